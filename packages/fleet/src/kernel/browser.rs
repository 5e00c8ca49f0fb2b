//! Seam to the headless-browser driver.
//!
//! The real adapter lives outside this crate; the scheduler only needs to
//! freeze and thaw the page around human interventions.

use anyhow::Result;
use async_trait::async_trait;

/// Minimal control surface over the automation driver.
///
/// Both operations are idempotent: pausing a paused page and resuming a
/// resumed page are no-ops.
#[async_trait]
pub trait BrowserAdapter: Send + Sync {
    /// Stop issuing page actions until `resume` is called.
    async fn pause(&self) -> Result<()>;

    /// Allow page actions again.
    async fn resume(&self) -> Result<()>;
}

/// Adapter that does nothing. Used by deployments where the handler owns
/// its own driver, and by tests.
#[derive(Default)]
pub struct NoopBrowser;

#[async_trait]
impl BrowserAdapter for NoopBrowser {
    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        Ok(())
    }
}

/// Test adapter that tracks pause state.
pub struct RecordingBrowser {
    paused: std::sync::atomic::AtomicBool,
}

impl Default for RecordingBrowser {
    fn default() -> Self {
        Self {
            paused: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl RecordingBrowser {
    pub fn is_paused(&self) -> bool {
        self.paused.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserAdapter for RecordingBrowser {
    async fn pause(&self) -> Result<()> {
        self.paused.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.paused
            .store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
