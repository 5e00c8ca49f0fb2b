// Kernel - scheduler infrastructure with dependency injection
//
// The FleetDeps container holds everything a worker process needs
// (database, browser seam, callback dispatcher, session store, rate
// limiter) and is handed to executors and handlers. Infrastructure only;
// job business logic lives in handlers.

pub mod browser;
pub mod callbacks;
pub mod jobs;
pub mod rate_limit;
pub mod sessions;

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

pub use browser::{BrowserAdapter, NoopBrowser, RecordingBrowser};
pub use callbacks::{
    CallbackCost, CallbackDispatcher, CallbackInteraction, CallbackPayload, CallbackStatus,
};
pub use rate_limit::{RateDecision, RateLimiter, Scope, Tier};
pub use sessions::{EnvelopeError, SessionCrypto, SessionStore};

use crate::config::Config;

/// Shared dependencies for one worker process.
#[derive(Clone)]
pub struct FleetDeps {
    pub db_pool: PgPool,
    pub browser: Arc<dyn BrowserAdapter>,
    pub dispatcher: Arc<CallbackDispatcher>,
    /// Present only when an encryption key is configured.
    pub sessions: Option<Arc<SessionStore>>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl FleetDeps {
    pub fn new(
        db_pool: PgPool,
        browser: Arc<dyn BrowserAdapter>,
        dispatcher: Arc<CallbackDispatcher>,
        sessions: Option<Arc<SessionStore>>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            db_pool,
            browser,
            dispatcher,
            sessions,
            rate_limiter,
        }
    }

    /// Wire up the standard production dependency set.
    pub fn from_config(db_pool: PgPool, config: &Config) -> Result<Self> {
        let sessions = match &config.encryption_key {
            Some(key) => {
                let crypto = SessionCrypto::from_base64_key(key, &config.encryption_key_id)?;
                Some(Arc::new(SessionStore::new(
                    db_pool.clone(),
                    crypto,
                    config.session_ttl,
                )))
            }
            None => None,
        };

        Ok(Self {
            db_pool,
            browser: Arc::new(NoopBrowser),
            dispatcher: Arc::new(CallbackDispatcher::new(config.callback_base_url.clone())),
            sessions,
            rate_limiter: Arc::new(RateLimiter::new()),
        })
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserAdapter>) -> Self {
        self.browser = browser;
        self
    }
}
