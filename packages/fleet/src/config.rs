use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Base64-encoded 32-byte AES key for browser-session envelopes.
    /// Optional: workers that never touch the session store can run without it.
    pub encryption_key: Option<String>,
    pub encryption_key_id: String,
    pub heartbeat_interval: Duration,
    pub lease_window: Duration,
    pub poll_interval: Duration,
    pub hitl_timeout: Duration,
    pub drain_deadline: Duration,
    pub session_ttl: Duration,
    /// Prefix applied to relative callback URLs (test deployments).
    pub callback_base_url: Option<String>,
    pub ec2_ip: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            encryption_key: env::var("FLEET_ENCRYPTION_KEY").ok(),
            encryption_key_id: env::var("FLEET_ENCRYPTION_KEY_ID")
                .unwrap_or_else(|_| "primary".to_string()),
            heartbeat_interval: secs_var("FLEET_HEARTBEAT_SECS", 30)?,
            lease_window: secs_var("FLEET_LEASE_SECS", 120)?,
            poll_interval: secs_var("FLEET_POLL_SECS", 5)?,
            hitl_timeout: secs_var("FLEET_HITL_TIMEOUT_SECS", 300)?,
            drain_deadline: secs_var("FLEET_DRAIN_SECS", 60)?,
            session_ttl: secs_var("FLEET_SESSION_TTL_SECS", 7 * 24 * 3600)?,
            callback_base_url: env::var("FLEET_CALLBACK_BASE_URL").ok(),
            ec2_ip: env::var("FLEET_EC2_IP").ok(),
        })
    }
}

fn secs_var(name: &str, default: u64) -> Result<Duration> {
    let secs = match env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{} must be a number of seconds", name))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secs_var_uses_default_when_unset() {
        let d = secs_var("FLEET_TEST_UNSET_INTERVAL", 42).unwrap();
        assert_eq!(d, Duration::from_secs(42));
    }

    #[test]
    fn secs_var_rejects_garbage() {
        env::set_var("FLEET_TEST_BAD_INTERVAL", "soon");
        assert!(secs_var("FLEET_TEST_BAD_INTERVAL", 1).is_err());
        env::remove_var("FLEET_TEST_BAD_INTERVAL");
    }
}
