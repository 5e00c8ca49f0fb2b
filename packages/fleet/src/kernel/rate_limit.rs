//! Sliding-window admission control.
//!
//! Counters are process-local and approximate by design; the shared
//! database stays out of the hot path. Every scope carries an hourly and a
//! daily cap, checked independently per user, so exhausting one platform
//! never blocks another while the account-wide tier cap still applies.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Premium,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }
}

/// What a check is scoped to: the user's plan, or one target platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Tier(Tier),
    Platform(String),
}

impl Scope {
    pub fn tier(tier: Tier) -> Self {
        Scope::Tier(tier)
    }

    pub fn platform(name: &str) -> Self {
        Scope::Platform(name.to_lowercase())
    }

    fn key(&self) -> String {
        match self {
            Scope::Tier(tier) => format!("tier:{}", tier.as_str()),
            Scope::Platform(name) => format!("platform:{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowCaps {
    pub hourly: u32,
    pub daily: u32,
}

/// Per-tier caps. Non-decreasing from free through premium; enterprise is
/// uncapped.
fn tier_caps(tier: Tier) -> Option<WindowCaps> {
    match tier {
        Tier::Free => Some(WindowCaps {
            hourly: 5,
            daily: 10,
        }),
        Tier::Starter => Some(WindowCaps {
            hourly: 10,
            daily: 50,
        }),
        Tier::Pro => Some(WindowCaps {
            hourly: 30,
            daily: 150,
        }),
        Tier::Premium => Some(WindowCaps {
            hourly: 60,
            daily: 300,
        }),
        Tier::Enterprise => None,
    }
}

/// Per-platform caps. Platforms we have no profile for get a conservative
/// default rather than a free pass.
fn platform_caps(platform: &str) -> WindowCaps {
    match platform {
        "linkedin" => WindowCaps {
            hourly: 10,
            daily: 50,
        },
        "greenhouse" => WindowCaps {
            hourly: 20,
            daily: 100,
        },
        "workday" => WindowCaps {
            hourly: 15,
            daily: 75,
        },
        "lever" => WindowCaps {
            hourly: 20,
            daily: 100,
        },
        _ => WindowCaps {
            hourly: 10,
            daily: 40,
        },
    }
}

fn caps_for(scope: &Scope) -> Option<WindowCaps> {
    match scope {
        Scope::Tier(tier) => tier_caps(*tier),
        Scope::Platform(name) => Some(platform_caps(name)),
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_epoch_seconds: Option<i64>,
    /// Which window tripped, e.g. "platform:linkedin:hourly".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl RateDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: None,
            reset_epoch_seconds: None,
            source: None,
        }
    }
}

/// In-memory sliding-window limiter keyed by (user, scope).
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<(String, String), VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Would one more admission fit right now?
    pub async fn check(&self, user_id: &str, scope: &Scope) -> RateDecision {
        self.check_at(user_id, scope, Utc::now()).await
    }

    /// Commit an admission. Call after a successful `check`.
    pub async fn record(&self, user_id: &str, scope: &Scope) {
        self.record_at(user_id, scope, Utc::now()).await;
    }

    async fn check_at(&self, user_id: &str, scope: &Scope, now: DateTime<Utc>) -> RateDecision {
        let Some(caps) = caps_for(scope) else {
            return RateDecision::allowed();
        };

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry((user_id.to_string(), scope.key()))
            .or_default();
        prune(bucket, now);

        let hour_ago = now - Duration::hours(1);
        let hourly_used = bucket.iter().filter(|t| **t > hour_ago).count() as u32;
        let daily_used = bucket.len() as u32;

        // Daily is the wider window; report it when both are exhausted so
        // the caller backs off for the right amount of time.
        if daily_used >= caps.daily {
            let reset = bucket.front().map(|t| *t + Duration::days(1));
            return blocked(scope, "daily", reset, now);
        }
        if hourly_used >= caps.hourly {
            let reset = bucket
                .iter()
                .find(|t| **t > hour_ago)
                .map(|t| *t + Duration::hours(1));
            return blocked(scope, "hourly", reset, now);
        }

        RateDecision::allowed()
    }

    async fn record_at(&self, user_id: &str, scope: &Scope, now: DateTime<Utc>) {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry((user_id.to_string(), scope.key()))
            .or_default();
        prune(bucket, now);
        bucket.push_back(now);
    }
}

/// Drop entries older than the widest (daily) window.
fn prune(bucket: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    let day_ago = now - Duration::days(1);
    while bucket.front().is_some_and(|t| *t <= day_ago) {
        bucket.pop_front();
    }
}

fn blocked(
    scope: &Scope,
    window: &str,
    reset: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> RateDecision {
    let retry_after = reset.map(|r| (r - now).num_seconds().max(0));
    RateDecision {
        allowed: false,
        retry_after_seconds: retry_after,
        reset_epoch_seconds: reset.map(|r| r.timestamp()),
        source: Some(format!("{}:{}", scope.key(), window)),
    }
}
