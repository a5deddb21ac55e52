//! Cross-agent rate-limit coordination.
//!
//! Agents that talk to the same upstream provider share one [`ProviderState`].
//! Once any of them is throttled, every caller for that provider waits on the
//! same reset time instead of hammering the provider independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{BatonError, Result};

/// A rate limit observed in an agent's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub provider: String,
    /// Estimated delay until the provider accepts requests again.
    pub reset_after: Duration,
    pub message: String,
}

/// Mutable per-provider record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderState {
    pub is_limited: bool,
    pub reset_at: Option<DateTime<Utc>>,
    pub wait_count: u32,
    pub last_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            is_limited: false,
            reset_at: None,
            wait_count: 0,
            last_message: None,
            updated_at: now,
        }
    }

    fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_limited {
            return None;
        }
        let reset_at = self.reset_at?;
        (reset_at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Recorded limits after which callers stop retrying.
    pub max_waits: u32,
    /// Upper bound of the random jitter, as a fraction of the wait.
    pub jitter_fraction: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_waits: 5,
            jitter_fraction: 0.1,
        }
    }
}

/// Reset estimates beyond this are treated as this long.
const MAX_RESET: Duration = Duration::from_secs(24 * 60 * 60);

fn to_delta(d: Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(d.min(MAX_RESET)).unwrap_or_else(|_| chrono::TimeDelta::zero())
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += to_delta(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared provider table. Construct one per process and pass it around.
pub struct RateLimitCoordinator {
    providers: RwLock<HashMap<String, ProviderState>>,
    agent_providers: HashMap<String, String>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimitCoordinator {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            agent_providers: HashMap::new(),
            config,
            clock,
        }
    }

    /// Declare which provider an agent calls. Unmapped agents are their own
    /// provider.
    pub fn map_agent(mut self, agent: impl Into<String>, provider: impl Into<String>) -> Self {
        self.agent_providers.insert(agent.into(), provider.into());
        self
    }

    pub fn provider_for<'a>(&'a self, agent: &'a str) -> &'a str {
        self.agent_providers
            .get(agent)
            .map(String::as_str)
            .unwrap_or(agent)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Mark `provider` limited until the estimated reset. Repeated calls keep
    /// the later reset time and count each observation.
    pub fn record_rate_limit(&self, provider: &str, info: &RateLimitInfo) {
        let now = self.clock.now();
        let reset_at = now + to_delta(info.reset_after);

        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        let state = providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderState::new(now));
        let still_limited = state.remaining(now).is_some();
        state.reset_at = match state.reset_at {
            Some(existing) if still_limited && existing > reset_at => Some(existing),
            _ => Some(reset_at),
        };
        state.is_limited = true;
        state.wait_count += 1;
        state.last_message = Some(info.message.clone());
        state.updated_at = now;

        info!(
            provider,
            agent = %info.provider,
            waits = state.wait_count,
            reset_after_secs = info.reset_after.as_secs_f64(),
            "rate limit recorded"
        );
    }

    pub fn should_wait(&self, provider: &str) -> bool {
        let now = self.clock.now();
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        providers
            .get(provider)
            .and_then(|s| s.remaining(now))
            .is_some()
    }

    /// Block until the provider's reset time plus jitter, or cancellation.
    pub async fn wait_for_reset(&self, cancel: &CancellationToken, provider: &str) -> Result<()> {
        let remaining = {
            let now = self.clock.now();
            let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
            providers.get(provider).and_then(|s| s.remaining(now))
        };
        let Some(remaining) = remaining else {
            return Ok(());
        };

        let wait = remaining + self.jitter(remaining);
        debug!(provider, wait_secs = wait.as_secs_f64(), "waiting for rate limit reset");
        tokio::select! {
            _ = cancel.cancelled() => Err(BatonError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    pub fn exceeded_max_waits(&self, provider: &str) -> bool {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        providers
            .get(provider)
            .is_some_and(|s| s.wait_count >= self.config.max_waits)
    }

    /// A run went through without a limit: the provider is healthy again.
    pub fn record_success(&self, provider: &str) {
        let now = self.clock.now();
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        let state = providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderState::new(now));
        if state.is_limited || state.wait_count > 0 {
            debug!(provider, "rate limit cleared");
        }
        state.is_limited = false;
        state.wait_count = 0;
        state.updated_at = now;
    }

    pub fn snapshot(&self, provider: &str) -> Option<ProviderState> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        providers.get(provider).cloned()
    }

    fn jitter(&self, wait: Duration) -> Duration {
        let fraction = self.config.jitter_fraction.clamp(0.0, 1.0);
        wait.mul_f64(fraction * rand::random::<f64>())
    }
}
