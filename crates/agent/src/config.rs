use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the loop does when the desired state cannot be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollFailurePolicy {
    /// Stop the loop and hand the error to the caller.
    Exit,
    /// Log, back off and poll again.
    Retry,
}

/// Long-lived agent settings, fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub app_id: String,
    pub poll_interval: Duration,
    pub poll_failure: PollFailurePolicy,
    /// Upper bound for the retry backoff; never below `poll_interval`.
    pub max_backoff: Duration,
    /// How long shutdown waits for in-flight removals.
    pub shutdown_grace: Duration,
}

impl AgentConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            poll_interval: Duration::from_secs(10),
            poll_failure: PollFailurePolicy::Retry,
            max_backoff: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(10),
        }
    }

    /// Delay after `failures` consecutive poll failures (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let cap = self.max_backoff.max(self.poll_interval);
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
        self.poll_interval.saturating_mul(factor).min(cap)
    }
}
