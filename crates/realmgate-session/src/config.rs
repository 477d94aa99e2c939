//! Configuration for the session machine.

use std::time::Duration;

/// Default window before expiry in which a token is refreshed.
pub const DEFAULT_REFRESH_LEEWAY: Duration = Duration::from_secs(30);

/// Default number of retries for transient refresh failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between refresh retries.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(250);

/// Upper bound on a single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Exponential backoff for transient refresh failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the retry count.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Configuration for a [`SessionMachine`](crate::SessionMachine).
///
/// There is no `Default`: the gateway timeout is always chosen by the host.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timeout applied to every gateway call.
    pub gateway_timeout: Duration,

    /// Refresh when the access token expires within this window.
    pub refresh_leeway: Duration,

    /// Backoff for transient refresh failures.
    pub retry: RetryPolicy,

    /// Write tokens to the durable store for remember-me sessions.
    pub persist_tokens: bool,
}

impl SessionConfig {
    /// Create a configuration with the given gateway timeout.
    pub fn new(gateway_timeout: Duration) -> Self {
        Self {
            gateway_timeout,
            refresh_leeway: DEFAULT_REFRESH_LEEWAY,
            retry: RetryPolicy::default(),
            persist_tokens: true,
        }
    }

    /// Set the refresh leeway.
    pub fn with_refresh_leeway(mut self, leeway: Duration) -> Self {
        self.refresh_leeway = leeway;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable or disable token persistence.
    pub fn with_persist_tokens(mut self, persist: bool) -> Self {
        self.persist_tokens = persist;
        self
    }
}
