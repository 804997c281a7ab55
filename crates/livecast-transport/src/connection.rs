//! Caller-driven retry bookkeeping.

use std::time::Duration;

use crate::DEFAULT_RETRY_DELAY_MS;

/// Retry budget for one client.
///
/// The core never reconnects on its own: the caller asks for a retry after a
/// failure event and this policy decides whether one is still allowed. The
/// delay is fixed, chosen by the caller on every retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed per connect() call.
    pub max_retries: u32,

    /// Retries left for the current session.
    remaining: u32,

    /// Delay used by the last retry.
    last_delay: Duration,

    /// URL of the last successful connect() call.
    url: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(0)
    }
}

impl RetryPolicy {
    /// Create a policy with `max_retries` retries per session.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            remaining: max_retries,
            last_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            url: None,
        }
    }

    /// Change the retry count. Also refills the remaining budget.
    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
        self.remaining = max_retries;
    }

    /// A fresh connect() starts a new session with a full budget.
    pub fn start_session(&mut self, url: &str) {
        self.remaining = self.max_retries;
        self.url = Some(url.to_string());
    }

    /// URL the session was started with.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Retries left.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Delay used by the last granted retry.
    pub fn last_delay(&self) -> Duration {
        self.last_delay
    }

    /// Check whether a failure with `reason` may be retried.
    ///
    /// Malformed endpoints never are: connecting again cannot fix them.
    pub fn should_retry(&self, reason: &str) -> bool {
        self.remaining > 0 && self.url.is_some() && !reason.contains("Endpoint malformed")
    }

    /// Consume one retry. Returns false when none is allowed.
    pub fn take_attempt(&mut self, delay: Duration, reason: &str) -> bool {
        if !self.should_retry(reason) {
            return false;
        }
        self.remaining -= 1;
        self.last_delay = delay;
        true
    }
}
