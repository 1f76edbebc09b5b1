//! Per-INN login attempt limiter.
//!
//! Attempts are kept on the device, so clearing storage resets the counter.
//! The registry applies its own limits.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{PortalError, Result};
use crate::storage::{Storage, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Attempt {
    /// Unix timestamp in milliseconds.
    timestamp: i64,
}

/// Sliding window of login attempts.
pub struct LoginLimiter {
    storage: Storage,
    clock: Arc<dyn Clock>,
    max_attempts: usize,
    window: Duration,
}

impl LoginLimiter {
    pub fn new(
        storage: Storage,
        clock: Arc<dyn Clock>,
        max_attempts: usize,
        window: Duration,
    ) -> Self {
        Self {
            storage,
            clock,
            max_attempts: max_attempts.max(1),
            window,
        }
    }

    fn load(&self, key: &str) -> Vec<Attempt> {
        match self.storage.try_get(key) {
            Ok(attempts) => attempts.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(key, error = %err, "clearing corrupt login attempts");
                self.storage.remove(key);
                Vec::new()
            },
        }
    }

    /// Record an attempt for `inn`.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::TooManyLoginAttempts`] with the remaining wait
    /// when the window is full. The refused attempt is not recorded.
    pub fn check(&self, inn: &str) -> Result<()> {
        let key = keys::login_attempts(inn);
        let now = self.clock.now_millis();
        let window = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);

        let mut attempts = self.load(&key);
        attempts.retain(|attempt| now - attempt.timestamp < window);

        if attempts.len() >= self.max_attempts {
            let oldest = attempts
                .iter()
                .map(|attempt| attempt.timestamp)
                .min()
                .unwrap_or(now);
            let wait = (window - (now - oldest)).max(0);

            tracing::warn!(inn, wait_ms = wait, "login attempt limit exceeded");
            return Err(PortalError::TooManyLoginAttempts {
                retry_after: Duration::from_millis(wait.unsigned_abs()),
            });
        }

        attempts.push(Attempt { timestamp: now });
        self.storage.set(&key, &attempts);
        Ok(())
    }

    /// Attempts still allowed in the current window.
    pub fn remaining(&self, inn: &str) -> usize {
        let now = self.clock.now_millis();
        let window = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        let used = self
            .load(&keys::login_attempts(inn))
            .iter()
            .filter(|attempt| now - attempt.timestamp < window)
            .count();

        self.max_attempts.saturating_sub(used)
    }
}
