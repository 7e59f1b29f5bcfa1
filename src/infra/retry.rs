//! Retry policy with exponential backoff and jitter
//!
//! Used in two places:
//! - the scheduler, to decide when a failed job runs again
//! - short in-process retries of ledger writes that hit a locked database

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Backoff settings for failed jobs
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Caps exponential growth
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (2.0 = double each time)
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0); 0.0 disables jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy for local database writes
    pub fn database() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// No delay between attempts; handy in tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether another attempt is allowed after `attempts_made` attempts
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before retry number `retry` (0-indexed)
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter > 0.0 && capped > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..=range);
            (capped + offset).clamp(0.0, self.max_delay.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}

/// Run a database operation, retrying while SQLite reports the file locked
pub async fn retry_db<F, Fut, T>(policy: &RetryPolicy, context: &str, operation: F) -> super::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = super::Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(super::SyncError::Database(ref e))
                if is_retryable_db_error(e) && policy.allows_retry(attempts) =>
            {
                let delay = policy.delay_for_attempt(attempts - 1);
                tracing::debug!(
                    context = context,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Database busy, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check if an error is transient (locked database, pool exhaustion)
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            // SQLITE_BUSY, SQLITE_LOCKED and their extended forms
            code == "5" || code == "6" || code == "261" || code == "517" || code == "262"
        }
        _ => false,
    }
}

// ============================================================================
// Tests
// ============================================================================
