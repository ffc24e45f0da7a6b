//! Bounded retry for whole-pipeline invocations.
//!
//! The retry layer re-runs a failed pipeline up to a configured number of
//! attempts, with optional backoff and jitter between attempts. The
//! attempt number is folded into every element's hashed input (see the
//! builder), so each attempt addresses a fresh cache id chain and can
//! never replay the stale entries of a failed earlier attempt. Aborts are
//! never retried.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::PipelineError;

/// Name of the input field carrying the attempt number.
///
/// Injected only from the second attempt onward, so first-attempt ids are
/// identical to an unretried pipeline's ids.
pub const ATTEMPT_FIELD: &str = "attempt";

/// Backoff strategy for delays between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// delay = base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// delay = base * attempt
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to spread out concurrent retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterStrategy {
    /// No jitter.
    #[default]
    None,
    /// Random from 0 to the computed delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

/// Predicate deciding whether a failed attempt should be retried.
pub type RetryPredicate = Arc<dyn Fn(&PipelineError, usize) -> bool + Send + Sync>;

/// Configuration for the retry wrapper.
#[derive(Clone)]
pub struct RetryOptions {
    /// Maximum attempts, including the first (>= 1).
    pub max_attempts: usize,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on the computed delay in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
    predicate: Option<RetryPredicate>,
}

impl RetryOptions {
    /// Creates retry options with the given attempt bound.
    #[must_use]
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
            predicate: None,
        }
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Supplies a predicate that can stop retrying early.
    #[must_use]
    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PipelineError, usize) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Asks the predicate (if any) whether to retry after a failure on
    /// `attempt`. Aborts are handled before this is consulted.
    #[must_use]
    pub fn should_retry(&self, error: &PipelineError, attempt: usize) -> bool {
        self.predicate
            .as_ref()
            .map_or(true, |predicate| predicate(error, attempt))
    }

    /// Computes the delay to sleep after a failure on `attempt`
    /// (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.base_delay_ms;
        let capped = match self.backoff {
            BackoffStrategy::Exponential => {
                let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(2u64.saturating_pow(exponent))
            }
            BackoffStrategy::Linear => base.saturating_mul(attempt as u64),
            BackoffStrategy::Constant => base,
        }
        .min(self.max_delay_ms);

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => {
                if capped == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=capped)
                }
            }
            JitterStrategy::Equal => {
                let half = capped / 2;
                if half == 0 {
                    capped
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}
