//! Delays between attempts.
//!
//! [`RetryPolicy`](crate::retry::RetryPolicy) reschedules failed jobs on an [`Exponential`]
//! curve. Stores space out attempts at a write that found the database locked on a [`Linear`]
//! one, usually with a [`Jitter`] so that competing workers do not retry in lockstep.
//!
//! # Example
//!
//! ```
//! # use queuectl::prelude::*;
//! # use chrono::TimeDelta;
//! let contention = BackoffStrategy::linear(TimeDelta::milliseconds(20))
//!     .with_max(TimeDelta::milliseconds(60))
//!     .with_jitter(Jitter::Absolute(TimeDelta::milliseconds(10)));
//!
//! let first = contention.backoff(1);
//! assert!(first >= TimeDelta::milliseconds(10) && first <= TimeDelta::milliseconds(30));
//!
//! // Jitter is applied after the cap.
//! let late = contention.backoff(10);
//! assert!(late >= TimeDelta::milliseconds(50) && late <= TimeDelta::milliseconds(70));
//! ```
use chrono::TimeDelta;
use rand::Rng;

/// Whole seconds beyond which a [`TimeDelta`] cannot be represented.
const MAX_SECONDS: i64 = i64::MAX / 1_000;

/// Maps an attempt number to the time to wait before making it.
pub trait Strategy {
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// `base ^ attempt` whole seconds, saturating at the largest representable delay.
///
/// Built with [`BackoffStrategy::exponential`].
///
/// ```
/// # use queuectl::prelude::*;
/// # use chrono::TimeDelta;
/// let retries = BackoffStrategy::exponential(TimeDelta::seconds(2));
///
/// assert_eq!(retries.backoff(1), TimeDelta::seconds(2));
/// assert_eq!(retries.backoff(3), TimeDelta::seconds(8));
/// assert_eq!(retries.with_max(TimeDelta::seconds(5)).backoff(3), TimeDelta::seconds(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let seconds = match self.base.num_seconds().checked_pow(attempt) {
            Some(seconds) => seconds.clamp(0, MAX_SECONDS),
            None => MAX_SECONDS,
        };
        cap(TimeDelta::seconds(seconds), self.max)
    }
}

/// `step * attempt`, saturating like [`Exponential`].
///
/// Built with [`BackoffStrategy::linear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    step: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let delay = i32::try_from(attempt)
            .ok()
            .and_then(|attempt| self.step.checked_mul(attempt))
            .unwrap_or_else(|| TimeDelta::seconds(MAX_SECONDS));
        cap(delay, self.max)
    }
}

fn cap(delay: TimeDelta, max: Option<TimeDelta>) -> TimeDelta {
    max.map_or(delay, |max| delay.min(max))
}

/// Random noise added to a delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Uniform in `-delta..=delta`.
    Absolute(TimeDelta),
    /// Uniform in `-delay * ratio..=delay * ratio`.
    Relative(f64),
}

impl Jitter {
    fn spread(&self, delay: TimeDelta) -> i64 {
        match *self {
            Self::Absolute(delta) => delta.num_milliseconds().abs(),
            Self::Relative(ratio) => (delay.num_milliseconds() as f64 * ratio).abs().round() as i64,
        }
    }

    fn apply(&self, delay: TimeDelta) -> TimeDelta {
        let spread = self.spread(delay);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        delay + TimeDelta::milliseconds(offset)
    }
}

/// A [`Strategy`] with optional [`Jitter`]. Never yields a negative delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
}

impl BackoffStrategy<Exponential> {
    /// Only the whole seconds of `base` count.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Caps the delay, before jitter, at `max`.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.strategy.max = Some(max);
        self
    }
}

impl BackoffStrategy<Linear> {
    pub const fn linear(step: TimeDelta) -> Self {
        Self::new(Linear { step, max: None })
    }

    /// Caps the delay, before jitter, at `max`.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.strategy.max = Some(max);
        self
    }
}

impl<T: Strategy> BackoffStrategy<T> {
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }
}

impl<T: Strategy> Strategy for BackoffStrategy<T> {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let delay = self.strategy.backoff(attempt);
        let delay = match &self.jitter {
            Some(jitter) => jitter.apply(delay),
            None => delay,
        };
        delay.max(TimeDelta::zero())
    }
}
