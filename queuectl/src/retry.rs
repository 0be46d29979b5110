//! The retry, backoff and dead letter policy applied when a job execution fails.
//!
//! The policy is a pure function of the failed job's counters, the configured backoff base and
//! the time of the failure, so a given failure always yields the same decision.
//!
//! # Example
//!
//! ```
//! # use queuectl::prelude::*;
//! # use chrono::{TimeDelta, Utc};
//! let policy = RetryPolicy::new(2);
//! let now = Utc::now();
//!
//! assert_eq!(
//!     policy.decide(0, 3, now),
//!     RetryDecision::Reschedule { attempts: 1, next_run_at: now + TimeDelta::seconds(2) }
//! );
//! assert_eq!(policy.decide(3, 3, now), RetryDecision::DeadLetter { attempts: 4 });
//! ```

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    backoff::{BackoffStrategy, Strategy},
    job::JobState,
};

/// The backoff base used when none is configured.
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// The latest time a job will be rescheduled to. Delays that would go beyond it saturate here.
fn latest_next_run_at() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Decides what happens to a job whose execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff_base: u32,
    max_backoff: Option<TimeDelta>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE)
    }
}

impl RetryPolicy {
    /// A policy waiting `backoff_base ^ attempts` seconds between attempts.
    pub const fn new(backoff_base: u32) -> Self {
        Self {
            backoff_base,
            max_backoff: None,
        }
    }

    /// Caps the delay between attempts.
    pub const fn with_max_backoff(mut self, max_backoff: TimeDelta) -> Self {
        self.max_backoff = Some(max_backoff);
        self
    }

    pub const fn backoff_base(&self) -> u32 {
        self.backoff_base
    }

    pub const fn max_backoff(&self) -> Option<TimeDelta> {
        self.max_backoff
    }

    /// The delay before the given attempt is retried.
    pub fn delay(&self, attempts: u32) -> TimeDelta {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(self.backoff_base.into()));
        match self.max_backoff {
            Some(max) => strategy.with_max(max).backoff(attempts),
            None => strategy.backoff(attempts),
        }
    }

    /// Decides the outcome of a failed execution of a job that had already failed `attempts`
    /// times and is allowed `max_retries` retries.
    pub fn decide(&self, attempts: u32, max_retries: u32, now: DateTime<Utc>) -> RetryDecision {
        let attempts = attempts.saturating_add(1);
        if attempts > max_retries {
            return RetryDecision::DeadLetter { attempts };
        }
        let next_run_at = now
            .checked_add_signed(self.delay(attempts))
            .unwrap_or_else(latest_next_run_at)
            .min(latest_next_run_at());
        RetryDecision::Reschedule {
            attempts,
            next_run_at,
        }
    }
}

/// The outcome of applying a [`RetryPolicy`] to a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back to pending, eligible again from `next_run_at`.
    Reschedule {
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    /// The job has exhausted its retries and is moved to the dead letter queue.
    DeadLetter { attempts: u32 },
}

impl RetryDecision {
    /// The attempt count to persist.
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Reschedule { attempts, .. } | Self::DeadLetter { attempts } => *attempts,
        }
    }

    /// The state the job moves to.
    pub const fn state(&self) -> JobState {
        match self {
            Self::Reschedule { .. } => JobState::Pending,
            Self::DeadLetter { .. } => JobState::Dead,
        }
    }

    pub const fn next_run_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Reschedule { next_run_at, .. } => Some(*next_run_at),
            Self::DeadLetter { .. } => None,
        }
    }
}
