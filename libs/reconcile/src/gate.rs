//! Cron and retry gates.
//!
//! A gate holds a next-eligible time; reconciliation of the owning job is
//! suppressed until that time passes.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;

use crate::backoff::BackoffPolicy;
use crate::GateError;

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
///
/// The `cron` crate requires 6 fields: `sec min hour day-of-month month day-of-week`.
/// Workload definitions use standard 5-field cron: `min hour day-of-month month day-of-week`.
pub fn normalize_cron(cron_5field: &str) -> String {
    let trimmed = cron_5field.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

fn add(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// =============================================================================
// Cron Gate
// =============================================================================

/// Admits reconciliation only at cron-scheduled times.
#[derive(Debug, Clone)]
pub struct CronGate {
    expression: String,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
}

impl CronGate {
    /// Parse a 5-field expression; the first eligible time is the first
    /// scheduled time after `created_at`.
    pub fn new(expression: &str, created_at: DateTime<Utc>) -> Result<Self, GateError> {
        let schedule =
            Schedule::from_str(&normalize_cron(expression)).map_err(|e| GateError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        let next = schedule.after(&created_at).next();

        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
            next,
        })
    }

    /// The expression as configured.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next eligible time, `None` when the schedule has no future occurrence.
    pub fn next(&self) -> Option<DateTime<Utc>> {
        self.next
    }

    /// True once `now` has reached the next scheduled time.
    pub fn can_reconcile(&self, now: DateTime<Utc>) -> bool {
        self.next.is_some_and(|next| now >= next)
    }

    /// Advance to the first scheduled time after `now`.
    pub fn compute_next(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next = self.schedule.after(&now).next();
        self.next
    }
}

// =============================================================================
// Retry Gate
// =============================================================================

/// Spaces out restart attempts according to a backoff policy.
///
/// Every call to [`RetryGate::compute_next`] consumes one backoff sample.
/// `marked_for_restart` serializes one pending restart at a time.
#[derive(Debug, Clone)]
pub struct RetryGate {
    policy: BackoffPolicy,
    next: Option<DateTime<Utc>>,
    samples: u32,
    attempts: u32,
    max_attempts: Option<u32>,
    marked_for_restart: bool,
    exhaustion_reported: bool,
}

impl RetryGate {
    /// A gate that retries forever.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            next: None,
            samples: 0,
            attempts: 0,
            max_attempts: None,
            marked_for_restart: false,
            exhaustion_reported: false,
        }
    }

    /// A gate that gives up after `max_attempts` restart attempts.
    pub fn bounded(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::new(policy)
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn next(&self) -> Option<DateTime<Utc>> {
        self.next
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn marked_for_restart(&self) -> bool {
        self.marked_for_restart
    }

    /// True when no backoff is pending or its delay has elapsed.
    pub fn can_reconcile(&self, now: DateTime<Utc>) -> bool {
        self.next.is_none_or(|next| now >= next)
    }

    /// Advance the next-eligible time by the next backoff sample.
    pub fn compute_next(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.policy.delay(self.samples);
        self.samples = self.samples.saturating_add(1);
        let next = add(now, delay);
        self.next = Some(next);
        next
    }

    /// Mark a restart as pending and schedule it one backoff sample from `now`.
    pub fn arm(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.marked_for_restart = true;
        self.compute_next(now)
    }

    /// Clear the pending-restart mark. The backoff position is kept.
    pub fn clear_restart(&mut self) {
        self.marked_for_restart = false;
    }

    /// Count one restart attempt.
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// True once the attempt budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempts >= max)
    }

    /// Returns true the first time it is called after exhaustion.
    pub fn take_exhaustion_report(&mut self) -> bool {
        if self.is_exhausted() && !self.exhaustion_reported {
            self.exhaustion_reported = true;
            return true;
        }
        false
    }

    /// Forget all attempts and backoff progress.
    pub fn reset(&mut self) {
        self.next = None;
        self.samples = 0;
        self.attempts = 0;
        self.marked_for_restart = false;
        self.exhaustion_reported = false;
    }
}

impl Default for RetryGate {
    /// Default policy, bounded at [`crate::DEFAULT_MAX_ATTEMPTS`].
    fn default() -> Self {
        Self::bounded(BackoffPolicy::default(), crate::DEFAULT_MAX_ATTEMPTS)
    }
}
