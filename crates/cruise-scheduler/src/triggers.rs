//! Built-in integration triggers.

use crate::lock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use cruise_core::ports::Trigger;
use cruise_core::{BuildCondition, Error, IntegrationRequest, Result};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Fires once at start-up and then `interval` after each integration attempt.
pub struct IntervalTrigger {
    name: String,
    interval: Duration,
    condition: BuildCondition,
    next: Mutex<Instant>,
}

impl IntervalTrigger {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            condition: BuildCondition::IfModificationExists,
            next: Mutex::new(Instant::now()),
        }
    }

    pub fn with_condition(mut self, condition: BuildCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl Trigger for IntervalTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Option<IntegrationRequest> {
        if Instant::now() < *lock(&self.next) {
            return None;
        }
        Some(IntegrationRequest::new(self.condition, self.name.clone()))
    }

    async fn reset(&self) {
        *lock(&self.next) = Instant::now() + self.interval;
    }
}

/// Fires at the times described by a cron expression (seconds precision).
pub struct CronTrigger {
    name: String,
    schedule: Schedule,
    condition: BuildCondition,
    next: Mutex<Option<DateTime<Utc>>>,
}

impl CronTrigger {
    pub fn new(name: impl Into<String>, expression: &str) -> Result<Self> {
        let name = name.into();
        let schedule = Schedule::from_str(expression).map_err(|e| {
            Error::InvalidConfiguration(format!("invalid cron expression for '{name}': {e}"))
        })?;
        let next = schedule.upcoming(Utc).next();
        Ok(Self {
            name,
            schedule,
            condition: BuildCondition::ForceBuild,
            next: Mutex::new(next),
        })
    }

    pub fn with_condition(mut self, condition: BuildCondition) -> Self {
        self.condition = condition;
        self
    }

    /// When the trigger fires next, if the schedule has any occurrences left.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        *lock(&self.next)
    }

    fn due_at(&self, now: DateTime<Utc>) -> bool {
        lock(&self.next).is_some_and(|next| next <= now)
    }
}

#[async_trait]
impl Trigger for CronTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Option<IntegrationRequest> {
        self.due_at(Utc::now())
            .then(|| IntegrationRequest::new(self.condition, self.name.clone()))
    }

    async fn reset(&self) {
        let next = self.schedule.after(&Utc::now()).next();
        debug!(trigger = %self.name, ?next, "Cron trigger rescheduled");
        *lock(&self.next) = next;
    }
}

/// Fires once for every call to [`request`](Self::request).
///
/// Requests made while one is outstanding are merged into it.
pub struct ManualTrigger {
    name: String,
    requested: Mutex<Option<BuildCondition>>,
}

impl ManualTrigger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requested: Mutex::new(None),
        }
    }

    /// Ask for a forced integration on the next poll.
    pub fn request(&self) {
        self.request_with(BuildCondition::ForceBuild);
    }

    pub fn request_with(&self, condition: BuildCondition) {
        let mut requested = lock(&self.requested);
        *requested = match *requested {
            Some(existing) if existing.is_forced() => Some(existing),
            _ => Some(condition),
        };
    }
}

#[async_trait]
impl Trigger for ManualTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Option<IntegrationRequest> {
        lock(&self.requested).map(|condition| IntegrationRequest::new(condition, self.name.clone()))
    }

    async fn reset(&self) {
        lock(&self.requested).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::block_on;

    #[test]
    fn test_interval_fires_immediately_then_waits() {
        let trigger = IntervalTrigger::new("interval", Duration::from_secs(60));

        let request = block_on(trigger.check()).unwrap();
        assert_eq!(request.source(), "interval");
        assert_eq!(request.condition(), BuildCondition::IfModificationExists);

        block_on(trigger.reset());
        assert!(block_on(trigger.check()).is_none());
    }

    #[test]
    fn test_interval_zero_fires_again_after_reset() {
        let trigger = IntervalTrigger::new("fast", Duration::ZERO)
            .with_condition(BuildCondition::ForceBuild);
        block_on(trigger.reset());

        let request = block_on(trigger.check()).unwrap();
        assert!(request.condition().is_forced());
    }

    #[test]
    fn test_cron_rejects_bad_expression() {
        assert!(matches!(
            CronTrigger::new("nightly", "not a schedule"),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_cron_fires_when_due() {
        let trigger = CronTrigger::new("nightly", "0 0 2 * * * *").unwrap();
        let next = trigger.next_fire().unwrap();

        assert!(next > Utc::now());
        assert!(!trigger.due_at(next - chrono::Duration::seconds(1)));
        assert!(trigger.due_at(next));
        assert!(block_on(trigger.check()).is_none());
    }

    #[test]
    fn test_manual_fires_once_per_request() {
        let trigger = ManualTrigger::new("manual");
        assert!(block_on(trigger.check()).is_none());

        trigger.request_with(BuildCondition::IfModificationExists);
        trigger.request();
        trigger.request_with(BuildCondition::IfModificationExists);

        let request = block_on(trigger.check()).unwrap();
        assert!(request.condition().is_forced());

        block_on(trigger.reset());
        assert!(block_on(trigger.check()).is_none());
    }
}
