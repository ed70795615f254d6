//! Periodic scheduling ("beat").
//!
//! The schedule comes from the `CELERYBEAT_SCHEDULE` setting, a mapping of
//! entry name to `{ task, cron, args? }`:
//!
//! ```toml
//! [CELERYBEAT_SCHEDULE.refresh-feeds]
//! task = "feeds.refresh"
//! cron = "*/15 * * * *"
//! args = { full = false }
//! ```
//!
//! Cron expressions have five fields (minute, hour, day of month, month, day
//! of week) and support `*`, `*/n`, `a-b`, `a-b/n`, lists and plain numbers.
//! They are evaluated in UTC at minute granularity.

use crate::broker::{Broker, TaskEnvelope};
use crate::error::{BrokerError, ScheduleError};
use crate::retry::{RetryPolicy, retry_with_predicate};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, DurationRound, Timelike, Utc};
use keel_core::{Configuration, SettingValue};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Setting holding the periodic schedule.
pub const SCHEDULE_SETTING: &str = "CELERYBEAT_SCHEDULE";

/// Minutes searched by [`CronSchedule::next_after`] (a little over four years).
const SEARCH_LIMIT_MINUTES: i64 = 4 * 366 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    allowed: u64,
    restricted: bool,
}

impl Field {
    fn parse(expr: &str, text: &str, min: u32, max: u32) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };

        let mut allowed = 0u64;
        for part in text.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| invalid(format!("bad step `{step}`")))?;
                    if step == 0 {
                        return Err(invalid("step must be positive".into()));
                    }
                    if step > max {
                        return Err(invalid(format!("step `{step}` exceeds {max}")));
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (parse_value(a, &invalid)?, parse_value(b, &invalid)?)
            } else {
                let value = parse_value(range, &invalid)?;
                // `5/10` means "from 5, every 10".
                if part.contains('/') { (value, max) } else { (value, value) }
            };

            if start < min || end > max || start > end {
                return Err(invalid(format!("`{part}` is outside {min}-{max}")));
            }

            let mut value = start;
            while value <= end {
                allowed |= 1 << value;
                match value.checked_add(step) {
                    Some(next) => value = next,
                    None => break,
                }
            }
        }

        Ok(Self {
            allowed,
            restricted: !text.starts_with('*'),
        })
    }

    const fn contains(&self, value: u32) -> bool {
        self.allowed & (1 << value) != 0
    }
}

fn parse_value(
    text: &str,
    invalid: &impl Fn(String) -> ScheduleError,
) -> Result<u32, ScheduleError> {
    text.parse()
        .map_err(|_| invalid(format!("`{text}` is not a number")))
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    /// Parse a cron expression.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidCron`] for malformed expressions.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(ScheduleError::InvalidCron {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, found {}", fields.len()),
            });
        };

        let mut day_of_week = Field::parse(expr, dow, 0, 7)?;
        // 7 is Sunday as well as 0.
        if day_of_week.contains(7) {
            day_of_week.allowed |= 1;
        }

        Ok(Self {
            expr: expr.to_string(),
            minute: Field::parse(expr, minute, 0, 59)?,
            hour: Field::parse(expr, hour, 0, 23)?,
            day_of_month: Field::parse(expr, dom, 1, 31)?,
            month: Field::parse(expr, month, 1, 12)?,
            day_of_week,
        })
    }

    /// The expression as written.
    #[must_use]
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Whether the schedule fires in the minute containing `at`.
    #[must_use]
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if !self.minute.contains(at.minute())
            || !self.hour.contains(at.hour())
            || !self.month.contains(at.month())
        {
            return false;
        }

        let dom = self.day_of_month.contains(at.day());
        let dow = self.day_of_week.contains(at.weekday().num_days_from_sunday());
        // Classic cron: when both day fields are restricted either may match.
        if self.day_of_month.restricted && self.day_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First minute strictly after `after` at which the schedule fires.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = truncate_to_minute(after) + ChronoDuration::minutes(1);
        for _ in 0..SEARCH_LIMIT_MINUTES {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += ChronoDuration::minutes(1);
        }
        None
    }
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(ChronoDuration::minutes(1)).unwrap_or(at)
}

/// One periodic job.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    /// Entry name.
    pub name: String,
    /// Registered task name to queue.
    pub task: String,
    /// When to queue it.
    pub cron: CronSchedule,
    /// Arguments passed to the task.
    pub args: Value,
}

/// The full periodic schedule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
}

impl Schedule {
    /// Build from explicit entries.
    #[must_use]
    pub const fn new(entries: Vec<ScheduleEntry>) -> Self {
        Self { entries }
    }

    /// Read `CELERYBEAT_SCHEDULE`. An absent setting is an empty schedule.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] when an entry is malformed.
    pub fn from_config(config: &Configuration) -> Result<Self, ScheduleError> {
        let Some(raw) = config.get_map(SCHEDULE_SETTING) else {
            return Ok(Self::default());
        };

        let mut entries = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            let invalid = |reason: &str| ScheduleError::InvalidEntry {
                name: name.clone(),
                reason: reason.to_string(),
            };
            let fields = value.as_map().ok_or_else(|| invalid("expected a table"))?;
            let task = fields
                .get("task")
                .and_then(SettingValue::as_str)
                .ok_or_else(|| invalid("missing `task`"))?;
            let cron = fields
                .get("cron")
                .and_then(SettingValue::as_str)
                .ok_or_else(|| invalid("missing `cron`"))?;

            entries.push(ScheduleEntry {
                name: name.clone(),
                task: task.to_string(),
                cron: CronSchedule::parse(cron)?,
                args: fields.get("args").map_or(Value::Null, SettingValue::to_json),
            });
        }

        Ok(Self { entries })
    }

    /// All entries.
    #[must_use]
    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Entries that fire in the minute containing `at`.
    pub fn due(&self, at: DateTime<Utc>) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.iter().filter(move |entry| entry.cron.matches(at))
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Queues scheduled tasks on the broker as they come due.
pub struct Beat {
    schedule: Schedule,
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
}

impl Beat {
    /// Create a scheduler over `schedule`.
    #[must_use]
    pub fn new(schedule: Schedule, broker: Arc<dyn Broker>) -> Self {
        Self {
            schedule,
            broker,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the backoff used when the broker is unreachable.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Queue every entry due in the minute containing `now`.
    ///
    /// Returns the queued envelopes; entries that could not be queued are
    /// logged at error level and skipped.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<TaskEnvelope> {
        let mut queued = Vec::new();

        for entry in self.schedule.due(now) {
            let envelope = TaskEnvelope::new(entry.task.clone(), entry.args.clone());
            let result = retry_with_predicate(
                self.retry.clone(),
                || self.broker.enqueue(envelope.clone()),
                |e| matches!(e, BrokerError::Connection(_)),
            )
            .await;

            match result {
                Ok(()) => {
                    tracing::info!(entry = %entry.name, task = %entry.task, id = %envelope.id, "Scheduled task queued");
                    queued.push(envelope);
                }
                Err(e) => {
                    tracing::error!(entry = %entry.name, task = %entry.task, error = %e, "Failed to queue scheduled task");
                }
            }
        }

        queued
    }

    /// Tick at the start of every minute until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(entries = self.schedule.entries().len(), "Beat starting");
        for entry in self.schedule.entries() {
            if let Some(next) = entry.cron.next_after(Utc::now()) {
                tracing::debug!(entry = %entry.name, cron = entry.cron.expr(), next = %next, "Schedule entry loaded");
            }
        }

        loop {
            let now = Utc::now();
            let next_minute = truncate_to_minute(now) + ChronoDuration::minutes(1);
            let wait = (next_minute - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(wait) => {
                    self.tick(next_minute).await;
                }
            }
        }

        tracing::info!("Beat stopped");
    }
}
