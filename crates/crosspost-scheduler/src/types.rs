//! Scheduler types and trigger math.

use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SchedulerError;

/// Identifier of a registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Every day at each listed local time.
    TimesOfDay { times: Vec<NaiveTime>, timezone: Tz },
    /// Every `every`, measured from the last fire.
    Interval { every: Duration },
    /// Once, at `at`.
    Once { at: DateTime<Utc> },
}

impl Trigger {
    /// Build a times-of-day trigger from `HH:MM` strings and a timezone name.
    pub fn times_of_day(times: &[impl AsRef<str>], timezone: &str) -> Result<Self, SchedulerError> {
        if times.is_empty() {
            return Err(SchedulerError::InvalidSchedule(
                "at least one time of day is required".into(),
            ));
        }
        let mut parsed = times
            .iter()
            .map(|t| parse_time_of_day(t.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        parsed.sort();
        parsed.dedup();

        Ok(Trigger::TimesOfDay {
            times: parsed,
            timezone: parse_timezone(timezone)?,
        })
    }

    /// Check the trigger can fire at all after `now`.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        match self {
            Trigger::TimesOfDay { times, .. } if times.is_empty() => Err(
                SchedulerError::InvalidSchedule("at least one time of day is required".into()),
            ),
            Trigger::Interval { every } if every.is_zero() => Err(
                SchedulerError::InvalidSchedule("interval must be greater than zero".into()),
            ),
            Trigger::Once { at } if *at < now => Err(SchedulerError::InvalidSchedule(format!(
                "one-shot time {at} is in the past"
            ))),
            _ => Ok(()),
        }
    }

    /// First fire strictly after `after`. `None` once a one-shot has passed.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::TimesOfDay { times, timezone } => next_fire_after(times, *timezone, after),
            Trigger::Interval { every } => {
                let every = chrono::Duration::from_std(*every).ok()?;
                after.checked_add_signed(every)
            }
            Trigger::Once { at } => (*at > after).then_some(*at),
        }
    }

    /// Fire time at registration. One-shots fire at their instant even if it
    /// is a moment in the past by the time the loop sees it.
    pub(crate) fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Once { at } => Some(*at),
            _ => self.next_after(now),
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Trigger::Once { .. })
    }
}

/// Parse a 24-hour `HH:MM` time of day.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, SchedulerError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|e| SchedulerError::InvalidSchedule(format!("invalid time '{s}': {e}")))
}

/// Parse an IANA timezone name such as `Asia/Kolkata`.
pub fn parse_timezone(name: &str) -> Result<Tz, SchedulerError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidSchedule(format!("unknown timezone '{name}'")))
}

/// Soonest occurrence of any of `times` (local to `tz`) strictly after `after`.
///
/// A local time that falls into a DST gap fires one hour later that day.
/// An ambiguous local time fires at its earlier instant.
pub fn next_fire_after(times: &[NaiveTime], tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = after.with_timezone(&tz).date_naive();

    // Looking at yesterday covers offsets that put "after" early in the local day;
    // two days ahead always contains a later occurrence.
    (0..=3)
        .filter_map(|offset| today.checked_sub_days(Days::new(1))?.checked_add_days(Days::new(offset)))
        .flat_map(|date| {
            times.iter().filter_map(move |time| {
                let local = date.and_time(*time);
                tz.from_local_datetime(&local)
                    .earliest()
                    .or_else(|| {
                        tz.from_local_datetime(&(local + chrono::Duration::hours(1)))
                            .earliest()
                    })
            })
        })
        .map(|fire| fire.with_timezone(&Utc))
        .filter(|fire| *fire > after)
        .min()
}

/// How a job's most recent fire ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure,
    /// The job was due while its previous invocation was still running.
    Skipped,
}

/// Running totals of fire outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeTally {
    pub success: u64,
    pub failure: u64,
    pub skipped: u64,
}

impl OutcomeTally {
    pub(crate) fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Success => self.success += 1,
            JobOutcome::Failure => self.failure += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Snapshot of a registered job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub trigger: Trigger,
    pub enabled: bool,
    /// `None` for a one-shot that has already fired.
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fire: Option<DateTime<Utc>>,
    pub last_outcome: Option<JobOutcome>,
    /// Whether an invocation is in progress.
    pub running: bool,
    pub tally: OutcomeTally,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn new(name: String, trigger: Trigger, now: DateTime<Utc>) -> Self {
        let next_fire = trigger.first_fire(now);
        Self {
            id: JobId::new(),
            name,
            trigger,
            enabled: true,
            next_fire,
            last_fire: None,
            last_outcome: None,
            running: false,
            tally: OutcomeTally::default(),
            created_at: now,
        }
    }

    /// Enabled and scheduled at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire.is_some_and(|at| at <= now)
    }
}
