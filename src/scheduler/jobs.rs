//! Job descriptors, triggers and the per-job state machine.
//!
//! Descriptors are persisted in the `jobs` table; the row, not an in-process
//! flag, is what decides whether a recurring job is already scheduled.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// When a recurring job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fixed interval between runs
    Interval { secs: u64 },
    /// Calendar trigger: once a day at HH:MM UTC
    Daily { hour: u32, minute: u32 },
}

impl Trigger {
    pub fn every_secs(secs: u64) -> Self {
        Trigger::Interval { secs: secs.max(1) }
    }

    pub fn daily_at(hour: u32, minute: u32) -> anyhow::Result<Self> {
        if hour > 23 || minute > 59 {
            anyhow::bail!("invalid daily trigger {:02}:{:02}", hour, minute);
        }
        Ok(Trigger::Daily { hour, minute })
    }

    /// Next fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Trigger::Interval { secs } => now + Duration::seconds(secs.max(1) as i64),
            Trigger::Daily { hour, minute } => {
                let Some(at) = NaiveTime::from_hms_opt(hour, minute, 0) else {
                    return now + Duration::days(1);
                };
                let today = Utc.from_utc_datetime(&now.date_naive().and_time(at));
                // If the execution time has passed today, schedule for tomorrow
                if today <= now {
                    today + Duration::days(1)
                } else {
                    today
                }
            }
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Trigger::Interval { secs } => format!("interval:{}", secs),
            Trigger::Daily { hour, minute } => format!("daily:{:02}:{:02}", hour, minute),
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        if let Some(secs) = s.strip_prefix("interval:") {
            return Ok(Trigger::every_secs(secs.parse()?));
        }
        if let Some(hm) = s.strip_prefix("daily:") {
            let (h, m) = hm
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("malformed daily trigger '{}'", s))?;
            return Trigger::daily_at(h.parse()?, m.parse()?);
        }
        anyhow::bail!("unknown trigger '{}'", s)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// `unscheduled → scheduled → running → scheduled`, with
/// `cancelling → unscheduled` on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Unscheduled,
    Scheduled,
    Running,
    Cancelling,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Unscheduled => "unscheduled",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Cancelling => "cancelling",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unscheduled" => Some(JobState::Unscheduled),
            "scheduled" => Some(JobState::Scheduled),
            "running" => Some(JobState::Running),
            "cancelling" => Some(JobState::Cancelling),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Unscheduled, Scheduled)
                | (Scheduled, Running)
                | (Running, Scheduled)
                | (Scheduled, Cancelling)
                | (Running, Cancelling)
                | (Cancelling, Unscheduled)
        )
    }
}

/// What callers register: `{name, trigger, concurrencyLimit}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub trigger: Trigger,
    pub concurrency_limit: usize,
}

impl JobDescriptor {
    pub fn new(name: &str, trigger: Trigger, concurrency_limit: usize) -> Self {
        JobDescriptor {
            name: name.to_string(),
            trigger,
            concurrency_limit: concurrency_limit.max(1),
        }
    }
}

/// Persisted scheduling state for one recurring job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: String,
    pub trigger: Trigger,
    pub concurrency_limit: usize,
    pub state: JobState,
    pub owner_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_scheduled_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Held by a live owner other than `owner_id`.
    pub fn leased_by_other(&self, owner_id: &str, now: DateTime<Utc>) -> bool {
        match (&self.owner_id, self.lease_expires_at) {
            (Some(owner), Some(expires)) => owner != owner_id && expires > now,
            _ => false,
        }
    }
}

impl ToSql for Trigger {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.encode()))
    }
}

impl FromSql for Trigger {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Trigger::parse(value.as_str()?).map_err(|e| FromSqlError::Other(e.into()))
    }
}

impl ToSql for JobState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        JobState::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown job state '{}'", s).into()))
    }
}
