use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Event state as reported by the result feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Scheduled,
    InProgress,
    HalfTime,
    Finished,
    Postponed,
    Cancelled,
    Abandoned,
}

impl EventStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, EventStatus::InProgress | EventStatus::HalfTime)
    }

    /// The event will not produce a result on its original schedule.
    pub fn is_called_off(&self) -> bool {
        matches!(
            self,
            EventStatus::Postponed | EventStatus::Cancelled | EventStatus::Abandoned
        )
    }
}

/// Explicit per-selection settlement flag published by some feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub selection_id: String,
    pub won: bool,
    /// Market withdrawn; the selection is refunded
    #[serde(default)]
    pub void: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    pub sport: String,
    pub league: Option<String>,
    pub home_team: String,
    pub away_team: String,
    pub start_time: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    #[serde(default)]
    pub selection_results: Vec<SelectionResult>,
}

/// A same-day fixture offered to the fuzzy matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: Option<DateTime<Utc>>,
}

impl From<&ProviderEvent> for Candidate {
    fn from(ev: &ProviderEvent) -> Self {
        Candidate {
            id: ev.id.clone(),
            home_team: ev.home_team.clone(),
            away_team: ev.away_team.clone(),
            start_time: ev.start_time,
        }
    }
}

/// Trait that every result feed must implement.
#[async_trait]
pub trait MatchProvider: Send + Sync {
    /// Look an event up by its provider id; `None` when the feed does not know it.
    async fn fetch_event(&self, event_id: &str) -> Result<Option<ProviderEvent>>;

    /// Fixtures of `sport` scheduled on `date` (UTC).
    async fn list_candidates(&self, date: NaiveDate, sport: &str) -> Result<Vec<Candidate>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
