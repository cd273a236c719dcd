use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::markets::Selection;

#[derive(Debug, Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Lifecycle state shared by wagers and their legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerStatus {
    Pending,
    Won,
    Lost,
    Void,
    Cancelled,
    HalfWon,
    HalfLost,
}

impl WagerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WagerStatus::Pending => "pending",
            WagerStatus::Won => "won",
            WagerStatus::Lost => "lost",
            WagerStatus::Void => "void",
            WagerStatus::Cancelled => "cancelled",
            WagerStatus::HalfWon => "half_won",
            WagerStatus::HalfLost => "half_lost",
        }
    }

    /// Terminal states are write-once.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WagerStatus::Won
                | WagerStatus::Lost
                | WagerStatus::Void
                | WagerStatus::HalfWon
                | WagerStatus::HalfLost
        )
    }
}

impl fmt::Display for WagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WagerStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WagerStatus::Pending),
            "won" => Ok(WagerStatus::Won),
            "lost" => Ok(WagerStatus::Lost),
            "void" => Ok(WagerStatus::Void),
            "cancelled" => Ok(WagerStatus::Cancelled),
            "half_won" => Ok(WagerStatus::HalfWon),
            "half_lost" => Ok(WagerStatus::HalfLost),
            other => Err(ParseEnumError {
                kind: "wager status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerKind {
    Single,
    Combination,
}

impl WagerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WagerKind::Single => "single",
            WagerKind::Combination => "combination",
        }
    }
}

impl FromStr for WagerKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(WagerKind::Single),
            "combination" => Ok(WagerKind::Combination),
            other => Err(ParseEnumError {
                kind: "wager kind",
                value: other.to_string(),
            }),
        }
    }
}

/// One selection within a wager.  A single wager has exactly one leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub leg_index: i64,
    /// External event ID from the match provider
    pub event_id: String,
    pub sport: String,
    pub league: Option<String>,
    /// Team names as snapshotted at placement (used by the fuzzy fallback)
    pub home_team: String,
    pub away_team: String,
    pub market_id: String,
    pub selection_id: String,
    pub market_name: String,
    pub selection_name: String,
    /// Classified once at placement
    pub selection: Selection,
    pub odds_at_placement: f64,
    pub event_start_time: DateTime<Utc>,
    pub estimated_settlement_time: DateTime<Utc>,
    pub status: WagerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub id: String,
    /// Owning account (referenced, never embedded)
    pub account_id: String,
    pub kind: WagerKind,
    /// Frozen at placement
    pub stake: f64,
    /// Odds snapshot; product of leg odds for a combination
    pub total_odds: f64,
    pub status: WagerStatus,
    pub payout: Option<f64>,
    /// Authoritative once persisted
    pub profit: Option<f64>,
    /// Remaining retry budget while `cancelled`
    pub retry_count: i64,
    pub max_retry_count: i64,
    pub estimated_settlement_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Whether the settlement credit was acknowledged by the account service
    pub credit_applied: bool,
    pub legs: Vec<Leg>,
}

impl Wager {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(ParseEnumError {
                kind: "task status",
                value: other.to_string(),
            }),
        }
    }
}

/// A one-off settlement check queued for a specific wager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleTask {
    pub id: i64,
    pub wager_id: String,
    pub run_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceTransaction {
    pub account_id: String,
    /// Signed: negative for debits
    pub amount: f64,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

// ── SQL conversions ──────────────────────────────────────────────────────────

macro_rules! text_enum_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ParseEnumError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum_sql!(WagerStatus);
text_enum_sql!(WagerKind);
text_enum_sql!(TaskStatus);
