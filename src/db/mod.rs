use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod models;
use models::*;

use crate::scheduler::jobs::{JobDescriptor, JobRecord, JobState};

/// Thread-safe SQLite connection pool (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Result of a signed balance mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceChange {
    Applied { balance: f64 },
    /// The reference was already booked; nothing changed
    Duplicate { balance: f64 },
    Insufficient { available: f64 },
    UnknownAccount,
}

/// Result of moving a wager to a new lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// State changed; `credit_due` is the payout still to be credited
    Applied { credit_due: Option<f64> },
    /// Already in the requested terminal state
    AlreadySettled { credit_due: Option<f64> },
    /// Already terminal in a different state
    Conflict { current: WagerStatus },
    /// Cancelled → cancelled; nothing to do
    Unchanged,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Accounts ──────────────────────────────────────────────────────────────

    /// Create an account with an opening balance unless it already exists.
    pub fn ensure_account(&self, account_id: &str, opening_balance: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO accounts (id, balance, updated_at) VALUES (?1, ?2, ?3)",
            params![account_id, opening_balance, Utc::now()],
        )?;
        Ok(())
    }

    pub fn account_balance(&self, account_id: &str) -> Result<Option<f64>> {
        let conn = self.conn()?;
        let balance = conn
            .query_row(
                "SELECT balance FROM accounts WHERE id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance)
    }

    /// Apply a signed balance change booked under a unique reference.
    ///
    /// The balance update and the journal row commit together; replaying the
    /// same reference is a no-op.
    pub fn apply_balance_change(
        &self,
        account_id: &str,
        amount: f64,
        reference: &str,
    ) -> Result<BalanceChange> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let balance: Option<f64> = tx
            .query_row(
                "SELECT balance FROM accounts WHERE id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(balance) = balance else {
            return Ok(BalanceChange::UnknownAccount);
        };

        let already: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM balance_transactions WHERE reference = ?1)",
                params![reference],
                |row| row.get(0),
            )?;
        if already {
            return Ok(BalanceChange::Duplicate { balance });
        }

        let new_balance = round_cents(balance + amount);
        if new_balance < 0.0 {
            return Ok(BalanceChange::Insufficient { available: balance });
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE accounts SET balance = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_balance, now, account_id],
        )?;
        tx.execute(
            "INSERT INTO balance_transactions (account_id, amount, reference, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![account_id, amount, reference, now],
        )?;
        tx.commit()?;
        Ok(BalanceChange::Applied {
            balance: new_balance,
        })
    }

    pub fn list_balance_transactions(&self, account_id: &str) -> Result<Vec<BalanceTransaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT account_id, amount, reference, created_at
             FROM balance_transactions WHERE account_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![account_id], |row| {
                Ok(BalanceTransaction {
                    account_id: row.get(0)?,
                    amount: row.get(1)?,
                    reference: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Wagers ────────────────────────────────────────────────────────────────

    /// Insert a wager and its legs in one transaction
    pub fn insert_wager(&self, wager: &Wager) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO wagers (
                id, account_id, kind, stake, total_odds, status, payout, profit,
                retry_count, max_retry_count, estimated_settlement_time,
                created_at, settled_at, credit_applied
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                wager.id,
                wager.account_id,
                wager.kind,
                wager.stake,
                wager.total_odds,
                wager.status,
                wager.payout,
                wager.profit,
                wager.retry_count,
                wager.max_retry_count,
                wager.estimated_settlement_time,
                wager.created_at,
                wager.settled_at,
                wager.credit_applied,
            ],
        )?;
        for leg in &wager.legs {
            let selection_json = serde_json::to_string(&leg.selection)?;
            tx.execute(
                "INSERT INTO wager_legs (
                    wager_id, leg_index, event_id, sport, league, home_team, away_team,
                    market_id, selection_id, market_name, selection_name, selection,
                    odds_at_placement, event_start_time, estimated_settlement_time, status
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                params![
                    wager.id,
                    leg.leg_index,
                    leg.event_id,
                    leg.sport,
                    leg.league,
                    leg.home_team,
                    leg.away_team,
                    leg.market_id,
                    leg.selection_id,
                    leg.market_name,
                    leg.selection_name,
                    selection_json,
                    leg.odds_at_placement,
                    leg.event_start_time,
                    leg.estimated_settlement_time,
                    leg.status,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_wager(&self, id: &str) -> Result<Option<Wager>> {
        let conn = self.conn()?;
        let wager = conn
            .query_row(
                &format!("SELECT {} FROM wagers WHERE id = ?1", WAGER_COLUMNS),
                params![id],
                map_wager,
            )
            .optional()?;
        match wager {
            Some(mut w) => {
                w.legs = load_legs(&conn, &w.id)?;
                Ok(Some(w))
            }
            None => Ok(None),
        }
    }

    /// List wagers (paginated), optionally filtered by status
    pub fn list_wagers(
        &self,
        status: Option<WagerStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Wager>> {
        let conn = self.conn()?;
        let wagers = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM wagers WHERE status = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                    WAGER_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![status, limit, offset], map_wager)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM wagers ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                    WAGER_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![limit, offset], map_wager)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        with_legs(&conn, wagers)
    }

    /// Pending wagers whose estimated settlement time has passed
    pub fn list_due_wagers(&self, now: DateTime<Utc>) -> Result<Vec<Wager>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM wagers
             WHERE status = 'pending' AND estimated_settlement_time <= ?1
             ORDER BY estimated_settlement_time",
            WAGER_COLUMNS
        ))?;
        let wagers = stmt
            .query_map(params![now], map_wager)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        with_legs(&conn, wagers)
    }

    /// Cancelled wagers with retry budget left
    pub fn list_retryable_wagers(&self) -> Result<Vec<Wager>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM wagers
             WHERE status = 'cancelled' AND retry_count > 0
             ORDER BY estimated_settlement_time",
            WAGER_COLUMNS
        ))?;
        let wagers = stmt
            .query_map([], map_wager)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        with_legs(&conn, wagers)
    }

    /// Terminal wagers with a recorded but unacknowledged credit
    pub fn list_uncredited_settlements(&self) -> Result<Vec<Wager>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM wagers
             WHERE status IN ('won','lost','void','half_won','half_lost')
               AND credit_applied = 0 AND payout > 0",
            WAGER_COLUMNS
        ))?;
        let wagers = stmt
            .query_map([], map_wager)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        with_legs(&conn, wagers)
    }

    /// Cancelled wagers out of retry budget whose stake refund is unacknowledged
    pub fn list_unrefunded_exhausted(&self) -> Result<Vec<Wager>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM wagers
             WHERE status = 'cancelled' AND retry_count = 0 AND credit_applied = 0",
            WAGER_COLUMNS
        ))?;
        let wagers = stmt
            .query_map([], map_wager)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        with_legs(&conn, wagers)
    }

    /// Move a wager to `target` guarded by its current state.
    ///
    /// Terminal states are write-once.  Only `pending` and `cancelled` wagers
    /// may transition, and a cancelled wager whose retry budget is spent is
    /// closed (its stake was refunded).  A terminal target records the
    /// payout, the derived profit and whether a credit is still owed.
    pub fn transition_wager(
        &self,
        id: &str,
        target: WagerStatus,
        payout: f64,
        leg_statuses: &[(i64, WagerStatus)],
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        if target == WagerStatus::Pending {
            anyhow::bail!("cannot transition wager {} back to pending", id);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let row: Option<(WagerStatus, f64, Option<f64>, bool, i64)> = tx
            .query_row(
                "SELECT status, stake, payout, credit_applied, retry_count
                 FROM wagers WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;
        let (current, stake, stored_payout, credit_applied, retry_count) =
            row.with_context(|| format!("wager {} not found", id))?;

        if current.is_terminal() {
            if current != target {
                return Ok(Transition::Conflict { current });
            }
            let owed = stored_payout.filter(|p| *p > 0.0 && !credit_applied);
            return Ok(Transition::AlreadySettled { credit_due: owed });
        }
        if current == WagerStatus::Cancelled && retry_count == 0 && target.is_terminal() {
            return Ok(Transition::Conflict { current });
        }
        if current == WagerStatus::Cancelled && target == WagerStatus::Cancelled {
            update_leg_statuses(&tx, id, leg_statuses)?;
            tx.commit()?;
            return Ok(Transition::Unchanged);
        }

        let credit_due = if target.is_terminal() {
            let payout = round_cents(payout.max(0.0));
            tx.execute(
                "UPDATE wagers
                 SET status = ?1, payout = ?2, profit = ?3, settled_at = ?4, credit_applied = ?5
                 WHERE id = ?6",
                params![
                    target,
                    payout,
                    round_cents(payout - stake),
                    now,
                    payout <= 0.0,
                    id
                ],
            )?;
            (payout > 0.0).then_some(payout)
        } else {
            tx.execute(
                "UPDATE wagers SET status = ?1 WHERE id = ?2",
                params![target, id],
            )?;
            None
        };
        update_leg_statuses(&tx, id, leg_statuses)?;
        tx.commit()?;
        Ok(Transition::Applied { credit_due })
    }

    /// Persist partially resolved legs on a wager that is still open.
    pub fn record_leg_progress(&self, id: &str, leg_statuses: &[(i64, WagerStatus)]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let status: Option<WagerStatus> = tx
            .query_row(
                "SELECT status FROM wagers WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(s) if !s.is_terminal() => {
                update_leg_statuses(&tx, id, leg_statuses)?;
                tx.commit()?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn mark_credit_applied(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE wagers SET credit_applied = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Decrement the retry budget of a cancelled wager; returns what is left.
    pub fn consume_retry(&self, id: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE wagers SET retry_count = MAX(retry_count - 1, 0)
             WHERE id = ?1 AND status = 'cancelled'",
            params![id],
        )?;
        let left = conn.query_row(
            "SELECT retry_count FROM wagers WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(left)
    }

    /// Fill `profit` on terminal rows that never had it.  Stored values are
    /// never overwritten.
    pub fn backfill_profit(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE wagers SET profit = ROUND(payout - stake, 2)
             WHERE profit IS NULL AND payout IS NOT NULL
               AND status IN ('won','lost','void','half_won','half_lost')",
            [],
        )?;
        Ok(n)
    }

    pub fn get_stats(&self) -> Result<WagerStats> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'pending'), 0),
                    COALESCE(SUM(status = 'cancelled'), 0),
                    COALESCE(SUM(status IN ('won','lost','void','half_won','half_lost')), 0),
                    COALESCE(SUM(stake), 0),
                    COALESCE(SUM(payout), 0),
                    COALESCE(SUM(profit), 0)
             FROM wagers",
            [],
            |r| {
                Ok(WagerStats {
                    total_wagers: r.get(0)?,
                    pending: r.get(1)?,
                    cancelled: r.get(2)?,
                    settled: r.get(3)?,
                    total_staked: r.get(4)?,
                    total_payout: r.get(5)?,
                    total_profit: r.get(6)?,
                })
            },
        )?;
        Ok(stats)
    }

    // ── Jobs ──────────────────────────────────────────────────────────────────

    /// Insert the descriptor if absent, otherwise refresh trigger and limit.
    /// Scheduling state on an existing row is left untouched.
    pub fn upsert_job(&self, desc: &JobDescriptor) -> Result<JobRecord> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (name, trigger, concurrency_limit, state, updated_at)
             VALUES (?1, ?2, ?3, 'unscheduled', ?4)
             ON CONFLICT(name) DO UPDATE SET
                trigger = excluded.trigger,
                concurrency_limit = excluded.concurrency_limit,
                updated_at = excluded.updated_at",
            params![desc.name, desc.trigger, desc.concurrency_limit as i64, Utc::now()],
        )?;
        get_job(&conn, &desc.name)?.with_context(|| format!("job {} vanished", desc.name))
    }

    pub fn get_job(&self, name: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn()?;
        get_job(&conn, name)
    }

    pub fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs ORDER BY name",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([], map_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Take the scheduling lease for `name` unless a live owner holds it.
    ///
    /// Keeps a persisted `next_run_at`; only fills it when the row never had one.
    pub fn try_acquire_job(
        &self,
        name: &str,
        owner_id: &str,
        lease_until: DateTime<Utc>,
        first_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET
                owner_id = ?1,
                lease_expires_at = ?2,
                state = 'scheduled',
                next_run_at = COALESCE(next_run_at, ?3),
                updated_at = ?4
             WHERE name = ?5
               AND state IN ('unscheduled', 'scheduled', 'running')
               AND (owner_id IS NULL OR owner_id = ?1
                    OR lease_expires_at IS NULL OR lease_expires_at <= ?4)",
            params![owner_id, lease_until, first_run_at, now, name],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        get_job(&conn, name)
    }

    /// Move a job this owner holds to `next`, validating the state machine.
    pub fn transition_job(
        &self,
        name: &str,
        owner_id: &str,
        next: JobState,
        update: JobUpdate,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let row: Option<(JobState, Option<String>)> = tx
            .query_row(
                "SELECT state, owner_id FROM jobs WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (current, owner) = row.with_context(|| format!("job {} not found", name))?;
        if owner.as_deref() != Some(owner_id) {
            anyhow::bail!("job {} is not owned by {}", name, owner_id);
        }
        if !current.can_transition_to(next) {
            anyhow::bail!("illegal job transition {} → {} for {}", current.as_str(), next.as_str(), name);
        }
        let release = next == JobState::Unscheduled;
        let set_error = update.last_error.is_some();
        let error = update.last_error.flatten();
        tx.execute(
            "UPDATE jobs SET
                state = ?1,
                lease_expires_at = CASE WHEN ?2 THEN NULL ELSE COALESCE(?3, lease_expires_at) END,
                owner_id = CASE WHEN ?2 THEN NULL ELSE owner_id END,
                next_run_at = COALESCE(?4, next_run_at),
                last_scheduled_at = COALESCE(?5, last_scheduled_at),
                last_error = CASE WHEN ?6 THEN ?7 ELSE last_error END,
                updated_at = ?8
             WHERE name = ?9",
            params![
                next,
                release,
                update.lease_until,
                update.next_run_at,
                update.last_scheduled_at,
                set_error,
                error,
                Utc::now(),
                name
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Extend the lease; returns false if this owner lost the job.
    pub fn renew_job_lease(
        &self,
        name: &str,
        owner_id: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET lease_expires_at = ?1 WHERE name = ?2 AND owner_id = ?3",
            params![lease_until, name, owner_id],
        )?;
        Ok(changed == 1)
    }

    /// Release jobs whose owner's lease lapsed (crashed or killed process),
    /// plus any still held under `own_id` by a previous run of this instance.
    pub fn release_expired_jobs(&self, now: DateTime<Utc>, own_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET
                state = CASE state WHEN 'cancelling' THEN 'unscheduled'
                                   WHEN 'running' THEN 'scheduled'
                                   ELSE state END,
                owner_id = NULL,
                lease_expires_at = NULL,
                updated_at = ?1
             WHERE owner_id IS NOT NULL
               AND (lease_expires_at IS NULL OR lease_expires_at <= ?1 OR owner_id = ?2)",
            params![now, own_id],
        )?;
        Ok(n)
    }

    // ── One-off settlement tasks ─────────────────────────────────────────────

    /// Queue a settlement check.  At most one task exists per wager; a second
    /// enqueue only pulls a queued task's run time earlier.
    pub fn enqueue_settle_task(&self, wager_id: &str, run_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (kind, wager_id, run_at, status, attempts, created_at)
             VALUES ('settle_wager', ?1, ?2, 'queued', 0, ?3)
             ON CONFLICT(kind, wager_id) DO UPDATE SET
                run_at = MIN(tasks.run_at, excluded.run_at)
             WHERE tasks.status = 'queued'",
            params![wager_id, run_at, Utc::now()],
        )?;
        Ok(())
    }

    /// Claim up to `limit` due tasks, marking them running.
    pub fn claim_due_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SettleTask>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let tasks = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM tasks
                 WHERE status = 'queued' AND run_at <= ?1
                 ORDER BY run_at LIMIT ?2",
                TASK_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![now, limit as i64], map_task)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        for task in &tasks {
            tx.execute(
                "UPDATE tasks SET status = 'running', attempts = attempts + 1 WHERE id = ?1",
                params![task.id],
            )?;
        }
        tx.commit()?;
        Ok(tasks
            .into_iter()
            .map(|t| SettleTask {
                status: TaskStatus::Running,
                attempts: t.attempts + 1,
                ..t
            })
            .collect())
    }

    pub fn complete_task(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET status = 'done', last_error = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn reschedule_task(&self, id: i64, run_at: DateTime<Utc>, error: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET status = 'queued', run_at = ?1, last_error = ?2 WHERE id = ?3",
            params![run_at, error, id],
        )?;
        Ok(())
    }

    pub fn fail_task(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET status = 'failed', last_error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }

    /// Put tasks left `running` by a previous process back in the queue.
    pub fn requeue_running_tasks(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET status = 'queued' WHERE status = 'running'",
            [],
        )?;
        Ok(n)
    }

    pub fn get_task_for_wager(&self, wager_id: &str) -> Result<Option<SettleTask>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!(
                    "SELECT {} FROM tasks WHERE kind = 'settle_wager' AND wager_id = ?1",
                    TASK_COLUMNS
                ),
                params![wager_id],
                map_task,
            )
            .optional()?;
        Ok(task)
    }
}

/// Optional column updates applied alongside a job state change.
#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    pub lease_until: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_scheduled_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the error, `Some(Some(e))` records one
    pub last_error: Option<Option<String>>,
}

pub fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

const WAGER_COLUMNS: &str = "id, account_id, kind, stake, total_odds, status, payout, profit,
    retry_count, max_retry_count, estimated_settlement_time, created_at, settled_at,
    credit_applied";

const JOB_COLUMNS: &str = "name, trigger, concurrency_limit, state, owner_id, lease_expires_at,
    last_scheduled_at, next_run_at, last_error";

const TASK_COLUMNS: &str = "id, wager_id, run_at, status, attempts, last_error";

fn map_wager(row: &rusqlite::Row) -> rusqlite::Result<Wager> {
    Ok(Wager {
        id: row.get(0)?,
        account_id: row.get(1)?,
        kind: row.get(2)?,
        stake: row.get(3)?,
        total_odds: row.get(4)?,
        status: row.get(5)?,
        payout: row.get(6)?,
        profit: row.get(7)?,
        retry_count: row.get(8)?,
        max_retry_count: row.get(9)?,
        estimated_settlement_time: row.get(10)?,
        created_at: row.get(11)?,
        settled_at: row.get(12)?,
        credit_applied: row.get(13)?,
        legs: Vec::new(),
    })
}

fn map_leg(row: &rusqlite::Row) -> rusqlite::Result<Leg> {
    let selection_json: String = row.get(11)?;
    let selection = serde_json::from_str(&selection_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Leg {
        leg_index: row.get(0)?,
        event_id: row.get(1)?,
        sport: row.get(2)?,
        league: row.get(3)?,
        home_team: row.get(4)?,
        away_team: row.get(5)?,
        market_id: row.get(6)?,
        selection_id: row.get(7)?,
        market_name: row.get(8)?,
        selection_name: row.get(9)?,
        odds_at_placement: row.get(10)?,
        selection,
        event_start_time: row.get(12)?,
        estimated_settlement_time: row.get(13)?,
        status: row.get(14)?,
    })
}

fn map_job(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
    let limit: i64 = row.get(2)?;
    Ok(JobRecord {
        name: row.get(0)?,
        trigger: row.get(1)?,
        concurrency_limit: limit.max(1) as usize,
        state: row.get(3)?,
        owner_id: row.get(4)?,
        lease_expires_at: row.get(5)?,
        last_scheduled_at: row.get(6)?,
        next_run_at: row.get(7)?,
        last_error: row.get(8)?,
    })
}

fn map_task(row: &rusqlite::Row) -> rusqlite::Result<SettleTask> {
    Ok(SettleTask {
        id: row.get(0)?,
        wager_id: row.get(1)?,
        run_at: row.get(2)?,
        status: row.get(3)?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
    })
}

fn load_legs(conn: &Connection, wager_id: &str) -> Result<Vec<Leg>> {
    let mut stmt = conn.prepare_cached(
        "SELECT leg_index, event_id, sport, league, home_team, away_team,
                market_id, selection_id, market_name, selection_name,
                odds_at_placement, selection, event_start_time,
                estimated_settlement_time, status
         FROM wager_legs WHERE wager_id = ?1 ORDER BY leg_index",
    )?;
    let legs = stmt
        .query_map(params![wager_id], map_leg)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(legs)
}

fn with_legs(conn: &Connection, mut wagers: Vec<Wager>) -> Result<Vec<Wager>> {
    for w in &mut wagers {
        w.legs = load_legs(conn, &w.id)?;
    }
    Ok(wagers)
}

fn update_leg_statuses(
    conn: &Connection,
    wager_id: &str,
    leg_statuses: &[(i64, WagerStatus)],
) -> Result<()> {
    for (leg_index, status) in leg_statuses {
        conn.execute(
            "UPDATE wager_legs SET status = ?1 WHERE wager_id = ?2 AND leg_index = ?3",
            params![status, wager_id, leg_index],
        )?;
    }
    Ok(())
}

fn get_job(conn: &Connection, name: &str) -> Result<Option<JobRecord>> {
    let job = conn
        .query_row(
            &format!("SELECT {} FROM jobs WHERE name = ?1", JOB_COLUMNS),
            params![name],
            map_job,
        )
        .optional()?;
    Ok(job)
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id          TEXT    PRIMARY KEY,
    balance     REAL    NOT NULL,
    updated_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS balance_transactions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id  TEXT    NOT NULL,
    amount      REAL    NOT NULL,
    reference   TEXT    NOT NULL UNIQUE,
    created_at  TEXT    NOT NULL,
    FOREIGN KEY (account_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS wagers (
    id                        TEXT    PRIMARY KEY,
    account_id                TEXT    NOT NULL,
    kind                      TEXT    NOT NULL,
    stake                     REAL    NOT NULL CHECK (stake > 0),
    total_odds                REAL    NOT NULL,
    status                    TEXT    NOT NULL DEFAULT 'pending',
    payout                    REAL,
    profit                    REAL,
    retry_count               INTEGER NOT NULL,
    max_retry_count           INTEGER NOT NULL,
    estimated_settlement_time TEXT    NOT NULL,
    created_at                TEXT    NOT NULL,
    settled_at                TEXT,
    credit_applied            INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS wager_legs (
    wager_id                  TEXT    NOT NULL,
    leg_index                 INTEGER NOT NULL,
    event_id                  TEXT    NOT NULL,
    sport                     TEXT    NOT NULL,
    league                    TEXT,
    home_team                 TEXT    NOT NULL,
    away_team                 TEXT    NOT NULL,
    market_id                 TEXT    NOT NULL,
    selection_id              TEXT    NOT NULL,
    market_name               TEXT    NOT NULL,
    selection_name            TEXT    NOT NULL,
    selection                 TEXT    NOT NULL,
    odds_at_placement         REAL    NOT NULL,
    event_start_time          TEXT    NOT NULL,
    estimated_settlement_time TEXT    NOT NULL,
    status                    TEXT    NOT NULL DEFAULT 'pending',
    PRIMARY KEY (wager_id, leg_index),
    FOREIGN KEY (wager_id) REFERENCES wagers(id)
);

CREATE TABLE IF NOT EXISTS jobs (
    name              TEXT    PRIMARY KEY,
    trigger           TEXT    NOT NULL,
    concurrency_limit INTEGER NOT NULL,
    state             TEXT    NOT NULL DEFAULT 'unscheduled',
    owner_id          TEXT,
    lease_expires_at  TEXT,
    last_scheduled_at TEXT,
    next_run_at       TEXT,
    last_error        TEXT,
    updated_at        TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    kind        TEXT    NOT NULL,
    wager_id    TEXT    NOT NULL,
    run_at      TEXT    NOT NULL,
    status      TEXT    NOT NULL DEFAULT 'queued',
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    created_at  TEXT    NOT NULL,
    UNIQUE (kind, wager_id)
);

CREATE INDEX IF NOT EXISTS idx_wagers_status_due ON wagers(status, estimated_settlement_time);
CREATE INDEX IF NOT EXISTS idx_wagers_account ON wagers(account_id);
CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(status, run_at);
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagerStats {
    pub total_wagers: i64,
    pub pending: i64,
    pub cancelled: i64,
    pub settled: i64,
    pub total_staked: f64,
    pub total_payout: f64,
    pub total_profit: f64,
}
