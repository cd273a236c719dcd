use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::evaluator::{evaluate_leg, evaluate_wager, Decision};
use crate::accounts::BalanceAccounts;
use crate::db::models::{Leg, SettleTask, Wager, WagerKind, WagerStatus};
use crate::db::Database;
use crate::error::{SettlementError, SettlementResult};
use crate::ledger::WagerLedger;
use crate::markets::{validate_odds, Selection};
use crate::resolver::{MatchResolver, ResolveRequest, Resolution};

/// Tunables for placement and the settlement workflow.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Retry budget granted to each wager
    pub max_retry_count: i64,
    /// Pending this long past the estimated settlement time → cancelled
    pub stale_after: Duration,
    /// Delay before an unresolved one-off task runs again
    pub reschedule_delay: Duration,
    pub reschedule_jitter_secs: i64,
    /// Pause between consecutive wagers in the retry sweep
    pub retry_spacing: std::time::Duration,
    /// Tasks claimed per queue drain
    pub task_batch: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            max_retry_count: 3,
            stale_after: Duration::hours(24),
            reschedule_delay: Duration::seconds(900),
            reschedule_jitter_secs: 60,
            retry_spacing: std::time::Duration::from_secs(2),
            task_batch: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegRequest {
    pub event_id: String,
    pub sport: String,
    #[serde(default)]
    pub league: Option<String>,
    pub home_team: String,
    pub away_team: String,
    pub market_id: String,
    pub selection_id: String,
    pub market_name: String,
    pub selection_name: String,
    pub odds: f64,
    pub event_start_time: DateTime<Utc>,
    #[serde(default)]
    pub estimated_settlement_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceWagerRequest {
    pub account_id: String,
    pub kind: WagerKind,
    pub stake: f64,
    pub legs: Vec<LegRequest>,
}

/// Result of one settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettleOutcome {
    Settled { status: WagerStatus, payout: f64 },
    /// Moved (or kept) in `cancelled`
    Cancelled,
    /// No terminal result yet
    Unresolved,
    AlreadyTerminal,
    /// Another worker holds this wager
    Busy,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub settled: usize,
    pub cancelled: usize,
    pub unresolved: usize,
    pub failed: usize,
}

impl SweepReport {
    fn record(&mut self, wager_id: &str, outcome: &SettlementResult<SettleOutcome>) {
        self.examined += 1;
        match outcome {
            Ok(SettleOutcome::Settled { .. }) | Ok(SettleOutcome::AlreadyTerminal) => {
                self.settled += 1
            }
            Ok(SettleOutcome::Cancelled) => self.cancelled += 1,
            Ok(SettleOutcome::Unresolved) | Ok(SettleOutcome::Busy) => self.unresolved += 1,
            Err(e @ SettlementError::LedgerConsistency { .. }) => {
                self.failed += 1;
                error!("Wager {}: {}", wager_id, e);
            }
            Err(e) => {
                self.failed += 1;
                warn!("Wager {} not settled this sweep: {}", wager_id, e);
            }
        }
    }
}

/// Wager ids currently being settled by some worker.
#[derive(Default)]
struct InFlight {
    ids: Mutex<HashSet<String>>,
}

struct InFlightGuard<'a> {
    owner: &'a InFlight,
    id: String,
}

impl InFlight {
    fn try_claim(&self, id: &str) -> Option<InFlightGuard<'_>> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            owner: self,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Typical wall-clock length of an event, used when the caller gives no
/// settlement time.
pub fn default_event_duration(sport: &str) -> Duration {
    match sport.to_lowercase().as_str() {
        "soccer" | "football" => Duration::minutes(120),
        "basketball" | "nba" => Duration::minutes(150),
        "american_football" | "nfl" => Duration::minutes(210),
        "baseball" | "mlb" => Duration::minutes(210),
        "ice_hockey" | "nhl" => Duration::minutes(180),
        "tennis" => Duration::minutes(180),
        _ => Duration::minutes(180),
    }
}

pub struct SettlementEngine {
    db: Database,
    ledger: WagerLedger,
    accounts: Arc<dyn BalanceAccounts>,
    resolver: Arc<MatchResolver>,
    settings: EngineSettings,
    in_flight: InFlight,
}

impl SettlementEngine {
    pub fn new(
        db: Database,
        ledger: WagerLedger,
        accounts: Arc<dyn BalanceAccounts>,
        resolver: Arc<MatchResolver>,
        settings: EngineSettings,
    ) -> Self {
        SettlementEngine {
            db,
            ledger,
            accounts,
            resolver,
            settings,
            in_flight: InFlight::default(),
        }
    }

    pub fn ledger(&self) -> &WagerLedger {
        &self.ledger
    }

    pub fn resolver(&self) -> &MatchResolver {
        &self.resolver
    }

    // ── Placement ─────────────────────────────────────────────────────────────

    /// Validate, debit the stake, persist the wager and queue its settlement.
    pub async fn place_wager(&self, req: PlaceWagerRequest) -> SettlementResult<Wager> {
        let wager = self.build_wager(req, Utc::now())?;
        let stake_ref = format!("stake:{}", wager.id);

        self.accounts
            .debit(&wager.account_id, wager.stake, &stake_ref)
            .await?;

        if let Err(e) = self.ledger.create(&wager) {
            error!("Failed to persist wager {}, reversing stake: {}", wager.id, e);
            let reversal = format!("stake-reversal:{}", wager.id);
            if let Err(rev) = self
                .accounts
                .credit(&wager.account_id, wager.stake, &reversal)
                .await
            {
                error!("Stake reversal {} failed: {}", reversal, rev);
            }
            return Err(e);
        }

        // The settlement sweep picks the wager up even if this fails
        if let Err(e) = self
            .db
            .enqueue_settle_task(&wager.id, wager.estimated_settlement_time)
        {
            warn!("Could not queue settlement task for {}: {}", wager.id, e);
        }
        Ok(wager)
    }

    fn build_wager(&self, req: PlaceWagerRequest, now: DateTime<Utc>) -> SettlementResult<Wager> {
        let invalid = |msg: String| SettlementError::Validation(msg);

        if req.account_id.trim().is_empty() {
            return Err(invalid("account id is required".into()));
        }
        if !(req.stake.is_finite() && req.stake > 0.0) {
            return Err(invalid(format!("stake must be positive, got {}", req.stake)));
        }
        match req.kind {
            WagerKind::Single if req.legs.len() != 1 => {
                return Err(invalid(format!(
                    "single wager needs exactly one selection, got {}",
                    req.legs.len()
                )))
            }
            WagerKind::Combination => {
                if req.legs.len() < 2 {
                    return Err(invalid("combination needs at least two selections".into()));
                }
                let events: HashSet<&str> = req.legs.iter().map(|l| l.event_id.as_str()).collect();
                if events.len() != req.legs.len() {
                    return Err(invalid("combination legs must be on distinct events".into()));
                }
            }
            _ => {}
        }

        let mut legs = Vec::with_capacity(req.legs.len());
        for (i, l) in req.legs.into_iter().enumerate() {
            if l.event_id.trim().is_empty() || l.selection_id.trim().is_empty() {
                return Err(invalid(format!("leg {} is missing its event or selection", i)));
            }
            if !validate_odds(l.odds) {
                return Err(invalid(format!("leg {} odds must exceed 1.0, got {}", i, l.odds)));
            }
            let selection =
                Selection::classify(&l.market_name, &l.selection_name, &l.home_team, &l.away_team)
                    .map_err(|e| invalid(format!("leg {}: {}", i, e)))?;
            debug!("Leg {} on {} classified as {}", i, l.event_id, selection.market.label());
            let estimated = l
                .estimated_settlement_time
                .unwrap_or_else(|| l.event_start_time + default_event_duration(&l.sport));

            legs.push(Leg {
                leg_index: i as i64,
                event_id: l.event_id,
                sport: l.sport.to_lowercase(),
                league: l.league,
                home_team: l.home_team,
                away_team: l.away_team,
                market_id: l.market_id,
                selection_id: l.selection_id,
                market_name: l.market_name,
                selection_name: l.selection_name,
                selection,
                odds_at_placement: l.odds,
                event_start_time: l.event_start_time,
                estimated_settlement_time: estimated,
                status: WagerStatus::Pending,
            });
        }

        let total_odds = legs.iter().map(|l| l.odds_at_placement).product::<f64>();
        let estimated_settlement_time = legs
            .iter()
            .map(|l| l.estimated_settlement_time)
            .max()
            .unwrap_or(now);

        Ok(Wager {
            id: Uuid::new_v4().to_string(),
            account_id: req.account_id,
            kind: req.kind,
            stake: req.stake,
            total_odds,
            status: WagerStatus::Pending,
            payout: None,
            profit: None,
            retry_count: self.settings.max_retry_count,
            max_retry_count: self.settings.max_retry_count,
            estimated_settlement_time,
            created_at: now,
            settled_at: None,
            credit_applied: false,
            legs,
        })
    }

    // ── Settlement ────────────────────────────────────────────────────────────

    /// Resolve every open leg, evaluate and record the outcome.
    pub async fn settle_wager(
        &self,
        wager: &Wager,
        now: DateTime<Utc>,
    ) -> SettlementResult<SettleOutcome> {
        if wager.is_terminal() {
            return Ok(SettleOutcome::AlreadyTerminal);
        }

        let mut statuses = Vec::with_capacity(wager.legs.len());
        let mut progress = Vec::new();
        let mut failure: Option<SettlementError> = None;

        for leg in &wager.legs {
            if leg.status.is_terminal() {
                statuses.push(leg.status);
                continue;
            }
            // One lost leg decides a combination; skip the remaining lookups
            if failure.is_some() || statuses.contains(&WagerStatus::Lost) {
                statuses.push(WagerStatus::Pending);
                continue;
            }
            let status = match self.resolver.resolve(&ResolveRequest::from(leg)).await {
                Ok(Resolution::Finished(result)) => evaluate_leg(leg, &result),
                Ok(Resolution::Cancelled { reason }) => {
                    info!("Wager {} leg {}: {}", wager.id, leg.leg_index, reason);
                    WagerStatus::Cancelled
                }
                Ok(Resolution::NotFinished) => WagerStatus::Pending,
                Err(e) if e.is_reschedule() => {
                    debug!("Wager {} leg {}: {}", wager.id, leg.leg_index, e);
                    WagerStatus::Pending
                }
                Err(e) => {
                    failure = Some(e);
                    WagerStatus::Pending
                }
            };
            if status != leg.status {
                progress.push((leg.leg_index, status));
            }
            statuses.push(status);
        }

        let decision = evaluate_wager(wager, &statuses);
        if decision.status.is_terminal() {
            self.ledger
                .apply_outcome(&wager.id, decision.status, decision.payout, &progress)
                .await?;
            return Ok(settled(decision));
        }

        if let Some(e) = failure {
            self.ledger.record_leg_progress(&wager.id, &progress)?;
            return Err(e);
        }

        let stale = now - wager.estimated_settlement_time > self.settings.stale_after;
        if wager.status == WagerStatus::Pending
            && (decision.status == WagerStatus::Cancelled || stale)
        {
            if decision.status == WagerStatus::Pending {
                warn!(
                    "Wager {} unresolved {}h past its settlement time, cancelling",
                    wager.id,
                    (now - wager.estimated_settlement_time).num_hours()
                );
            }
            self.ledger
                .apply_outcome(&wager.id, WagerStatus::Cancelled, 0.0, &progress)
                .await?;
            return Ok(SettleOutcome::Cancelled);
        }

        self.ledger.record_leg_progress(&wager.id, &progress)?;
        Ok(SettleOutcome::Unresolved)
    }

    async fn settle_guarded(
        &self,
        wager: &Wager,
        now: DateTime<Utc>,
    ) -> SettlementResult<SettleOutcome> {
        let Some(_guard) = self.in_flight.try_claim(&wager.id) else {
            debug!("Wager {} already being settled", wager.id);
            return Ok(SettleOutcome::Busy);
        };
        // The caller's copy may predate another worker's settlement
        let current = self.ledger.get(&wager.id)?;
        self.settle_wager(&current, now).await
    }

    /// Settle every pending wager that is due, `concurrency` at a time.
    pub async fn run_settlement_sweep(
        &self,
        now: DateTime<Utc>,
        concurrency: usize,
    ) -> SettlementResult<SweepReport> {
        let due = self.ledger.find_due_for_settlement(now)?;
        let mut report = SweepReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        info!("Settlement sweep: {} wager(s) due", due.len());

        let pending: Vec<_> = due
            .iter()
            .map(|w| async move { (w.id.clone(), self.settle_guarded(w, now).await) })
            .collect();
        let results: Vec<(String, SettlementResult<SettleOutcome>)> = stream::iter(pending)
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        for (id, outcome) in &results {
            report.record(id, outcome);
        }
        info!(
            "Settlement sweep done: {} settled, {} cancelled, {} unresolved, {} failed",
            report.settled, report.cancelled, report.unresolved, report.failed
        );
        Ok(report)
    }

    /// Re-evaluate cancelled wagers one at a time, spending retry budget on
    /// each that stays unresolved.
    pub async fn run_retry_sweep(&self, now: DateTime<Utc>) -> SettlementResult<SweepReport> {
        let retryable = self.ledger.find_retryable(now)?;
        let mut report = SweepReport::default();
        if retryable.is_empty() {
            return Ok(report);
        }
        info!("Retry sweep: {} cancelled wager(s) with budget left", retryable.len());

        for (i, wager) in retryable.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.retry_spacing).await;
            }
            let outcome = self.settle_guarded(wager, now).await;
            let resolved = matches!(
                outcome,
                Ok(SettleOutcome::Settled { .. })
                    | Ok(SettleOutcome::AlreadyTerminal)
                    | Ok(SettleOutcome::Busy)
            );
            if !resolved {
                match self.ledger.consume_retry(&wager.id).await {
                    Ok(left) => debug!("Wager {} retry budget left: {}", wager.id, left),
                    Err(e) => warn!("Could not spend retry on {}: {}", wager.id, e),
                }
            }
            report.record(&wager.id, &outcome);
        }
        Ok(report)
    }

    /// Drain due one-off settlement tasks.
    pub async fn run_task_queue(
        &self,
        now: DateTime<Utc>,
        concurrency: usize,
    ) -> SettlementResult<SweepReport> {
        let tasks = self.db.claim_due_tasks(now, self.settings.task_batch)?;
        let mut report = SweepReport::default();
        if tasks.is_empty() {
            return Ok(report);
        }
        debug!("Task queue: {} due", tasks.len());

        let results: Vec<(String, SettlementResult<SettleOutcome>)> = stream::iter(tasks)
            .map(|task| async move { self.run_task(task, now).await })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        for (id, outcome) in &results {
            report.record(id, outcome);
        }
        Ok(report)
    }

    async fn run_task(
        &self,
        task: SettleTask,
        now: DateTime<Utc>,
    ) -> (String, SettlementResult<SettleOutcome>) {
        let wager = match self.ledger.get(&task.wager_id) {
            Ok(w) => w,
            Err(e) => {
                let store = match &e {
                    SettlementError::UnknownWager(_) => self.db.fail_task(task.id, &e.to_string()),
                    _ => self
                        .db
                        .reschedule_task(task.id, self.next_attempt(now), Some(&e.to_string())),
                };
                if let Err(db_err) = store {
                    warn!("Task {} bookkeeping failed: {}", task.id, db_err);
                }
                return (task.wager_id, Err(e));
            }
        };

        let outcome = self.settle_guarded(&wager, now).await;
        let store = match &outcome {
            Ok(SettleOutcome::Settled { .. })
            | Ok(SettleOutcome::AlreadyTerminal)
            | Ok(SettleOutcome::Cancelled) => self.db.complete_task(task.id),
            Ok(SettleOutcome::Unresolved) | Ok(SettleOutcome::Busy) => {
                self.db.reschedule_task(task.id, self.next_attempt(now), None)
            }
            Err(e @ SettlementError::LedgerConsistency { .. }) => {
                self.db.fail_task(task.id, &e.to_string())
            }
            Err(e) => self
                .db
                .reschedule_task(task.id, self.next_attempt(now), Some(&e.to_string())),
        };
        if let Err(db_err) = store {
            warn!("Task {} bookkeeping failed: {}", task.id, db_err);
        }
        (task.wager_id, outcome)
    }

    fn next_attempt(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let jitter = if self.settings.reschedule_jitter_secs > 0 {
            rand::thread_rng().gen_range(0..=self.settings.reschedule_jitter_secs)
        } else {
            0
        };
        now + self.settings.reschedule_delay + Duration::seconds(jitter)
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    /// Startup pass: repair unacknowledged credits, then settle everything
    /// already overdue without waiting for the first tick.
    pub async fn recover(
        &self,
        now: DateTime<Utc>,
        concurrency: usize,
    ) -> SettlementResult<SweepReport> {
        self.ledger.reconcile_credits().await?;
        let report = self.run_settlement_sweep(now, concurrency).await?;
        info!("Recovery pass examined {} overdue wager(s)", report.examined);
        Ok(report)
    }

    /// Daily ledger upkeep.
    pub async fn run_ledger_maintenance(&self) -> SettlementResult<(usize, usize)> {
        let credits = self.ledger.reconcile_credits().await?;
        let backfilled = self.ledger.backfill_profit()?;
        Ok((credits, backfilled))
    }
}

fn settled(decision: Decision) -> SettleOutcome {
    SettleOutcome::Settled {
        status: decision.status,
        payout: decision.payout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::SqliteAccounts;
    use crate::cache::{TierTtls, TtlCache};
    use crate::db::models::TaskStatus;
    use crate::resolver::testing::{event, MockProvider};
    use crate::resolver::{EventStatus, ResolverConfig, SelectionResult};
    use approx::assert_relative_eq;

    struct Harness {
        engine: Arc<SettlementEngine>,
        provider: Arc<MockProvider>,
        accounts: Arc<SqliteAccounts>,
        db: Database,
    }

    fn harness() -> Harness {
        let db = Database::open_in_memory().unwrap();
        db.ensure_account("acct", 1000.0).unwrap();
        let accounts = Arc::new(SqliteAccounts::new(db.clone()));
        let provider = Arc::new(MockProvider::default());
        // No caching so every sweep sees the feed's latest state
        let ttls = TierTtls {
            live: std::time::Duration::ZERO,
            upcoming: std::time::Duration::ZERO,
            long: std::time::Duration::ZERO,
        };
        let resolver = Arc::new(MatchResolver::new(
            provider.clone(),
            TtlCache::new(ttls),
            None,
            ResolverConfig::default(),
        ));
        let ledger = WagerLedger::new(db.clone(), accounts.clone());
        let settings = EngineSettings {
            retry_spacing: std::time::Duration::ZERO,
            reschedule_jitter_secs: 0,
            ..EngineSettings::default()
        };
        let engine = SettlementEngine::new(db.clone(), ledger, accounts.clone(), resolver, settings);
        Harness {
            engine: Arc::new(engine),
            provider,
            accounts,
            db,
        }
    }

    fn leg(event_id: &str, market: &str, selection: &str, odds: f64, hours_ago: i64) -> LegRequest {
        LegRequest {
            event_id: event_id.into(),
            sport: "soccer".into(),
            league: None,
            home_team: "Arsenal".into(),
            away_team: "Chelsea".into(),
            market_id: format!("{}-m", event_id),
            selection_id: format!("{}-s", event_id),
            market_name: market.into(),
            selection_name: selection.into(),
            odds,
            event_start_time: Utc::now() - Duration::hours(hours_ago),
            estimated_settlement_time: None,
        }
    }

    fn single(event_id: &str, odds: f64, stake: f64) -> PlaceWagerRequest {
        PlaceWagerRequest {
            account_id: "acct".into(),
            kind: WagerKind::Single,
            stake,
            legs: vec![leg(event_id, "1X2", "1", odds, 3)],
        }
    }

    async fn balance(h: &Harness) -> f64 {
        h.accounts.balance("acct").await.unwrap()
    }

    #[tokio::test]
    async fn test_placement_debits_stake_once_and_queues_task() {
        let h = harness();
        let w = h.engine.place_wager(single("e1", 2.5, 100.0)).await.unwrap();

        assert_relative_eq!(balance(&h).await, 900.0);
        assert_eq!(w.status, WagerStatus::Pending);
        assert_eq!(w.retry_count, 3);
        let task = h.db.get_task_for_wager(&w.id).unwrap().unwrap();
        assert_eq!(task.run_at, w.estimated_settlement_time);
        assert_eq!(
            w.estimated_settlement_time,
            w.legs[0].event_start_time + Duration::minutes(120)
        );
    }

    #[tokio::test]
    async fn test_placement_rejections_leave_balance_untouched() {
        let h = harness();

        let bad_stake = h.engine.place_wager(single("e1", 2.0, 0.0)).await;
        assert!(matches!(bad_stake, Err(SettlementError::Validation(_))));

        let bad_odds = h.engine.place_wager(single("e1", 1.0, 10.0)).await;
        assert!(matches!(bad_odds, Err(SettlementError::Validation(_))));

        let mut unknown_market = single("e1", 2.0, 10.0);
        unknown_market.legs[0].market_name = "First Goalscorer".into();
        assert!(matches!(
            h.engine.place_wager(unknown_market).await,
            Err(SettlementError::Validation(_))
        ));

        let same_event = PlaceWagerRequest {
            account_id: "acct".into(),
            kind: WagerKind::Combination,
            stake: 10.0,
            legs: vec![leg("e1", "1X2", "1", 2.0, 3), leg("e1", "BTTS", "Yes", 1.8, 3)],
        };
        assert!(matches!(
            h.engine.place_wager(same_event).await,
            Err(SettlementError::Validation(_))
        ));

        let too_big = h.engine.place_wager(single("e1", 2.0, 5000.0)).await;
        assert!(matches!(too_big, Err(SettlementError::InsufficientFunds { .. })));

        assert_relative_eq!(balance(&h).await, 1000.0);
        assert!(h.engine.ledger().list(None, 10, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_won_single_credits_payout_exactly_once() {
        let h = harness();
        let w = h.engine.place_wager(single("e1", 2.5, 100.0)).await.unwrap();
        h.provider.put(event("e1", EventStatus::Finished, Some((2, 0))));

        let report = h.engine.run_settlement_sweep(Utc::now(), 5).await.unwrap();
        assert_eq!(report.settled, 1);
        assert_relative_eq!(balance(&h).await, 1150.0);

        // Nothing is due any more, and replaying the outcome is a no-op
        let again = h.engine.run_settlement_sweep(Utc::now(), 5).await.unwrap();
        assert_eq!(again.examined, 0);
        h.engine
            .ledger()
            .apply_outcome(&w.id, WagerStatus::Won, 250.0, &[])
            .await
            .unwrap();
        assert_relative_eq!(balance(&h).await, 1150.0);

        let stored = h.engine.ledger().get(&w.id).unwrap();
        assert_eq!(stored.status, WagerStatus::Won);
        assert_eq!(stored.profit, Some(150.0));
        assert_eq!(stored.legs[0].status, WagerStatus::Won);
    }

    #[tokio::test]
    async fn test_single_pays_at_unrounded_placement_odds() {
        let h = harness();
        let w = h.engine.place_wager(single("e1", 1.8333, 1000.0)).await.unwrap();
        assert_relative_eq!(w.total_odds, 1.8333);
        h.provider.put(event("e1", EventStatus::Finished, Some((1, 0))));

        h.engine.run_settlement_sweep(Utc::now(), 5).await.unwrap();
        let stored = h.engine.ledger().get(&w.id).unwrap();
        assert_eq!(stored.status, WagerStatus::Won);
        assert_relative_eq!(stored.payout.unwrap(), 1833.3);
        assert_relative_eq!(stored.profit.unwrap(), 833.3);
        assert_relative_eq!(balance(&h).await, 1833.3);
    }

    #[tokio::test]
    async fn test_combination_with_lost_leg_pays_nothing() {
        let h = harness();
        let req = PlaceWagerRequest {
            account_id: "acct".into(),
            kind: WagerKind::Combination,
            stake: 100.0,
            legs: vec![
                leg("e1", "1X2", "1", 3.0, 3),
                leg("e2", "1X2", "1", 4.0, 3),
                leg("e3", "1X2", "1", 5.0, 3),
            ],
        };
        let w = h.engine.place_wager(req).await.unwrap();
        assert_relative_eq!(w.total_odds, 60.0);
        h.provider.put(event("e1", EventStatus::Finished, Some((1, 0))));
        h.provider.put(event("e2", EventStatus::Finished, Some((2, 0))));
        h.provider.put(event("e3", EventStatus::Finished, Some((0, 1))));

        h.engine.run_settlement_sweep(Utc::now(), 5).await.unwrap();
        let stored = h.engine.ledger().get(&w.id).unwrap();
        assert_eq!(stored.status, WagerStatus::Lost);
        assert_eq!(stored.payout, Some(0.0));
        assert_relative_eq!(balance(&h).await, 900.0);
    }

    #[tokio::test]
    async fn test_combination_waits_for_unfinished_leg() {
        let h = harness();
        let req = PlaceWagerRequest {
            account_id: "acct".into(),
            kind: WagerKind::Combination,
            stake: 50.0,
            legs: vec![leg("e1", "1X2", "1", 2.0, 3), leg("e2", "Over/Under 2.5", "Over 2.5", 1.9, 3)],
        };
        let w = h.engine.place_wager(req).await.unwrap();
        h.provider.put(event("e1", EventStatus::Finished, Some((1, 0))));
        h.provider.put(event("e2", EventStatus::InProgress, Some((1, 1))));

        h.engine.run_settlement_sweep(Utc::now(), 5).await.unwrap();
        let stored = h.engine.ledger().get(&w.id).unwrap();
        assert_eq!(stored.status, WagerStatus::Pending);
        // Finished leg is remembered
        assert_eq!(stored.legs[0].status, WagerStatus::Won);

        h.provider.put(event("e2", EventStatus::Finished, Some((2, 1))));
        h.engine.run_settlement_sweep(Utc::now(), 5).await.unwrap();
        let stored = h.engine.ledger().get(&w.id).unwrap();
        assert_eq!(stored.status, WagerStatus::Won);
        assert_relative_eq!(stored.payout.unwrap(), 190.0);
        assert_relative_eq!(balance(&h).await, 1140.0);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let h = harness();
        let w = h.engine.place_wager(single("e1", 2.0, 100.0)).await.unwrap();
        h.provider.put(event("e1", EventStatus::Postponed, None));

        let first = h.engine.run_settlement_sweep(Utc::now(), 5).await.unwrap();
        assert_eq!(first.cancelled, 1);
        assert_eq!(h.engine.ledger().get(&w.id).unwrap().status, WagerStatus::Cancelled);

        for _ in 0..4 {
            h.engine.run_retry_sweep(Utc::now()).await.unwrap();
        }
        let stored = h.engine.ledger().get(&w.id).unwrap();
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.status, WagerStatus::Cancelled);

        let fifth = h.engine.run_retry_sweep(Utc::now()).await.unwrap();
        assert_eq!(fifth.examined, 0);
        // Spending the last retry closes the wager and returns the stake
        assert_relative_eq!(balance(&h).await, 1000.0);

        // A result arriving after closure changes nothing
        let late = h
            .engine
            .ledger()
            .apply_outcome(&w.id, WagerStatus::Void, 100.0, &[])
            .await;
        assert!(matches!(late, Err(SettlementError::LedgerConsistency { .. })));
        assert_relative_eq!(balance(&h).await, 1000.0);
    }

    #[tokio::test]
    async fn test_cancelled_wager_refunded_once_when_voided() {
        let h = harness();
        let w = h.engine.place_wager(single("e1", 2.0, 100.0)).await.unwrap();
        h.provider.put(event("e1", EventStatus::Cancelled, None));
        h.engine.run_settlement_sweep(Utc::now(), 5).await.unwrap();
        assert_relative_eq!(balance(&h).await, 900.0);

        let mut finished = event("e1", EventStatus::Finished, Some((0, 0)));
        finished.selection_results.push(SelectionResult {
            selection_id: "e1-s".into(),
            won: false,
            void: true,
        });
        h.provider.put(finished);

        let report = h.engine.run_retry_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.settled, 1);
        assert_eq!(h.engine.ledger().get(&w.id).unwrap().status, WagerStatus::Void);
        assert_relative_eq!(balance(&h).await, 1000.0);

        h.engine.run_retry_sweep(Utc::now()).await.unwrap();
        assert_relative_eq!(balance(&h).await, 1000.0);
    }

    #[tokio::test]
    async fn test_recovery_pass_settles_overdue_wager() {
        let h = harness();
        let w = h.engine.place_wager(single("e1", 3.0, 10.0)).await.unwrap();
        h.provider.put(event("e1", EventStatus::Finished, Some((3, 1))));

        let report = h.engine.recover(Utc::now(), 5).await.unwrap();
        assert_eq!(report.settled, 1);
        assert_eq!(h.engine.ledger().get(&w.id).unwrap().status, WagerStatus::Won);
        assert_relative_eq!(balance(&h).await, 1020.0);
    }

    #[tokio::test]
    async fn test_stale_pending_wager_is_cancelled() {
        let h = harness();
        let mut req = single("e1", 2.0, 10.0);
        req.legs[0].event_start_time = Utc::now() - Duration::hours(30);
        let w = h.engine.place_wager(req).await.unwrap();
        h.provider.put(event("e1", EventStatus::InProgress, Some((0, 0))));

        let report = h.engine.run_settlement_sweep(Utc::now(), 5).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(h.engine.ledger().get(&w.id).unwrap().status, WagerStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_provider_outage_does_not_abort_sweep() {
        let h = harness();
        h.engine.place_wager(single("e1", 2.0, 10.0)).await.unwrap();
        h.engine.place_wager(single("e2", 2.0, 10.0)).await.unwrap();
        h.provider.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        let report = h.engine.run_settlement_sweep(Utc::now(), 5).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn test_task_queue_reschedules_then_completes() {
        let h = harness();
        let w = h.engine.place_wager(single("e1", 2.0, 10.0)).await.unwrap();
        h.provider.put(event("e1", EventStatus::InProgress, Some((0, 0))));

        let now = Utc::now();
        h.engine.run_task_queue(now, 5).await.unwrap();
        let task = h.db.get_task_for_wager(&w.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.run_at >= now + Duration::seconds(900));

        h.provider.put(event("e1", EventStatus::Finished, Some((1, 0))));
        h.engine.run_task_queue(task.run_at, 5).await.unwrap();
        let task = h.db.get_task_for_wager(&w.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.attempts, 2);
        assert_relative_eq!(balance(&h).await, 1010.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweep_and_task_queue_together_credit_once() {
        let h = harness();
        let w = h.engine.place_wager(single("e1", 2.5, 100.0)).await.unwrap();
        h.provider.put(event("e1", EventStatus::Finished, Some((2, 0))));

        let now = Utc::now();
        let sweep = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.run_settlement_sweep(now, 5).await }
        });
        let queue = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.run_task_queue(now, 5).await }
        });
        let (sweep, queue) = tokio::join!(sweep, queue);
        let (sweep, queue) = (sweep.unwrap().unwrap(), queue.unwrap().unwrap());
        assert_eq!(sweep.failed + queue.failed, 0);
        assert!(sweep.settled + queue.settled >= 1);

        let stored = h.engine.ledger().get(&w.id).unwrap();
        assert_eq!(stored.status, WagerStatus::Won);
        assert_relative_eq!(balance(&h).await, 1150.0);
        let payouts = h
            .db
            .list_balance_transactions("acct")
            .unwrap()
            .into_iter()
            .filter(|t| t.reference == format!("payout:{}", w.id))
            .count();
        assert_eq!(payouts, 1);
    }

    #[test]
    fn test_in_flight_guard_excludes_second_worker() {
        let in_flight = InFlight::default();
        let guard = in_flight.try_claim("w1").unwrap();
        assert!(in_flight.try_claim("w1").is_none());
        drop(guard);
        assert!(in_flight.try_claim("w1").is_some());
    }

    #[test]
    fn test_default_durations() {
        assert_eq!(default_event_duration("basketball"), Duration::minutes(150));
        assert_eq!(default_event_duration("curling"), Duration::minutes(180));
    }
}
