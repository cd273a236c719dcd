//! Authoritative store of wagers and their lifecycle.
//!
//! `apply_outcome` is the single serialization point for settlement: the
//! state change and the owed credit are recorded in one SQLite transaction,
//! the credit is then issued under the idempotent `payout:{id}` reference and
//! acknowledged.  A crash between the two steps is repaired by re-running
//! `apply_outcome` or by `reconcile_credits`.
//!
//! A cancelled wager that spends its whole retry budget is closed: the stake
//! goes back under `refund:{id}` and no later outcome is accepted for it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::accounts::BalanceAccounts;
use crate::db::models::{Wager, WagerStatus};
use crate::db::{Database, Transition, WagerStats};
use crate::error::{SettlementError, SettlementResult};

/// What `apply_outcome` did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppliedOutcome {
    /// The wager moved to the requested state
    Transitioned,
    /// Already in that terminal state; at most an unacknowledged credit was re-issued
    AlreadyApplied,
    /// Cancelled → cancelled
    Unchanged,
}

#[derive(Clone)]
pub struct WagerLedger {
    db: Database,
    accounts: Arc<dyn BalanceAccounts>,
}

impl WagerLedger {
    pub fn new(db: Database, accounts: Arc<dyn BalanceAccounts>) -> Self {
        WagerLedger { db, accounts }
    }

    /// Persist a freshly placed wager.  The stake has already been debited.
    pub fn create(&self, wager: &Wager) -> SettlementResult<()> {
        if wager.status != WagerStatus::Pending {
            return Err(SettlementError::Validation(format!(
                "new wager {} must be pending, got {}",
                wager.id, wager.status
            )));
        }
        self.db.insert_wager(wager)?;
        info!(
            "Created {} wager {} ({} legs, stake {:.2} @ {:.2})",
            wager.kind.as_str(),
            wager.id,
            wager.legs.len(),
            wager.stake,
            wager.total_odds
        );
        Ok(())
    }

    pub fn find_due_for_settlement(&self, now: DateTime<Utc>) -> SettlementResult<Vec<Wager>> {
        Ok(self.db.list_due_wagers(now)?)
    }

    pub fn find_retryable(&self, now: DateTime<Utc>) -> SettlementResult<Vec<Wager>> {
        let wagers = self.db.list_retryable_wagers()?;
        Ok(wagers
            .into_iter()
            .filter(|w| w.estimated_settlement_time <= now)
            .collect())
    }

    /// Move a wager to `status` and issue the owed credit exactly once.
    pub async fn apply_outcome(
        &self,
        wager_id: &str,
        status: WagerStatus,
        payout: f64,
        leg_statuses: &[(i64, WagerStatus)],
    ) -> SettlementResult<AppliedOutcome> {
        let wager = self
            .db
            .get_wager(wager_id)?
            .ok_or_else(|| SettlementError::UnknownWager(wager_id.to_string()))?;

        let transition =
            self.db
                .transition_wager(wager_id, status, payout, leg_statuses, Utc::now())?;

        match transition {
            Transition::Applied { credit_due } => {
                info!(
                    "Wager {} {} → {} (payout {:.2})",
                    wager_id, wager.status, status, payout
                );
                if let Some(amount) = credit_due {
                    self.issue_credit(&wager, amount).await?;
                }
                if status == WagerStatus::Cancelled && wager.retry_count == 0 {
                    self.refund_stake(&wager).await?;
                }
                Ok(AppliedOutcome::Transitioned)
            }
            Transition::AlreadySettled { credit_due } => {
                if let Some(amount) = credit_due {
                    warn!("Wager {} settled earlier without credit ack, re-issuing", wager_id);
                    self.issue_credit(&wager, amount).await?;
                }
                Ok(AppliedOutcome::AlreadyApplied)
            }
            Transition::Unchanged => Ok(AppliedOutcome::Unchanged),
            Transition::Conflict { current } => {
                error!(
                    "Double settlement rejected: wager {} is {}, attempted {}",
                    wager_id, current, status
                );
                Err(SettlementError::LedgerConsistency {
                    wager_id: wager_id.to_string(),
                    current,
                    attempted: status,
                })
            }
        }
    }

    async fn issue_credit(&self, wager: &Wager, amount: f64) -> SettlementResult<()> {
        let reference = format!("payout:{}", wager.id);
        self.accounts
            .credit(&wager.account_id, amount, &reference)
            .await?;
        self.db.mark_credit_applied(&wager.id)?;
        Ok(())
    }

    pub fn record_leg_progress(
        &self,
        wager_id: &str,
        leg_statuses: &[(i64, WagerStatus)],
    ) -> SettlementResult<()> {
        if leg_statuses.is_empty() {
            return Ok(());
        }
        self.db.record_leg_progress(wager_id, leg_statuses)?;
        Ok(())
    }

    /// Spend one unit of a cancelled wager's retry budget.  Spending the
    /// last unit closes the wager and refunds its stake.
    pub async fn consume_retry(&self, wager_id: &str) -> SettlementResult<i64> {
        let left = self.db.consume_retry(wager_id)?;
        if left == 0 {
            let wager = self.get(wager_id)?;
            if wager.status == WagerStatus::Cancelled {
                warn!("Wager {} exhausted its retry budget, refunding stake", wager_id);
                self.refund_stake(&wager).await?;
            }
        }
        Ok(left)
    }

    async fn refund_stake(&self, wager: &Wager) -> SettlementResult<()> {
        if wager.credit_applied {
            return Ok(());
        }
        let reference = format!("refund:{}", wager.id);
        self.accounts
            .credit(&wager.account_id, wager.stake, &reference)
            .await?;
        self.db.mark_credit_applied(&wager.id)?;
        info!("Refunded stake {:.2} on closed wager {}", wager.stake, wager.id);
        Ok(())
    }

    /// Re-issue credits and refunds recorded but never acknowledged.
    pub async fn reconcile_credits(&self) -> SettlementResult<usize> {
        let owed = self.db.list_uncredited_settlements()?;
        let mut repaired = 0;
        for wager in owed {
            let Some(amount) = wager.payout else { continue };
            match self.issue_credit(&wager, amount).await {
                Ok(()) => repaired += 1,
                Err(e) => warn!("Credit reconcile failed for wager {}: {}", wager.id, e),
            }
        }
        for wager in self.db.list_unrefunded_exhausted()? {
            match self.refund_stake(&wager).await {
                Ok(()) => repaired += 1,
                Err(e) => warn!("Refund reconcile failed for wager {}: {}", wager.id, e),
            }
        }
        if repaired > 0 {
            info!("Reconciled {} outstanding settlement credits", repaired);
        }
        Ok(repaired)
    }

    pub fn backfill_profit(&self) -> SettlementResult<usize> {
        let n = self.db.backfill_profit()?;
        if n > 0 {
            info!("Backfilled profit on {} historical wagers", n);
        }
        Ok(n)
    }

    pub fn get(&self, wager_id: &str) -> SettlementResult<Wager> {
        self.db
            .get_wager(wager_id)?
            .ok_or_else(|| SettlementError::UnknownWager(wager_id.to_string()))
    }

    pub fn list(
        &self,
        status: Option<WagerStatus>,
        limit: i64,
        offset: i64,
    ) -> SettlementResult<Vec<Wager>> {
        Ok(self.db.list_wagers(status, limit, offset)?)
    }

    pub fn stats(&self) -> SettlementResult<WagerStats> {
        Ok(self.db.get_stats()?)
    }
}
