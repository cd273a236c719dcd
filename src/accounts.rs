//! Balance account service seam.
//!
//! The engine debits the stake at placement and credits the payout on
//! settlement.  Every mutation carries a deterministic reference
//! (`stake:{id}`, `payout:{id}`, `refund:{id}`, `stake-reversal:{id}`) so
//! replays are no-ops.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::db::{BalanceChange, Database};
use crate::error::{SettlementError, SettlementResult};

/// Acknowledgement of a credit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditReceipt {
    pub reference: String,
    pub balance: f64,
    /// False when the reference had already been booked
    pub newly_applied: bool,
}

#[async_trait]
pub trait BalanceAccounts: Send + Sync {
    /// Take `amount` from the account; `InsufficientFunds` on shortfall.
    async fn debit(&self, account_id: &str, amount: f64, reference: &str) -> SettlementResult<()>;

    async fn credit(
        &self,
        account_id: &str,
        amount: f64,
        reference: &str,
    ) -> SettlementResult<CreditReceipt>;

    async fn balance(&self, account_id: &str) -> SettlementResult<f64>;
}

/// Accounts kept in the engine's own SQLite database.
#[derive(Clone)]
pub struct SqliteAccounts {
    db: Database,
}

impl SqliteAccounts {
    pub fn new(db: Database) -> Self {
        SqliteAccounts { db }
    }
}

#[async_trait]
impl BalanceAccounts for SqliteAccounts {
    async fn debit(&self, account_id: &str, amount: f64, reference: &str) -> SettlementResult<()> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(SettlementError::Validation(format!(
                "debit amount must be positive, got {}",
                amount
            )));
        }
        match self.db.apply_balance_change(account_id, -amount, reference)? {
            BalanceChange::Applied { balance } => {
                info!("Debited {:.2} from {} ({}), balance {:.2}", amount, account_id, reference, balance);
                Ok(())
            }
            BalanceChange::Duplicate { .. } => {
                debug!("Debit {} already booked", reference);
                Ok(())
            }
            BalanceChange::Insufficient { available } => Err(SettlementError::InsufficientFunds {
                required: amount,
                available,
            }),
            BalanceChange::UnknownAccount => Err(SettlementError::Validation(format!(
                "unknown account {}",
                account_id
            ))),
        }
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: f64,
        reference: &str,
    ) -> SettlementResult<CreditReceipt> {
        if !(amount.is_finite() && amount >= 0.0) {
            return Err(SettlementError::Validation(format!(
                "credit amount must be non-negative, got {}",
                amount
            )));
        }
        match self.db.apply_balance_change(account_id, amount, reference)? {
            BalanceChange::Applied { balance } => {
                info!("Credited {:.2} to {} ({}), balance {:.2}", amount, account_id, reference, balance);
                Ok(CreditReceipt {
                    reference: reference.to_string(),
                    balance,
                    newly_applied: true,
                })
            }
            BalanceChange::Duplicate { balance } => {
                debug!("Credit {} already booked", reference);
                Ok(CreditReceipt {
                    reference: reference.to_string(),
                    balance,
                    newly_applied: false,
                })
            }
            // A credit never reduces the balance
            BalanceChange::Insufficient { available } => Err(SettlementError::Storage(
                anyhow::anyhow!("credit {} rejected with balance {:.2}", reference, available),
            )),
            BalanceChange::UnknownAccount => Err(SettlementError::Validation(format!(
                "unknown account {}",
                account_id
            ))),
        }
    }

    async fn balance(&self, account_id: &str) -> SettlementResult<f64> {
        self.db
            .account_balance(account_id)?
            .ok_or_else(|| SettlementError::Validation(format!("unknown account {}", account_id)))
    }
}
