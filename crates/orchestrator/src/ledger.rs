//! Credit ledger port and its two backends.
//!
//! [`PgCreditLedger`] delegates to [`CreditRepo`], whose debit is a single
//! conditional update. [`MemoryCreditLedger`] serializes every operation
//! behind one mutex and backs the server when no database is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use mvstudio_core::credits::{CostTable, OperationKind, TransactionKind};
use mvstudio_core::error::CoreError;
use mvstudio_core::types::{AccountId, Credits};
use mvstudio_db::models::credit::{CreditTransaction, DebitReceipt, RefundOutcome};
use mvstudio_db::repositories::{CreditRepo, DebitOutcome};
use mvstudio_db::DbPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::OrchestratorError;

/// Per-account credit balances plus the cost table they are charged from.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    fn costs(&self) -> &CostTable;

    /// Cost of `kind`; `UnknownOperation` if it is not in the table.
    fn cost(&self, kind: OperationKind) -> Result<Credits, CoreError> {
        self.costs().cost(kind)
    }

    /// Atomically check `balance >= cost` and decrement.
    async fn debit(
        &self,
        account_id: AccountId,
        kind: OperationKind,
    ) -> Result<DebitReceipt, OrchestratorError>;

    /// Reverse exactly the amount of a receipt. Refunding twice is a no-op
    /// reported as [`RefundOutcome::AlreadyRefunded`].
    async fn refund(&self, receipt_id: Uuid) -> Result<RefundOutcome, OrchestratorError>;

    async fn balance(&self, account_id: AccountId) -> Result<Credits, OrchestratorError>;

    /// Top up an account. Returns the new balance.
    async fn grant(
        &self,
        account_id: AccountId,
        amount: Credits,
    ) -> Result<Credits, OrchestratorError>;

    /// Balance changes of an account, newest first.
    async fn transactions(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CreditTransaction>, OrchestratorError>;
}

fn check_grant(amount: Credits) -> Result<(), CoreError> {
    if amount <= 0 {
        return Err(CoreError::Validation(format!(
            "Grant amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

fn receipt_not_found(receipt_id: Uuid) -> OrchestratorError {
    CoreError::NotFound {
        entity: "credit_receipt",
        id: receipt_id.to_string(),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgCreditLedger {
    pool: DbPool,
    costs: CostTable,
}

impl PgCreditLedger {
    pub fn new(pool: DbPool, costs: CostTable) -> Self {
        Self { pool, costs }
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    fn costs(&self) -> &CostTable {
        &self.costs
    }

    async fn debit(
        &self,
        account_id: AccountId,
        kind: OperationKind,
    ) -> Result<DebitReceipt, OrchestratorError> {
        let cost = self.cost(kind)?;
        match CreditRepo::debit(&self.pool, account_id, kind, cost).await? {
            DebitOutcome::Debited(receipt) => {
                tracing::debug!(
                    account_id,
                    operation = %kind,
                    amount = cost,
                    balance_after = receipt.balance_after,
                    "Credits debited",
                );
                Ok(receipt)
            }
            DebitOutcome::Insufficient { available } => Err(CoreError::InsufficientCredits {
                required: cost,
                available,
            }
            .into()),
        }
    }

    async fn refund(&self, receipt_id: Uuid) -> Result<RefundOutcome, OrchestratorError> {
        let outcome = CreditRepo::refund(&self.pool, receipt_id)
            .await?
            .ok_or_else(|| receipt_not_found(receipt_id))?;
        tracing::debug!(%receipt_id, ?outcome, "Refund processed");
        Ok(outcome)
    }

    async fn balance(&self, account_id: AccountId) -> Result<Credits, OrchestratorError> {
        Ok(CreditRepo::balance(&self.pool, account_id).await?)
    }

    async fn grant(
        &self,
        account_id: AccountId,
        amount: Credits,
    ) -> Result<Credits, OrchestratorError> {
        check_grant(amount)?;
        Ok(CreditRepo::grant(&self.pool, account_id, amount).await?)
    }

    async fn transactions(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CreditTransaction>, OrchestratorError> {
        Ok(CreditRepo::list_transactions(&self.pool, account_id, limit, offset).await?)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MemoryReceipt {
    account_id: AccountId,
    operation: OperationKind,
    amount: Credits,
    refunded: bool,
}

#[derive(Debug, Default)]
struct MemoryLedgerState {
    balances: HashMap<AccountId, Credits>,
    receipts: HashMap<Uuid, MemoryReceipt>,
    /// Oldest first.
    history: Vec<CreditTransaction>,
}

impl MemoryLedgerState {
    fn record(
        &mut self,
        account_id: AccountId,
        kind: TransactionKind,
        amount: Credits,
        operation: Option<OperationKind>,
        receipt_id: Option<Uuid>,
    ) {
        let balance_after = self.balances.get(&account_id).copied().unwrap_or(0);
        self.history.push(CreditTransaction {
            id: Uuid::now_v7(),
            account_id,
            kind,
            amount,
            balance_after,
            operation: operation.map(|op| op.as_str().to_string()),
            receipt_id,
            created_at: Utc::now(),
        });
    }
}

/// Process-local ledger. Balances are lost on restart.
pub struct MemoryCreditLedger {
    costs: CostTable,
    state: Mutex<MemoryLedgerState>,
}

impl MemoryCreditLedger {
    pub fn new(costs: CostTable) -> Self {
        Self {
            costs,
            state: Mutex::new(MemoryLedgerState::default()),
        }
    }
}

impl Default for MemoryCreditLedger {
    fn default() -> Self {
        Self::new(CostTable::default())
    }
}

#[async_trait]
impl CreditLedger for MemoryCreditLedger {
    fn costs(&self) -> &CostTable {
        &self.costs
    }

    async fn debit(
        &self,
        account_id: AccountId,
        kind: OperationKind,
    ) -> Result<DebitReceipt, OrchestratorError> {
        let cost = self.cost(kind)?;
        let mut state = self.state.lock().await;

        let balance = state.balances.entry(account_id).or_insert(0);
        if *balance < cost {
            return Err(CoreError::InsufficientCredits {
                required: cost,
                available: *balance,
            }
            .into());
        }
        *balance -= cost;
        let balance_after = *balance;

        let receipt_id = Uuid::now_v7();
        state.receipts.insert(
            receipt_id,
            MemoryReceipt {
                account_id,
                operation: kind,
                amount: cost,
                refunded: false,
            },
        );
        state.record(
            account_id,
            TransactionKind::Debit,
            -cost,
            Some(kind),
            Some(receipt_id),
        );

        Ok(DebitReceipt {
            receipt_id,
            account_id,
            operation: kind,
            amount: cost,
            balance_after,
        })
    }

    async fn refund(&self, receipt_id: Uuid) -> Result<RefundOutcome, OrchestratorError> {
        let mut state = self.state.lock().await;

        let receipt = state
            .receipts
            .get_mut(&receipt_id)
            .ok_or_else(|| receipt_not_found(receipt_id))?;
        if receipt.refunded {
            return Ok(RefundOutcome::AlreadyRefunded);
        }
        receipt.refunded = true;
        let (account_id, operation, amount) =
            (receipt.account_id, receipt.operation, receipt.amount);

        let balance = state.balances.entry(account_id).or_insert(0);
        *balance += amount;
        let balance_after = *balance;
        state.record(
            account_id,
            TransactionKind::Refund,
            amount,
            Some(operation),
            Some(receipt_id),
        );
        Ok(RefundOutcome::Refunded { balance_after })
    }

    async fn balance(&self, account_id: AccountId) -> Result<Credits, OrchestratorError> {
        let state = self.state.lock().await;
        Ok(state.balances.get(&account_id).copied().unwrap_or(0))
    }

    async fn grant(
        &self,
        account_id: AccountId,
        amount: Credits,
    ) -> Result<Credits, OrchestratorError> {
        check_grant(amount)?;
        let mut state = self.state.lock().await;
        let balance = state.balances.entry(account_id).or_insert(0);
        *balance += amount;
        let balance_after = *balance;
        state.record(account_id, TransactionKind::Grant, amount, None, None);
        Ok(balance_after)
    }

    async fn transactions(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CreditTransaction>, OrchestratorError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
