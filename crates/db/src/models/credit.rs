//! Credit ledger rows and receipts.

use mvstudio_core::credits::{OperationKind, TransactionKind};
use mvstudio_core::types::{AccountId, Credits, Timestamp};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A row from the `credit_accounts` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CreditAccount {
    pub account_id: AccountId,
    pub balance: Credits,
    pub lifetime_spent: Credits,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Proof of a successful debit, used to reverse exactly that debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebitReceipt {
    pub receipt_id: Uuid,
    pub account_id: AccountId,
    pub operation: OperationKind,
    pub amount: Credits,
    /// Account balance right after the debit committed.
    pub balance_after: Credits,
}

/// Result of a refund request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    /// The receipt amount was credited back by this call.
    Refunded { balance_after: Credits },
    /// The receipt had already been refunded; nothing changed.
    AlreadyRefunded,
}

/// A row from the `credit_transactions` table.
///
/// `amount` is signed: debits are negative, refunds and grants positive.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub account_id: AccountId,
    #[sqlx(try_from = "String")]
    pub kind: TransactionKind,
    pub amount: Credits,
    pub balance_after: Credits,
    /// Operation the debit paid for; also set on its refund.
    pub operation: Option<String>,
    #[serde(skip_serializing)]
    pub receipt_id: Option<Uuid>,
    pub created_at: Timestamp,
}
