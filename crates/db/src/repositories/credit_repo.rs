//! Repository for `credit_accounts` and `credit_receipts`.
//!
//! Debits are a single conditional `UPDATE ... WHERE balance >= cost`, so two
//! concurrent debits against the same account can never both observe a
//! sufficient balance. Refunds flip `refunded_at` from NULL exactly once and
//! only then credit the account, inside one transaction. Every balance
//! change also appends a `credit_transactions` row in the same transaction.

use mvstudio_core::credits::{OperationKind, TransactionKind};
use mvstudio_core::types::{AccountId, Credits};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::credit::{CreditAccount, CreditTransaction, DebitReceipt, RefundOutcome};

const ACCOUNT_COLUMNS: &str = "account_id, balance, lifetime_spent, created_at, updated_at";

const TRANSACTION_COLUMNS: &str =
    "id, account_id, kind, amount, balance_after, operation, receipt_id, created_at";

/// Result of a debit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitOutcome {
    Debited(DebitReceipt),
    Insufficient { available: Credits },
}

pub struct CreditRepo;

impl CreditRepo {
    /// Fetch an account row, if it has ever been used.
    pub async fn find_account(
        pool: &PgPool,
        account_id: AccountId,
    ) -> Result<Option<CreditAccount>, sqlx::Error> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM credit_accounts WHERE account_id = $1");
        sqlx::query_as::<_, CreditAccount>(&query)
            .bind(account_id)
            .fetch_optional(pool)
            .await
    }

    /// Current balance; accounts that were never used hold zero.
    pub async fn balance(pool: &PgPool, account_id: AccountId) -> Result<Credits, sqlx::Error> {
        let balance: Option<Credits> =
            sqlx::query_scalar("SELECT balance FROM credit_accounts WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }

    /// Add credits to an account, creating it on first use.
    pub async fn grant(
        pool: &PgPool,
        account_id: AccountId,
        amount: Credits,
    ) -> Result<Credits, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let balance: Credits = sqlx::query_scalar(
            "INSERT INTO credit_accounts (account_id, balance) VALUES ($1, $2) \
             ON CONFLICT (account_id) DO UPDATE \
             SET balance = credit_accounts.balance + EXCLUDED.balance, updated_at = NOW() \
             RETURNING balance",
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        Self::record_transaction(
            &mut *tx,
            account_id,
            TransactionKind::Grant,
            amount,
            balance,
            None,
            None,
        )
        .await?;

        tx.commit().await?;
        Ok(balance)
    }

    /// Atomically check-and-decrement the balance and record a receipt.
    pub async fn debit(
        pool: &PgPool,
        account_id: AccountId,
        operation: OperationKind,
        cost: Credits,
    ) -> Result<DebitOutcome, sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query("INSERT INTO credit_accounts (account_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        let balance_after: Option<Credits> = sqlx::query_scalar(
            "UPDATE credit_accounts \
             SET balance = balance - $2, lifetime_spent = lifetime_spent + $2, updated_at = NOW() \
             WHERE account_id = $1 AND balance >= $2 \
             RETURNING balance",
        )
        .bind(account_id)
        .bind(cost)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance_after) = balance_after else {
            let available: Credits =
                sqlx::query_scalar("SELECT balance FROM credit_accounts WHERE account_id = $1")
                    .bind(account_id)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.commit().await?;
            return Ok(DebitOutcome::Insufficient { available });
        };

        let receipt_id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO credit_receipts (id, account_id, operation, amount) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(receipt_id)
        .bind(account_id)
        .bind(operation.as_str())
        .bind(cost)
        .execute(&mut *tx)
        .await?;

        Self::record_transaction(
            &mut *tx,
            account_id,
            TransactionKind::Debit,
            -cost,
            balance_after,
            Some(operation.as_str()),
            Some(receipt_id),
        )
        .await?;

        tx.commit().await?;

        Ok(DebitOutcome::Debited(DebitReceipt {
            receipt_id,
            account_id,
            operation,
            amount: cost,
            balance_after,
        }))
    }

    /// Reverse exactly the amount recorded on a receipt.
    ///
    /// Returns `None` when the receipt does not exist.
    pub async fn refund(
        pool: &PgPool,
        receipt_id: Uuid,
    ) -> Result<Option<RefundOutcome>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let outcome = Self::refund_in(&mut *tx, receipt_id).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Refund inside a caller-owned transaction. Nothing is written unless
    /// the receipt was still unrefunded.
    pub(crate) async fn refund_in(
        conn: &mut PgConnection,
        receipt_id: Uuid,
    ) -> Result<Option<RefundOutcome>, sqlx::Error> {
        let claimed: Option<(AccountId, Credits, String)> = sqlx::query_as(
            "UPDATE credit_receipts SET refunded_at = NOW() \
             WHERE id = $1 AND refunded_at IS NULL \
             RETURNING account_id, amount, operation",
        )
        .bind(receipt_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((account_id, amount, operation)) = claimed else {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM credit_receipts WHERE id = $1)")
                    .bind(receipt_id)
                    .fetch_one(&mut *conn)
                    .await?;
            return Ok(exists.then_some(RefundOutcome::AlreadyRefunded));
        };

        let balance_after: Credits = sqlx::query_scalar(
            "UPDATE credit_accounts \
             SET balance = balance + $2, lifetime_spent = lifetime_spent - $2, updated_at = NOW() \
             WHERE account_id = $1 \
             RETURNING balance",
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *conn)
        .await?;

        Self::record_transaction(
            conn,
            account_id,
            TransactionKind::Refund,
            amount,
            balance_after,
            Some(&operation),
            Some(receipt_id),
        )
        .await?;

        Ok(Some(RefundOutcome::Refunded { balance_after }))
    }

    /// Most recent balance changes of an account, newest first.
    pub async fn list_transactions(
        pool: &PgPool,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CreditTransaction>, sqlx::Error> {
        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE account_id = $1 \
             ORDER BY created_at DESC, id DESC \
             LIMIT $2 OFFSET $3"
        );
        sqlx::query_as::<_, CreditTransaction>(&query)
            .bind(account_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    async fn record_transaction(
        conn: &mut PgConnection,
        account_id: AccountId,
        kind: TransactionKind,
        amount: Credits,
        balance_after: Credits,
        operation: Option<&str>,
        receipt_id: Option<Uuid>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO credit_transactions \
                 (id, account_id, kind, amount, balance_after, operation, receipt_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::now_v7())
        .bind(account_id)
        .bind(kind.as_str())
        .bind(amount)
        .bind(balance_after)
        .bind(operation)
        .bind(receipt_id)
        .execute(conn)
        .await?;
        Ok(())
    }
}
