//! Ledger (C2): every monetary movement across `wallets`, `liquidity_pool`,
//! `claimable` amounts on parlays, and `withdrawal_requests`. See spec §4.2.
//!
//! Every operation here is one transaction; partial failure leaves every
//! balance unchanged. Mutations use guarded `UPDATE ... WHERE balance +
//! delta >= 0` statements the way the teacher's `db_adapter.rs` guards
//! `rp_balance_ledger`, and retry transient conflicts via
//! `with_serializable_tx!` (see `db_retry.rs`, grounded on the teacher's
//! `lmsr_api.rs` macros).

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{Environment, Parlay, Side, WithdrawalRequest, WithdrawalStatus};

pub struct LegOutcomeInput {
    pub leg_number: i32,
    pub ticker: String,
    pub side: Side,
}

async fn record_event(
    tx: &mut Transaction<'_, Postgres>,
    actor: &str,
    kind: &str,
    parlay_session_id: Option<&str>,
    user_id: Option<Uuid>,
    delta_by_account: serde_json::Value,
    note: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO ledger_events (actor, kind, parlay_session_id, user_id, delta_by_account, note)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(actor)
    .bind(kind)
    .bind(parlay_session_id)
    .bind(user_id)
    .bind(delta_by_account)
    .bind(note)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Atomically decrements the wallet; fails with `InsufficientFunds` if it
/// would go negative.
pub async fn debit_wallet(pool: &PgPool, user_id: Uuid, amount: Decimal, reason: &str) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(anyhow!("debit amount must be positive"));
    }

    crate::with_serializable_tx!(pool, tx, {
        let rows_affected = sqlx::query(
            "UPDATE wallets SET balance = balance - $1, updated_at = now()
             WHERE user_id = $2 AND balance - $1 >= 0",
        )
        .bind(amount)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(anyhow::Error::new(ApiError::InsufficientFunds));
        }

        record_event(
            &mut tx,
            "ledger",
            "debit_wallet",
            None,
            Some(user_id),
            json!({"wallet": format!("-{amount}")}),
            Some(reason),
        )
        .await?;

        Ok(())
    })
}

pub async fn credit_wallet(pool: &PgPool, user_id: Uuid, amount: Decimal, reason: &str) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(anyhow!("credit amount must be positive"));
    }

    crate::with_serializable_tx!(pool, tx, {
        sqlx::query("UPDATE wallets SET balance = balance + $1, updated_at = now() WHERE user_id = $2")
            .bind(amount)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        record_event(
            &mut tx,
            "ledger",
            "credit_wallet",
            None,
            Some(user_id),
            json!({"wallet": format!("+{amount}")}),
            Some(reason),
        )
        .await?;

        Ok(())
    })
}

/// Pool balance is signed — it may go negative, representing expected
/// future liability (e.g. a promised payout not yet realized as revenue).
pub async fn pool_credit(pool: &PgPool, amount: Decimal, reason: &str) -> Result<()> {
    adjust_pool(pool, amount, "pool_credit", reason).await
}

pub async fn pool_debit(pool: &PgPool, amount: Decimal, reason: &str) -> Result<()> {
    adjust_pool(pool, -amount, "pool_debit", reason).await
}

async fn adjust_pool(pool: &PgPool, signed_delta: Decimal, kind: &str, reason: &str) -> Result<()> {
    crate::with_serializable_tx!(pool, tx, {
        sqlx::query("UPDATE liquidity_pool SET balance = balance + $1 WHERE id = 1")
            .bind(signed_delta)
            .execute(&mut *tx)
            .await?;

        record_event(
            &mut tx,
            "ledger",
            kind,
            None,
            None,
            json!({"liquidity_pool": format!("{signed_delta:+}")}),
            Some(reason),
        )
        .await?;

        Ok(())
    })
}

/// Places one parlay: debits the stake, inserts the `Parlay` row, inserts
/// one `LegOutcome` per leg, and clears the user's draft for the
/// environment — all in one transaction (spec §5 ordering guarantees:
/// either the whole placement lands or none of it does).
#[allow(clippy::too_many_arguments)]
pub async fn place_parlay(
    pool: &PgPool,
    user_id: Uuid,
    environment: Environment,
    session_id: &str,
    stake: Decimal,
    payout: Decimal,
    legs: &[LegOutcomeInput],
    parlay_data: serde_json::Value,
    quote_snapshot: serde_json::Value,
    hedging_plan: serde_json::Value,
) -> Result<Parlay> {
    crate::with_serializable_tx!(pool, tx, {
        let rows_affected = sqlx::query(
            "UPDATE wallets SET balance = balance - $1, updated_at = now()
             WHERE user_id = $2 AND balance - $1 >= 0",
        )
        .bind(stake)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(anyhow::Error::new(ApiError::InsufficientFunds));
        }

        let parlay = sqlx::query_as::<_, Parlay>(
            "INSERT INTO parlays
                (session_id, user_id, environment, stake, payout, parlay_data, quote_snapshot, hedging_plan, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending')
             RETURNING session_id, user_id, environment, stake, payout, parlay_data,
                       quote_snapshot, hedging_plan, status, claimable_amount, claimed_at, created_at",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(environment)
        .bind(stake)
        .bind(payout)
        .bind(&parlay_data)
        .bind(&quote_snapshot)
        .bind(&hedging_plan)
        .fetch_one(&mut *tx)
        .await?;

        for leg in legs {
            sqlx::query(
                "INSERT INTO leg_outcomes
                    (parlay_session_id, leg_number, ticker, side, expected_outcome, market_status, outcome)
                 VALUES ($1, $2, $3, $4, $4, 'open', 'pending')",
            )
            .bind(session_id)
            .bind(leg.leg_number)
            .bind(&leg.ticker)
            .bind(leg.side)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM leg_drafts WHERE user_id = $1 AND environment = $2")
            .bind(user_id)
            .bind(environment)
            .execute(&mut *tx)
            .await?;

        // The stake's counterpart: it becomes the pool's position on this
        // parlay (spec §4.5 step 3's "the pool's position was already
        // established at placement"). A loss later realizes it as revenue
        // (no further pool move); a win's claim moves `payout` back out.
        sqlx::query("UPDATE liquidity_pool SET balance = balance + $1 WHERE id = 1")
            .bind(stake)
            .execute(&mut *tx)
            .await?;

        record_event(
            &mut tx,
            "ledger",
            "place_parlay",
            Some(session_id),
            Some(user_id),
            json!({"wallet": format!("-{stake}"), "liquidity_pool": format!("+{stake}")}),
            None,
        )
        .await?;

        Ok(parlay)
    })
}

/// Creates/sets the claimable amount on a `won` parlay. Idempotent by
/// session id: a second call is a no-op (the `claimable_amount IS NULL`
/// guard prevents overwriting).
pub async fn record_claimable(
    pool: &PgPool,
    parlay_session_id: &str,
    user_id: Uuid,
    amount: Decimal,
) -> Result<()> {
    crate::with_serializable_tx!(pool, tx, {
        let rows_affected = sqlx::query(
            "UPDATE parlays SET claimable_amount = $1
             WHERE session_id = $2 AND status = 'won' AND claimable_amount IS NULL",
        )
        .bind(amount)
        .bind(parlay_session_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            record_event(
                &mut tx,
                "ledger",
                "record_claimable",
                Some(parlay_session_id),
                Some(user_id),
                json!({"claimable": amount.to_string()}),
                None,
            )
            .await?;
        }

        Ok(())
    })
}

/// Verifies the parlay is `won` with `claimed_at IS NULL`, moves
/// `claimable_amount` from the pool to the wallet, and stamps `claimed_at`
/// — all in one transaction so concurrent duplicate calls yield exactly
/// one credit (spec §8 property 4). The unique-constraint-style guard is
/// the `claimed_at IS NULL` predicate in the `UPDATE ... RETURNING`.
pub async fn claim(pool: &PgPool, parlay_session_id: &str) -> Result<Decimal> {
    crate::with_serializable_tx!(pool, tx, {
        let row = sqlx::query_as::<_, (Uuid, Option<Decimal>, String)>(
            "SELECT user_id, claimable_amount, status FROM parlays WHERE session_id = $1 FOR UPDATE",
        )
        .bind(parlay_session_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| anyhow::Error::new(ApiError::NotFound("parlay".to_string())))?;

        let (user_id, claimable_amount, status) = row;
        if status != "won" {
            return Err(anyhow!("parlay is not in a claimable state"));
        }

        let claimed = sqlx::query(
            "UPDATE parlays SET claimed_at = now()
             WHERE session_id = $1 AND claimed_at IS NULL",
        )
        .bind(parlay_session_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            return Err(anyhow::Error::new(ApiError::AlreadyClaimed));
        }

        let amount = claimable_amount
            .ok_or_else(|| anyhow!("won parlay has no claimable amount recorded"))?;

        sqlx::query("UPDATE liquidity_pool SET balance = balance - $1 WHERE id = 1")
            .bind(amount)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE wallets SET balance = balance + $1, updated_at = now() WHERE user_id = $2")
            .bind(amount)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        record_event(
            &mut tx,
            "ledger",
            "claim",
            Some(parlay_session_id),
            Some(user_id),
            json!({"wallet": format!("+{amount}"), "liquidity_pool": format!("-{amount}")}),
            None,
        )
        .await?;

        Ok(amount)
    })
}

pub async fn open_withdrawal(pool: &PgPool, user_id: Uuid, amount: Decimal) -> Result<WithdrawalRequest> {
    crate::with_serializable_tx!(pool, tx, {
        let rows_affected = sqlx::query(
            "UPDATE wallets SET balance = balance - $1, updated_at = now()
             WHERE user_id = $2 AND balance - $1 >= 0",
        )
        .bind(amount)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(anyhow::Error::new(ApiError::InsufficientFunds));
        }

        let request = sqlx::query_as::<_, WithdrawalRequest>(
            "INSERT INTO withdrawal_requests (user_id, amount, status)
             VALUES ($1, $2, 'pending')
             RETURNING id, user_id, amount, status, venue_transfer_id, created_at",
        )
        .bind(user_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        record_event(
            &mut tx,
            "ledger",
            "open_withdrawal",
            None,
            Some(user_id),
            json!({"wallet": format!("-{amount}")}),
            None,
        )
        .await?;

        Ok(request)
    })
}

pub async fn complete_withdrawal(pool: &PgPool, request_id: i64, venue_transfer_id: &str) -> Result<()> {
    crate::with_serializable_tx!(pool, tx, {
        let rows_affected = sqlx::query(
            "UPDATE withdrawal_requests SET status = 'completed', venue_transfer_id = $1
             WHERE id = $2 AND status = 'pending'",
        )
        .bind(venue_transfer_id)
        .bind(request_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(anyhow!("withdrawal request {request_id} is not pending"));
        }

        record_event(
            &mut tx,
            "ledger",
            "complete_withdrawal",
            None,
            None,
            json!({"withdrawal_request": request_id}),
            Some(venue_transfer_id),
        )
        .await?;

        Ok(())
    })
}

/// Failed withdrawals credit the wallet back.
pub async fn fail_withdrawal(pool: &PgPool, request_id: i64, reason: &str) -> Result<()> {
    crate::with_serializable_tx!(pool, tx, {
        let row = sqlx::query_as::<_, (Uuid, Decimal, WithdrawalStatus)>(
            "SELECT user_id, amount, status FROM withdrawal_requests WHERE id = $1 FOR UPDATE",
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| anyhow!("withdrawal request {request_id} not found"))?;

        let (user_id, amount, status) = row;
        if !matches!(status, WithdrawalStatus::Pending) {
            return Err(anyhow!("withdrawal request {request_id} is not pending"));
        }

        sqlx::query("UPDATE withdrawal_requests SET status = 'failed' WHERE id = $1")
            .bind(request_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE wallets SET balance = balance + $1, updated_at = now() WHERE user_id = $2")
            .bind(amount)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        record_event(
            &mut tx,
            "ledger",
            "fail_withdrawal",
            None,
            Some(user_id),
            json!({"wallet": format!("+{amount}")}),
            Some(reason),
        )
        .await?;

        Ok(())
    })
}

/// Operator diagnostic: sums every account and compares against the
/// conservation invariant (spec §8 property 2). Grounded on the teacher's
/// `benchmark.rs` pattern of a self-contained routine callable from an
/// endpoint rather than only from tests.
pub async fn reconcile(pool: &PgPool) -> Result<ReconciliationReport> {
    let wallets_total: Option<Decimal> = sqlx::query_scalar("SELECT SUM(balance) FROM wallets")
        .fetch_one(pool)
        .await
        .context("summing wallets")?;
    let pool_balance: Decimal = sqlx::query_scalar("SELECT balance FROM liquidity_pool WHERE id = 1")
        .fetch_one(pool)
        .await
        .context("reading pool balance")?;
    let claimable_open: Option<Decimal> = sqlx::query_scalar(
        "SELECT SUM(claimable_amount) FROM parlays WHERE status = 'won' AND claimed_at IS NULL",
    )
    .fetch_one(pool)
    .await
    .context("summing open claimables")?;
    let open_withdrawals: Option<Decimal> = sqlx::query_scalar(
        "SELECT SUM(amount) FROM withdrawal_requests WHERE status = 'pending'",
    )
    .fetch_one(pool)
    .await
    .context("summing open withdrawals")?;

    Ok(ReconciliationReport {
        wallets_total: wallets_total.unwrap_or(Decimal::ZERO),
        liquidity_pool: pool_balance,
        claimable_open: claimable_open.unwrap_or(Decimal::ZERO),
        open_withdrawals: open_withdrawals.unwrap_or(Decimal::ZERO),
        generated_at: Utc::now(),
    })
}

#[derive(Debug, serde::Serialize)]
pub struct ReconciliationReport {
    pub wallets_total: Decimal,
    pub liquidity_pool: Decimal,
    pub claimable_open: Decimal,
    pub open_withdrawals: Decimal,
    pub generated_at: chrono::DateTime<Utc>,
}
