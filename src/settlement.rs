//! Settlement Worker (C5): reconciles pending parlays against the venue on
//! a timer and on demand. See spec §4.5.
//!
//! Bounded-concurrency fan-out over pending parlays uses `JoinSet` + a
//! `Semaphore` rather than the teacher's `rayon` (this work is I/O-bound —
//! each task awaits the exchange client and the database — so a CPU
//! thread pool is the wrong tool). Per-parlay serialization is a Postgres
//! `pg_advisory_xact_lock`, the same "let the database do it" instinct as
//! the teacher's row-level guarded updates in `db_adapter.rs`.

use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::db_retry;
use crate::exchange::ExchangeClient;
use crate::ledger;
use crate::models::{LegOutcomeValue, Side};

#[derive(Debug, Clone, sqlx::FromRow)]
struct PendingParlay {
    session_id: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct OpenLeg {
    id: i64,
    ticker: String,
    side: Side,
}

/// One pass over every `pending` parlay, bounded by `max_concurrency` and
/// by `pass_max_secs` wall-clock (spec §4.5 cancellation/timeout). Returns
/// the number of parlays it finished reconciling.
pub async fn run_pass(pool: &PgPool, exchange: &ExchangeClient, config: &Config) -> anyhow::Result<usize> {
    if let Err(e) = reconcile_stuck_hedges(pool, exchange, config.settlement.call_deadline_secs as i64 * 3).await {
        tracing::warn!(error = %e, "stuck-hedge reconciliation failed, continuing settlement pass");
    }

    let parlays: Vec<PendingParlay> = sqlx::query_as(
        "SELECT session_id FROM parlays WHERE status = 'pending'",
    )
    .fetch_all(pool)
    .await?;

    let semaphore = Arc::new(Semaphore::new(config.settlement.max_concurrency));
    let mut tasks = JoinSet::new();
    let deadline = Duration::from_secs(config.settlement.pass_max_secs);
    let max_attempts = config.settlement.max_retry_attempts;
    let call_deadline = Duration::from_secs(config.settlement.call_deadline_secs);

    for parlay in parlays {
        let permit = semaphore.clone().acquire_owned().await?;
        let pool = pool.clone();
        let exchange = exchange.clone();
        tasks.spawn(async move {
            let _permit = permit;
            reconcile_parlay_with_retry(&pool, &exchange, &parlay.session_id, max_attempts, call_deadline).await
        });
    }

    let completed = tokio::time::timeout(deadline, async {
        let mut count = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => count += 1,
                Ok(Err(e)) => tracing::error!(error = %e, "settlement pass failed to reconcile a parlay"),
                Err(e) => tracing::error!(error = %e, "settlement task panicked"),
            }
        }
        count
    })
    .await
    .unwrap_or_else(|_| {
        tracing::warn!("settlement pass exceeded its deadline, remaining parlays retried next tick");
        0
    });

    Ok(completed)
}

async fn reconcile_parlay_with_retry(
    pool: &PgPool,
    exchange: &ExchangeClient,
    session_id: &str,
    max_attempts: u32,
    call_deadline: Duration,
) -> anyhow::Result<()> {
    let mut attempt = 1;
    loop {
        match tokio::time::timeout(call_deadline, reconcile_parlay(pool, exchange, session_id)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) if db_retry::is_retryable(&e) && attempt < max_attempts => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                continue;
            }
            Ok(Err(e)) => {
                mark_needs_attention(pool, session_id, &e.to_string()).await?;
                return Err(e);
            }
            Err(_) => {
                if attempt < max_attempts {
                    attempt += 1;
                    continue;
                }
                let message = "reconciliation call deadline exceeded repeatedly".to_string();
                mark_needs_attention(pool, session_id, &message).await?;
                anyhow::bail!(message);
            }
        }
    }
}

async fn mark_needs_attention(pool: &PgPool, session_id: &str, reason: &str) -> anyhow::Result<()> {
    tracing::error!(session_id, reason, "parlay pinned to needs_attention");
    sqlx::query("UPDATE parlays SET status = 'needs_attention' WHERE session_id = $1 AND status = 'pending'")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(())
}

enum SettlementAction {
    None,
    Lost,
    Won { user_id: uuid::Uuid, payout: Decimal },
}

/// Reconciles one parlay under its advisory lock: settles any open legs,
/// derives a terminal parlay status if warranted, and reconciles hedge
/// fills. All in one transaction so a crash mid-pass leaves the parlay
/// exactly where it was (`pending`), safe to retry next tick.
async fn reconcile_parlay(pool: &PgPool, exchange: &ExchangeClient, session_id: &str) -> anyhow::Result<()> {
    let action: SettlementAction = crate::with_serializable_tx!(pool, tx, {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        let open_legs: Vec<OpenLeg> = sqlx::query_as(
            "SELECT id, ticker, side FROM leg_outcomes
             WHERE parlay_session_id = $1 AND market_status = 'open'
             FOR UPDATE",
        )
        .bind(session_id)
        .fetch_all(&mut *tx)
        .await?;

        for leg in &open_legs {
            let market = match exchange.get_market(&leg.ticker).await {
                Ok(m) => m,
                Err(e) if e.is_retryable() => return Err(anyhow::Error::new(e)),
                Err(e) => {
                    tracing::warn!(session_id, ticker = %leg.ticker, error = %e, "could not fetch market status");
                    continue;
                }
            };
            if market.status != "settled" && market.status != "void" {
                continue;
            }

            let outcome = resolve_outcome(&market, leg.side);
            sqlx::query(
                "UPDATE leg_outcomes SET market_status = 'settled', outcome = $1, settled_at = now()
                 WHERE id = $2",
            )
            .bind(outcome)
            .bind(leg.id)
            .execute(&mut *tx)
            .await?;
        }

        let legs: Vec<(LegOutcomeValue, String)> = sqlx::query_as(
            "SELECT outcome, market_status FROM leg_outcomes WHERE parlay_session_id = $1",
        )
        .bind(session_id)
        .fetch_all(&mut *tx)
        .await?;

        let any_loss = legs.iter().any(|(o, _)| matches!(o, LegOutcomeValue::Loss));
        let all_settled = legs.iter().all(|(_, status)| status == "settled");
        let any_win = legs.iter().any(|(o, _)| matches!(o, LegOutcomeValue::Win));

        if any_loss {
            sqlx::query("UPDATE parlays SET status = 'lost' WHERE session_id = $1")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
            return Ok(SettlementAction::Lost);
        }

        if all_settled && any_win {
            let (user_id, payout): (uuid::Uuid, Decimal) =
                sqlx::query_as("SELECT user_id, payout FROM parlays WHERE session_id = $1")
                    .bind(session_id)
                    .fetch_one(&mut *tx)
                    .await?;
            sqlx::query("UPDATE parlays SET status = 'won' WHERE session_id = $1")
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
            return Ok(SettlementAction::Won { user_id, payout });
        }

        Ok(SettlementAction::None)
    })?;

    // The reconciliation transaction above has already committed; these
    // ledger moves are separate transactions by design (spec §4.2 — every
    // ledger mutation is its own transaction with its own audit event).
    // A loss needs no further pool move: the stake was already credited to
    // the pool at placement (`ledger::place_parlay`) and simply stays there
    // as realized revenue.
    match action {
        SettlementAction::Lost => {}
        SettlementAction::Won { user_id, payout } => {
            ledger::record_claimable(pool, session_id, user_id, payout).await?;
        }
        SettlementAction::None => {}
    }

    reconcile_hedge_fills(pool, exchange, session_id).await
}

fn resolve_outcome(market: &crate::exchange::MarketInfo, expected: Side) -> LegOutcomeValue {
    if market.status == "void" {
        return LegOutcomeValue::Void;
    }
    let resolved_yes = market
        .contracts
        .iter()
        .find(|c| c.side.eq_ignore_ascii_case("yes"))
        .map(|c| c.probability_percent >= 50.0)
        .unwrap_or(false);
    let resolved_side = if resolved_yes { Side::Yes } else { Side::No };
    if resolved_side == expected {
        LegOutcomeValue::Win
    } else {
        LegOutcomeValue::Loss
    }
}

/// Polls fills for hedge orders missing fill data, then — independently —
/// folds the P&L of already-filled hedges whose leg has since resolved
/// into the liquidity pool, spec §4.5 step 4.
async fn reconcile_hedge_fills(pool: &PgPool, exchange: &ExchangeClient, session_id: &str) -> anyhow::Result<()> {
    #[derive(sqlx::FromRow)]
    struct UnreconciledHedge {
        id: i64,
        ticker: String,
        venue_order_id: Option<String>,
    }

    let hedges: Vec<UnreconciledHedge> = sqlx::query_as(
        "SELECT id, ticker, venue_order_id FROM hedge_orders
         WHERE parlay_session_id = $1 AND status = 'accepted' AND filled_count IS NULL",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    for hedge in hedges {
        let Some(venue_order_id) = hedge.venue_order_id else { continue };
        let fills = exchange.list_fills(None, Some(&hedge.ticker)).await?;
        let Some(fill) = fills.iter().find(|f| f.venue_order_id == venue_order_id) else {
            continue;
        };

        sqlx::query("UPDATE hedge_orders SET filled_count = $1, avg_fill_price = $2 WHERE id = $3")
            .bind(fill.filled_count)
            .bind(fill.avg_price.round() as i32)
            .bind(hedge.id)
            .execute(pool)
            .await?;
    }

    settle_hedge_pnl(pool, session_id).await
}

/// Once a hedged leg's own outcome is known, folds that hedge's realized
/// P&L into the liquidity pool: a win pays `count * (1 - price)`, a loss
/// costs `count * price` (spec §4.5 step 4). Guarded by `pnl_settled` so a
/// retried pass never double-counts the same fill.
async fn settle_hedge_pnl(pool: &PgPool, session_id: &str) -> anyhow::Result<()> {
    #[derive(sqlx::FromRow)]
    struct SettledHedge {
        id: i64,
        filled_count: i32,
        avg_fill_price: i32,
        outcome: crate::models::LegOutcomeValue,
    }

    let hedges: Vec<SettledHedge> = sqlx::query_as(
        "SELECT h.id, h.filled_count, h.avg_fill_price, l.outcome
         FROM hedge_orders h
         JOIN leg_outcomes l
           ON l.parlay_session_id = h.parlay_session_id AND l.leg_number = h.leg_number
         WHERE h.parlay_session_id = $1
           AND h.pnl_settled = false
           AND h.filled_count IS NOT NULL
           AND l.market_status = 'settled'
           AND l.outcome IN ('win', 'loss')",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    for hedge in hedges {
        let count = Decimal::from(hedge.filled_count);
        let price = Decimal::new(hedge.avg_fill_price as i64, 2);

        match hedge.outcome {
            LegOutcomeValue::Win => {
                let pnl = count * (Decimal::ONE - price);
                if pnl > Decimal::ZERO {
                    ledger::pool_credit(pool, pnl, "hedge leg won").await?;
                }
            }
            LegOutcomeValue::Loss => {
                let pnl = count * price;
                if pnl > Decimal::ZERO {
                    ledger::pool_debit(pool, pnl, "hedge leg lost").await?;
                }
            }
            _ => unreachable!("query filters to win/loss"),
        }

        sqlx::query("UPDATE hedge_orders SET pnl_settled = true WHERE id = $1")
            .bind(hedge.id)
            .execute(pool)
            .await?;
    }

    Ok(())
}

/// Re-submits any hedge order stuck in `submitting` past a deadline — the
/// crash-between-persist-and-network-call case spec §4.4's Replay Safety
/// paragraph calls for. Safe to retry: the same `client_order_id` makes the
/// venue call idempotent.
async fn reconcile_stuck_hedges(
    pool: &PgPool,
    exchange: &ExchangeClient,
    stuck_after_secs: i64,
) -> anyhow::Result<()> {
    #[derive(sqlx::FromRow)]
    struct StuckHedge {
        client_order_id: String,
        ticker: String,
        side: Side,
        count: i32,
    }

    let stuck: Vec<StuckHedge> = sqlx::query_as(
        "SELECT client_order_id, ticker, side, count FROM hedge_orders
         WHERE status = 'submitting' AND created_at < now() - make_interval(secs => $1)",
    )
    .bind(stuck_after_secs as f64)
    .fetch_all(pool)
    .await?;

    for hedge in stuck {
        let request = crate::exchange::PlaceOrderRequest {
            ticker: hedge.ticker,
            side: hedge.side,
            action: "buy",
            count: hedge.count as u32,
            order_type: crate::exchange::OrderType::Market,
            limit_price: None,
            client_order_id: hedge.client_order_id.clone(),
            cancel_order_on_pause: true,
        };

        match exchange.place_order(request).await {
            Ok(response) => {
                sqlx::query(
                    "UPDATE hedge_orders SET status = 'accepted', venue_order_id = $1
                     WHERE client_order_id = $2",
                )
                .bind(&response.venue_order_id)
                .bind(&hedge.client_order_id)
                .execute(pool)
                .await?;
            }
            Err(e) => {
                tracing::warn!(
                    client_order_id = %hedge.client_order_id,
                    error = %e,
                    "stuck hedge re-submission failed, will retry next pass"
                );
            }
        }
    }

    Ok(())
}

/// Registers the periodic settlement tick with the process scheduler.
pub async fn spawn_scheduler(
    pool: PgPool,
    exchange: ExchangeClient,
    config: Arc<Config>,
) -> anyhow::Result<tokio_cron_scheduler::JobScheduler> {
    use tokio_cron_scheduler::{Job, JobScheduler};

    let scheduler = JobScheduler::new().await?;
    let interval = config.settlement.poll_interval_secs;
    let schedule = format!("1/{interval} * * * * *");

    let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
        let pool = pool.clone();
        let exchange = exchange.clone();
        let config = config.clone();
        Box::pin(async move {
            match run_pass(&pool, &exchange, &config).await {
                Ok(n) => tracing::info!(reconciled = n, "settlement pass complete"),
                Err(e) => tracing::error!(error = %e, "settlement pass errored"),
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;
    Ok(scheduler)
}
