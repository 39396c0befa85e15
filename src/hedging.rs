//! Hedging Engine (C4): turns a quote's hedge plan into venue orders.
//! See spec §4.4.
//!
//! Persists a `HedgeOrder` row before ever calling the venue so a crash
//! between persistence and the network call is recoverable by replaying
//! the same `client_order_id` — the same idempotency-by-construction the
//! teacher's `db_adapter.rs` uses for `record_market_update`.

use rust_decimal::prelude::ToPrimitive;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::exchange::{ExchangeClient, OrderType, PlaceOrderRequest};
use crate::quote::HedgeLegPlan;

#[derive(Debug, Clone)]
pub struct HedgeLegOutcome {
    pub leg_number: usize,
    pub client_order_id: String,
    pub count: u32,
    pub result: HedgeLegResult,
}

#[derive(Debug, Clone)]
pub enum HedgeLegResult {
    Accepted { venue_order_id: String },
    Skipped { reason: &'static str },
    Failed { error: String },
}

#[derive(sqlx::FromRow)]
struct ExistingHedge {
    client_order_id: String,
    status: String,
    venue_order_id: Option<String>,
}

fn epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis()
}

/// Converts a leg's hedge notional into whole venue contracts at the
/// leg's own probability, spec §4.4.
fn notional_to_contracts(notional: rust_decimal::Decimal, prob: f64) -> (i32, u32) {
    let contract_cost_cents = (prob * 100.0).round() as i32;
    if contract_cost_cents <= 0 {
        return (contract_cost_cents, 0);
    }
    let notional_cents = (notional * rust_decimal::Decimal::ONE_HUNDRED)
        .to_f64()
        .unwrap_or(0.0);
    let count = (notional_cents / contract_cost_cents as f64).floor().max(0.0) as u32;
    (contract_cost_cents, count)
}

/// Places every hedge in the plan, persisting a `HedgeOrder` row per leg
/// before the network call. A single leg's venue failure never aborts the
/// batch (spec §4.4 failure semantics) — the caller gets back one outcome
/// per leg and decides whether the parlay needs `needs_attention`.
///
/// `HedgeLegPlan` already carries the leg's ticker and side; its own
/// probability is recovered as `notional / projected_win` rather than
/// threaded through separately, since that's exactly how `projected_win`
/// was derived when the plan was built (see `quote::build_quote`).
pub async fn place_hedges(
    pool: &sqlx::PgPool,
    exchange: &ExchangeClient,
    parlay_session_id: &str,
    hedge_plan: &[HedgeLegPlan],
) -> anyhow::Result<Vec<HedgeLegOutcome>> {
    let mut outcomes = Vec::with_capacity(hedge_plan.len());

    for leg in hedge_plan {
        let ticker = leg.ticker.clone();
        let side = leg.side;
        let prob = (leg.notional / leg.projected_win).to_f64().unwrap_or(0.5);

        let (contract_cost_cents, count) = notional_to_contracts(leg.notional, prob);
        if count == 0 {
            tracing::info!(
                parlay_session_id,
                leg_number = leg.leg_number,
                "hedge notional rounds to zero contracts, skipping leg"
            );
            outcomes.push(HedgeLegOutcome {
                leg_number: leg.leg_number,
                client_order_id: String::new(),
                count: 0,
                result: HedgeLegResult::Skipped { reason: "count_zero" },
            });
            continue;
        }

        // Idempotency keys on the row, not on a freshly-minted id: if this
        // leg was already persisted by an earlier call (retry, duplicate
        // request), reuse its `client_order_id` and skip straight to the
        // venue call only if it never got past `submitting` — a repeated
        // `place_hedges` for the same parlay must not place a second order.
        let existing: Option<ExistingHedge> = sqlx::query_as(
            "SELECT client_order_id, status, venue_order_id FROM hedge_orders
             WHERE parlay_session_id = $1 AND leg_number = $2",
        )
        .bind(parlay_session_id)
        .bind(leg.leg_number as i32)
        .fetch_optional(pool)
        .await?;

        if let Some(ref existing) = existing {
            match existing.status.as_str() {
                "accepted" => {
                    outcomes.push(HedgeLegOutcome {
                        leg_number: leg.leg_number,
                        client_order_id: existing.client_order_id.clone(),
                        count,
                        result: HedgeLegResult::Accepted {
                            venue_order_id: existing.venue_order_id.clone().unwrap_or_default(),
                        },
                    });
                    continue;
                }
                "failed" => {
                    outcomes.push(HedgeLegOutcome {
                        leg_number: leg.leg_number,
                        client_order_id: existing.client_order_id.clone(),
                        count,
                        result: HedgeLegResult::Skipped { reason: "already_failed" },
                    });
                    continue;
                }
                _ => {}
            }
        }

        let client_order_id = existing
            .map(|e| e.client_order_id)
            .unwrap_or_else(|| format!("hedge-{parlay_session_id}-{}-{}", leg.leg_number, epoch_ms()));

        sqlx::query(
            "INSERT INTO hedge_orders
                (parlay_session_id, leg_number, ticker, side, count, limit_price, client_order_id, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'submitting')
             ON CONFLICT (parlay_session_id, leg_number) DO NOTHING",
        )
        .bind(parlay_session_id)
        .bind(leg.leg_number as i32)
        .bind(&ticker)
        .bind(side)
        .bind(count as i32)
        .bind(contract_cost_cents)
        .bind(&client_order_id)
        .execute(pool)
        .await?;

        let request = PlaceOrderRequest {
            ticker: ticker.clone(),
            side,
            action: "buy",
            count,
            order_type: OrderType::Market,
            limit_price: None,
            client_order_id: client_order_id.clone(),
            cancel_order_on_pause: true,
        };

        let result = match exchange.place_order(request).await {
            Ok(response) => {
                sqlx::query(
                    "UPDATE hedge_orders SET status = 'accepted', venue_order_id = $1
                     WHERE client_order_id = $2",
                )
                .bind(&response.venue_order_id)
                .bind(&client_order_id)
                .execute(pool)
                .await?;
                HedgeLegResult::Accepted { venue_order_id: response.venue_order_id }
            }
            Err(e) => {
                tracing::warn!(
                    parlay_session_id,
                    leg_number = leg.leg_number,
                    error = %e,
                    "hedge leg failed at the venue, parlay remains valid"
                );
                sqlx::query("UPDATE hedge_orders SET status = 'failed' WHERE client_order_id = $1")
                    .bind(&client_order_id)
                    .execute(pool)
                    .await?;
                HedgeLegResult::Failed { error: e.to_string() }
            }
        };

        outcomes.push(HedgeLegOutcome {
            leg_number: leg.leg_number,
            client_order_id,
            count,
            result,
        });
    }

    let failed = outcomes
        .iter()
        .filter(|o| matches!(o.result, HedgeLegResult::Failed { .. }))
        .count();
    tracing::info!(
        parlay_session_id,
        total = outcomes.len(),
        failed,
        "hedge batch complete"
    );

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_contract_conversion_floors() {
        let (cost_cents, count) = notional_to_contracts(rust_decimal::Decimal::new(10000, 2), 0.60);
        assert_eq!(cost_cents, 60);
        assert_eq!(count, 166);
    }

    #[test]
    fn zero_notional_yields_zero_contracts() {
        let (_, count) = notional_to_contracts(rust_decimal::Decimal::ZERO, 0.60);
        assert_eq!(count, 0);
    }
}
