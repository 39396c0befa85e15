//! Shared data model types for the parlay ledger.
//!
//! These mirror the Postgres schema in `migrations/` row for row. Money
//! fields are `Decimal` end to end; only the quote engine's probability
//! math drops to `f64` (see `quote.rs`).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Environment {
    Demo,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Demo => "demo",
            Environment::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "YES" => Some(Side::Yes),
            "NO" => Some(Side::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum ParlayStatus {
    Pending,
    Won,
    Lost,
    /// Operational state: a settlement pass hit a permanent error reconciling
    /// against the venue and the parlay needs an operator to look at it.
    NeedsAttention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum LegOutcomeValue {
    Win,
    Loss,
    Void,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum HedgeOrderStatus {
    Submitting,
    Accepted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Wallet {
    pub user_id: Uuid,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct LegDraft {
    pub id: i64,
    pub user_id: Uuid,
    pub environment: Environment,
    pub market_id: String,
    pub ticker: String,
    pub option_label: String,
    pub side: Side,
    /// Percent in [0, 100], matching the wire contract in spec §6.
    pub prob: Decimal,
    pub market_url: Option<String>,
    pub market_image_url: Option<String>,
    pub option_image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Parlay {
    pub session_id: String,
    pub user_id: Uuid,
    pub environment: Environment,
    pub stake: Decimal,
    pub payout: Decimal,
    pub parlay_data: serde_json::Value,
    pub quote_snapshot: serde_json::Value,
    pub hedging_plan: serde_json::Value,
    pub status: ParlayStatus,
    pub claimable_amount: Option<Decimal>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct LegOutcome {
    pub id: i64,
    pub parlay_session_id: String,
    pub leg_number: i32,
    pub ticker: String,
    pub side: Side,
    pub expected_outcome: Side,
    pub market_status: MarketStatus,
    pub outcome: LegOutcomeValue,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct HedgeOrder {
    pub id: i64,
    pub parlay_session_id: String,
    pub leg_number: i32,
    pub ticker: String,
    pub side: Side,
    pub count: i32,
    pub limit_price: Option<i32>,
    pub client_order_id: String,
    pub status: HedgeOrderStatus,
    pub venue_order_id: Option<String>,
    pub filled_count: Option<i32>,
    pub avg_fill_price: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct LiquidityPool {
    pub id: i32,
    pub balance: Decimal,
    pub description: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct WithdrawalRequest {
    pub id: i64,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub status: WithdrawalStatus,
    pub venue_transfer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct PendingPurchase {
    pub session_id: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub status: String,
}
