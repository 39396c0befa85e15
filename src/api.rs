//! API Gateway (C6): the HTTP surface consumed by the browser extension.
//! See spec §6.
//!
//! `AppState` bundles the db pool, exchange client, config, and a cache for
//! the one read-heavy endpoint that benefits from one, `GET
//! /api/kalshi/market/:id`. No broadcast channel — there's no real-time
//! streaming surface here.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{FromRef, FromRequestParts, Path, Query, State};
use axum::http::{request::Parts, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use jsonwebtoken::{DecodingKey, Validation};
use moka::future::Cache;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::exchange::ExchangeClient;
use crate::ledger;
use crate::models::{Environment, LegDraft, Parlay, Side};
use crate::quote::{self, HedgeLegPlan, LegInput, RiskAssessment};

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub exchange: ExchangeClient,
    pub config: Arc<Config>,
    pub cache: Cache<String, String>,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> Self {
        state.db.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(public_config))
        .route("/auth/callback", post(auth_callback))
        .route("/api/kalshi/market/:id", get(get_market))
        .route(
            "/api/parlay/:user_id",
            get(list_drafts).post(create_draft).delete(delete_all_drafts),
        )
        .route("/api/parlay/:user_id/:bet_id", delete(delete_draft))
        .route("/api/quote", post(post_quote))
        .route("/api/place-parlay", post(place_parlay))
        .route("/api/parlay-history/:user_id", get(parlay_history))
        .route("/api/parlay-status/:session_id", get(parlay_status))
        .route("/api/claim-winnings/:session_id", post(claim_winnings))
        .route("/api/wallet/:user_id", get(get_wallet))
        .route("/api/withdraw/:user_id", post(withdraw))
        .route("/api/purchase-history/:user_id", get(purchase_history))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower::timeout::TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}

// ---------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Bearer-token-authenticated caller, extracted from the JWT's `sub`
/// claim. Every authenticated handler below takes this as its first
/// extractor argument.
pub struct AuthUser(pub Uuid);

impl<S> FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::NotAuthenticated)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::NotAuthenticated)?;

        let public_key_pem = app_state
            .config
            .jwt_public_key_pem
            .as_ref()
            .ok_or(ApiError::NotAuthenticated)?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|_| ApiError::NotAuthenticated)?;

        let mut validation = Validation::new(jsonwebtoken::Algorithm::RS256);
        if let Some(issuer) = &app_state.config.jwt_issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = jsonwebtoken::decode::<Claims>(token, &decoding_key, &validation)
            .map_err(|_| ApiError::NotAuthenticated)?;
        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| ApiError::NotAuthenticated)?;
        Ok(AuthUser(user_id))
    }
}

fn require_self(auth: &AuthUser, path_user_id: Uuid) -> ApiResult<()> {
    if auth.0 != path_user_id {
        return Err(ApiError::NotAuthenticated);
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Public endpoints
// ---------------------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(json!({"ok": true}))
}

async fn public_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "identityUrl": state.config.identity_public_url,
        "anonKey": state.config.identity_anon_key,
    }))
}

async fn auth_callback(Json(_body): Json<serde_json::Value>) -> StatusCode {
    // Identity-provider internals are out of scope (spec §1); this
    // endpoint only needs to exist so the redirect has somewhere to land.
    StatusCode::OK
}

// ---------------------------------------------------------------------
// Market lookup (C1 passthrough, cached)
// ---------------------------------------------------------------------

async fn get_market(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let cache_key = format!("market:{market_id}");
    if let Some(cached) = state.cache.get(&cache_key).await {
        if let Ok(value) = serde_json::from_str(&cached) {
            return Ok(Json(value));
        }
    }

    let market = state
        .exchange
        .get_market(&market_id)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;

    let mut by_label: HashMap<String, serde_json::Value> = HashMap::new();
    for contract in &market.contracts {
        let entry = by_label
            .entry(contract.label.clone())
            .or_insert_with(|| json!({"label": contract.label, "imageUrl": contract.image}));
        let side_key = if contract.side.eq_ignore_ascii_case("yes") { "yes" } else { "no" };
        entry[side_key] = json!({
            "ticker": contract.ticker,
            "prob": contract.probability_percent,
            "price": contract.price_cents,
        });
    }

    let normalized = json!({
        "title": market.title,
        "imageUrl": market.image,
        "contracts": by_label.into_values().collect::<Vec<_>>(),
    });

    if let Ok(serialized) = serde_json::to_string(&normalized) {
        state.cache.insert(cache_key, serialized).await;
    }

    Ok(Json(normalized))
}

// ---------------------------------------------------------------------
// Draft legs
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EnvironmentQuery {
    environment: Option<String>,
}

fn parse_environment(s: &str) -> ApiResult<Environment> {
    match s.to_lowercase().as_str() {
        "demo" => Ok(Environment::Demo),
        "production" => Ok(Environment::Production),
        _ => Err(ApiError::EnvironmentMismatch),
    }
}

async fn list_drafts(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(q): Query<EnvironmentQuery>,
) -> ApiResult<Json<Vec<LegDraft>>> {
    require_self(&auth, user_id)?;
    let environment = q
        .environment
        .as_deref()
        .map(parse_environment)
        .transpose()?
        .unwrap_or(Environment::Demo);

    let drafts = sqlx::query_as::<_, LegDraft>(
        "SELECT id, user_id, environment, market_id, ticker, option_label, side, prob,
                market_url, market_image_url, option_image_url, created_at
         FROM leg_drafts WHERE user_id = $1 AND environment = $2 ORDER BY id",
    )
    .bind(user_id)
    .bind(environment)
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::Internal(e.into()))?;

    Ok(Json(drafts))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDraftRequest {
    market_id: String,
    #[allow(dead_code)]
    market_title: Option<String>,
    market_url: Option<String>,
    #[allow(dead_code)]
    image_url: Option<String>,
    market_image_url: Option<String>,
    option_image_url: Option<String>,
    #[allow(dead_code)]
    option_id: Option<String>,
    option_label: String,
    prob: Decimal,
    ticker: String,
    side: String,
    environment: String,
}

async fn create_draft(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<CreateDraftRequest>,
) -> ApiResult<Json<LegDraft>> {
    require_self(&auth, user_id)?;
    let environment = parse_environment(&body.environment)?;
    let side = Side::parse(&body.side).ok_or(ApiError::InvalidProbability)?;

    let existing_environment: Option<Environment> =
        sqlx::query_scalar("SELECT environment FROM leg_drafts WHERE user_id = $1 LIMIT 1")
            .bind(user_id)
            .fetch_optional(&state.db)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
    if let Some(existing) = existing_environment {
        if existing != environment {
            return Err(ApiError::EnvironmentMismatch);
        }
    }

    let draft = sqlx::query_as::<_, LegDraft>(
        "INSERT INTO leg_drafts
            (user_id, environment, market_id, ticker, option_label, side, prob,
             market_url, market_image_url, option_image_url)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         RETURNING id, user_id, environment, market_id, ticker, option_label, side, prob,
                   market_url, market_image_url, option_image_url, created_at",
    )
    .bind(user_id)
    .bind(environment)
    .bind(&body.market_id)
    .bind(&body.ticker)
    .bind(&body.option_label)
    .bind(side)
    .bind(body.prob)
    .bind(&body.market_url)
    .bind(&body.market_image_url)
    .bind(&body.option_image_url)
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::Internal(e.into()))?;

    Ok(Json(draft))
}

async fn delete_draft(
    auth: AuthUser,
    State(state): State<AppState>,
    Path((user_id, bet_id)): Path<(Uuid, i64)>,
) -> ApiResult<StatusCode> {
    require_self(&auth, user_id)?;
    sqlx::query("DELETE FROM leg_drafts WHERE id = $1 AND user_id = $2")
        .bind(bet_id)
        .bind(user_id)
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_all_drafts(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_self(&auth, user_id)?;
    sqlx::query("DELETE FROM leg_drafts WHERE user_id = $1")
        .bind(user_id)
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------
// Quote + placement
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteBetInput {
    market_title: String,
    option_label: String,
    /// Percent in [0, 100].
    prob: f64,
    /// Not in the minimal wire contract (spec §6); when omitted, the
    /// option label stands in as the instrument reference until the leg
    /// is persisted as a draft with its real ticker.
    ticker: Option<String>,
    side: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuoteRequest {
    bets: Vec<QuoteBetInput>,
    stake: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct QuotePayout {
    naive_payout: Decimal,
    adjusted_payout: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct QuoteAnalysis {
    adjusted_probability: f64,
    correlation_factor: f64,
    reasoning: String,
    risk_assessment: RiskAssessment,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct QuoteSnapshot {
    stake: Decimal,
    payout: QuotePayout,
    analysis: QuoteAnalysis,
    hedging_strategy: Vec<HedgeLegPlan>,
}

async fn post_quote(
    State(state): State<AppState>,
    Json(body): Json<QuoteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let legs: Vec<LegInput> = body
        .bets
        .iter()
        .map(|bet| LegInput {
            ticker: bet.ticker.clone().unwrap_or_else(|| bet.option_label.clone()),
            title: bet.market_title.clone(),
            side: bet.side.as_deref().and_then(Side::parse).unwrap_or(Side::Yes),
            prob: bet.prob / 100.0,
        })
        .collect();

    let quote = quote::build_quote(&state.config, &legs, body.stake).await?;

    let snapshot = QuoteSnapshot {
        stake: quote.stake,
        payout: QuotePayout { naive_payout: quote.u_naive, adjusted_payout: quote.u_offer },
        analysis: QuoteAnalysis {
            adjusted_probability: quote.p_adj,
            correlation_factor: quote.correlation_factor,
            reasoning: quote.ai_reasoning.clone(),
            risk_assessment: quote.risk_assessment,
        },
        hedging_strategy: quote.hedge_plan.clone(),
    };

    Ok(Json(json!({"quote": snapshot})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParlayBetInput {
    market_title: String,
    option_label: String,
    ticker: String,
    side: String,
    #[allow(dead_code)]
    market_url: Option<String>,
    #[allow(dead_code)]
    market_image_url: Option<String>,
    #[allow(dead_code)]
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceParlayRequest {
    user_id: Uuid,
    environment: String,
    stake: Decimal,
    parlay_bets: Vec<ParlayBetInput>,
    quote: QuoteSnapshot,
}

async fn place_parlay(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<PlaceParlayRequest>,
) -> ApiResult<Json<Parlay>> {
    require_self(&auth, body.user_id)?;
    let environment = parse_environment(&body.environment)?;

    let session_id = Uuid::new_v4().to_string();
    let mut leg_inputs = Vec::with_capacity(body.parlay_bets.len());
    for (i, bet) in body.parlay_bets.iter().enumerate() {
        let side = Side::parse(&bet.side).ok_or(ApiError::InvalidProbability)?;
        leg_inputs.push(ledger::LegOutcomeInput {
            leg_number: i as i32,
            ticker: bet.ticker.clone(),
            side,
        });
    }

    let parlay_data = json!(body
        .parlay_bets
        .iter()
        .map(|b| json!({"marketTitle": b.market_title, "optionLabel": b.option_label, "ticker": b.ticker, "side": b.side}))
        .collect::<Vec<_>>());
    let quote_snapshot = json!(body.quote);
    let hedging_plan = json!(body.quote.hedging_strategy);

    let parlay = ledger::place_parlay(
        &state.db,
        body.user_id,
        environment,
        &session_id,
        body.stake,
        body.quote.payout.adjusted_payout,
        &leg_inputs,
        parlay_data,
        quote_snapshot,
        hedging_plan,
    )
    .await
    .map_err(ApiError::from_anyhow)?;

    let pool = state.db.clone();
    let exchange = state.exchange.clone();
    let hedge_plan = body.quote.hedging_strategy.clone();
    let parlay_session_id = session_id.clone();
    tokio::spawn(async move {
        if let Err(e) = crate::hedging::place_hedges(&pool, &exchange, &parlay_session_id, &hedge_plan).await {
            tracing::error!(parlay_session_id, error = %e, "hedge batch failed to run");
        }
    });

    Ok(Json(parlay))
}

// ---------------------------------------------------------------------
// History, status, claim, wallet, withdrawal
// ---------------------------------------------------------------------

async fn parlay_history(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Vec<serde_json::Value>>> {
    require_self(&auth, user_id)?;
    let parlays = sqlx::query_as::<_, Parlay>(
        "SELECT session_id, user_id, environment, stake, payout, parlay_data, quote_snapshot,
                hedging_plan, status, claimable_amount, claimed_at, created_at
         FROM parlays WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::Internal(e.into()))?;

    let mut out = Vec::with_capacity(parlays.len());
    for parlay in parlays {
        let legs: Vec<crate::models::LegOutcome> = sqlx::query_as(
            "SELECT id, parlay_session_id, leg_number, ticker, side, expected_outcome,
                    market_status, outcome, settled_at
             FROM leg_outcomes WHERE parlay_session_id = $1 ORDER BY leg_number",
        )
        .bind(&parlay.session_id)
        .fetch_all(&state.db)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;

        out.push(json!({
            "sessionId": parlay.session_id,
            "environment": parlay.environment,
            "stake": parlay.stake,
            "payout": parlay.payout,
            "status": parlay.status,
            "claimableAmount": parlay.claimable_amount,
            "claimedAt": parlay.claimed_at,
            "createdAt": parlay.created_at,
            "legOutcomes": legs,
        }));
    }

    Ok(Json(out))
}

async fn parlay_status(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Parlay>> {
    crate::settlement::run_pass(&state.db, &state.exchange, &state.config)
        .await
        .map_err(ApiError::from_anyhow)?;

    let parlay = sqlx::query_as::<_, Parlay>(
        "SELECT session_id, user_id, environment, stake, payout, parlay_data, quote_snapshot,
                hedging_plan, status, claimable_amount, claimed_at, created_at
         FROM parlays WHERE session_id = $1",
    )
    .bind(&session_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| ApiError::Internal(e.into()))?
    .ok_or_else(|| ApiError::NotFound("parlay".to_string()))?;

    Ok(Json(parlay))
}

async fn claim_winnings(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let amount = ledger::claim(&state.db, &session_id)
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(json!({"creditedAmount": amount})))
}

async fn get_wallet(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    require_self(&auth, user_id)?;
    let balance: Option<Decimal> =
        sqlx::query_scalar("SELECT balance FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&state.db)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
    let balance = balance.ok_or_else(|| ApiError::NotFound("wallet".to_string()))?;
    Ok(Json(json!({"balance": balance})))
}

#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    amount: Decimal,
}

async fn withdraw(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<WithdrawRequest>,
) -> ApiResult<Json<crate::models::WithdrawalRequest>> {
    require_self(&auth, user_id)?;
    let request = ledger::open_withdrawal(&state.db, user_id, body.amount)
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(request))
}

async fn purchase_history(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Vec<crate::models::PendingPurchase>>> {
    require_self(&auth, user_id)?;
    let purchases = sqlx::query_as::<_, crate::models::PendingPurchase>(
        "SELECT session_id, user_id, amount, status FROM pending_purchases WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(purchases))
}
