//! Quote Engine (C3): prices a candidate parlay and derives its hedge plan.
//! See spec §4.3.
//!
//! The naive/adjusted probability composition follows the same
//! numerically-careful style as the teacher's `lmsr_core.rs` (working in
//! logs where a long product would underflow), though this module's
//! probabilities are plain per-leg `f64`s rather than an LMSR market state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::models::Side;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegInput {
    pub ticker: String,
    pub title: String,
    pub side: Side,
    /// Probability in (0, 1).
    pub prob: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeLegPlan {
    pub leg_number: usize,
    pub ticker: String,
    pub side: Side,
    pub notional: Decimal,
    pub projected_win: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub stake: Decimal,
    pub p_naive: f64,
    pub p_adj: f64,
    pub correlation_factor: f64,
    pub u_naive: Decimal,
    pub u_fair: Decimal,
    pub u_offer: Decimal,
    pub margin: Decimal,
    pub hedge_plan: Vec<HedgeLegPlan>,
    pub ai_reasoning: String,
    pub risk_assessment: RiskAssessment,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskAssessment {
    Low,
    Medium,
    High,
}

#[derive(Debug, Deserialize)]
pub struct AiCorrelationResponse {
    /// Percent, e.g. 42.5 for 42.5%.
    pub p_adj: f64,
    pub correlation_factor: f64,
    pub reasoning: String,
    pub risk_assessment: RiskAssessment,
}

/// `p_naive = ∏ p_i` computed as `exp(Σ ln p_i)` — the teacher's
/// `log_sum_exp` discipline applied to a product instead of a sum, so a
/// 10-leg parlay of long-shot legs doesn't silently underflow to zero
/// before we can tell a genuine zero from a numerical one.
fn naive_probability(legs: &[LegInput]) -> f64 {
    let log_sum: f64 = legs.iter().map(|leg| leg.prob.ln()).sum();
    log_sum.exp()
}

fn validate_legs(legs: &[LegInput], stake: Decimal) -> ApiResult<()> {
    if legs.len() < 2 {
        return Err(ApiError::TooFewLegs);
    }
    if stake <= Decimal::ZERO {
        return Err(ApiError::InvalidStake);
    }
    for leg in legs {
        if !(leg.prob > 0.0 && leg.prob < 1.0) {
            return Err(ApiError::InvalidProbability);
        }
    }
    Ok(())
}

/// Per-leg hedge fraction tiered on the leg's own probability, spec §4.3
/// step 5.
fn hedge_fraction(prob: f64, alpha_max: f64) -> f64 {
    if prob < 0.50 {
        0.0
    } else if prob < 0.55 {
        0.15
    } else if prob < 0.65 {
        0.25
    } else {
        0.40_f64.min(alpha_max)
    }
}

async fn call_ai_correlation(
    config: &Config,
    legs: &[LegInput],
) -> Option<AiCorrelationResponse> {
    let url = config.ai_correlation_url.as_ref()?;
    let client = reqwest::Client::new();
    let mut request = client.post(url).json(&serde_json::json!({
        "legs": legs.iter().map(|l| serde_json::json!({
            "title": l.title,
            "probability_percent": l.prob * 100.0,
        })).collect::<Vec<_>>(),
    }));
    if let Some(key) = &config.ai_correlation_key {
        request = request.bearer_auth(key);
    }

    match request
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            response.json::<AiCorrelationResponse>().await.ok()
        }
        Ok(response) => {
            tracing::warn!(status = %response.status(), "ai correlation service returned an error");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "ai correlation service unreachable, falling back to naive probability");
            None
        }
    }
}

/// Produces a full priced quote for a candidate parlay, spec §4.3.
pub async fn build_quote(config: &Config, legs: &[LegInput], stake: Decimal) -> ApiResult<Quote> {
    validate_legs(legs, stake)?;

    let p_naive = naive_probability(legs);
    let u_naive = stake / Decimal::try_from(p_naive)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;

    let ai_response = call_ai_correlation(config, legs).await;
    let (mut p_adj, correlation_factor, reasoning, risk_assessment) = match ai_response {
        Some(r) => (r.p_adj / 100.0, r.correlation_factor, r.reasoning, r.risk_assessment),
        None => (
            p_naive,
            1.0,
            "AI correlation service unavailable; used independence assumption.".to_string(),
            RiskAssessment::Medium,
        ),
    };

    // Hard constraint: never offer better odds than plain independence.
    if p_adj < p_naive {
        tracing::warn!(p_adj, p_naive, "AI correlation adjustment violated p_adj >= p_naive, clamping");
        p_adj = p_naive;
    }
    let correlation_factor = correlation_factor.max(1.0);

    let u_fair = stake / Decimal::try_from(p_adj)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    debug_assert!(u_fair <= u_naive * Decimal::new(1001, 3), "u_fair must not exceed u_naive");

    let margin = config.margin.rate.clamp(config.margin.min, config.margin.max);
    let house_margin = Decimal::try_from(margin).map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    let u_offer = u_fair * (Decimal::ONE - house_margin);

    let hedge_plan = legs
        .iter()
        .enumerate()
        .filter_map(|(i, leg)| {
            let alpha = hedge_fraction(leg.prob, config.hedge.alpha_max);
            if alpha <= 0.0 {
                return None;
            }
            let alpha_decimal = Decimal::try_from(alpha).ok()?;
            let notional = stake * alpha_decimal;
            let prob_decimal = Decimal::try_from(leg.prob).ok()?;
            let projected_win = notional / prob_decimal;
            Some(HedgeLegPlan {
                leg_number: i,
                ticker: leg.ticker.clone(),
                side: leg.side,
                notional,
                projected_win,
            })
        })
        .collect();

    Ok(Quote {
        stake,
        p_naive,
        p_adj,
        correlation_factor,
        u_naive,
        u_fair,
        u_offer,
        margin: house_margin,
        hedge_plan,
        ai_reasoning: reasoning,
        risk_assessment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Environment, HedgeConfig, MarginConfig};
    use proptest::prelude::*;

    fn test_config() -> Config {
        Config {
            environment: Environment::Demo,
            dry_run: true,
            hedge: HedgeConfig { beta: 0.10, alpha_max: 0.40 },
            margin: MarginConfig { min: 0.10, max: 0.15, rate: 0.12 },
            settlement: crate::config::SettlementConfig::default(),
            venue_base_url: "https://example.invalid".to_string(),
            venue_credentials: None,
            ai_correlation_url: None,
            ai_correlation_key: None,
            jwt_issuer: None,
            jwt_public_key_pem: None,
            identity_public_url: None,
            identity_anon_key: None,
            database_url: "postgres://localhost/test".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }

    #[test]
    fn naive_probability_is_product() {
        let legs = vec![
            LegInput { ticker: "A".into(), title: "A".into(), side: Side::Yes, prob: 0.5 },
            LegInput { ticker: "B".into(), title: "B".into(), side: Side::Yes, prob: 0.4 },
        ];
        let p = naive_probability(&legs);
        assert!((p - 0.2).abs() < 1e-9);
    }

    #[test]
    fn hedge_fraction_tiers() {
        assert_eq!(hedge_fraction(0.49, 0.40), 0.0);
        assert_eq!(hedge_fraction(0.52, 0.40), 0.15);
        assert_eq!(hedge_fraction(0.60, 0.40), 0.25);
        assert_eq!(hedge_fraction(0.90, 0.40), 0.40);
        assert_eq!(hedge_fraction(0.90, 0.20), 0.20);
    }

    #[tokio::test]
    async fn falls_back_to_naive_probability_when_ai_unconfigured() {
        let config = test_config();
        let legs = vec![
            LegInput { ticker: "A".into(), title: "A".into(), side: Side::Yes, prob: 0.6 },
            LegInput { ticker: "B".into(), title: "B".into(), side: Side::No, prob: 0.7 },
        ];
        let quote = build_quote(&config, &legs, Decimal::new(100, 0)).await.unwrap();
        assert!((quote.p_adj - quote.p_naive).abs() < 1e-9);
        assert_eq!(quote.correlation_factor, 1.0);
        assert!(quote.u_fair <= quote.u_naive);
    }

    #[tokio::test]
    async fn rejects_too_few_legs() {
        let config = test_config();
        let legs = vec![LegInput { ticker: "A".into(), title: "A".into(), side: Side::Yes, prob: 0.6 }];
        let err = build_quote(&config, &legs, Decimal::new(100, 0)).await.unwrap_err();
        assert!(matches!(err, ApiError::TooFewLegs));
    }

    #[tokio::test]
    async fn rejects_non_positive_stake() {
        let config = test_config();
        let legs = vec![
            LegInput { ticker: "A".into(), title: "A".into(), side: Side::Yes, prob: 0.6 },
            LegInput { ticker: "B".into(), title: "B".into(), side: Side::Yes, prob: 0.5 },
        ];
        let err = build_quote(&config, &legs, Decimal::ZERO).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidStake));
    }

    // Spec §8 property 7: reordering a parlay's legs must not change its
    // naive probability — it's a plain product, so the teacher's
    // round-trip-invariant style from `lmsr_core.rs` applies directly to
    // permutation instead of buy/sell.
    proptest! {
        #[test]
        fn naive_probability_is_permutation_invariant(
            probs in prop::collection::vec(0.01f64..0.99, 2..6),
        ) {
            let legs: Vec<LegInput> = probs
                .iter()
                .enumerate()
                .map(|(i, &prob)| LegInput {
                    ticker: format!("LEG{i}"),
                    title: format!("Leg {i}"),
                    side: Side::Yes,
                    prob,
                })
                .collect();

            let forward = naive_probability(&legs);
            let mut reversed = legs.clone();
            reversed.reverse();
            let backward = naive_probability(&reversed);

            prop_assert!(
                (forward - backward).abs() < 1e-9,
                "forward={} backward={}", forward, backward
            );
        }

        #[test]
        fn hedge_fraction_never_decreases_as_probability_rises(
            prob in 0.01f64..0.98,
            alpha_max in 0.20f64..0.50,
        ) {
            let low = hedge_fraction(prob, alpha_max);
            let high = hedge_fraction(prob + 0.01, alpha_max);

            prop_assert!(high >= low - 1e-9, "low={} high={}", low, high);
            prop_assert!(low >= 0.0);
            prop_assert!(low <= alpha_max.min(0.40) + 1e-9);
        }

        // Spec §8 property 3: U_offer <= U_fair <= U_naive and
        // p_adj >= p_naive, correlation_factor >= 1.0, for any valid parlay —
        // holds whether or not the AI correlation service is configured,
        // since `ai_correlation_url` is unset in `test_config`.
        #[test]
        fn quote_prices_are_monotonic(
            probs in prop::collection::vec(0.05f64..0.95, 2..5),
            stake_cents in 100i64..1_000_000i64,
            margin_rate in 0.10f64..0.15,
        ) {
            let legs: Vec<LegInput> = probs
                .iter()
                .enumerate()
                .map(|(i, &prob)| LegInput {
                    ticker: format!("LEG{i}"),
                    title: format!("Leg {i}"),
                    side: Side::Yes,
                    prob,
                })
                .collect();

            let mut config = test_config();
            config.margin = MarginConfig { min: 0.10, max: 0.15, rate: margin_rate };
            let stake = Decimal::new(stake_cents, 2);

            let runtime = tokio::runtime::Runtime::new().unwrap();
            let quote = runtime.block_on(build_quote(&config, &legs, stake)).unwrap();

            prop_assert!(quote.p_adj >= quote.p_naive - 1e-9);
            prop_assert!(quote.correlation_factor >= 1.0 - 1e-9);
            prop_assert!(quote.u_offer <= quote.u_fair);
            prop_assert!(quote.u_fair <= quote.u_naive * Decimal::new(1001, 3));
        }
    }
}
