//! Configuration management for the parlay engine.
//! Resolved once at process start from environment variables; see spec §4.7.

use serde::{Deserialize, Serialize};
use std::env;

/// Selects the upstream exchange's base URL and credential pair. A process
/// runs in exactly one environment for its whole lifetime; there is no
/// per-request mixing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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

    fn from_env_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "demo" => Some(Environment::Demo),
            "production" => Some(Environment::Production),
            _ => None,
        }
    }
}

impl From<Environment> for crate::models::Environment {
    fn from(e: Environment) -> Self {
        match e {
            Environment::Demo => crate::models::Environment::Demo,
            Environment::Production => crate::models::Environment::Production,
        }
    }
}

/// Hedge tuning parameters, see spec §4.3 step 5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Margin fraction used by the quote engine's house margin policy.
    pub beta: f64,
    /// Per-leg hedge notional cap as a fraction of stake.
    pub alpha_max: f64,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            beta: 0.10,
            alpha_max: 0.40,
        }
    }
}

/// The house margin `m` and the acceptable range it's clamped into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarginConfig {
    pub min: f64,
    pub max: f64,
    /// The margin actually applied to quotes, clamped into `[min, max]`.
    pub rate: f64,
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self { min: 0.10, max: 0.15, rate: 0.12 }
    }
}

/// Settlement worker cadence, see spec §4.5.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SettlementConfig {
    pub poll_interval_secs: u64,
    pub pass_max_secs: u64,
    pub max_concurrency: usize,
    pub call_deadline_secs: u64,
    pub max_retry_attempts: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            pass_max_secs: 60,
            max_concurrency: 8,
            call_deadline_secs: 10,
            max_retry_attempts: 5,
        }
    }
}

/// Venue credentials. The private key accepts either a full PEM block or a
/// bare base64 blob; `exchange::signing` normalizes whichever form is given.
#[derive(Debug, Clone)]
pub struct VenueCredentials {
    pub access_key: String,
    pub private_key_pem_or_b64: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub dry_run: bool,
    pub hedge: HedgeConfig,
    pub margin: MarginConfig,
    pub settlement: SettlementConfig,
    pub venue_base_url: String,
    pub venue_credentials: Option<VenueCredentials>,
    pub ai_correlation_url: Option<String>,
    pub ai_correlation_key: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_public_key_pem: Option<String>,
    /// Surfaced verbatim by the public `/api/config` endpoint; never a secret.
    pub identity_public_url: Option<String>,
    pub identity_anon_key: Option<String>,
    pub database_url: String,
    pub bind_addr: String,
}

impl Config {
    /// Load configuration from environment variables, validating and
    /// clamping out-of-range values with a warning rather than failing,
    /// except for genuinely required secrets (exit code 2, see spec §6).
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .ok()
            .and_then(|s| Environment::from_env_str(&s))
            .unwrap_or(Environment::Demo);

        let dry_run = env::var("DRY_RUN")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(true);

        let mut hedge = HedgeConfig::default();
        if let Ok(v) = env::var("HEDGE_BETA") {
            hedge.beta = v.parse().unwrap_or(hedge.beta);
        }
        if let Ok(v) = env::var("HEDGE_ALPHA_MAX") {
            hedge.alpha_max = v.parse().unwrap_or(hedge.alpha_max);
        }

        let mut margin = MarginConfig::default();
        if let Ok(v) = env::var("MARGIN_MIN") {
            margin.min = v.parse().unwrap_or(margin.min);
        }
        if let Ok(v) = env::var("MARGIN_MAX") {
            margin.max = v.parse().unwrap_or(margin.max);
        }
        if margin.min > margin.max {
            tracing::warn!(
                min = margin.min,
                max = margin.max,
                "MARGIN_MIN > MARGIN_MAX, resetting to defaults"
            );
            margin = MarginConfig::default();
        }
        if let Ok(v) = env::var("MARGIN_RATE") {
            margin.rate = v.parse().unwrap_or(margin.rate);
        }
        margin.rate = margin.rate.clamp(margin.min, margin.max);

        let mut settlement = SettlementConfig::default();
        if let Ok(v) = env::var("T_POLL") {
            settlement.poll_interval_secs = v.parse().unwrap_or(settlement.poll_interval_secs);
        }
        if let Ok(v) = env::var("T_PASS_MAX") {
            settlement.pass_max_secs = v.parse().unwrap_or(settlement.pass_max_secs);
        }

        let venue_base_url = match environment {
            Environment::Demo => env::var("VENUE_DEMO_URL")
                .unwrap_or_else(|_| "https://demo-api.exchange.example/trade-api/v2".to_string()),
            Environment::Production => env::var("VENUE_PROD_URL")
                .unwrap_or_else(|_| "https://api.exchange.example/trade-api/v2".to_string()),
        };

        let venue_credentials = if dry_run {
            // DRY-RUN never touches the network; missing venue keys degrade
            // gracefully rather than becoming a startup error.
            match (env::var("VENUE_ACCESS_KEY"), env::var("VENUE_PRIVATE_KEY")) {
                (Ok(access_key), Ok(private_key_pem_or_b64)) => Some(VenueCredentials {
                    access_key,
                    private_key_pem_or_b64,
                }),
                _ => {
                    tracing::warn!("no venue credentials configured; fine in DRY_RUN mode");
                    None
                }
            }
        } else {
            let access_key = env::var("VENUE_ACCESS_KEY").unwrap_or_else(|_| {
                tracing::error!("VENUE_ACCESS_KEY is required outside DRY_RUN mode");
                std::process::exit(2);
            });
            let private_key_pem_or_b64 = env::var("VENUE_PRIVATE_KEY").unwrap_or_else(|_| {
                tracing::error!("VENUE_PRIVATE_KEY is required outside DRY_RUN mode");
                std::process::exit(2);
            });
            Some(VenueCredentials {
                access_key,
                private_key_pem_or_b64,
            })
        };

        let ai_correlation_url = env::var("AI_CORRELATION_URL").ok();
        let ai_correlation_key = env::var("AI_CORRELATION_KEY").ok();
        if ai_correlation_url.is_some() && ai_correlation_key.is_none() {
            tracing::warn!(
                "AI_CORRELATION_URL set without AI_CORRELATION_KEY; falling back to naive correlation"
            );
        }

        let jwt_issuer = env::var("IDENTITY_ISSUER").ok();
        let jwt_public_key_pem = env::var("IDENTITY_JWT_PUBLIC_KEY").ok();
        if jwt_public_key_pem.is_none() {
            tracing::warn!(
                "IDENTITY_JWT_PUBLIC_KEY not set; authenticated endpoints will reject all requests"
            );
        }

        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            tracing::error!("DATABASE_URL is required");
            std::process::exit(2);
        });

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let identity_public_url = env::var("IDENTITY_PUBLIC_URL").ok();
        let identity_anon_key = env::var("IDENTITY_ANON_KEY").ok();

        let config = Config {
            environment,
            dry_run,
            hedge,
            margin,
            settlement,
            venue_base_url,
            venue_credentials,
            ai_correlation_url,
            ai_correlation_key,
            jwt_issuer,
            jwt_public_key_pem,
            identity_public_url,
            identity_anon_key,
            database_url,
            bind_addr,
        };

        config.print_config();
        config
    }

    fn print_config(&self) {
        tracing::info!(
            environment = self.environment.as_str(),
            dry_run = self.dry_run,
            hedge_beta = self.hedge.beta,
            hedge_alpha_max = self.hedge.alpha_max,
            margin_min = self.margin.min,
            margin_max = self.margin.max,
            poll_interval_secs = self.settlement.poll_interval_secs,
            "loaded configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hedge_defaults_match_spec_bounds() {
        let hedge = HedgeConfig::default();
        assert!(hedge.alpha_max <= 0.40 + f64::EPSILON);
        let margin = MarginConfig::default();
        assert!(margin.min >= 0.10 && margin.max <= 0.15);
    }
}
