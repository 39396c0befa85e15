//! Exchange Client (C1): signed REST access to the prediction-market venue.
//! See spec §4.1.

pub mod error;
pub mod rate_limit;
pub mod signing;

pub use error::ExchangeError;

use rate_limit::RateLimiter;
use serde::{Deserialize, Serialize};
use signing::RequestSigner;
use std::time::Duration;

use crate::config::{Config, Environment};
use crate::models::Side;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub ticker: String,
    pub label: String,
    pub side: String,
    pub probability_percent: f64,
    pub price_cents: i32,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    pub ticker: String,
    pub title: String,
    pub image: Option<String>,
    pub status: String,
    pub contracts: Vec<Contract>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderRequest {
    pub ticker: String,
    pub side: Side,
    pub action: &'static str,
    pub count: u32,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub limit_price: Option<i32>,
    pub client_order_id: String,
    pub cancel_order_on_pause: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderResponse {
    pub venue_order_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub venue_order_id: String,
    pub filled_count: i32,
    pub avg_price: f64,
    pub filled_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutResponse {
    pub venue_transfer_id: String,
}

/// Signed REST client for the upstream prediction-market venue.
///
/// Environment (`demo` vs `production`) and DRY-RUN are both resolved once
/// at construction time from `Config`, never mixed within the lifetime of
/// the client (spec §4.1/§9).
#[derive(Clone)]
pub struct ExchangeClient {
    http: reqwest::Client,
    base_url: String,
    environment: Environment,
    dry_run: bool,
    signer: Option<RequestSigner>,
    rate_limiter: RateLimiter,
}

impl ExchangeClient {
    pub fn new(config: &Config) -> Result<Self, ExchangeError> {
        let signer = match &config.venue_credentials {
            Some(creds) => Some(RequestSigner::new(
                creds.access_key.clone(),
                &creds.private_key_pem_or_b64,
            )?),
            None => None,
        };

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.venue_base_url.clone(),
            environment: config.environment,
            dry_run: config.dry_run,
            signer,
            rate_limiter: RateLimiter::default_for_venue(),
        })
    }

    fn signed_headers(
        &self,
        method: &str,
        path: &str,
    ) -> Result<Vec<(&'static str, String)>, ExchangeError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| ExchangeError::Fatal("no venue credentials configured".to_string()))?;
        let headers = signer.sign(method, path)?;
        Ok(vec![
            ("ACCESS-KEY", headers.access_key),
            ("ACCESS-TIMESTAMP", headers.access_timestamp),
            ("ACCESS-SIGNATURE", headers.access_signature),
        ])
    }

    async fn send_signed<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<T, ExchangeError> {
        let headers = self.signed_headers(method.as_str(), path)?;
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, &url);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ExchangeError::Retryable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let text = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Fatal(format!(
                "signature rejected by venue: {text}"
            )));
        }
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Retryable(text));
        }
        if status.is_client_error() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let code = body
                .get("error")
                .and_then(|v| v.get("code"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let message = body
                .get("error")
                .and_then(|v| v.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("request rejected")
                .to_string();
            return Err(ExchangeError::from_venue_code(
                status.as_u16(),
                &code,
                &message,
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ExchangeError::Retryable(format!("invalid venue response: {e}")))
    }

    /// `GET /markets/{market_id}`. Unknown markets fail with `MarketNotFound`.
    pub async fn get_market(&self, market_id: &str) -> Result<MarketInfo, ExchangeError> {
        let path = format!("/markets/{market_id}");
        match self
            .send_signed::<MarketInfo>(reqwest::Method::GET, &path, None::<&()>)
            .await
        {
            Ok(market) => Ok(market),
            Err(ExchangeError::NonRetryable { code, .. }) if code == "not_found" => {
                Err(ExchangeError::MarketNotFound(market_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Places one order. In DRY-RUN mode no network call is made; a
    /// synthetic success is returned and the full request is logged, per
    /// spec §4.1. Self-paces via the shared rate limiter.
    pub async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<PlaceOrderResponse, ExchangeError> {
        self.rate_limiter.acquire().await;

        if self.dry_run {
            tracing::info!(
                target: "exchange.dry_run",
                endpoint = "POST /orders",
                environment = self.environment.as_str(),
                request = ?request,
                "DRY-RUN: would have placed order"
            );
            return Ok(PlaceOrderResponse {
                venue_order_id: format!("dryrun-{}", request.client_order_id),
                status: "accepted".to_string(),
            });
        }

        self.send_signed(reqwest::Method::POST, "/orders", Some(&request))
            .await
    }

    /// `GET /fills?since=..&ticker=..`.
    pub async fn list_fills(
        &self,
        since: Option<chrono::DateTime<chrono::Utc>>,
        ticker: Option<&str>,
    ) -> Result<Vec<Fill>, ExchangeError> {
        let mut path = "/fills".to_string();
        let mut params = Vec::new();
        if let Some(since) = since {
            params.push(format!("since={}", since.to_rfc3339()));
        }
        if let Some(ticker) = ticker {
            params.push(format!("ticker={ticker}"));
        }
        if !params.is_empty() {
            path.push('?');
            path.push_str(&params.join("&"));
        }

        #[derive(Deserialize)]
        struct FillsResponse {
            fills: Vec<Fill>,
        }

        let response: FillsResponse = self
            .send_signed(reqwest::Method::GET, &path, None::<&()>)
            .await?;
        Ok(response.fills)
    }

    /// Used by withdrawals. DRY-RUN behaves identically to `place_order`.
    pub async fn transfer_out(
        &self,
        user_handle: &str,
        amount: rust_decimal::Decimal,
    ) -> Result<TransferOutResponse, ExchangeError> {
        #[derive(Serialize, Debug)]
        struct TransferOutRequest<'a> {
            user_handle: &'a str,
            amount: rust_decimal::Decimal,
        }
        let request = TransferOutRequest { user_handle, amount };

        if self.dry_run {
            tracing::info!(
                target: "exchange.dry_run",
                endpoint = "POST /transfers",
                environment = self.environment.as_str(),
                request = ?request,
                "DRY-RUN: would have transferred funds out"
            );
            return Ok(TransferOutResponse {
                venue_transfer_id: format!("dryrun-transfer-{user_handle}-{amount}"),
            });
        }

        self.send_signed(reqwest::Method::POST, "/transfers", Some(&request))
            .await
    }
}
