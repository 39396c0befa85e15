//! Exchange client error taxonomy.
//!
//! Shape grounded on `error/mod.rs` in the Deribit HTTP client pack example,
//! but carrying the retry taxonomy spec §4.1/§7 require instead of a flat
//! list of transport failures.

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Network failure or 5xx — the caller may retry.
    #[error("retryable exchange error: {0}")]
    Retryable(String),

    /// 4xx with a recognized machine-readable venue error code — must not
    /// be retried blindly.
    #[error("exchange rejected the request ({code}): {message}")]
    NonRetryable { code: String, message: String },

    /// Signature-related 401 or similar configuration failure. Fatal:
    /// surfaced to operators, never retried automatically.
    #[error("exchange signing/configuration error: {0}")]
    Fatal(String),

    #[error("market {0} not found")]
    MarketNotFound(String),
}

impl ExchangeError {
    /// Maps a 4xx venue error code to the right variant, per spec §4.1.
    pub fn from_venue_code(status: u16, code: &str, message: &str) -> Self {
        match code {
            "insufficient_funds" | "invalid_ticker" | "market_paused" | "order_rejected" => {
                ExchangeError::NonRetryable {
                    code: code.to_string(),
                    message: message.to_string(),
                }
            }
            _ if status == 401 => ExchangeError::Fatal(message.to_string()),
            _ if status >= 500 => ExchangeError::Retryable(message.to_string()),
            _ => ExchangeError::NonRetryable {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Retryable(_))
    }
}
