//! Shared transaction-retry helper.
//!
//! Retries on PostgreSQL SQLSTATEs that indicate a transient conflict
//! (serialization failure, deadlock, unique violation under concurrent
//! insert) rather than string-matching error messages.

use sqlx::Error as SqlxError;

pub mod pg_error_codes {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const UNIQUE_VIOLATION: &str = "23505";
}

/// Walks the error chain looking for a retryable PostgreSQL SQLSTATE.
pub fn is_retryable(error: &anyhow::Error) -> bool {
    let mut current: &dyn std::error::Error = error.as_ref();
    loop {
        if let Some(sqlx_error) = current.downcast_ref::<SqlxError>() {
            if let SqlxError::Database(db_error) = sqlx_error {
                if let Some(code) = db_error.code() {
                    return matches!(
                        code.as_ref(),
                        pg_error_codes::SERIALIZATION_FAILURE
                            | pg_error_codes::DEADLOCK_DETECTED
                            | pg_error_codes::UNIQUE_VIOLATION
                    );
                }
            }
            return false;
        }
        match current.source() {
            Some(source) => current = source,
            None => return false,
        }
    }
}

/// Runs `$body` (an `async` block evaluating to `anyhow::Result<_>` and
/// given a mutable `$tx_var: sqlx::Transaction<Postgres>`) inside a
/// `SERIALIZABLE` transaction, retrying up to 5 times with exponential
/// backoff plus jitter on a retryable SQLSTATE, and rolling back on any
/// other error.
#[macro_export]
macro_rules! with_serializable_tx {
    ($pool:expr, $tx_var:ident, $body:block) => {{
        use rand::Rng;
        let mut attempt: u32 = 1;
        loop {
            let mut $tx_var = $pool.begin().await?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *$tx_var)
                .await?;

            let result: anyhow::Result<_> = async { $body }.await;

            match result {
                Ok(value) => {
                    $tx_var.commit().await?;
                    break Ok(value);
                }
                Err(e) => {
                    $tx_var.rollback().await.ok();
                    if $crate::db_retry::is_retryable(&e) && attempt < 5 {
                        let jitter = rand::thread_rng().gen_range(0..10);
                        let delay_ms = 10u64 * (1u64 << (attempt - 1)) + jitter;
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                        continue;
                    }
                    break Err(e);
                }
            }
        }
    }};
}
