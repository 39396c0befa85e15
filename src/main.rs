//! Process entry point: loads config, connects to Postgres, runs
//! migrations, starts the settlement scheduler, and serves the API.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use parlay_engine::api::{build_router, AppState};
use parlay_engine::config::Config;
use parlay_engine::exchange::ExchangeClient;
use parlay_engine::{db, settlement};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    let config = Arc::new(config);

    tracing::info!("starting parlay engine");

    let pool = match db::create_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "could not connect to database");
            std::process::exit(3);
        }
    };

    if let Err(e) = db::run_migrations(&pool).await {
        tracing::error!(error = %e, "database migrations failed");
        std::process::exit(3);
    }

    let exchange = ExchangeClient::new(&config).map_err(|e| {
        tracing::error!(error = %e, "could not initialize exchange client");
        anyhow::anyhow!(e)
    })?;

    let cache = Cache::builder()
        .max_capacity(1000)
        .time_to_live(Duration::from_secs(30))
        .time_to_idle(Duration::from_secs(15))
        .build();

    let state = AppState {
        db: pool.clone(),
        exchange: exchange.clone(),
        config: config.clone(),
        cache,
    };

    let _scheduler = settlement::spawn_scheduler(pool, exchange, config.clone()).await?;

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
