//! ratefeed: real-time market-data fan-out for fixed-income blotters.
//!
//! Streams field-level instrument deltas over WebSocket to subscribed
//! blotter clients, driven by a stochastic market simulator over an
//! in-memory catalog managed through the admin REST API.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratefeed_backend::app::{self, AppState};
use ratefeed_backend::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("invalid configuration")?;

    info!("🚀 ratefeed starting");
    info!(
        tick_ms = config.update_frequency_ms,
        scenario = config.scenario.as_str(),
        time_of_day = config.time_of_day.as_str(),
        volatility = config.volatility_factor,
        max_updates_per_second = config.max_updates_per_second,
        bucket_size = config.bucket_size,
        "market model configured"
    );

    let port = config.port;
    let (state, runtime) = AppState::spawn(config);
    info!(instruments = state.store.len(), "📊 catalog ready");

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    info!(addr = %listener.local_addr()?, "📡 listening");

    let shutdown_rx = state.shutdown.clone();
    let mut server = tokio::spawn(app::serve(listener, state, app::shutdown_flag(shutdown_rx)));

    let early_exit = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
        result = &mut server => {
            warn!("server exited before shutdown was requested");
            Some(result)
        }
    };

    // Flipping the flag stops the ticker, closes every session, and
    // releases the accept loop; the drain is bounded either way.
    runtime.shutdown(Duration::from_secs(3)).await;

    let server_result = match early_exit {
        Some(result) => Some(result),
        None => tokio::time::timeout(Duration::from_secs(3), &mut server)
            .await
            .ok(),
    };
    match server_result {
        Some(Ok(result)) => result?,
        Some(Err(e)) => warn!(error = %e, "server task failed"),
        None => warn!("server did not stop within the shutdown deadline"),
    }

    info!("👋 ratefeed stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ratefeed_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
