//! Shared application state and process wiring.
//!
//! `AppState::spawn` builds the instrument store, correlation graph,
//! subscriber registry, and delta pipeline, then starts the ticker and
//! dispatcher tasks. The router carries the admin REST surface and the
//! WebSocket endpoint. Kept out of `main.rs` so integration tests can run
//! the full service on an ephemeral port.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::api;
use crate::config::{Config, SimulationSettings};
use crate::delta::{Delta, DeltaEngine};
use crate::dispatch::Dispatcher;
use crate::instruments::seed;
use crate::instruments::store::InstrumentStore;
use crate::market::correlation::CorrelationGraph;
use crate::market::simulator::TickGenerator;
use crate::subscriptions::SubscriberRegistry;
use crate::ws;

/// Monotonic counters exposed on `/api/stats`.
#[derive(Debug, Default)]
pub struct ServiceStats {
    ticks: AtomicU64,
    deltas_emitted: AtomicU64,
    deltas_delivered: AtomicU64,
    deltas_rate_limited: AtomicU64,
    deltas_queue_full: AtomicU64,
}

impl ServiceStats {
    pub fn bump_ticks(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_emitted(&self) {
        self.deltas_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_delivered(&self) {
        self.deltas_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_rate_limited(&self) {
        self.deltas_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_queue_full(&self) {
        self.deltas_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) -> u64 {
        self.deltas_rate_limited.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.deltas_delivered.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            deltas_emitted: self.deltas_emitted.load(Ordering::Relaxed),
            deltas_delivered: self.deltas_delivered.load(Ordering::Relaxed),
            deltas_rate_limited: self.deltas_rate_limited.load(Ordering::Relaxed),
            deltas_queue_full: self.deltas_queue_full.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub deltas_emitted: u64,
    pub deltas_delivered: u64,
    pub deltas_rate_limited: u64,
    pub deltas_queue_full: u64,
}

/// Application state shared across tasks and request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<InstrumentStore>,
    pub correlation: Arc<RwLock<CorrelationGraph>>,
    pub simulation: Arc<RwLock<SimulationSettings>>,
    pub registry: Arc<SubscriberRegistry>,
    pub delta_engine: DeltaEngine,
    /// Producer side of the delta pipeline; admin merge updates feed the
    /// same dispatcher the ticker does.
    pub delta_tx: mpsc::Sender<Delta>,
    pub stats: Arc<ServiceStats>,
    /// Flipped once at shutdown; session tasks close on it, and the
    /// server's accept loop keys its graceful stop off the same flag.
    pub shutdown: watch::Receiver<bool>,
}

/// Handles to the background tasks, used for graceful shutdown.
pub struct Runtime {
    shutdown: watch::Sender<bool>,
    ticker: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Runtime {
    /// Stop the ticker, then drain outstanding dispatches best-effort
    /// within the deadline.
    pub async fn shutdown(self, deadline: Duration) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(deadline, self.ticker).await.is_err() {
            warn!("ticker did not stop within the shutdown deadline");
        }
        let abort = self.dispatcher.abort_handle();
        if tokio::time::timeout(deadline, self.dispatcher)
            .await
            .is_err()
        {
            warn!("dispatcher drain timed out; aborting");
            abort.abort();
        }
    }
}

impl AppState {
    /// Build the service state and start the ticker and dispatcher tasks.
    /// Must run inside a tokio runtime.
    pub fn spawn(config: Config) -> (AppState, Runtime) {
        let config = Arc::new(config);
        let store = Arc::new(InstrumentStore::new());
        let correlation = Arc::new(RwLock::new(CorrelationGraph::new(
            config.correlation_strength,
        )));
        let simulation = Arc::new(RwLock::new(SimulationSettings::from_config(&config)));
        let registry = Arc::new(SubscriberRegistry::from_config(&config));
        let stats = Arc::new(ServiceStats::default());
        let (delta_tx, delta_rx) = mpsc::channel::<Delta>(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if config.seed_instruments {
            seed::seed_catalog(&store, &correlation);
        }

        let ticker = TickGenerator::new(
            store.clone(),
            correlation.clone(),
            simulation.clone(),
            stats.clone(),
            &config,
        );
        let ticker_handle = tokio::spawn(ticker.run(delta_tx.clone(), shutdown_rx));

        let dispatcher = Dispatcher::new(store.clone(), registry.clone(), stats.clone());
        let dispatcher_handle = tokio::spawn(dispatcher.run(delta_rx, shutdown_tx.subscribe()));

        let state = AppState {
            delta_engine: DeltaEngine::new(store.clone()),
            shutdown: shutdown_tx.subscribe(),
            config,
            store,
            correlation,
            simulation,
            registry,
            delta_tx,
            stats,
        };
        let runtime = Runtime {
            shutdown: shutdown_tx,
            ticker: ticker_handle,
            dispatcher: dispatcher_handle,
        };
        (state, runtime)
    }
}

/// Admin REST surface plus the `/ws` streaming endpoint.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::routes::health))
        .route("/ws", get(ws::websocket_handler))
        .route(
            "/api/instruments",
            get(api::routes::list_instruments).post(api::routes::create_instrument),
        )
        .route(
            "/api/instruments/:id",
            get(api::routes::get_instrument)
                .patch(api::routes::update_instrument)
                .delete(api::routes::delete_instrument),
        )
        .route(
            "/api/simulation",
            get(api::routes::get_simulation).put(api::routes::update_simulation),
        )
        .route("/api/stats", get(api::routes::get_stats))
        .layer(axum::middleware::from_fn(
            crate::middleware::request_logging,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the router until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Into::into)
}

/// Resolve once the shutdown flag flips (or its sender is gone).
pub async fn shutdown_flag(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
