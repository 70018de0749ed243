mod handlers;
mod responses;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::outbound::webhook::{
    DeliveryEngine, EngineConfig, HttpDispatcher, RetryScheduler, SystemClock,
};
use crate::server::handlers::deliveries::{
    get_delivery, list_deliveries, retry_delivery, trigger_event,
};
use crate::server::handlers::health::health_check;
use axum::http::Method;
use axum::{
    Router,
    routing::{get, post},
};
use color_eyre::eyre::{Context, Result};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use webhook_store::SqliteStore;

pub use responses::ErrorBody;

/// Connection setup budget for outbound webhook requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
/// The global application state shared between all request handlers.
pub struct AppState {
    pub(crate) engine: Arc<DeliveryEngine>,
}

pub struct Server {
    router: Router,
    listener: TcpListener,
    store: SqliteStore,
    scheduler: Arc<RetryScheduler>,
}

impl Server {
    /// Open the store, wire the delivery engine and bind the listener.
    pub async fn new(config: &Config) -> Result<Self> {
        let trace_layer =
            TraceLayer::new_for_http().make_span_with(|request: &'_ axum::extract::Request<_>| {
                let uri = request.uri().to_string();
                tracing::info_span!("request", method = %request.method(), uri)
            });

        let cors_layer = CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS]);

        let store = SqliteStore::open(&config.database.path)
            .wrap_err_with(|| format!("Failed to open database {}", config.database.path))?;
        let dispatcher =
            HttpDispatcher::new(CONNECT_TIMEOUT).wrap_err("Failed to build webhook HTTP client")?;

        let engine = Arc::new(DeliveryEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(dispatcher),
            Arc::new(SystemClock),
            EngineConfig::from(&config.webhooks),
        ));
        let scheduler = Arc::new(RetryScheduler::from_config(
            engine.clone(),
            &config.scheduler,
        ));

        let state = AppState { engine };

        let router = Router::new()
            .route("/health", get(health_check))
            .route("/subscriptions/{id}/events", post(trigger_event))
            .route("/subscriptions/{id}/deliveries", get(list_deliveries))
            .route("/deliveries/{id}", get(get_delivery))
            .route("/deliveries/{id}/retry", post(retry_delivery))
            .layer(cors_layer)
            .layer(trace_layer)
            .with_state(state);

        let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))
            .await
            .wrap_err_with(|| format!("Failed to bind to port {}", config.server.port))?;

        Ok(Self {
            router,
            listener,
            store,
            scheduler,
        })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Store handle for the subscription management layer.
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Runs the server and the retry scheduler until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Server listening on {}", self.listener.local_addr()?);
        let scheduler = self.scheduler.start();

        let served = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        scheduler.shutdown().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
