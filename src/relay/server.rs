//! HTTP server setup and configuration.

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::fallback::{FallbackRelay, RelaySettings};
use super::handlers::{self, GENIA_REQUEST_ID_HEADER};
use crate::config::Config;
use crate::providers::build_adapters;

/// Correlation id assigned to every inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<FallbackRelay>,
    pub config: Arc<Config>,
    pub started_at: Instant,
    /// Relays in flight, shared by every route.
    pub relay_slots: Arc<Semaphore>,
}

impl AppState {
    /// Build adapters for every configured provider, in priority order.
    pub fn new(config: Config, http_client: Client) -> Self {
        let adapters = build_adapters(&config, http_client);
        let relay = FallbackRelay::new(adapters, RelaySettings::from_config(&config.relay));
        let relay_slots = Arc::new(Semaphore::new(config.server.max_concurrent_requests));
        Self {
            relay: Arc::new(relay),
            config: Arc::new(config),
            started_at: Instant::now(),
            relay_slots,
        }
    }

    /// Wait for a free relay slot. The slot is released when the permit drops.
    ///
    /// The semaphore is never closed, so `None` does not occur in practice.
    pub async fn acquire_relay_slot(&self) -> Option<OwnedSemaphorePermit> {
        self.relay_slots.clone().acquire_owned().await.ok()
    }
}

/// HTTP client shared by all adapters.
///
/// No overall timeout: responses are streamed, and the start of each
/// response is bounded per request by the adapters.
pub fn build_http_client() -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
}

async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(id);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        response.headers_mut().insert(GENIA_REQUEST_ID_HEADER, value);
    }
    response
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(handlers::chat).get(handlers::list_models))
        .route("/api/ai/evaluate", post(handlers::evaluate))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request| {
                let request_id = request
                    .extensions()
                    .get::<RequestId>()
                    .map(|id| id.0.to_string())
                    .unwrap_or_default();
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(middleware::from_fn(assign_request_id))
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let state = AppState::new(config, build_http_client()?);

    let chain: Vec<&str> = state.relay.adapters().iter().map(|a| a.name()).collect();
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(
        address = %listen_addr,
        providers = ?chain,
        "Starting genia-relay server"
    );

    axum::serve(listener, app).await?;

    Ok(())
}
