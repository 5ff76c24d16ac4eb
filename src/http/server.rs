use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::CacheError;
use crate::key::CacheKey;
use crate::logging::{operations, services, status};
use crate::storage::Storage;

/// Largest entry accepted on PUT
pub const MAX_ENTRY_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    storage: Arc<dyn Storage>,
}

/// HTTP cache server over a local entry store
///
/// The API the `http` remote type speaks:
/// - GET /cache/{key} - 200 with the payload, 404 when absent
/// - PUT /cache/{key} - store the request body
/// - GET /health - Health check
///
/// Keys are 64 hex characters; anything else is a 400.
pub struct CacheServer {
    bind: SocketAddr,
    storage: Arc<dyn Storage>,
}

impl CacheServer {
    pub fn new(bind: SocketAddr, storage: Arc<dyn Storage>) -> Self {
        Self { bind, storage }
    }

    /// Create the Axum router with all cache endpoints
    pub fn router(&self) -> Router {
        router(Arc::clone(&self.storage))
    }

    /// Start the HTTP server and serve until the process exits
    pub async fn run(self) -> Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        info!("HTTP cache server listening on {}", listener.local_addr()?);

        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Router serving `storage`
pub fn router(storage: Arc<dyn Storage>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/cache/{key}", get(get_entry).put(put_entry))
        .layer(DefaultBodyLimit::max(MAX_ENTRY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { storage })
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

fn parse_key(raw: &str) -> Result<CacheKey, Response> {
    CacheKey::from_hex(raw).map_err(|e| {
        warn!(service = services::SERVER, key = %raw, error = %e, "Invalid cache key");
        (StatusCode::BAD_REQUEST, "Invalid cache key").into_response()
    })
}

async fn get_entry(Path(raw): Path<String>, State(state): State<AppState>) -> Response {
    let key = match parse_key(&raw) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let storage = Arc::clone(&state.storage);
    let loaded = match tokio::task::spawn_blocking(move || storage.get(&key)).await {
        Ok(loaded) => loaded,
        Err(e) => return join_failure(&key, e),
    };

    match loaded {
        Ok(Some(data)) => {
            info!(
                service = services::SERVER,
                operation = operations::LOAD,
                status = status::HIT,
                key = %key,
                size_bytes = data.len(),
                "Cache HIT"
            );
            (StatusCode::OK, data).into_response()
        }
        Ok(None) => {
            info!(
                service = services::SERVER,
                operation = operations::LOAD,
                status = status::MISS,
                key = %key,
                "Cache MISS"
            );
            (StatusCode::NOT_FOUND, "Not found").into_response()
        }
        Err(e @ CacheError::CorruptEntry { .. }) => {
            warn!(service = services::SERVER, key = %key, error = %e, "Corrupt entry removed");
            (StatusCode::NOT_FOUND, "Not found").into_response()
        }
        Err(e) => {
            warn!(service = services::SERVER, key = %key, error = %e, "Storage error");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
    }
}

async fn put_entry(
    Path(raw): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let key = match parse_key(&raw) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let storage = Arc::clone(&state.storage);
    let size_bytes = body.len();
    let stored = match tokio::task::spawn_blocking(move || storage.put(&key, &body)).await {
        Ok(stored) => stored,
        Err(e) => return join_failure(&key, e),
    };

    match stored {
        Ok(()) => {
            info!(
                service = services::SERVER,
                operation = operations::STORE,
                status = status::SUCCESS,
                key = %key,
                size_bytes,
                "Entry stored"
            );
            (StatusCode::OK, "Stored").into_response()
        }
        Err(e) => {
            warn!(service = services::SERVER, key = %key, error = %e, "Storage error");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
    }
}

fn join_failure(key: &CacheKey, error: tokio::task::JoinError) -> Response {
    warn!(service = services::SERVER, key = %key, error = %error, "Storage task failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "Storage task failed").into_response()
}
