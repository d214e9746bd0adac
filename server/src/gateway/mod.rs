//! Offline caching gateway
//!
//! Every request reaching the gateway is classified and served network-first,
//! cache-first or straight from upstream. `/__shelf/*` is the gateway's own
//! control surface.

pub mod classify;
pub mod control;
mod error;
pub mod lifecycle;
mod strategy;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

use crate::storage::CacheStore;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use classify::Classifier;
use lifecycle::CacheLifecycle;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use upstream::{FetchRequest, Upstream};

pub struct Gateway<U> {
    store: Arc<CacheStore>,
    lifecycle: CacheLifecycle,
    upstream: U,
    classifier: Classifier,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<U: Upstream> Gateway<U> {
    pub fn new(
        store: Arc<CacheStore>,
        lifecycle: CacheLifecycle,
        upstream: U,
        classifier: Classifier,
    ) -> Self {
        Self {
            store,
            lifecycle,
            upstream,
            classifier,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn lifecycle(&self) -> &CacheLifecycle {
        &self.lifecycle
    }

    fn record_lookup(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn lookup_counts(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

pub fn router<U: Upstream>(gateway: Arc<Gateway<U>>) -> Router {
    Router::new()
        .route("/__shelf/control", post(control::control::<U>))
        .route("/__shelf/stats", get(control::stats::<U>))
        .fallback(intercept::<U>)
        .with_state(gateway)
}

pub async fn serve<U: Upstream>(addr: SocketAddr, gateway: Arc<Gateway<U>>) -> anyhow::Result<()> {
    let x_request_id = header::HeaderName::from_static("x-request-id");

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let app = router(gateway)
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(trace_layer);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn intercept<U: Upstream>(
    State(gateway): State<Arc<Gateway<U>>>,
    request: Request<Body>,
) -> Response {
    // The body is handed on unread, so uploads stream straight to upstream
    let (parts, body) = request.into_parts();
    let request = FetchRequest {
        method: parts.method,
        uri: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: parts.headers,
        body,
    };

    gateway.handle(request).await.into_response()
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
