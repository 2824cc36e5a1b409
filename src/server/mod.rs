//! The HTTP protocol engine: routing, middleware and background loops.

pub mod authorize;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod pages;
pub mod state;
pub mod token;
pub mod userinfo;

pub use config::{default_grant_types, RefreshPolicy, ServerConfig};
pub use state::ServerState;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::storage::Storage;

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    let elapsed = start.elapsed();

    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), &path, response.status().as_str()])
        .inc();
    metrics::HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method.as_str(), &path])
        .observe(elapsed.as_secs_f64());
    debug!(
        "{} {} -> {} in {:?}",
        method,
        path,
        response.status().as_u16(),
        elapsed
    );
    response
}

fn cors_layer(allowed_origins: &[String]) -> Option<CorsLayer> {
    if allowed_origins.is_empty() {
        return None;
    }
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any);
    if allowed_origins.iter().any(|o| o == "*") {
        return Some(layer.allow_origin(Any));
    }
    let origins: Vec<_> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Skipping unparsable allowed origin {:?}", origin);
                None
            }
        })
        .collect();
    Some(layer.allow_origin(AllowOrigin::list(origins)))
}

pub fn build_router(state: ServerState, allowed_origins: &[String]) -> Router {
    let mut router = Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(discovery::handle_discovery),
        )
        .route("/keys", get(discovery::handle_jwks))
        .route("/healthz", get(discovery::handle_healthz))
        .route("/auth", get(authorize::handle_auth))
        .route("/auth/login", post(authorize::handle_password_login))
        .route(
            "/callback/{connector_id}",
            get(authorize::handle_callback_get).post(authorize::handle_callback_post),
        )
        .route(
            "/approval",
            get(authorize::handle_approval_get).post(authorize::handle_approval_post),
        )
        .route("/token", post(token::handle_token))
        .route("/userinfo", get(userinfo::handle_userinfo))
        .route("/device/code", post(device::handle_device_code))
        .route("/device", get(device::handle_device_entry))
        .route("/device/auth/verify_code", post(device::handle_verify_code))
        .route("/device/callback", get(device::handle_device_callback))
        .layer(middleware::from_fn(log_requests));

    if let Some(cors) = cors_layer(allowed_origins) {
        router = router.layer(cors);
    }
    router.with_state(state)
}

/// Binds the protocol listener and serves until the token fires.
pub async fn run_server(
    state: ServerState,
    addr: SocketAddr,
    allowed_origins: Vec<String>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = build_router(state, &allowed_origins);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Serves `/metrics` on its own listener.
pub async fn run_metrics_server(
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = Router::new().route("/metrics", get(metrics::serve_metrics));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics on http://{}/metrics", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Periodic cleanup of expired auth requests, codes and device rows.
pub async fn run_gc_loop(
    storage: Arc<dyn Storage>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    // The immediate first tick would race server startup for no benefit.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match storage.garbage_collect(Utc::now()) {
                    Ok(result) => {
                        if !result.is_empty() {
                            info!(
                                "GC removed {} auth requests, {} auth codes, {} device requests, {} device tokens",
                                result.auth_requests,
                                result.auth_codes,
                                result.device_requests,
                                result.device_tokens
                            );
                        }
                        metrics::GC_DELETED_TOTAL
                            .with_label_values(&["auth_request"])
                            .inc_by(result.auth_requests);
                        metrics::GC_DELETED_TOTAL
                            .with_label_values(&["auth_code"])
                            .inc_by(result.auth_codes);
                        metrics::GC_DELETED_TOTAL
                            .with_label_values(&["device_request"])
                            .inc_by(result.device_requests);
                        metrics::GC_DELETED_TOTAL
                            .with_label_values(&["device_token"])
                            .inc_by(result.device_tokens);
                    }
                    Err(err) => error!("Garbage collection failed: {}", err),
                }
            }
            _ = shutdown.cancelled() => {
                info!("GC loop stopped");
                return;
            }
        }
    }
}
