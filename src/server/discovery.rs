//! OIDC discovery, JWKS and health endpoints.

use super::config::*;
use super::state::ServerState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

pub async fn handle_discovery(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let config = &state.config;
    let mut scopes = vec![
        SCOPE_OPENID,
        SCOPE_EMAIL,
        SCOPE_PROFILE,
        SCOPE_GROUPS,
        SCOPE_OFFLINE_ACCESS,
        SCOPE_FEDERATED_ID,
    ];
    scopes.sort_unstable();

    Json(json!({
        "issuer": config.issuer,
        "authorization_endpoint": config.absolute_url("/auth"),
        "token_endpoint": config.absolute_url("/token"),
        "jwks_uri": config.absolute_url("/keys"),
        "userinfo_endpoint": config.absolute_url("/userinfo"),
        "device_authorization_endpoint": config.absolute_url("/device/code"),
        "grant_types_supported": config.allowed_grant_types,
        "response_types_supported": config.supported_response_types,
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "code_challenge_methods_supported": ["plain", "S256"],
        "scopes_supported": scopes,
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post"],
        "claims_supported": [
            "iss", "sub", "aud", "iat", "exp", "email", "email_verified",
            "name", "preferred_username", "groups", "at_hash",
        ],
    }))
}

pub async fn handle_jwks(State(state): State<ServerState>) -> Response {
    match state.signer.jwks() {
        Ok(jwks) => Json(jwks).into_response(),
        Err(err) => {
            error!("JWKS unavailable: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "keys unavailable").into_response()
        }
    }
}

/// Liveness plus a storage round trip.
pub async fn handle_healthz(State(state): State<ServerState>) -> Response {
    match state.storage.list_clients() {
        Ok(_) => Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": state.start_time.elapsed().as_secs(),
        }))
        .into_response(),
        Err(err) => {
            error!("Health check failed: {}", err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "error"})),
            )
                .into_response()
        }
    }
}
