//! The userinfo endpoint.

use super::state::ServerState;
use axum::extract::{FromRequestParts, State};
use axum::http::{header, request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tracing::debug;

/// Bearer token pulled from the Authorization header.
pub struct BearerToken(pub String);

pub enum BearerRejection {
    Missing,
}

impl IntoResponse for BearerRejection {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                "Bearer realm=\"varlock\"",
            )],
            "",
        )
            .into_response()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = BearerRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(BearerRejection::Missing)?;
        let (scheme, token) = value.split_once(' ').ok_or(BearerRejection::Missing)?;
        if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
            return Err(BearerRejection::Missing);
        }
        Ok(BearerToken(token.trim().to_string()))
    }
}

/// Token-delivery claims that are not user claims.
const NON_USER_CLAIMS: [&str; 4] = ["aud", "azp", "nonce", "at_hash"];

pub async fn handle_userinfo(
    State(state): State<ServerState>,
    BearerToken(token): BearerToken,
) -> Response {
    let mut claims = match state.signer.verify(&token) {
        Ok(Value::Object(claims)) => claims,
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                [(
                    header::WWW_AUTHENTICATE,
                    "Bearer error=\"invalid_token\"",
                )],
                "",
            )
                .into_response();
        }
    };
    for claim in NON_USER_CLAIMS {
        claims.remove(claim);
    }

    // Connectors that can enrich userinfo get a chance to, keyed by the
    // federated_claims connector reference when the token carries one.
    let connector_id = claims
        .get("federated_claims")
        .and_then(|fc| fc.get("connector_id"))
        .and_then(|id| id.as_str())
        .map(str::to_string);
    if let Some(connector_id) = connector_id {
        if let Some(extra) = enrich_from_connector(&state, &connector_id, &claims).await {
            for (key, value) in extra {
                claims.entry(key).or_insert(value);
            }
        }
    }

    debug!(
        "Served userinfo for sub {}",
        claims.get("sub").and_then(|s| s.as_str()).unwrap_or("?")
    );
    Json(Value::Object(claims)).into_response()
}

/// Best effort: enrichment failures degrade to the plain claim set.
async fn enrich_from_connector(
    state: &ServerState,
    connector_id: &str,
    claims: &serde_json::Map<String, Value>,
) -> Option<serde_json::Map<String, Value>> {
    let record = state.storage.get_connector(connector_id).ok()?;
    let connector = state
        .registry
        .open(&record.type_, &record.id, &record.config)
        .await
        .ok()?;
    let user_info = connector.as_user_info()?;

    let identity = crate::connector::Identity {
        user_id: claims.get("sub")?.as_str()?.to_string(),
        email: claims
            .get("email")
            .and_then(|e| e.as_str())
            .unwrap_or_default()
            .to_string(),
        ..Default::default()
    };
    match user_info.user_info(&identity).await {
        Ok(extra) => Some(extra),
        Err(err) => {
            debug!("Userinfo enrichment via {} failed: {}", connector_id, err);
            None
        }
    }
}
