//! RFC 8628 device authorization grant.
//!
//! `POST /device/code` hands the device a short human-typable user code
//! and an opaque device code. The user finishes a normal browser
//! authorization at `GET /device`; the resulting auth code is redeemed
//! server-side at the device pseudo-callback, which parks the final token
//! response on the DeviceToken row for the device's next poll.

use super::config::*;
use super::error::TokenError;
use super::pages;
use super::state::ServerState;
use super::token::issue_token_response;
use crate::storage::{
    new_secret, DeviceRequest, DeviceToken, Pkce, StorageError, DEVICE_TOKEN_COMPLETE,
    DEVICE_TOKEN_PENDING,
};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::{Form, Json};
use chrono::{Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const USER_CODE_BYTES: usize = 5; // 8 chars of Crockford base32
const DEVICE_POLL_INTERVAL_SECONDS: i64 = 5;

/// 8 characters of Crockford base32 (no ambiguous glyphs), split for
/// readability: `ABCD-EFGH`.
fn new_user_code() -> String {
    let mut bytes = [0u8; USER_CODE_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    let code = base32::encode(base32::Alphabet::Crockford, &bytes);
    format!("{}-{}", &code[..4], &code[4..8])
}

/// Accepts the code however the user typed it: any case, hyphen optional.
fn normalize_user_code(input: &str) -> String {
    let cleaned: String = input
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_uppercase();
    if cleaned.len() == 8 {
        format!("{}-{}", &cleaned[..4], &cleaned[4..])
    } else {
        cleaned
    }
}

#[derive(Deserialize)]
pub struct DeviceCodeForm {
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

#[derive(Serialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    pub interval: i64,
}

pub async fn handle_device_code(
    State(state): State<ServerState>,
    Form(form): Form<DeviceCodeForm>,
) -> Result<Json<DeviceCodeResponse>, TokenError> {
    let client_id = form
        .client_id
        .filter(|c| !c.is_empty())
        .ok_or_else(|| TokenError::InvalidRequest("missing client_id".to_string()))?;
    state
        .storage
        .get_client(&client_id)
        .map_err(|_| TokenError::InvalidClient(format!("unknown client {:?}", client_id)))?;

    let scopes: Vec<String> = form
        .scope
        .as_deref()
        .unwrap_or("openid")
        .split_whitespace()
        .map(str::to_string)
        .collect();
    for scope in &scopes {
        if !is_recognized_scope(scope) {
            return Err(TokenError::InvalidScope(format!(
                "unrecognized scope {:?}",
                scope
            )));
        }
    }

    let pkce = match form.code_challenge {
        Some(challenge) if !challenge.is_empty() => {
            let method = form
                .code_challenge_method
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "plain".to_string());
            if method != "plain" && method != "S256" {
                return Err(TokenError::InvalidRequest(format!(
                    "unsupported code_challenge_method {:?}",
                    method
                )));
            }
            Pkce {
                code_challenge: challenge,
                code_challenge_method: method,
            }
        }
        _ => Pkce::default(),
    };

    let now = Utc::now();
    let expiry = now + state.config.device_requests_valid_for;
    let user_code = new_user_code();
    // 32 opaque bytes, base64url.
    let device_code = new_secret();

    state.storage.create_device_request(DeviceRequest {
        user_code: user_code.clone(),
        device_code: device_code.clone(),
        client_id: client_id.clone(),
        client_secret: form.client_secret.unwrap_or_default(),
        scopes,
        expiry,
    })?;
    state.storage.create_device_token(DeviceToken {
        device_code: device_code.clone(),
        status: DEVICE_TOKEN_PENDING.to_string(),
        token: String::new(),
        expiry,
        // Backdated so the device's first poll is never throttled.
        last_request: now - Duration::seconds(DEVICE_POLL_INTERVAL_SECONDS),
        poll_interval_seconds: DEVICE_POLL_INTERVAL_SECONDS,
        pkce,
    })?;

    info!("Issued device code for client {}", client_id);
    let verification_uri = state.config.absolute_url("/device");
    Ok(Json(DeviceCodeResponse {
        device_code,
        verification_uri_complete: format!(
            "{}?user_code={}",
            verification_uri,
            urlencoding::encode(&user_code)
        ),
        verification_uri,
        user_code,
        expires_in: (expiry - now).num_seconds(),
        interval: DEVICE_POLL_INTERVAL_SECONDS,
    }))
}

#[derive(Deserialize)]
pub struct DeviceEntryQuery {
    pub user_code: Option<String>,
}

pub async fn handle_device_entry(Query(query): Query<DeviceEntryQuery>) -> Response {
    pages::device_entry(query.user_code.as_deref(), None)
}

#[derive(Deserialize)]
pub struct VerifyCodeForm {
    pub user_code: Option<String>,
}

pub async fn handle_verify_code(
    State(state): State<ServerState>,
    Form(form): Form<VerifyCodeForm>,
) -> Response {
    let Some(user_code) = form.user_code.filter(|c| !c.trim().is_empty()) else {
        return pages::device_entry(None, Some("Enter the code shown on your device."));
    };
    let user_code = normalize_user_code(&user_code);

    let request = match state.storage.get_device_request(&user_code) {
        Ok(request) => request,
        Err(StorageError::NotFound) => {
            return pages::device_entry(None, Some("Unknown code, check it and try again."))
        }
        Err(err) => {
            warn!("Device request lookup failed: {}", err);
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "Storage is unavailable.",
            );
        }
    };
    if request.expiry < Utc::now() {
        return pages::device_entry(None, Some("That code expired, request a new one."));
    }

    // Run the standard browser authorization with the device pseudo
    // redirect; the user code rides along in the state parameter.
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    serializer
        .append_pair("client_id", &request.client_id)
        .append_pair("redirect_uri", DEVICE_CALLBACK_URI)
        .append_pair("response_type", RESPONSE_TYPE_CODE)
        .append_pair("scope", &request.scopes.join(" "))
        .append_pair("state", &request.user_code);
    Redirect::to(&format!("/auth?{}", serializer.finish())).into_response()
}

#[derive(Deserialize)]
pub struct DeviceCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Server-side redemption of the internal auth code; parks the token
/// response for the polling device.
pub async fn handle_device_callback(
    State(state): State<ServerState>,
    Query(query): Query<DeviceCallbackQuery>,
) -> Response {
    if let Some(error) = query.error {
        let detail = query.error_description.unwrap_or_default();
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Device authorization failed",
            &format!("{error}: {detail}"),
        );
    }
    let (Some(code_id), Some(user_code)) = (query.code, query.state) else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "Missing code or state parameter.",
        );
    };

    let request = match state.storage.get_device_request(&user_code) {
        Ok(request) => request,
        Err(_) => {
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Device authorization failed",
                "This device login is no longer valid.",
            )
        }
    };

    let code = match state.storage.get_auth_code(&code_id) {
        Ok(code) => code,
        Err(_) => {
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Device authorization failed",
                "The login expired before it could complete.",
            )
        }
    };
    if code.client_id != request.client_id || code.expiry < Utc::now() {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Device authorization failed",
            "The login expired before it could complete.",
        );
    }
    if let Err(err) = state.storage.delete_auth_code(&code_id) {
        warn!("Deleting device auth code failed: {}", err);
        return pages::error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error",
            "Storage is unavailable.",
        );
    }

    let response = match issue_token_response(
        &state,
        &code.client_id,
        &code.claims,
        &code.scopes,
        &code.nonce,
        &code.connector_id,
        &code.connector_data,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!("Device token issuance failed: {}", err);
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "Token issuance failed.",
            );
        }
    };
    let serialized = match serde_json::to_string(&response) {
        Ok(serialized) => serialized,
        Err(err) => {
            warn!("Serializing device token response failed: {}", err);
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "Token issuance failed.",
            );
        }
    };

    let update = state
        .storage
        .update_device_token(&request.device_code, &mut |mut t| {
            t.status = DEVICE_TOKEN_COMPLETE.to_string();
            t.token = serialized.clone();
            Ok(t)
        });
    if let Err(err) = update {
        warn!("Completing device token failed: {}", err);
        return pages::error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error",
            "Storage is unavailable.",
        );
    }

    info!("Device flow completed for client {}", request.client_id);
    pages::device_done()
}
