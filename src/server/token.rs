//! The token endpoint: every grant the IdP speaks.
//!
//! All grants funnel through the same issuance helpers so ID tokens and
//! access tokens have one shape regardless of how they were obtained.
//! Refresh redemption serializes through the storage updater; concurrent
//! redemptions of the same token see exactly one rotation winner, and
//! losers either replay idempotently inside the reuse window or trip reuse
//! detection and revoke the chain.

use super::config::*;
use super::error::TokenError;
use super::metrics::record_grant;
use super::state::ServerState;
use crate::connector::{Connector, ConnectorError, Identity};
use crate::storage::{
    new_id, new_secret, Claims, Client, OfflineSession, Pkce, RefreshToken, RefreshTokenRef,
    StorageError, DEVICE_TOKEN_COMPLETE, DEVICE_TOKEN_PENDING,
};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use base64::Engine;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub device_code: Option<String>,
    pub subject_token: Option<String>,
    pub subject_token_type: Option<String>,
    pub requested_token_type: Option<String>,
    pub audience: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_token_type: Option<String>,
}

/// The opaque wire form of a refresh token: the storage ID plus the
/// current rotating secret.
#[derive(Serialize, Deserialize)]
struct WireRefresh {
    id: String,
    secret: String,
}

pub(crate) fn encode_refresh_token(id: &str, secret: &str) -> String {
    let json = serde_json::to_vec(&WireRefresh {
        id: id.to_string(),
        secret: secret.to_string(),
    })
    .expect("wire refresh token always serializes");
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
}

fn decode_refresh_token(raw: &str) -> Result<(String, String), TokenError> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|_| TokenError::InvalidRequest("malformed refresh token".to_string()))?;
    let wire: WireRefresh = serde_json::from_slice(&bytes)
        .map_err(|_| TokenError::InvalidRequest("malformed refresh token".to_string()))?;
    Ok((wire.id, wire.secret))
}

/// `at_hash`: base64url of the left half of SHA-256 over the access token.
fn access_token_hash(access_token: &str) -> String {
    let digest = Sha256::digest(access_token.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&digest[..16])
}

fn ct_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

pub struct MintedTokens {
    pub access_token: String,
    pub id_token: String,
    pub expires_in: i64,
}

/// Builds and signs the access/ID token pair for one identity.
pub(crate) fn mint_tokens(
    state: &ServerState,
    client_id: &str,
    claims: &Claims,
    scopes: &[String],
    nonce: &str,
    connector_id: &str,
) -> Result<MintedTokens, TokenError> {
    let now = Utc::now();
    let expiry = now + state.config.id_tokens_valid_for;

    // Cross-client audiences come from audience:server:client_id:<id>
    // scopes and require the target client to trust the requester.
    let mut audiences = vec![client_id.to_string()];
    for scope in scopes {
        if let Some(peer) = scope.strip_prefix(SCOPE_AUDIENCE_PREFIX) {
            if peer == client_id || audiences.iter().any(|a| a == peer) {
                continue;
            }
            let target = state.storage.get_client(peer).map_err(|_| {
                TokenError::InvalidRequest(format!("unknown audience client {:?}", peer))
            })?;
            if !target.trusted_peers.iter().any(|p| p == client_id) {
                return Err(TokenError::UnauthorizedClient(format!(
                    "client {:?} is not a trusted peer of {:?}",
                    client_id, peer
                )));
            }
            audiences.push(peer.to_string());
        }
    }

    let mut base = Map::new();
    base.insert("iss".to_string(), json!(state.config.issuer));
    base.insert("sub".to_string(), json!(claims.user_id));
    if audiences.len() == 1 {
        base.insert("aud".to_string(), json!(audiences[0]));
    } else {
        base.insert("aud".to_string(), json!(audiences));
        base.insert("azp".to_string(), json!(client_id));
    }
    base.insert("exp".to_string(), json!(expiry.timestamp()));
    base.insert("iat".to_string(), json!(now.timestamp()));

    if scopes.iter().any(|s| s == SCOPE_EMAIL) && !claims.email.is_empty() {
        base.insert("email".to_string(), json!(claims.email));
        base.insert("email_verified".to_string(), json!(claims.email_verified));
    }
    if scopes.iter().any(|s| s == SCOPE_PROFILE) {
        if !claims.username.is_empty() {
            base.insert("name".to_string(), json!(claims.username));
        }
        if !claims.preferred_username.is_empty() {
            base.insert(
                "preferred_username".to_string(),
                json!(claims.preferred_username),
            );
        }
    }
    if scopes.iter().any(|s| s == SCOPE_GROUPS) {
        base.insert("groups".to_string(), json!(claims.groups));
    }
    if scopes.iter().any(|s| s == SCOPE_FEDERATED_ID) {
        base.insert(
            "federated_claims".to_string(),
            json!({"connector_id": connector_id, "user_id": claims.user_id}),
        );
    }

    let access_claims = Value::Object(base.clone());
    let access_token = state.signer.sign(&access_claims)?;

    let mut id_claims = base;
    id_claims.insert("at_hash".to_string(), json!(access_token_hash(&access_token)));
    if !nonce.is_empty() {
        id_claims.insert("nonce".to_string(), json!(nonce));
    }
    let id_token = state.signer.sign(&Value::Object(id_claims))?;

    Ok(MintedTokens {
        access_token,
        id_token,
        expires_in: (expiry - now).num_seconds(),
    })
}

/// Full token-endpoint response, optionally with a fresh refresh token and
/// offline session when `offline_access` was granted.
pub(crate) async fn issue_token_response(
    state: &ServerState,
    client_id: &str,
    claims: &Claims,
    scopes: &[String],
    nonce: &str,
    connector_id: &str,
    connector_data: &[u8],
) -> Result<TokenResponse, TokenError> {
    let minted = mint_tokens(state, client_id, claims, scopes, nonce, connector_id)?;

    let mut refresh_token = None;
    if scopes.iter().any(|s| s == SCOPE_OFFLINE_ACCESS) {
        refresh_token =
            create_refresh_token(state, client_id, claims, scopes, nonce, connector_id, connector_data)
                .await?;
    }

    Ok(TokenResponse {
        access_token: minted.access_token,
        token_type: "bearer".to_string(),
        expires_in: minted.expires_in,
        refresh_token,
        id_token: Some(minted.id_token),
        issued_token_type: None,
    })
}

/// Creates the refresh token plus its offline-session entry. Skipped with
/// a warning when the connector cannot refresh identities.
async fn create_refresh_token(
    state: &ServerState,
    client_id: &str,
    claims: &Claims,
    scopes: &[String],
    nonce: &str,
    connector_id: &str,
    connector_data: &[u8],
) -> Result<Option<String>, TokenError> {
    let connector = open_connector(state, connector_id).await?;
    if connector.as_refresh().is_none() {
        warn!(
            "Connector {} cannot refresh identities, not issuing a refresh token",
            connector_id
        );
        return Ok(None);
    }

    let now = Utc::now();
    let token = RefreshToken {
        id: new_id(),
        token: new_secret(),
        obsolete_token: String::new(),
        client_id: client_id.to_string(),
        scopes: scopes.to_vec(),
        nonce: nonce.to_string(),
        claims: claims.clone(),
        connector_id: connector_id.to_string(),
        connector_data: connector_data.to_vec(),
        created_at: now,
        last_used: now,
    };
    state.storage.create_refresh_token(token.clone())?;

    let reference = RefreshTokenRef {
        id: token.id.clone(),
        client_id: client_id.to_string(),
        created_at: now,
        last_used: now,
    };
    upsert_offline_session(
        state,
        &claims.user_id,
        connector_id,
        reference,
        connector_data,
    )?;

    Ok(Some(encode_refresh_token(&token.id, &token.token)))
}

fn upsert_offline_session(
    state: &ServerState,
    user_id: &str,
    conn_id: &str,
    reference: RefreshTokenRef,
    connector_data: &[u8],
) -> Result<(), TokenError> {
    let insert = |session: &mut OfflineSession| {
        session
            .refresh
            .insert(reference.client_id.clone(), reference.clone());
        if !connector_data.is_empty() {
            session.connector_data = connector_data.to_vec();
        }
    };

    match state
        .storage
        .update_offline_session(user_id, conn_id, &mut |mut session| {
            insert(&mut session);
            Ok(session)
        }) {
        Ok(()) => Ok(()),
        Err(StorageError::NotFound) => {
            let mut session = OfflineSession {
                user_id: user_id.to_string(),
                conn_id: conn_id.to_string(),
                refresh: Default::default(),
                connector_data: Vec::new(),
            };
            insert(&mut session);
            match state.storage.create_offline_session(session) {
                Ok(()) => Ok(()),
                // Lost the creation race; the update now has a row to hit.
                Err(StorageError::AlreadyExists) => state
                    .storage
                    .update_offline_session(user_id, conn_id, &mut |mut session| {
                        insert(&mut session);
                        Ok(session)
                    })
                    .map_err(Into::into),
                Err(err) => Err(err.into()),
            }
        }
        Err(err) => Err(err.into()),
    }
}

async fn open_connector(
    state: &ServerState,
    connector_id: &str,
) -> Result<Box<dyn Connector>, TokenError> {
    let record = state
        .storage
        .get_connector(connector_id)
        .map_err(|_| TokenError::ServerError(format!("connector {:?} is gone", connector_id)))?;
    state
        .registry
        .open(&record.type_, &record.id, &record.config)
        .await
        .map_err(|e| TokenError::ServerError(e.to_string()))
}

/// RFC 7636 verification against the challenge captured at /auth.
fn verify_pkce(pkce: &Pkce, verifier: Option<&str>) -> Result<(), TokenError> {
    if !pkce.is_set() {
        if verifier.is_some() {
            return Err(TokenError::InvalidRequest(
                "code_verifier provided but no code_challenge was set".to_string(),
            ));
        }
        return Ok(());
    }
    let Some(verifier) = verifier else {
        return Err(TokenError::InvalidRequest(
            "missing code_verifier".to_string(),
        ));
    };
    let derived = match pkce.code_challenge_method.as_str() {
        "S256" => {
            let digest = Sha256::digest(verifier.as_bytes());
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
        }
        // "" and "plain" compare the verifier directly.
        _ => verifier.to_string(),
    };
    if !ct_eq(&derived, &pkce.code_challenge) {
        return Err(TokenError::InvalidGrant(
            "invalid code_verifier".to_string(),
        ));
    }
    Ok(())
}

/// Client authentication: HTTP Basic or form fields; public clients may
/// omit the secret and are held to PKCE instead.
fn authenticate_client(
    state: &ServerState,
    headers: &HeaderMap,
    form: &TokenRequest,
) -> Result<Client, TokenError> {
    let basic = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|encoded| {
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .ok()
        })
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|creds| {
            let (id, secret) = creds.split_once(':')?;
            // RFC 6749 §2.3.1: both halves are form-urlencoded.
            let id = urlencoding::decode(id).ok()?.into_owned();
            let secret = urlencoding::decode(secret).ok()?.into_owned();
            Some((id, secret))
        });

    let (client_id, client_secret) = match basic {
        Some((id, secret)) => (id, Some(secret)),
        None => (
            form.client_id
                .clone()
                .ok_or_else(|| TokenError::InvalidClient("missing client credentials".to_string()))?,
            form.client_secret.clone(),
        ),
    };

    let client = state
        .storage
        .get_client(&client_id)
        .map_err(|_| TokenError::InvalidClient(format!("unknown client {:?}", client_id)))?;

    let secret = client_secret.unwrap_or_default();
    if client.public && secret.is_empty() {
        return Ok(client);
    }
    if !ct_eq(&secret, &client.secret) {
        return Err(TokenError::InvalidClient("invalid client secret".to_string()));
    }
    Ok(client)
}

pub async fn handle_token(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Form(form): Form<TokenRequest>,
) -> Response {
    let grant_type = form.grant_type.clone().unwrap_or_default();
    let result = token_inner(&state, &headers, form).await;
    match result {
        Ok(response) => {
            record_grant(&grant_type, "ok");
            response
        }
        Err(err) => {
            record_grant(&grant_type, err.code());
            err.into_response()
        }
    }
}

async fn token_inner(
    state: &ServerState,
    headers: &HeaderMap,
    form: TokenRequest,
) -> Result<Response, TokenError> {
    let grant_type = form
        .grant_type
        .clone()
        .filter(|g| !g.is_empty())
        .ok_or_else(|| TokenError::InvalidRequest("missing grant_type".to_string()))?;
    if !state.config.grant_allowed(&grant_type) {
        return Err(TokenError::UnsupportedGrantType(grant_type));
    }

    let client = authenticate_client(state, headers, &form)?;

    match grant_type.as_str() {
        GRANT_AUTHORIZATION_CODE => grant_authorization_code(state, &client, &form).await,
        GRANT_REFRESH_TOKEN => grant_refresh_token(state, &client, &form).await,
        GRANT_PASSWORD => grant_password(state, &client, &form).await,
        GRANT_DEVICE_CODE => grant_device_code(state, &client, &form).await,
        GRANT_TOKEN_EXCHANGE => grant_token_exchange(state, &client, &form),
        other => Err(TokenError::UnsupportedGrantType(other.to_string())),
    }
}

async fn grant_authorization_code(
    state: &ServerState,
    client: &Client,
    form: &TokenRequest,
) -> Result<Response, TokenError> {
    let code_id = form
        .code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| TokenError::InvalidRequest("missing code".to_string()))?;

    let code = state
        .storage
        .get_auth_code(code_id)
        .map_err(|_| TokenError::InvalidGrant("invalid or expired code".to_string()))?;

    if code.client_id != client.id {
        return Err(TokenError::InvalidGrant(
            "code was issued to another client".to_string(),
        ));
    }
    if code.expiry < Utc::now() {
        let _ = state.storage.delete_auth_code(code_id);
        return Err(TokenError::InvalidGrant("invalid or expired code".to_string()));
    }
    let redirect_uri = form.redirect_uri.as_deref().unwrap_or_default();
    if redirect_uri != code.redirect_uri {
        return Err(TokenError::InvalidGrant(
            "redirect_uri does not match the authorization request".to_string(),
        ));
    }
    if client.public && !code.pkce.is_set() {
        return Err(TokenError::InvalidRequest(
            "public clients must use PKCE".to_string(),
        ));
    }
    verify_pkce(&code.pkce, form.code_verifier.as_deref())?;

    // One redemption: losing a delete race means the code was used.
    match state.storage.delete_auth_code(code_id) {
        Ok(()) => {}
        Err(StorageError::NotFound) => {
            return Err(TokenError::InvalidGrant("invalid or expired code".to_string()))
        }
        Err(err) => return Err(err.into()),
    }

    let response = issue_token_response(
        state,
        &client.id,
        &code.claims,
        &code.scopes,
        &code.nonce,
        &code.connector_id,
        &code.connector_data,
    )
    .await?;
    Ok(Json(response).into_response())
}

enum RefreshOutcome {
    /// Respond with this secret (freshly rotated, or the current one on an
    /// idempotent obsolete-token replay).
    Use(String),
    Reuse,
}

async fn grant_refresh_token(
    state: &ServerState,
    client: &Client,
    form: &TokenRequest,
) -> Result<Response, TokenError> {
    let raw = form
        .refresh_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TokenError::InvalidRequest("missing refresh_token".to_string()))?;
    let (id, presented) = decode_refresh_token(raw)?;

    let stored = state
        .storage
        .get_refresh_token(&id)
        .map_err(|_| TokenError::InvalidGrant("invalid refresh token".to_string()))?;
    if stored.client_id != client.id {
        return Err(TokenError::InvalidGrant(
            "refresh token was issued to another client".to_string(),
        ));
    }

    let now = Utc::now();
    let policy = &state.config.refresh;

    // Reuse detection: any secret that is neither current nor the obsolete
    // one inside the overlap window burns the whole chain.
    let current = ct_eq(&presented, &stored.token);
    let obsolete_in_window = ct_eq(&presented, &stored.obsolete_token)
        && !stored.obsolete_token.is_empty()
        && now - stored.last_used < policy.reuse_interval;
    if !current && !obsolete_in_window {
        warn!(
            "Refresh token {} presented with a stale secret, revoking",
            id
        );
        revoke_refresh_chain(state, &stored);
        return Err(TokenError::InvalidGrant(
            "refresh token reuse detected".to_string(),
        ));
    }

    if let Some(absolute) = policy.absolute_lifetime {
        if now - stored.created_at > absolute {
            revoke_refresh_token(state, &stored);
            return Err(TokenError::InvalidGrant("refresh token expired".to_string()));
        }
    }
    if let Some(idle) = policy.valid_if_not_used_for {
        if now - stored.last_used > idle {
            revoke_refresh_token(state, &stored);
            return Err(TokenError::InvalidGrant("refresh token expired".to_string()));
        }
    }

    // Ask the connector to refresh the identity so upstream changes (and
    // revocations) propagate.
    let connector = open_connector(state, &stored.connector_id).await?;
    let mut claims = stored.claims.clone();
    let mut connector_data = stored.connector_data.clone();
    if let Some(refresher) = connector.as_refresh() {
        let session_data = state
            .storage
            .get_offline_session(&claims.user_id, &stored.connector_id)
            .map(|s| s.connector_data)
            .unwrap_or_default();
        let data = if session_data.is_empty() {
            connector_data.clone()
        } else {
            session_data
        };
        let identity = Identity::from_claims(&claims, &data);
        let scopes = super::authorize::scopes_for_connector(&stored.scopes);
        match refresher.refresh(scopes, identity).await {
            Ok(refreshed) => {
                claims = refreshed.to_claims();
                connector_data = refreshed.connector_data;
            }
            Err(ConnectorError::UserGone) => {
                warn!(
                    "Upstream user for refresh token {} is gone, revoking",
                    id
                );
                revoke_refresh_chain(state, &stored);
                return Err(TokenError::InvalidGrant(
                    "upstream identity no longer exists".to_string(),
                ));
            }
            Err(err) => return Err(TokenError::ServerError(err.to_string())),
        }
    }

    // Serialize the rotation decision through the updater; concurrent
    // redemptions converge on one winner here.
    let mut outcome = RefreshOutcome::Reuse;
    let update = state.storage.update_refresh_token(&id, &mut |mut t| {
        if ct_eq(&presented, &t.token) {
            if !policy.disable_rotation {
                t.obsolete_token = t.token.clone();
                t.token = new_secret();
            }
            t.last_used = now;
            t.claims = claims.clone();
            t.connector_data = connector_data.clone();
            outcome = RefreshOutcome::Use(t.token.clone());
            Ok(t)
        } else if ct_eq(&presented, &t.obsolete_token)
            && !t.obsolete_token.is_empty()
            && now - t.last_used < policy.reuse_interval
        {
            // Idempotent redelivery: hand back the already-rotated secret
            // without touching the row.
            outcome = RefreshOutcome::Use(t.token.clone());
            Ok(t)
        } else {
            outcome = RefreshOutcome::Reuse;
            Err(StorageError::Conflict)
        }
    });
    let secret = match (update, outcome) {
        (Ok(()), RefreshOutcome::Use(secret)) => secret,
        (Err(StorageError::Conflict), _) | (Ok(()), RefreshOutcome::Reuse) => {
            warn!("Refresh token {} lost its secret mid-redemption, revoking", id);
            revoke_refresh_chain(state, &stored);
            return Err(TokenError::InvalidGrant(
                "refresh token reuse detected".to_string(),
            ));
        }
        (Err(err), _) => return Err(err.into()),
    };

    // Best-effort bookkeeping on the offline session.
    let _ = state.storage.update_offline_session(
        &claims.user_id,
        &stored.connector_id,
        &mut |mut session| {
            if let Some(reference) = session.refresh.get_mut(&stored.client_id) {
                reference.last_used = now;
            }
            if !connector_data.is_empty() {
                session.connector_data = connector_data.clone();
            }
            Ok(session)
        },
    );

    let minted = mint_tokens(
        state,
        &client.id,
        &claims,
        &stored.scopes,
        &stored.nonce,
        &stored.connector_id,
    )?;
    Ok(Json(TokenResponse {
        access_token: minted.access_token,
        token_type: "bearer".to_string(),
        expires_in: minted.expires_in,
        refresh_token: Some(encode_refresh_token(&id, &secret)),
        id_token: Some(minted.id_token),
        issued_token_type: None,
    })
    .into_response())
}

fn revoke_refresh_token(state: &ServerState, token: &RefreshToken) {
    let _ = state.storage.delete_refresh_token(&token.id);
    let _ = state.storage.update_offline_session(
        &token.claims.user_id,
        &token.connector_id,
        &mut |mut session| {
            session.refresh.remove(&token.client_id);
            Ok(session)
        },
    );
}

/// Reuse detection burns the token and its whole offline session.
fn revoke_refresh_chain(state: &ServerState, token: &RefreshToken) {
    let _ = state.storage.delete_refresh_token(&token.id);
    let _ = state
        .storage
        .delete_offline_session(&token.claims.user_id, &token.connector_id);
}

async fn grant_password(
    state: &ServerState,
    client: &Client,
    form: &TokenRequest,
) -> Result<Response, TokenError> {
    let Some(connector_id) = state.config.password_connector.clone() else {
        return Err(TokenError::UnsupportedGrantType(GRANT_PASSWORD.to_string()));
    };
    let username = form
        .username
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| TokenError::InvalidRequest("missing username".to_string()))?;
    let password = form
        .password
        .as_deref()
        .ok_or_else(|| TokenError::InvalidRequest("missing password".to_string()))?;

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

    let connector = open_connector(state, &connector_id).await?;
    let Some(password_conn) = connector.as_password() else {
        return Err(TokenError::ServerError(format!(
            "connector {:?} does not support password login",
            connector_id
        )));
    };

    let conn_scopes = super::authorize::scopes_for_connector(&scopes);
    let (identity, valid) = password_conn
        .login(conn_scopes, username, password)
        .await
        .map_err(|e| TokenError::ServerError(e.to_string()))?;
    if !valid {
        return Err(TokenError::InvalidGrant(
            "invalid username or password".to_string(),
        ));
    }

    let claims = identity.to_claims();
    let response = issue_token_response(
        state,
        &client.id,
        &claims,
        &scopes,
        "",
        &connector_id,
        &identity.connector_data,
    )
    .await?;
    Ok(Json(response).into_response())
}

enum DevicePoll {
    SlowDown,
    Pending,
    Complete(String),
}

async fn grant_device_code(
    state: &ServerState,
    _client: &Client,
    form: &TokenRequest,
) -> Result<Response, TokenError> {
    let device_code = form
        .device_code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| TokenError::InvalidRequest("missing device_code".to_string()))?;

    let token = state
        .storage
        .get_device_token(device_code)
        .map_err(|_| TokenError::InvalidGrant("invalid device code".to_string()))?;

    let now = Utc::now();
    if token.expiry < now {
        return Err(TokenError::ExpiredToken);
    }
    verify_pkce(&token.pkce, form.code_verifier.as_deref())?;

    let mut poll = DevicePoll::Pending;
    state
        .storage
        .update_device_token(device_code, &mut |mut t| {
            let min_next = t.last_request + Duration::seconds(t.poll_interval_seconds);
            if now < min_next {
                poll = DevicePoll::SlowDown;
            } else if t.status == DEVICE_TOKEN_COMPLETE {
                poll = DevicePoll::Complete(t.token.clone());
            } else {
                debug_assert_eq!(t.status, DEVICE_TOKEN_PENDING);
                poll = DevicePoll::Pending;
            }
            t.last_request = now;
            Ok(t)
        })?;

    match poll {
        DevicePoll::SlowDown => Err(TokenError::SlowDown),
        DevicePoll::Pending => Err(TokenError::AuthorizationPending),
        DevicePoll::Complete(raw) => {
            // Single delivery: the record is gone after the first success.
            state.storage.delete_device_token(device_code)?;
            let body: Value = serde_json::from_str(&raw)
                .map_err(|e| TokenError::ServerError(format!("stored device token: {e}")))?;
            debug!("Device code {} redeemed", device_code);
            Ok(Json(body).into_response())
        }
    }
}

fn grant_token_exchange(
    state: &ServerState,
    client: &Client,
    form: &TokenRequest,
) -> Result<Response, TokenError> {
    let subject_token = form
        .subject_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TokenError::InvalidRequest("missing subject_token".to_string()))?;
    let subject_token_type = form.subject_token_type.as_deref().unwrap_or_default();
    if subject_token_type != TOKEN_TYPE_ID_TOKEN && subject_token_type != TOKEN_TYPE_ACCESS_TOKEN {
        return Err(TokenError::InvalidRequest(format!(
            "unsupported subject_token_type {:?}",
            subject_token_type
        )));
    }

    let subject = state
        .signer
        .verify(subject_token)
        .map_err(|_| TokenError::InvalidGrant("invalid subject_token".to_string()))?;
    if subject["iss"].as_str() != Some(state.config.issuer.as_str()) {
        return Err(TokenError::InvalidGrant(
            "subject_token was not issued by this server".to_string(),
        ));
    }

    let audience = form
        .audience
        .clone()
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| client.id.clone());
    if audience != client.id {
        let target = state
            .storage
            .get_client(&audience)
            .map_err(|_| TokenError::InvalidRequest(format!("unknown audience {:?}", audience)))?;
        if !target.trusted_peers.iter().any(|p| p == &client.id) {
            return Err(TokenError::UnauthorizedClient(format!(
                "client {:?} is not a trusted peer of {:?}",
                client.id, audience
            )));
        }
    }

    let now = Utc::now();
    let expiry = now + state.config.id_tokens_valid_for;
    let mut claims = Map::new();
    claims.insert("iss".to_string(), json!(state.config.issuer));
    claims.insert("aud".to_string(), json!(audience));
    claims.insert("azp".to_string(), json!(client.id));
    claims.insert("exp".to_string(), json!(expiry.timestamp()));
    claims.insert("iat".to_string(), json!(now.timestamp()));
    for copied in [
        "sub",
        "email",
        "email_verified",
        "name",
        "preferred_username",
        "groups",
        "federated_claims",
    ] {
        if let Some(value) = subject.get(copied) {
            claims.insert(copied.to_string(), value.clone());
        }
    }
    if claims.get("sub").is_none() {
        return Err(TokenError::InvalidGrant(
            "subject_token has no sub claim".to_string(),
        ));
    }

    let token = state.signer.sign(&Value::Object(claims))?;
    let issued_token_type = form
        .requested_token_type
        .clone()
        .unwrap_or_else(|| TOKEN_TYPE_ID_TOKEN.to_string());
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer".to_string(),
        expires_in: (expiry - now).num_seconds(),
        refresh_token: None,
        id_token: None,
        issued_token_type: Some(issued_token_type),
    })
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_s256_round_trip() {
        // base64url(sha256("abc"))
        let challenge = {
            let digest = Sha256::digest(b"abc");
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
        };
        let pkce = Pkce {
            code_challenge: challenge,
            code_challenge_method: "S256".to_string(),
        };
        assert!(verify_pkce(&pkce, Some("abc")).is_ok());
        let err = verify_pkce(&pkce, Some("abd")).unwrap_err();
        assert_eq!(err.code(), "invalid_grant");
    }

    #[test]
    fn pkce_plain_compares_directly() {
        let pkce = Pkce {
            code_challenge: "verifier-value".to_string(),
            code_challenge_method: "plain".to_string(),
        };
        assert!(verify_pkce(&pkce, Some("verifier-value")).is_ok());
        assert!(verify_pkce(&pkce, Some("other")).is_err());
    }

    #[test]
    fn pkce_missing_verifier_is_invalid_request() {
        let pkce = Pkce {
            code_challenge: "x".to_string(),
            code_challenge_method: "plain".to_string(),
        };
        assert_eq!(verify_pkce(&pkce, None).unwrap_err().code(), "invalid_request");
    }

    #[test]
    fn pkce_unsolicited_verifier_is_rejected() {
        assert_eq!(
            verify_pkce(&Pkce::default(), Some("abc")).unwrap_err().code(),
            "invalid_request"
        );
    }

    #[test]
    fn refresh_token_wire_round_trip() {
        let wire = encode_refresh_token("token-id", "secret-value");
        let (id, secret) = decode_refresh_token(&wire).unwrap();
        assert_eq!(id, "token-id");
        assert_eq!(secret, "secret-value");
    }

    #[test]
    fn malformed_refresh_token_is_invalid_request() {
        assert_eq!(
            decode_refresh_token("!!!").unwrap_err().code(),
            "invalid_request"
        );
        let bogus = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"[1,2,3]");
        assert_eq!(
            decode_refresh_token(&bogus).unwrap_err().code(),
            "invalid_request"
        );
    }

    #[test]
    fn at_hash_is_left_half_of_sha256() {
        let hash = access_token_hash("token");
        let digest = Sha256::digest(b"token");
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&digest[..16]);
        assert_eq!(hash, expected);
    }
}
