//! The authorization endpoint, connector callbacks and the approval step.
//!
//! `/auth` turns a validated OAuth2 request into a stored AuthRequest and
//! hands the browser to a connector. The state given to the connector is a
//! MAC over (request ID, connector ID) under a per-request key, so a
//! callback can only ever resume the exact request that started it. The
//! callback stores the federated identity on the request; approval (or the
//! skip-approval shortcut) redeems the request for a one-time code.

use super::config::*;
use super::pages;
use super::state::ServerState;
use super::token::mint_tokens;
use crate::connector::{CallbackParams, Connector, Scopes};
use crate::storage::{new_hmac_key, new_id, AuthCode, AuthRequest, Claims, Pkce, StorageError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Form;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthQuery {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub connector_id: Option<String>,
}

/// MAC-bound state handed to connectors: `<auth request id>.<mac>`.
pub(crate) fn connector_state(hmac_key: &[u8], req_id: &str, connector_id: &str) -> String {
    format!("{}.{}", req_id, state_mac(hmac_key, req_id, connector_id))
}

fn state_mac(hmac_key: &[u8], req_id: &str, connector_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(hmac_key).expect("hmac accepts any key length");
    mac.update(req_id.as_bytes());
    mac.update(b"\x00");
    mac.update(connector_id.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

pub(crate) fn parse_state(state: &str) -> Option<(&str, &str)> {
    state.split_once('.')
}

fn verify_state_mac(hmac_key: &[u8], req_id: &str, connector_id: &str, tag: &str) -> bool {
    let Ok(tag) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(tag) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(hmac_key).expect("hmac accepts any key length");
    mac.update(req_id.as_bytes());
    mac.update(b"\x00");
    mac.update(connector_id.as_bytes());
    mac.verify_slice(&tag).is_ok()
}

/// MAC authorizing the approval form for one request.
pub(crate) fn approval_mac(hmac_key: &[u8], req_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(hmac_key).expect("hmac accepts any key length");
    mac.update(b"approval\x00");
    mac.update(req_id.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn verify_approval_mac(hmac_key: &[u8], req_id: &str, tag: &str) -> bool {
    let Ok(tag) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(tag) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(hmac_key).expect("hmac accepts any key length");
    mac.update(b"approval\x00");
    mac.update(req_id.as_bytes());
    mac.verify_slice(&tag).is_ok()
}

pub(crate) fn scopes_for_connector(scopes: &[String]) -> Scopes {
    Scopes {
        offline_access: scopes.iter().any(|s| s == SCOPE_OFFLINE_ACCESS),
        groups: scopes.iter().any(|s| s == SCOPE_GROUPS),
    }
}

/// Resolves a registered redirect URI; the device pseudo-URI is served by
/// this process and hangs off the issuer.
pub(crate) fn resolve_redirect(config: &ServerConfig, redirect_uri: &str) -> String {
    if redirect_uri == DEVICE_CALLBACK_URI {
        config.absolute_url(DEVICE_CALLBACK_URI)
    } else {
        redirect_uri.to_string()
    }
}

fn redirect_with_query(target: &str, params: &[(&str, &str)]) -> Response {
    let mut url = match url::Url::parse(target) {
        Ok(url) => url,
        Err(_) => {
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Bad request",
                "The registered redirect URI is not a valid URL.",
            )
        }
    };
    url.query_pairs_mut().extend_pairs(params.iter().copied());
    Redirect::to(url.as_str()).into_response()
}

fn redirect_with_fragment(target: &str, params: &[(&str, &str)]) -> Response {
    let mut fragment = url::form_urlencoded::Serializer::new(String::new());
    fragment.extend_pairs(params.iter().copied());
    Redirect::to(&format!("{}#{}", target, fragment.finish())).into_response()
}

/// Error redirect per RFC 6749 §4.1.2.1; only used once the client and
/// redirect URI have been validated.
fn redirect_error(target: &str, state: &str, code: &str, description: &str) -> Response {
    let mut params = vec![("error", code), ("error_description", description)];
    if !state.is_empty() {
        params.push(("state", state));
    }
    redirect_with_query(target, &params)
}

/// Rebuilds the /auth URL with a connector pinned, for the selection page.
fn auth_url_with_connector(query: &AuthQuery, connector_id: &str) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    let pairs: [(&str, &Option<String>); 8] = [
        ("response_type", &query.response_type),
        ("client_id", &query.client_id),
        ("redirect_uri", &query.redirect_uri),
        ("scope", &query.scope),
        ("state", &query.state),
        ("nonce", &query.nonce),
        ("code_challenge", &query.code_challenge),
        ("code_challenge_method", &query.code_challenge_method),
    ];
    for (key, value) in pairs {
        if let Some(value) = value {
            serializer.append_pair(key, value);
        }
    }
    serializer.append_pair("connector_id", connector_id);
    format!("/auth?{}", serializer.finish())
}

pub async fn handle_auth(
    State(state): State<ServerState>,
    Query(query): Query<AuthQuery>,
) -> Response {
    // Client and redirect URI must check out before anything is allowed to
    // redirect; a failure here terminates in the browser.
    let Some(client_id) = query.client_id.clone().filter(|v| !v.is_empty()) else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "Missing client_id parameter.",
        );
    };
    let Some(redirect_uri) = query.redirect_uri.clone().filter(|v| !v.is_empty()) else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "Missing redirect_uri parameter.",
        );
    };

    let client = match state.storage.get_client(&client_id) {
        Ok(client) => client,
        Err(StorageError::NotFound) => {
            return pages::error_page(
                StatusCode::NOT_FOUND,
                "Bad request",
                &format!("Unknown client {:?}.", client_id),
            )
        }
        Err(err) => {
            warn!("Client lookup failed: {}", err);
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "Storage is unavailable.",
            );
        }
    };

    // Byte-exact match against the registered list; the device pseudo-URI
    // is implicitly registered for every client.
    let registered = redirect_uri == DEVICE_CALLBACK_URI
        || client.redirect_uris.iter().any(|uri| *uri == redirect_uri);
    if !registered {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            &format!("Unregistered redirect URI {:?}.", redirect_uri),
        );
    }

    let redirect_target = resolve_redirect(&state.config, &redirect_uri);
    let client_state = query.state.clone().unwrap_or_default();

    // Response types.
    let response_types: Vec<String> = query
        .response_type
        .as_deref()
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if response_types.is_empty() {
        return redirect_error(
            &redirect_target,
            &client_state,
            "invalid_request",
            "Missing response_type parameter.",
        );
    }
    for rt in &response_types {
        let known = matches!(
            rt.as_str(),
            RESPONSE_TYPE_CODE | RESPONSE_TYPE_ID_TOKEN | RESPONSE_TYPE_TOKEN
        );
        if !known || !state.config.supported_response_types.contains(rt) {
            return redirect_error(
                &redirect_target,
                &client_state,
                "unsupported_response_type",
                &format!("Unsupported response type {:?}.", rt),
            );
        }
    }
    if response_types.iter().all(|rt| rt == RESPONSE_TYPE_TOKEN) {
        return redirect_error(
            &redirect_target,
            &client_state,
            "unsupported_response_type",
            "response_type=token must be combined with id_token or code.",
        );
    }

    // Scopes.
    let scopes: Vec<String> = query
        .scope
        .as_deref()
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if !scopes.iter().any(|s| s == SCOPE_OPENID) {
        return redirect_error(
            &redirect_target,
            &client_state,
            "invalid_scope",
            "Missing required scope \"openid\".",
        );
    }
    for scope in &scopes {
        if !is_recognized_scope(scope) {
            return redirect_error(
                &redirect_target,
                &client_state,
                "invalid_scope",
                &format!("Unrecognized scope {:?}.", scope),
            );
        }
    }

    // PKCE.
    let pkce = match &query.code_challenge {
        Some(challenge) if !challenge.is_empty() => {
            let method = query
                .code_challenge_method
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "plain".to_string());
            if method != "plain" && method != "S256" {
                return redirect_error(
                    &redirect_target,
                    &client_state,
                    "invalid_request",
                    &format!("Unsupported code_challenge_method {:?}.", method),
                );
            }
            Pkce {
                code_challenge: challenge.clone(),
                code_challenge_method: method,
            }
        }
        _ => {
            // The device leg binds the client with the device code itself;
            // everywhere else a public client needs PKCE.
            if client.public && redirect_uri != DEVICE_CALLBACK_URI {
                return redirect_error(
                    &redirect_target,
                    &client_state,
                    "invalid_request",
                    "Public clients must use PKCE.",
                );
            }
            Pkce::default()
        }
    };

    // Pick a connector.
    let connectors = match state.storage.list_connectors() {
        Ok(connectors) => connectors,
        Err(err) => {
            warn!("Connector listing failed: {}", err);
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "Storage is unavailable.",
            );
        }
    };
    if connectors.is_empty() {
        return pages::error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Misconfigured",
            "No connectors are configured.",
        );
    }

    let chosen = match &query.connector_id {
        Some(cid) => match connectors.iter().find(|c| c.id == *cid) {
            Some(rec) => rec.clone(),
            None => {
                return pages::error_page(
                    StatusCode::NOT_FOUND,
                    "Bad request",
                    &format!("Unknown connector {:?}.", cid),
                )
            }
        },
        None if connectors.len() == 1 && !state.config.always_show_login_screen => {
            connectors[0].clone()
        }
        None => {
            let choices: Vec<(String, String, String)> = connectors
                .iter()
                .map(|c| {
                    let name = if c.name.is_empty() { c.id.clone() } else { c.name.clone() };
                    (c.id.clone(), name, auth_url_with_connector(&query, &c.id))
                })
                .collect();
            return pages::connector_selection(&choices);
        }
    };

    let auth_req = AuthRequest {
        id: new_id(),
        client_id: client.id.clone(),
        response_types,
        scopes,
        redirect_uri,
        nonce: query.nonce.clone().unwrap_or_default(),
        state: client_state.clone(),
        force_approval_prompt: false,
        logged_in: false,
        claims: Claims::default(),
        connector_id: chosen.id.clone(),
        connector_data: Vec::new(),
        expiry: Utc::now() + state.config.auth_requests_valid_for,
        pkce,
        hmac_key: new_hmac_key(),
    };

    let connector = match state
        .registry
        .open(&chosen.type_, &chosen.id, &chosen.config)
        .await
    {
        Ok(connector) => connector,
        Err(err) => {
            warn!("Opening connector {} failed: {}", chosen.id, err);
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "The identity provider is unavailable.",
            );
        }
    };

    if let Err(err) = state.storage.create_auth_request(auth_req.clone()) {
        warn!("Persisting auth request failed: {}", err);
        return pages::error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error",
            "Storage is unavailable.",
        );
    }

    let conn_state = connector_state(&auth_req.hmac_key, &auth_req.id, &chosen.id);
    let conn_scopes = scopes_for_connector(&auth_req.scopes);

    if let Some(callback) = connector.as_callback() {
        let callback_url = state
            .config
            .absolute_url(&format!("/callback/{}", chosen.id));
        match callback
            .login_url(conn_scopes, &callback_url, &conn_state)
            .await
        {
            Ok(url) => return Redirect::to(&url).into_response(),
            Err(err) => {
                return pages::error_page(
                    StatusCode::BAD_GATEWAY,
                    "Login failed",
                    &err.to_string(),
                )
            }
        }
    }
    if let Some(password) = connector.as_password() {
        return pages::login_form(password.prompt(), &conn_state, None);
    }
    if connector.as_saml().is_some() {
        return saml_post_form(connector.as_ref(), conn_scopes, &auth_req.id, &conn_state);
    }
    pages::error_page(
        StatusCode::BAD_REQUEST,
        "Bad request",
        "The selected connector supports no login method.",
    )
}

fn saml_post_form(
    connector: &dyn Connector,
    scopes: Scopes,
    request_id: &str,
    relay_state: &str,
) -> Response {
    let saml = connector.as_saml().expect("checked by caller");
    match saml.post_data(scopes, request_id) {
        Ok((sso_url, saml_request)) => {
            let body = format!(
                "<form method=\"post\" action=\"{}\">\
                 <input type=\"hidden\" name=\"SAMLRequest\" value=\"{}\">\
                 <input type=\"hidden\" name=\"RelayState\" value=\"{}\">\
                 </form><script>document.forms[0].submit()</script>",
                pages::escape_html(&sso_url),
                pages::escape_html(&saml_request),
                pages::escape_html(relay_state),
            );
            axum::response::Html(body).into_response()
        }
        Err(err) => pages::error_page(StatusCode::BAD_GATEWAY, "Login failed", &err.to_string()),
    }
}

/// Loads the auth request a MAC-bound state refers to, verifying the MAC
/// against the expected connector.
fn load_bound_request(
    state: &ServerState,
    bound_state: &str,
    connector_id: &str,
) -> Result<AuthRequest, Response> {
    let Some((req_id, tag)) = parse_state(bound_state) else {
        return Err(pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "Malformed state parameter.",
        ));
    };
    let auth_req = match state.storage.get_auth_request(req_id) {
        Ok(req) => req,
        Err(StorageError::NotFound) => {
            return Err(pages::error_page(
                StatusCode::BAD_REQUEST,
                "Login session expired",
                "This login link is no longer valid. Start over from the application.",
            ))
        }
        Err(err) => {
            warn!("Auth request lookup failed: {}", err);
            return Err(pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "Storage is unavailable.",
            ));
        }
    };
    if auth_req.connector_id != connector_id
        || !verify_state_mac(&auth_req.hmac_key, req_id, connector_id, tag)
    {
        return Err(pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "State parameter does not match this login.",
        ));
    }
    if auth_req.expiry < Utc::now() {
        return Err(pages::error_page(
            StatusCode::BAD_REQUEST,
            "Login session expired",
            "This login took too long. Start over from the application.",
        ));
    }
    Ok(auth_req)
}

pub async fn handle_callback_get(
    State(state): State<ServerState>,
    Path(connector_id): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Response {
    handle_callback(state, connector_id, params).await
}

pub async fn handle_callback_post(
    State(state): State<ServerState>,
    Path(connector_id): Path<String>,
    Form(params): Form<CallbackParams>,
) -> Response {
    handle_callback(state, connector_id, params).await
}

async fn handle_callback(
    state: ServerState,
    connector_id: String,
    params: CallbackParams,
) -> Response {
    let Some(bound_state) = params
        .get("state")
        .or_else(|| params.get("RelayState"))
        .cloned()
    else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "Missing state parameter.",
        );
    };
    let auth_req = match load_bound_request(&state, &bound_state, &connector_id) {
        Ok(req) => req,
        Err(response) => return response,
    };

    let record = match state.storage.get_connector(&connector_id) {
        Ok(record) => record,
        Err(_) => {
            return pages::error_page(
                StatusCode::NOT_FOUND,
                "Bad request",
                &format!("Unknown connector {:?}.", connector_id),
            )
        }
    };
    let connector = match state
        .registry
        .open(&record.type_, &record.id, &record.config)
        .await
    {
        Ok(connector) => connector,
        Err(err) => {
            warn!("Opening connector {} failed: {}", connector_id, err);
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "The identity provider is unavailable.",
            );
        }
    };

    let scopes = scopes_for_connector(&auth_req.scopes);
    let identity = if let Some(callback) = connector.as_callback() {
        match callback.handle_callback(scopes, &params).await {
            Ok(identity) => identity,
            Err(err) => {
                super::metrics::CONNECTOR_LOGINS_TOTAL
                    .with_label_values(&[connector_id.as_str(), "error"])
                    .inc();
                // Connector errors surface on the page, never to clients.
                return pages::error_page(
                    StatusCode::BAD_GATEWAY,
                    "Login failed",
                    &err.to_string(),
                );
            }
        }
    } else if let Some(saml) = connector.as_saml() {
        let saml_response = params.get("SAMLResponse").cloned().unwrap_or_default();
        match saml.handle_post(scopes, &saml_response, &auth_req.id) {
            Ok(identity) => identity,
            Err(err) => {
                return pages::error_page(
                    StatusCode::BAD_GATEWAY,
                    "Login failed",
                    &err.to_string(),
                )
            }
        }
    } else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "This connector does not use callbacks.",
        );
    };

    super::metrics::CONNECTOR_LOGINS_TOTAL
        .with_label_values(&[connector_id.as_str(), "ok"])
        .inc();
    debug!(
        "Connector {} authenticated user {}",
        connector_id, identity.user_id
    );

    let claims = identity.to_claims();
    let connector_data = identity.connector_data.clone();
    if let Err(err) = state.storage.update_auth_request(&auth_req.id, &mut |mut r| {
        r.logged_in = true;
        r.claims = claims.clone();
        r.connector_data = connector_data.clone();
        Ok(r)
    }) {
        warn!("Updating auth request failed: {}", err);
        return pages::error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error",
            "Storage is unavailable.",
        );
    }

    let mut auth_req = auth_req;
    auth_req.logged_in = true;
    auth_req.claims = claims;
    auth_req.connector_data = identity.connector_data;
    continue_after_login(&state, auth_req).await
}

#[derive(Deserialize)]
pub struct PasswordLoginForm {
    pub state: String,
    pub login: String,
    pub password: String,
}

pub async fn handle_password_login(
    State(state): State<ServerState>,
    Form(form): Form<PasswordLoginForm>,
) -> Response {
    let Some((req_id, _)) = parse_state(&form.state) else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "Malformed state parameter.",
        );
    };
    let connector_id = match state.storage.get_auth_request(req_id) {
        Ok(req) => req.connector_id,
        Err(_) => {
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Login session expired",
                "This login link is no longer valid. Start over from the application.",
            )
        }
    };
    let auth_req = match load_bound_request(&state, &form.state, &connector_id) {
        Ok(req) => req,
        Err(response) => return response,
    };

    let record = match state.storage.get_connector(&connector_id) {
        Ok(record) => record,
        Err(_) => {
            return pages::error_page(
                StatusCode::NOT_FOUND,
                "Bad request",
                &format!("Unknown connector {:?}.", connector_id),
            )
        }
    };
    let connector = match state
        .registry
        .open(&record.type_, &record.id, &record.config)
        .await
    {
        Ok(connector) => connector,
        Err(err) => {
            warn!("Opening connector {} failed: {}", connector_id, err);
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "The identity provider is unavailable.",
            );
        }
    };
    let Some(password_conn) = connector.as_password() else {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "This connector does not accept passwords.",
        );
    };

    let scopes = scopes_for_connector(&auth_req.scopes);
    let (identity, valid) = match password_conn
        .login(scopes, &form.login, &form.password)
        .await
    {
        Ok(result) => result,
        Err(err) => {
            super::metrics::CONNECTOR_LOGINS_TOTAL
                .with_label_values(&[connector_id.as_str(), "error"])
                .inc();
            return pages::error_page(StatusCode::BAD_GATEWAY, "Login failed", &err.to_string());
        }
    };
    if !valid {
        super::metrics::CONNECTOR_LOGINS_TOTAL
            .with_label_values(&[connector_id.as_str(), "invalid"])
            .inc();
        return pages::login_form(
            password_conn.prompt(),
            &form.state,
            Some("Invalid credentials."),
        );
    }
    super::metrics::CONNECTOR_LOGINS_TOTAL
        .with_label_values(&[connector_id.as_str(), "ok"])
        .inc();

    let claims = identity.to_claims();
    let connector_data = identity.connector_data.clone();
    if let Err(err) = state.storage.update_auth_request(&auth_req.id, &mut |mut r| {
        r.logged_in = true;
        r.claims = claims.clone();
        r.connector_data = connector_data.clone();
        Ok(r)
    }) {
        warn!("Updating auth request failed: {}", err);
        return pages::error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error",
            "Storage is unavailable.",
        );
    }

    let mut auth_req = auth_req;
    auth_req.logged_in = true;
    auth_req.claims = claims;
    auth_req.connector_data = identity.connector_data;
    continue_after_login(&state, auth_req).await
}

/// Either jumps straight to code issuance or parks the request behind the
/// approval screen.
async fn continue_after_login(state: &ServerState, auth_req: AuthRequest) -> Response {
    if state.config.skip_approval_screen && !auth_req.force_approval_prompt {
        return send_code(state, auth_req).await;
    }
    let mac = approval_mac(&auth_req.hmac_key, &auth_req.id);
    Redirect::to(&format!(
        "/approval?req={}&hmac={}",
        urlencoding::encode(&auth_req.id),
        urlencoding::encode(&mac)
    ))
    .into_response()
}

#[derive(Deserialize)]
pub struct ApprovalQuery {
    pub req: String,
    pub hmac: String,
}

pub async fn handle_approval_get(
    State(state): State<ServerState>,
    Query(query): Query<ApprovalQuery>,
) -> Response {
    let auth_req = match authorize_approval(&state, &query.req, &query.hmac) {
        Ok(req) => req,
        Err(response) => return response,
    };
    let client_name = state
        .storage
        .get_client(&auth_req.client_id)
        .map(|c| if c.name.is_empty() { c.id } else { c.name })
        .unwrap_or_else(|_| auth_req.client_id.clone());
    pages::approval_page(&client_name, &auth_req.claims.email, &query.req, &query.hmac)
}

#[derive(Deserialize)]
pub struct ApprovalForm {
    pub req: String,
    pub hmac: String,
    #[serde(default)]
    pub approval: String,
}

pub async fn handle_approval_post(
    State(state): State<ServerState>,
    Form(form): Form<ApprovalForm>,
) -> Response {
    let auth_req = match authorize_approval(&state, &form.req, &form.hmac) {
        Ok(req) => req,
        Err(response) => return response,
    };
    if form.approval != "approve" {
        let target = resolve_redirect(&state.config, &auth_req.redirect_uri);
        return redirect_error(
            &target,
            &auth_req.state,
            "access_denied",
            "The user denied the request.",
        );
    }
    send_code(&state, auth_req).await
}

fn authorize_approval(
    state: &ServerState,
    req_id: &str,
    tag: &str,
) -> Result<AuthRequest, Response> {
    let auth_req = match state.storage.get_auth_request(req_id) {
        Ok(req) => req,
        Err(_) => {
            return Err(pages::error_page(
                StatusCode::BAD_REQUEST,
                "Login session expired",
                "This login is no longer valid. Start over from the application.",
            ))
        }
    };
    if !verify_approval_mac(&auth_req.hmac_key, req_id, tag) {
        return Err(pages::error_page(
            StatusCode::FORBIDDEN,
            "Bad request",
            "Approval link does not match this login.",
        ));
    }
    if !auth_req.logged_in {
        return Err(pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "Login has not completed.",
        ));
    }
    if auth_req.expiry < Utc::now() {
        return Err(pages::error_page(
            StatusCode::BAD_REQUEST,
            "Login session expired",
            "This login took too long. Start over from the application.",
        ));
    }
    Ok(auth_req)
}

/// Redeems a logged-in auth request: deletes it, mints the authorization
/// code (and implicit tokens when requested) and bounces the browser back
/// to the client.
async fn send_code(state: &ServerState, auth_req: AuthRequest) -> Response {
    if !auth_req.logged_in {
        return pages::error_page(
            StatusCode::BAD_REQUEST,
            "Bad request",
            "Login has not completed.",
        );
    }
    // Single-use: whichever caller deletes the row first wins.
    match state.storage.delete_auth_request(&auth_req.id) {
        Ok(()) => {}
        Err(StorageError::NotFound) => {
            return pages::error_page(
                StatusCode::BAD_REQUEST,
                "Login session expired",
                "This login was already redeemed.",
            )
        }
        Err(err) => {
            warn!("Deleting auth request failed: {}", err);
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "Storage is unavailable.",
            );
        }
    }

    let target = resolve_redirect(&state.config, &auth_req.redirect_uri);
    let wants_code = auth_req
        .response_types
        .iter()
        .any(|rt| rt == RESPONSE_TYPE_CODE);
    let implicit = auth_req
        .response_types
        .iter()
        .any(|rt| rt == RESPONSE_TYPE_ID_TOKEN || rt == RESPONSE_TYPE_TOKEN);

    let code_id = if wants_code {
        let code = AuthCode {
            id: new_id(),
            client_id: auth_req.client_id.clone(),
            scopes: auth_req.scopes.clone(),
            nonce: auth_req.nonce.clone(),
            redirect_uri: auth_req.redirect_uri.clone(),
            claims: auth_req.claims.clone(),
            connector_id: auth_req.connector_id.clone(),
            connector_data: auth_req.connector_data.clone(),
            expiry: Utc::now() + state.config.auth_codes_valid_for,
            pkce: auth_req.pkce.clone(),
        };
        if let Err(err) = state.storage.create_auth_code(code.clone()) {
            warn!("Persisting auth code failed: {}", err);
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "Storage is unavailable.",
            );
        }
        Some(code.id)
    } else {
        None
    };

    if !implicit {
        let code = code_id.expect("code response type verified at /auth");
        let mut params = vec![("code", code.as_str())];
        if !auth_req.state.is_empty() {
            params.push(("state", auth_req.state.as_str()));
        }
        return redirect_with_query(&target, &params);
    }

    // Implicit and hybrid flows answer in the fragment.
    let minted = match mint_tokens(
        state,
        &auth_req.client_id,
        &auth_req.claims,
        &auth_req.scopes,
        &auth_req.nonce,
        &auth_req.connector_id,
    ) {
        Ok(minted) => minted,
        Err(err) => {
            warn!("Minting implicit tokens failed: {}", err);
            return pages::error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "Token issuance failed.",
            );
        }
    };
    let expires_in = minted.expires_in.to_string();
    let mut params: Vec<(&str, &str)> = vec![
        ("id_token", minted.id_token.as_str()),
        ("token_type", "bearer"),
        ("expires_in", expires_in.as_str()),
    ];
    if auth_req.response_types.iter().any(|rt| rt == RESPONSE_TYPE_TOKEN) {
        params.push(("access_token", minted.access_token.as_str()));
    }
    if let Some(code) = &code_id {
        params.push(("code", code.as_str()));
    }
    if !auth_req.state.is_empty() {
        params.push(("state", auth_req.state.as_str()));
    }
    redirect_with_fragment(&target, &params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mac_round_trip() {
        let key = new_hmac_key();
        let state = connector_state(&key, "req-1", "mock");
        let (id, tag) = parse_state(&state).unwrap();
        assert_eq!(id, "req-1");
        assert!(verify_state_mac(&key, id, "mock", tag));
    }

    #[test]
    fn state_mac_binds_the_connector() {
        let key = new_hmac_key();
        let state = connector_state(&key, "req-1", "mock");
        let (id, tag) = parse_state(&state).unwrap();
        // Same request, different connector: mix-up is caught.
        assert!(!verify_state_mac(&key, id, "github", tag));
    }

    #[test]
    fn state_mac_requires_the_request_key() {
        let key = new_hmac_key();
        let other_key = new_hmac_key();
        let state = connector_state(&key, "req-1", "mock");
        let (id, tag) = parse_state(&state).unwrap();
        assert!(!verify_state_mac(&other_key, id, "mock", tag));
    }

    #[test]
    fn approval_mac_is_distinct_from_connector_mac() {
        let key = new_hmac_key();
        let approval = approval_mac(&key, "req-1");
        let state = connector_state(&key, "req-1", "mock");
        let (_, connector_tag) = parse_state(&state).unwrap();
        assert_ne!(approval, connector_tag);
        assert!(verify_approval_mac(&key, "req-1", &approval));
        assert!(!verify_approval_mac(&key, "req-2", &approval));
    }
}
