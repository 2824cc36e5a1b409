//! The admin API: client, password and connector management plus refresh
//! token inspection and revocation.
//!
//! Served as JSON on its own listener (the `grpc.addr` config key), never
//! on the public protocol listener. Transport security is the fronting
//! proxy's job; the method set matches the management surface clients of
//! the original deployment expect.

use crate::storage::{new_id, new_secret, Client, ConnectorRecord, Password, Storage, StorageError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct AdminState {
    pub storage: Arc<dyn Storage>,
}

#[derive(Debug)]
struct AdminError(StorageError);

impl From<StorageError> for AdminError {
    fn from(err: StorageError) -> Self {
        AdminError(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            StorageError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            StorageError::AlreadyExists => (StatusCode::CONFLICT, "already exists".to_string()),
            StorageError::Conflict => (StatusCode::CONFLICT, "conflict".to_string()),
            StorageError::Internal(detail) => {
                (StatusCode::INTERNAL_SERVER_ERROR, detail.clone())
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

type AdminResult<T> = Result<T, AdminError>;

// Clients.

#[derive(Deserialize)]
struct CreateClientRequest {
    #[serde(default)]
    id: String,
    #[serde(default)]
    secret: String,
    #[serde(default)]
    redirect_uris: Vec<String>,
    #[serde(default)]
    trusted_peers: Vec<String>,
    #[serde(default)]
    public: bool,
    #[serde(default)]
    name: String,
    #[serde(default)]
    logo_url: String,
}

async fn create_client(
    State(state): State<AdminState>,
    Json(body): Json<CreateClientRequest>,
) -> AdminResult<Json<Client>> {
    let client = Client {
        id: if body.id.is_empty() { new_id() } else { body.id },
        secret: if body.secret.is_empty() && !body.public {
            new_secret()
        } else {
            body.secret
        },
        redirect_uris: body.redirect_uris,
        trusted_peers: body.trusted_peers,
        public: body.public,
        name: body.name,
        logo_url: body.logo_url,
    };
    state.storage.create_client(client.clone())?;
    info!("Admin created client {}", client.id);
    Ok(Json(client))
}

async fn get_client(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<Json<Client>> {
    Ok(Json(state.storage.get_client(&id)?))
}

#[derive(Deserialize)]
struct UpdateClientRequest {
    redirect_uris: Option<Vec<String>>,
    trusted_peers: Option<Vec<String>>,
    name: Option<String>,
    logo_url: Option<String>,
}

async fn update_client(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateClientRequest>,
) -> AdminResult<StatusCode> {
    state.storage.update_client(&id, &mut |mut client| {
        if let Some(uris) = &body.redirect_uris {
            client.redirect_uris = uris.clone();
        }
        if let Some(peers) = &body.trusted_peers {
            client.trusted_peers = peers.clone();
        }
        if let Some(name) = &body.name {
            client.name = name.clone();
        }
        if let Some(logo) = &body.logo_url {
            client.logo_url = logo.clone();
        }
        Ok(client)
    })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_client(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    state.storage.delete_client(&id)?;
    info!("Admin deleted client {}", id);
    Ok(StatusCode::NO_CONTENT)
}

// Passwords.

#[derive(Serialize)]
struct PasswordEntry {
    email: String,
    username: String,
    user_id: String,
}

async fn list_passwords(State(state): State<AdminState>) -> AdminResult<Json<Vec<PasswordEntry>>> {
    let entries = state
        .storage
        .list_passwords()?
        .into_iter()
        .map(|p| PasswordEntry {
            email: p.email,
            username: p.username,
            user_id: p.user_id,
        })
        .collect();
    Ok(Json(entries))
}

#[derive(Deserialize)]
struct CreatePasswordRequest {
    email: String,
    /// A bcrypt digest, never a plaintext password.
    hash: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    user_id: String,
}

fn validate_bcrypt(hash: &str) -> Result<(), AdminError> {
    // A parseable digest verifies (to false) against any password; only a
    // malformed hash errors.
    match bcrypt::verify("", hash) {
        Ok(_) => Ok(()),
        Err(_) => Err(AdminError(StorageError::Internal(
            "hash is not a valid bcrypt digest".to_string(),
        ))),
    }
}

async fn create_password(
    State(state): State<AdminState>,
    Json(body): Json<CreatePasswordRequest>,
) -> AdminResult<StatusCode> {
    validate_bcrypt(&body.hash)?;
    state.storage.create_password(Password {
        email: body.email,
        hash: body.hash.into_bytes(),
        username: body.username,
        user_id: if body.user_id.is_empty() {
            new_id()
        } else {
            body.user_id
        },
    })?;
    Ok(StatusCode::CREATED)
}

#[derive(Deserialize)]
struct UpdatePasswordRequest {
    hash: Option<String>,
    username: Option<String>,
}

async fn update_password(
    State(state): State<AdminState>,
    Path(email): Path<String>,
    Json(body): Json<UpdatePasswordRequest>,
) -> AdminResult<StatusCode> {
    if let Some(hash) = &body.hash {
        validate_bcrypt(hash)?;
    }
    state.storage.update_password(&email, &mut |mut password| {
        if let Some(hash) = &body.hash {
            password.hash = hash.clone().into_bytes();
        }
        if let Some(username) = &body.username {
            password.username = username.clone();
        }
        Ok(password)
    })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_password(
    State(state): State<AdminState>,
    Path(email): Path<String>,
) -> AdminResult<StatusCode> {
    state.storage.delete_password(&email)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct VerifyPasswordRequest {
    email: String,
    password: String,
}

async fn verify_password(
    State(state): State<AdminState>,
    Json(body): Json<VerifyPasswordRequest>,
) -> AdminResult<Json<serde_json::Value>> {
    let record = match state.storage.get_password(&body.email) {
        Ok(record) => record,
        Err(StorageError::NotFound) => {
            return Ok(Json(json!({"not_found": true, "verified": false})))
        }
        Err(err) => return Err(err.into()),
    };
    let hash = String::from_utf8(record.hash)
        .map_err(|_| AdminError(StorageError::Internal("stored hash is not utf8".to_string())))?;
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(&body.password, &hash))
        .await
        .map_err(|e| AdminError(StorageError::Internal(e.to_string())))?
        .unwrap_or(false);
    Ok(Json(json!({"not_found": false, "verified": verified})))
}

// Connectors.

async fn list_connectors(
    State(state): State<AdminState>,
) -> AdminResult<Json<Vec<ConnectorRecord>>> {
    Ok(Json(state.storage.list_connectors()?))
}

#[derive(Deserialize)]
struct CreateConnectorRequest {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: serde_json::Value,
}

async fn create_connector(
    State(state): State<AdminState>,
    Json(body): Json<CreateConnectorRequest>,
) -> AdminResult<StatusCode> {
    let config = serde_json::to_vec(&body.config)
        .map_err(|e| AdminError(StorageError::Internal(e.to_string())))?;
    state.storage.create_connector(ConnectorRecord {
        id: body.id.clone(),
        type_: body.type_,
        name: if body.name.is_empty() { body.id } else { body.name },
        resource_version: "1".to_string(),
        config,
    })?;
    Ok(StatusCode::CREATED)
}

#[derive(Deserialize)]
struct UpdateConnectorRequest {
    name: Option<String>,
    config: Option<serde_json::Value>,
}

async fn update_connector(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateConnectorRequest>,
) -> AdminResult<StatusCode> {
    state.storage.update_connector(&id, &mut |mut connector| {
        if let Some(name) = &body.name {
            connector.name = name.clone();
        }
        if let Some(config) = &body.config {
            connector.config =
                serde_json::to_vec(config).map_err(StorageError::internal)?;
        }
        let version: u64 = connector.resource_version.parse().unwrap_or(0);
        connector.resource_version = (version + 1).to_string();
        Ok(connector)
    })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_connector(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    state.storage.delete_connector(&id)?;
    info!("Admin deleted connector {}", id);
    Ok(StatusCode::NO_CONTENT)
}

// Refresh tokens.

#[derive(Deserialize)]
struct RefreshFilter {
    user_id: String,
}

#[derive(Serialize)]
struct RefreshEntry {
    id: String,
    client_id: String,
    connector_id: String,
    created_at: chrono::DateTime<chrono::Utc>,
    last_used: chrono::DateTime<chrono::Utc>,
}

async fn list_refresh(
    State(state): State<AdminState>,
    Query(filter): Query<RefreshFilter>,
) -> AdminResult<Json<Vec<RefreshEntry>>> {
    let entries = state
        .storage
        .list_refresh_tokens()?
        .into_iter()
        .filter(|t| t.claims.user_id == filter.user_id)
        .map(|t| RefreshEntry {
            id: t.id,
            client_id: t.client_id,
            connector_id: t.connector_id,
            created_at: t.created_at,
            last_used: t.last_used,
        })
        .collect();
    Ok(Json(entries))
}

#[derive(Deserialize)]
struct RevokeRefreshRequest {
    user_id: String,
    client_id: String,
}

async fn revoke_refresh(
    State(state): State<AdminState>,
    Json(body): Json<RevokeRefreshRequest>,
) -> AdminResult<StatusCode> {
    let tokens: Vec<_> = state
        .storage
        .list_refresh_tokens()?
        .into_iter()
        .filter(|t| t.claims.user_id == body.user_id && t.client_id == body.client_id)
        .collect();
    if tokens.is_empty() {
        return Err(AdminError(StorageError::NotFound));
    }
    for token in tokens {
        state.storage.delete_refresh_token(&token.id)?;
        let _ = state.storage.update_offline_session(
            &body.user_id,
            &token.connector_id,
            &mut |mut session| {
                session.refresh.remove(&body.client_id);
                Ok(session)
            },
        );
        info!(
            "Admin revoked refresh token {} (user {}, client {})",
            token.id, body.user_id, body.client_id
        );
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "server": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn build_router(storage: Arc<dyn Storage>) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/clients", post(create_client))
        .route(
            "/clients/{id}",
            get(get_client).put(update_client).delete(delete_client),
        )
        .route("/passwords", get(list_passwords).post(create_password))
        .route(
            "/passwords/{email}",
            axum::routing::put(update_password).delete(delete_password),
        )
        .route("/passwords/verify", post(verify_password))
        .route("/connectors", get(list_connectors).post(create_connector))
        .route(
            "/connectors/{id}",
            axum::routing::put(update_connector).delete(delete_connector),
        )
        .route("/refresh", get(list_refresh).delete(revoke_refresh))
        .with_state(AdminState { storage })
}

pub async fn run_admin_server(
    storage: Arc<dyn Storage>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = build_router(storage);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Admin API on http://{}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemStorage;

    #[test]
    fn bcrypt_validation_accepts_real_digests() {
        assert!(validate_bcrypt(
            "$2a$10$33EMT0cVYVlPy6WAMCLsceLYjWhuHpbz5yuZxu/GAFj03J9Lytjuy"
        )
        .is_ok());
        assert!(validate_bcrypt("plaintext-password").is_err());
        assert!(validate_bcrypt("$argon2id$v=19$m=65536").is_err());
    }

    #[tokio::test]
    async fn client_create_fills_in_credentials() {
        let state = AdminState {
            storage: Arc::new(MemStorage::new()),
        };
        let Json(client) = create_client(
            State(state.clone()),
            Json(CreateClientRequest {
                id: String::new(),
                secret: String::new(),
                redirect_uris: vec!["http://127.0.0.1:5555/callback".to_string()],
                trusted_peers: vec![],
                public: false,
                name: "Generated".to_string(),
                logo_url: String::new(),
            }),
        )
        .await
        .unwrap();
        assert!(!client.id.is_empty());
        assert!(!client.secret.is_empty());
        assert!(state.storage.get_client(&client.id).is_ok());
    }
}
