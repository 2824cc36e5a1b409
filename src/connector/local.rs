//! The built-in "local" connector, backed by the password store.

use super::{
    Connector, ConnectorError, ConnectorOpener, Identity, PasswordConnector, RefreshConnector,
    Scopes,
};
use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub struct LocalOpener {
    storage: Arc<dyn Storage>,
}

impl LocalOpener {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ConnectorOpener for LocalOpener {
    async fn open(
        &self,
        _id: &str,
        _config: serde_json::Value,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        Ok(Box::new(LocalConnector {
            storage: self.storage.clone(),
        }))
    }
}

pub struct LocalConnector {
    storage: Arc<dyn Storage>,
}

impl Connector for LocalConnector {
    fn as_password(&self) -> Option<&dyn PasswordConnector> {
        Some(self)
    }
    fn as_refresh(&self) -> Option<&dyn RefreshConnector> {
        Some(self)
    }
}

#[async_trait]
impl RefreshConnector for LocalConnector {
    /// Re-reads the password record so renames propagate and deleted
    /// users lose their refresh tokens.
    async fn refresh(
        &self,
        _scopes: Scopes,
        identity: Identity,
    ) -> Result<Identity, ConnectorError> {
        let record = match self.storage.get_password(&identity.email) {
            Ok(record) => record,
            Err(StorageError::NotFound) => return Err(ConnectorError::UserGone),
            Err(err) => return Err(ConnectorError::Upstream(err.to_string())),
        };
        if record.user_id != identity.user_id {
            return Err(ConnectorError::UserGone);
        }
        Ok(Identity {
            user_id: record.user_id,
            username: record.username,
            email: record.email,
            ..identity
        })
    }
}

#[async_trait]
impl PasswordConnector for LocalConnector {
    fn prompt(&self) -> &str {
        "Email Address"
    }

    async fn login(
        &self,
        _scopes: Scopes,
        username: &str,
        password: &str,
    ) -> Result<(Identity, bool), ConnectorError> {
        let record = match self.storage.get_password(username) {
            Ok(record) => record,
            // An unknown user and a wrong password are indistinguishable
            // to the caller.
            Err(StorageError::NotFound) => return Ok((Identity::default(), false)),
            Err(err) => return Err(ConnectorError::Upstream(err.to_string())),
        };

        let hash = match std::str::from_utf8(&record.hash) {
            Ok(hash) => hash,
            Err(_) => {
                warn!("Password record for {} holds a non-utf8 hash", record.email);
                return Ok((Identity::default(), false));
            }
        };

        // bcrypt comparison is CPU-bound; keep it off the async workers.
        let password = password.to_string();
        let hash = hash.to_string();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(&password, &hash))
            .await
            .map_err(|e| ConnectorError::Upstream(e.to_string()))?
            .unwrap_or(false);

        if !valid {
            return Ok((Identity::default(), false));
        }
        Ok((
            Identity {
                user_id: record.user_id,
                username: record.username,
                preferred_username: String::new(),
                email: record.email,
                email_verified: true,
                groups: Vec::new(),
                connector_data: Vec::new(),
            },
            true,
        ))
    }
}
