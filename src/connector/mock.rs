//! Mock connectors for tests and local development.

use super::{
    CallbackConnector, CallbackParams, Connector, ConnectorError, ConnectorOpener, Identity,
    PasswordConnector, RefreshConnector, Scopes,
};
use async_trait::async_trait;
use serde::Deserialize;

fn kilgore() -> Identity {
    Identity {
        user_id: "0-385-28089-0".to_string(),
        username: "Kilgore Trout".to_string(),
        preferred_username: "kilgore".to_string(),
        email: "kilgore@kilgore.trout".to_string(),
        email_verified: true,
        groups: vec!["authors".to_string()],
        connector_data: Vec::new(),
    }
}

/// Callback connector that immediately "authenticates" a fixed identity.
pub struct CallbackOpener;

#[async_trait]
impl ConnectorOpener for CallbackOpener {
    async fn open(
        &self,
        _id: &str,
        _config: serde_json::Value,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        Ok(Box::new(MockCallback))
    }
}

pub struct MockCallback;

impl Connector for MockCallback {
    fn as_callback(&self) -> Option<&dyn CallbackConnector> {
        Some(self)
    }
    fn as_refresh(&self) -> Option<&dyn RefreshConnector> {
        Some(self)
    }
}

#[async_trait]
impl CallbackConnector for MockCallback {
    async fn login_url(
        &self,
        _scopes: Scopes,
        callback_url: &str,
        state: &str,
    ) -> Result<String, ConnectorError> {
        Ok(format!(
            "{}?state={}",
            callback_url,
            urlencoding::encode(state)
        ))
    }

    async fn handle_callback(
        &self,
        _scopes: Scopes,
        _params: &CallbackParams,
    ) -> Result<Identity, ConnectorError> {
        Ok(kilgore())
    }
}

#[async_trait]
impl RefreshConnector for MockCallback {
    async fn refresh(
        &self,
        _scopes: Scopes,
        identity: Identity,
    ) -> Result<Identity, ConnectorError> {
        Ok(Identity {
            connector_data: identity.connector_data,
            ..kilgore()
        })
    }
}

/// Password connector validating one configured credential pair.
pub struct PasswordOpener;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordConfig {
    username: String,
    password: String,
}

#[async_trait]
impl ConnectorOpener for PasswordOpener {
    async fn open(
        &self,
        _id: &str,
        config: serde_json::Value,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        let config: PasswordConfig =
            serde_json::from_value(config).map_err(|e| ConnectorError::Config(e.to_string()))?;
        if config.username.is_empty() {
            return Err(ConnectorError::Config("username is required".to_string()));
        }
        if config.password.is_empty() {
            return Err(ConnectorError::Config("password is required".to_string()));
        }
        Ok(Box::new(MockPassword { config }))
    }
}

pub struct MockPassword {
    config: PasswordConfig,
}

impl Connector for MockPassword {
    fn as_password(&self) -> Option<&dyn PasswordConnector> {
        Some(self)
    }
}

#[async_trait]
impl PasswordConnector for MockPassword {
    fn prompt(&self) -> &str {
        "Username"
    }

    async fn login(
        &self,
        _scopes: Scopes,
        username: &str,
        password: &str,
    ) -> Result<(Identity, bool), ConnectorError> {
        if username != self.config.username || password != self.config.password {
            return Ok((Identity::default(), false));
        }
        Ok((kilgore(), true))
    }
}
