//! Connector abstraction: pluggable adapters to upstream identity sources.
//!
//! A connector is polymorphic over a set of capabilities rather than one
//! fat interface. The protocol engine asks for exactly the capability it
//! needs (`as_password`, `as_callback`, ...) and treats `None` as an
//! unsupported-operation error. New upstreams only implement what they can
//! actually do.

pub mod local;
pub mod mock;
pub mod oidc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The fixed ID of the built-in password-database connector.
pub const LOCAL_CONNECTOR_ID: &str = "local";

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("unknown connector type {0:?}")]
    UnknownType(String),
    #[error("invalid connector config: {0}")]
    Config(String),
    #[error("upstream identity provider error: {0}")]
    Upstream(String),
    #[error("upstream user no longer exists")]
    UserGone,
    #[error("operation not supported by this connector")]
    Unsupported,
}

/// The identity a connector resolved for the end user, plus whatever the
/// connector needs to refresh it later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub preferred_username: String,
    pub email: String,
    pub email_verified: bool,
    pub groups: Vec<String>,
    /// Opaque bytes handed back to the connector on refresh.
    pub connector_data: Vec<u8>,
}

/// The subset of requested scopes a connector cares about.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scopes {
    pub offline_access: bool,
    pub groups: bool,
}

/// Query/form parameters of a callback request, keyed by name.
pub type CallbackParams = HashMap<String, String>;

/// Username/password capability.
#[async_trait]
pub trait PasswordConnector: Send + Sync {
    /// Label for the username field on the login form.
    fn prompt(&self) -> &str;

    /// Returns the identity and whether the password was valid. A wrong
    /// password is `Ok((_, false))`, not an error.
    async fn login(
        &self,
        scopes: Scopes,
        username: &str,
        password: &str,
    ) -> Result<(Identity, bool), ConnectorError>;
}

/// Browser-redirect capability.
#[async_trait]
pub trait CallbackConnector: Send + Sync {
    /// The URL to send the user agent to. `state` is MAC-bound by the
    /// engine and must be round-tripped unchanged.
    async fn login_url(
        &self,
        scopes: Scopes,
        callback_url: &str,
        state: &str,
    ) -> Result<String, ConnectorError>;

    async fn handle_callback(
        &self,
        scopes: Scopes,
        params: &CallbackParams,
    ) -> Result<Identity, ConnectorError>;
}

/// SAML POST-binding capability. Defined so a SAML upstream can be added
/// without touching the engine; no SAML connector ships in-tree.
pub trait SamlConnector: Send + Sync {
    /// Returns the SSO URL and the base64 SAMLRequest document.
    fn post_data(&self, scopes: Scopes, request_id: &str) -> Result<(String, String), ConnectorError>;

    fn handle_post(
        &self,
        scopes: Scopes,
        saml_response: &str,
        in_response_to: &str,
    ) -> Result<Identity, ConnectorError>;
}

/// Optional: called on every refresh-token redemption so group/profile
/// changes and upstream revocations propagate.
#[async_trait]
pub trait RefreshConnector: Send + Sync {
    async fn refresh(&self, scopes: Scopes, identity: Identity) -> Result<Identity, ConnectorError>;
}

/// Optional: enrich `/userinfo` responses from stored connector data.
#[async_trait]
pub trait UserInfoConnector: Send + Sync {
    async fn user_info(
        &self,
        identity: &Identity,
    ) -> Result<serde_json::Map<String, serde_json::Value>, ConnectorError>;
}

/// A connector instance. Capability accessors return `None` when the
/// upstream cannot do the operation.
pub trait Connector: Send + Sync {
    fn as_password(&self) -> Option<&dyn PasswordConnector> {
        None
    }
    fn as_callback(&self) -> Option<&dyn CallbackConnector> {
        None
    }
    fn as_saml(&self) -> Option<&dyn SamlConnector> {
        None
    }
    fn as_refresh(&self) -> Option<&dyn RefreshConnector> {
        None
    }
    fn as_user_info(&self) -> Option<&dyn UserInfoConnector> {
        None
    }
}

/// Opens a connector of one concrete type from its JSON config payload.
#[async_trait]
pub trait ConnectorOpener: Send + Sync {
    async fn open(
        &self,
        id: &str,
        config: serde_json::Value,
    ) -> Result<Box<dyn Connector>, ConnectorError>;
}

/// Maps config `type` tags to openers. Static config and persisted
/// connector records go through the same registry, so a type registered
/// here is usable from both.
pub struct ConnectorRegistry {
    openers: HashMap<String, Box<dyn ConnectorOpener>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            openers: HashMap::new(),
        }
    }

    /// Registry with every built-in connector type. The password store
    /// backs the "local" type.
    pub fn with_builtins(storage: std::sync::Arc<dyn crate::storage::Storage>) -> Self {
        let mut registry = Self::new();
        registry.register("local", Box::new(local::LocalOpener::new(storage)));
        registry.register("mockCallback", Box::new(mock::CallbackOpener));
        registry.register("mockPassword", Box::new(mock::PasswordOpener));
        registry.register("oidc", Box::new(oidc::OidcOpener));
        registry
    }

    pub fn register(&mut self, type_: &str, opener: Box<dyn ConnectorOpener>) {
        self.openers.insert(type_.to_string(), opener);
    }

    pub fn supports(&self, type_: &str) -> bool {
        self.openers.contains_key(type_)
    }

    /// Decodes `config` (raw JSON bytes; empty means `{}`) and opens the
    /// connector.
    pub async fn open(
        &self,
        type_: &str,
        id: &str,
        config: &[u8],
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        let opener = self
            .openers
            .get(type_)
            .ok_or_else(|| ConnectorError::UnknownType(type_.to_string()))?;
        let config: serde_json::Value = if config.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_slice(config).map_err(|e| ConnectorError::Config(e.to_string()))?
        };
        opener.open(id, config).await
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Identity {
    /// The claim set persisted with auth requests, codes and refresh
    /// tokens. Connector data travels separately.
    pub fn to_claims(&self) -> crate::storage::Claims {
        crate::storage::Claims {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            preferred_username: self.preferred_username.clone(),
            email: self.email.clone(),
            email_verified: self.email_verified,
            groups: self.groups.clone(),
        }
    }

    pub fn from_claims(claims: &crate::storage::Claims, connector_data: &[u8]) -> Self {
        Identity {
            user_id: claims.user_id.clone(),
            username: claims.username.clone(),
            preferred_username: claims.preferred_username.clone(),
            email: claims.email.clone(),
            email_verified: claims.email_verified,
            groups: claims.groups.clone(),
            connector_data: connector_data.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemStorage;
    use std::sync::Arc;

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let registry = ConnectorRegistry::with_builtins(Arc::new(MemStorage::new()));
        let err = registry.open("shibboleth", "x", b"{}").await.err().unwrap();
        assert!(matches!(err, ConnectorError::UnknownType(_)));
    }

    #[tokio::test]
    async fn malformed_config_is_rejected() {
        let registry = ConnectorRegistry::with_builtins(Arc::new(MemStorage::new()));
        let err = registry
            .open("mockPassword", "m", b"not json")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectorError::Config(_)));
    }

    #[tokio::test]
    async fn builtin_types_are_registered() {
        let registry = ConnectorRegistry::with_builtins(Arc::new(MemStorage::new()));
        for type_ in ["local", "mockCallback", "mockPassword", "oidc"] {
            assert!(registry.supports(type_), "missing builtin {type_}");
        }
    }
}
