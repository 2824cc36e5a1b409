//! Upstream OpenID Connect connector.
//!
//! Federates login to any spec-compliant OIDC provider: discovery, the
//! authorization-code exchange, ID-token signature validation, and refresh
//! via the upstream refresh token carried in connector data. Claim mapping
//! is configurable per deployment (`userNameKey`, `preferredUsernameKey`,
//! `groupsKey`) so nonstandard providers need config, not code.

use super::{
    CallbackConnector, CallbackParams, Connector, ConnectorError, ConnectorOpener, Identity,
    RefreshConnector, Scopes,
};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use openidconnect::core::{CoreAuthenticationFlow, CoreClient, CoreProviderMetadata};
use openidconnect::{
    AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointMaybeSet, EndpointNotSet,
    EndpointSet, IssuerUrl, Nonce, OAuth2TokenResponse, RedirectUrl,
    RefreshToken as OidcRefreshToken, Scope, TokenResponse,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// HTTP client for OIDC requests. Redirects are never followed; every
/// provider endpoint must answer directly.
fn http_client() -> Result<reqwest::Client, ConnectorError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ConnectorError::Upstream(e.to_string()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OidcConfig {
    pub issuer: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Trust the provider even when it omits `email_verified`.
    #[serde(default)]
    pub insecure_skip_email_verified: bool,
    #[serde(default)]
    pub user_name_key: Option<String>,
    #[serde(default)]
    pub preferred_username_key: Option<String>,
    #[serde(default)]
    pub groups_key: Option<String>,
}

/// Continuation state round-tripped through storage between logins.
#[derive(Debug, Default, Serialize, Deserialize)]
struct OidcConnectorData {
    refresh_token: Option<String>,
}

/// Endpoint-state of a client built from discovered provider metadata.
type DiscoveredClient = CoreClient<
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointMaybeSet,
    EndpointMaybeSet,
>;

pub struct OidcOpener;

#[async_trait]
impl ConnectorOpener for OidcOpener {
    async fn open(
        &self,
        id: &str,
        config: serde_json::Value,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        let config: OidcConfig =
            serde_json::from_value(config).map_err(|e| ConnectorError::Config(e.to_string()))?;
        OidcConnector::open(id, config)
            .await
            .map(|c| Box::new(c) as Box<dyn Connector>)
    }
}

pub struct OidcConnector {
    provider_metadata: CoreProviderMetadata,
    client_id: ClientId,
    client_secret: ClientSecret,
    scopes: Vec<String>,
    insecure_skip_email_verified: bool,
    user_name_key: String,
    preferred_username_key: String,
    groups_key: String,
}

impl OidcConnector {
    pub async fn open(id: &str, config: OidcConfig) -> Result<Self, ConnectorError> {
        info!("Discovering OIDC provider {} for connector {}", config.issuer, id);
        let issuer_url = IssuerUrl::new(config.issuer.clone())
            .map_err(|e| ConnectorError::Config(format!("invalid issuer: {e}")))?;
        let http = http_client()?;
        let provider_metadata = CoreProviderMetadata::discover_async(issuer_url, &http)
            .await
            .map_err(|e| ConnectorError::Upstream(format!("provider discovery: {e}")))?;

        let scopes = if config.scopes.is_empty() {
            vec!["profile".to_string(), "email".to_string()]
        } else {
            config.scopes
        };

        Ok(Self {
            provider_metadata,
            client_id: ClientId::new(config.client_id),
            client_secret: ClientSecret::new(config.client_secret),
            scopes,
            insecure_skip_email_verified: config.insecure_skip_email_verified,
            user_name_key: config.user_name_key.unwrap_or_else(|| "name".to_string()),
            preferred_username_key: config
                .preferred_username_key
                .unwrap_or_else(|| "preferred_username".to_string()),
            groups_key: config.groups_key.unwrap_or_else(|| "groups".to_string()),
        })
    }

    fn oauth_client(&self, redirect_url: Option<RedirectUrl>) -> DiscoveredClient {
        let client = CoreClient::from_provider_metadata(
            self.provider_metadata.clone(),
            self.client_id.clone(),
            Some(self.client_secret.clone()),
        );
        match redirect_url {
            Some(url) => client.set_redirect_uri(url),
            None => client,
        }
    }

    /// Maps the verified ID-token payload onto an identity using the
    /// configured claim keys.
    fn identity_from_payload(
        &self,
        payload: &serde_json::Value,
        connector_data: Vec<u8>,
    ) -> Result<Identity, ConnectorError> {
        let sub = payload["sub"]
            .as_str()
            .ok_or_else(|| ConnectorError::Upstream("id_token has no sub claim".to_string()))?;
        let email = payload["email"].as_str().unwrap_or_default();
        let email_verified = if self.insecure_skip_email_verified {
            true
        } else {
            payload["email_verified"].as_bool().unwrap_or(false)
        };
        let username = payload[&self.user_name_key]
            .as_str()
            .unwrap_or(email)
            .to_string();
        let preferred_username = payload[&self.preferred_username_key]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let groups = match &payload[&self.groups_key] {
            serde_json::Value::Array(values) => values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            // Some providers emit a single group as a bare string.
            serde_json::Value::String(one) => vec![one.clone()],
            _ => Vec::new(),
        };

        Ok(Identity {
            user_id: sub.to_string(),
            username,
            preferred_username,
            email: email.to_string(),
            email_verified,
            groups,
            connector_data,
        })
    }
}

/// Decodes the payload segment of a JWS compact serialization. Signature
/// validation has already happened through the provider's JWKS; this only
/// exposes nonstandard claims for the configurable mapping.
fn raw_payload(id_token: &str) -> Result<serde_json::Value, ConnectorError> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| ConnectorError::Upstream("malformed id_token".to_string()))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| ConnectorError::Upstream(format!("malformed id_token payload: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ConnectorError::Upstream(format!("malformed id_token payload: {e}")))
}

impl Connector for OidcConnector {
    fn as_callback(&self) -> Option<&dyn CallbackConnector> {
        Some(self)
    }
    fn as_refresh(&self) -> Option<&dyn RefreshConnector> {
        Some(self)
    }
}

#[async_trait]
impl CallbackConnector for OidcConnector {
    async fn login_url(
        &self,
        scopes: Scopes,
        callback_url: &str,
        state: &str,
    ) -> Result<String, ConnectorError> {
        let redirect = RedirectUrl::new(callback_url.to_string())
            .map_err(|e| ConnectorError::Config(format!("invalid callback URL: {e}")))?;
        let client = self.oauth_client(Some(redirect));

        let state = state.to_string();
        let mut request = client.authorize_url(
            CoreAuthenticationFlow::AuthorizationCode,
            move || CsrfToken::new(state.clone()),
            Nonce::new_random,
        );
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        if scopes.offline_access {
            request = request.add_scope(Scope::new("offline_access".to_string()));
        }
        let (url, _csrf, _nonce) = request.url();
        Ok(url.to_string())
    }

    async fn handle_callback(
        &self,
        _scopes: Scopes,
        params: &CallbackParams,
    ) -> Result<Identity, ConnectorError> {
        if let Some(error) = params.get("error") {
            let description = params
                .get("error_description")
                .map(String::as_str)
                .unwrap_or("");
            return Err(ConnectorError::Upstream(format!("{error}: {description}")));
        }
        let code = params
            .get("code")
            .ok_or_else(|| ConnectorError::Upstream("callback is missing code".to_string()))?;

        let client = self.oauth_client(None);
        let http = http_client()?;
        let response = client
            .exchange_code(AuthorizationCode::new(code.clone()))
            .context("token endpoint not advertised")
            .map_err(|e| ConnectorError::Upstream(e.to_string()))?
            .request_async(&http)
            .await
            .map_err(|e| ConnectorError::Upstream(format!("code exchange: {e}")))?;

        let id_token = response
            .id_token()
            .ok_or_else(|| ConnectorError::Upstream("provider returned no id_token".to_string()))?;

        // Verify signature and standard claims. Nonce binding is handled by
        // this IdP's own auth-request state, not replayed upstream.
        let verifier = client.id_token_verifier();
        id_token
            .claims(&verifier, |_: Option<&Nonce>| Ok(()))
            .map_err(|e| ConnectorError::Upstream(format!("id_token validation: {e}")))?;

        let payload = raw_payload(&id_token.to_string())?;
        debug!("Upstream identity resolved for sub {}", payload["sub"]);

        let data = OidcConnectorData {
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        };
        let connector_data =
            serde_json::to_vec(&data).map_err(|e| ConnectorError::Upstream(e.to_string()))?;
        self.identity_from_payload(&payload, connector_data)
    }
}

#[async_trait]
impl RefreshConnector for OidcConnector {
    async fn refresh(
        &self,
        _scopes: Scopes,
        identity: Identity,
    ) -> Result<Identity, ConnectorError> {
        let data: OidcConnectorData = if identity.connector_data.is_empty() {
            OidcConnectorData::default()
        } else {
            serde_json::from_slice(&identity.connector_data)
                .map_err(|e| ConnectorError::Upstream(e.to_string()))?
        };
        let Some(refresh_token) = data.refresh_token else {
            // Nothing to ask upstream; the stored claims stay authoritative.
            return Ok(identity);
        };

        let client = self.oauth_client(None);
        let http = http_client()?;
        let response = client
            .exchange_refresh_token(&OidcRefreshToken::new(refresh_token.clone()))
            .map_err(|e| ConnectorError::Upstream(e.to_string()))?
            .request_async(&http)
            .await
            .map_err(|e| ConnectorError::Upstream(format!("upstream refresh: {e}")))?;

        let data = OidcConnectorData {
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().clone())
                .or(Some(refresh_token)),
        };
        let connector_data =
            serde_json::to_vec(&data).map_err(|e| ConnectorError::Upstream(e.to_string()))?;

        match response.id_token() {
            Some(id_token) => {
                let verifier = client.id_token_verifier();
                id_token
                    .claims(&verifier, |_: Option<&Nonce>| Ok(()))
                    .map_err(|e| ConnectorError::Upstream(format!("id_token validation: {e}")))?;
                let payload = raw_payload(&id_token.to_string())?;
                self.identity_from_payload(&payload, connector_data)
            }
            // Provider rotated the refresh token without a fresh id_token.
            None => Ok(Identity {
                connector_data,
                ..identity
            }),
        }
    }
}
