//! Protocol-engine configuration and shared OAuth2 vocabulary.

use chrono::Duration;

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_EMAIL: &str = "email";
pub const SCOPE_PROFILE: &str = "profile";
pub const SCOPE_GROUPS: &str = "groups";
pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";
pub const SCOPE_FEDERATED_ID: &str = "federated:id";
/// Cross-client scope prefix; the suffix names the audience client.
pub const SCOPE_AUDIENCE_PREFIX: &str = "audience:server:client_id:";

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const GRANT_PASSWORD: &str = "password";
pub const GRANT_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
pub const GRANT_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

pub const RESPONSE_TYPE_CODE: &str = "code";
pub const RESPONSE_TYPE_ID_TOKEN: &str = "id_token";
pub const RESPONSE_TYPE_TOKEN: &str = "token";

/// Pseudo redirect URI registered for the device flow; resolved against
/// the issuer at redirect time.
pub const DEVICE_CALLBACK_URI: &str = "/device/callback";

pub const TOKEN_TYPE_ID_TOKEN: &str = "urn:ietf:params:oauth:token-type:id_token";
pub const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Refresh-token lifecycle policy.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// Keep one fixed secret instead of rotating per use.
    pub disable_rotation: bool,
    /// Window during which the previous secret is accepted idempotently.
    pub reuse_interval: Duration,
    /// Hard cap on total token lifetime; `None` disables.
    pub absolute_lifetime: Option<Duration>,
    /// Idle timeout; `None` disables.
    pub valid_if_not_used_for: Option<Duration>,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            disable_rotation: false,
            reuse_interval: Duration::seconds(30),
            absolute_lifetime: None,
            valid_if_not_used_for: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Canonical external URL of this IdP; every advertised endpoint hangs
    /// off it and the `iss` claim equals it byte for byte.
    pub issuer: String,
    pub supported_response_types: Vec<String>,
    pub allowed_grant_types: Vec<String>,
    pub skip_approval_screen: bool,
    pub always_show_login_screen: bool,
    /// Connector backing the password grant; the grant is disabled when
    /// unset.
    pub password_connector: Option<String>,
    pub auth_requests_valid_for: Duration,
    pub auth_codes_valid_for: Duration,
    pub id_tokens_valid_for: Duration,
    pub device_requests_valid_for: Duration,
    pub refresh: RefreshPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            issuer: "http://127.0.0.1:5556".to_string(),
            supported_response_types: vec![RESPONSE_TYPE_CODE.to_string()],
            allowed_grant_types: default_grant_types(),
            skip_approval_screen: false,
            always_show_login_screen: false,
            password_connector: None,
            auth_requests_valid_for: Duration::hours(24),
            auth_codes_valid_for: Duration::minutes(5),
            id_tokens_valid_for: Duration::hours(24),
            device_requests_valid_for: Duration::minutes(5),
            refresh: RefreshPolicy::default(),
        }
    }
}

/// Grants enabled when the config does not name any. Token exchange is
/// opt-in only.
pub fn default_grant_types() -> Vec<String> {
    vec![
        GRANT_AUTHORIZATION_CODE.to_string(),
        GRANT_REFRESH_TOKEN.to_string(),
        GRANT_DEVICE_CODE.to_string(),
        GRANT_PASSWORD.to_string(),
    ]
}

impl ServerConfig {
    pub fn absolute_url(&self, path: &str) -> String {
        format!("{}{}", self.issuer.trim_end_matches('/'), path)
    }

    pub fn grant_allowed(&self, grant_type: &str) -> bool {
        self.allowed_grant_types.iter().any(|g| g == grant_type)
    }
}

/// Scope vocabulary check used by the authorize and token endpoints.
pub fn is_recognized_scope(scope: &str) -> bool {
    matches!(
        scope,
        SCOPE_OPENID | SCOPE_EMAIL | SCOPE_PROFILE | SCOPE_GROUPS | SCOPE_OFFLINE_ACCESS
            | SCOPE_FEDERATED_ID
    ) || scope.starts_with(SCOPE_AUDIENCE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_scopes_are_recognized() {
        assert!(is_recognized_scope("audience:server:client_id:other-app"));
        assert!(is_recognized_scope("openid"));
        assert!(!is_recognized_scope("calendar.read"));
    }

    #[test]
    fn token_exchange_is_not_a_default_grant() {
        let config = ServerConfig::default();
        assert!(config.grant_allowed(GRANT_AUTHORIZATION_CODE));
        assert!(!config.grant_allowed(GRANT_TOKEN_EXCHANGE));
    }

    #[test]
    fn absolute_url_joins_cleanly() {
        let config = ServerConfig {
            issuer: "https://idp.example.com/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.absolute_url("/auth"), "https://idp.example.com/auth");
    }
}
