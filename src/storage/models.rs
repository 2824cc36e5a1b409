//! Entities persisted by every storage backend.
//!
//! Composite fields are stored as JSON columns in SQL backends, so all types
//! here derive Serialize/Deserialize and round-trip losslessly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A registered downstream OAuth2 client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    /// Shared secret; empty iff `public` is set.
    pub secret: String,
    pub redirect_uris: Vec<String>,
    /// Client IDs allowed to mint tokens with this client as audience.
    pub trusted_peers: Vec<String>,
    /// Public clients authenticate with PKCE instead of a secret.
    pub public: bool,
    pub name: String,
    pub logo_url: String,
}

/// A local password record, used by the built-in "local" connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Password {
    /// Primary key. Always stored lower-cased.
    pub email: String,
    /// A bcrypt digest (`$2a$...`).
    pub hash: Vec<u8>,
    pub username: String,
    pub user_id: String,
}

/// A persisted connector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub name: String,
    /// Optimistic-concurrency token maintained by the backend.
    pub resource_version: String,
    /// JSON config blob, shape owned by the connector type. May be
    /// encrypted at rest by SQL backends.
    pub config: Vec<u8>,
}

/// Identity claims captured from an upstream connector.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub username: String,
    pub preferred_username: String,
    pub email: String,
    pub email_verified: bool,
    pub groups: Vec<String>,
}

/// PKCE parameters bound to an auth request / auth code.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pkce {
    pub code_challenge: String,
    /// "", "plain" or "S256".
    pub code_challenge_method: String,
}

impl Pkce {
    pub fn is_set(&self) -> bool {
        !self.code_challenge.is_empty()
    }
}

/// An in-flight browser authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub id: String,
    pub client_id: String,
    pub response_types: Vec<String>,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    pub nonce: String,
    pub state: String,
    pub force_approval_prompt: bool,
    /// Set once the connector callback has supplied an identity.
    pub logged_in: bool,
    pub claims: Claims,
    pub connector_id: String,
    /// Opaque bytes the connector needs to refresh the identity later.
    pub connector_data: Vec<u8>,
    pub expiry: DateTime<Utc>,
    pub pkce: Pkce,
    /// Per-request MAC key binding the state handed to connectors.
    pub hmac_key: Vec<u8>,
}

/// A one-time code exchanged at the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCode {
    pub id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub nonce: String,
    pub redirect_uri: String,
    pub claims: Claims,
    pub connector_id: String,
    pub connector_data: Vec<u8>,
    pub expiry: DateTime<Utc>,
    pub pkce: Pkce,
}

/// A long-lived refresh token with rotating secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: String,
    /// Current secret.
    pub token: String,
    /// Previous secret, accepted during the reuse-overlap window.
    pub obsolete_token: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub nonce: String,
    pub claims: Claims,
    pub connector_id: String,
    pub connector_data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Reference to a refresh token held inside an offline session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRef {
    pub id: String,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Per (user, connector) aggregate of refresh state across clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineSession {
    pub user_id: String,
    pub conn_id: String,
    /// client_id -> refresh token reference.
    pub refresh: HashMap<String, RefreshTokenRef>,
    pub connector_data: Vec<u8>,
}

/// RFC 8628 device authorization request, keyed by user code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub user_code: String,
    pub device_code: String,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub expiry: DateTime<Utc>,
}

/// Status of a device token poll record.
pub const DEVICE_TOKEN_PENDING: &str = "pending";
pub const DEVICE_TOKEN_COMPLETE: &str = "complete";

/// RFC 8628 device token state, keyed by device code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub device_code: String,
    pub status: String,
    /// Serialized token response once status is "complete".
    pub token: String,
    pub expiry: DateTime<Utc>,
    pub last_request: DateTime<Utc>,
    pub poll_interval_seconds: i64,
    pub pkce: Pkce,
}

/// Private signing key material plus its key ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKey {
    pub kid: String,
    /// PKCS#1 DER private key.
    pub private_der: Vec<u8>,
    /// PKCS#1 DER public key.
    pub public_der: Vec<u8>,
}

/// A demoted public key retained for the ID-token validity window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationKey {
    pub kid: String,
    pub public_der: Vec<u8>,
    pub expiry: DateTime<Utc>,
}

/// The singleton signing-key row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keys {
    pub signing_key: Option<SigningKey>,
    pub verification_keys: Vec<VerificationKey>,
    pub next_rotation: DateTime<Utc>,
}

/// Counts of rows removed by a garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcResult {
    pub auth_requests: u64,
    pub auth_codes: u64,
    pub device_requests: u64,
    pub device_tokens: u64,
}

impl GcResult {
    pub fn is_empty(&self) -> bool {
        self.auth_requests == 0
            && self.auth_codes == 0
            && self.device_requests == 0
            && self.device_tokens == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_json_round_trip() {
        let client = Client {
            id: "example-app".to_string(),
            secret: "ZXhhbXBsZS1hcHAtc2VjcmV0".to_string(),
            redirect_uris: vec!["http://127.0.0.1:5555/callback".to_string()],
            trusted_peers: vec!["other-app".to_string()],
            public: false,
            name: "Example App".to_string(),
            logo_url: String::new(),
        };
        let json = serde_json::to_string(&client).unwrap();
        let back: Client = serde_json::from_str(&json).unwrap();
        assert_eq!(client, back);
    }

    #[test]
    fn connector_record_type_field_name() {
        let rec = ConnectorRecord {
            id: "github".to_string(),
            type_: "github".to_string(),
            name: "GitHub".to_string(),
            resource_version: "1".to_string(),
            config: b"{}".to_vec(),
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json.get("type").is_some());
        assert!(json.get("type_").is_none());
    }
}
