//! Pluggable storage for all durable state.
//!
//! Every backend implements the same [`Storage`] trait: plain CRUD plus
//! optimistic update-via-updater semantics. The updater closure sees a
//! consistent snapshot of the row and either its return value replaces the
//! row atomically or the whole call has no effect. Backends must pass the
//! shared conformance suite.

pub mod encrypt;
pub mod memory;
pub mod models;
pub mod overlay;
pub mod sql;

#[cfg(test)]
pub mod conformance;

use chrono::{DateTime, Utc};
use rand::RngCore;
use thiserror::Error;

pub use models::*;

/// Error kinds shared by all backends. Protocol code matches on these,
/// never on message strings.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("update conflict")]
    Conflict,
    #[error("storage error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        StorageError::Internal(err.to_string())
    }
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Updater closure passed to the `update_*` family. Must be a pure
/// old -> new transformation; backends may invoke it more than once when
/// retrying optimistic-concurrency conflicts.
pub type Updater<'a, T> = &'a mut dyn FnMut(T) -> Result<T>;

/// The uniform storage interface consumed by every other component.
///
/// Implementations are `Send + Sync` and internally serialize mutations per
/// entity, so callers never need additional locking.
pub trait Storage: Send + Sync {
    // Clients.
    fn create_client(&self, client: Client) -> Result<()>;
    fn get_client(&self, id: &str) -> Result<Client>;
    fn list_clients(&self) -> Result<Vec<Client>>;
    fn update_client(&self, id: &str, f: Updater<Client>) -> Result<()>;
    fn delete_client(&self, id: &str) -> Result<()>;

    // Auth requests.
    fn create_auth_request(&self, req: AuthRequest) -> Result<()>;
    fn get_auth_request(&self, id: &str) -> Result<AuthRequest>;
    fn update_auth_request(&self, id: &str, f: Updater<AuthRequest>) -> Result<()>;
    fn delete_auth_request(&self, id: &str) -> Result<()>;

    // Auth codes.
    fn create_auth_code(&self, code: AuthCode) -> Result<()>;
    fn get_auth_code(&self, id: &str) -> Result<AuthCode>;
    fn delete_auth_code(&self, id: &str) -> Result<()>;

    // Refresh tokens.
    fn create_refresh_token(&self, token: RefreshToken) -> Result<()>;
    fn get_refresh_token(&self, id: &str) -> Result<RefreshToken>;
    fn list_refresh_tokens(&self) -> Result<Vec<RefreshToken>>;
    fn update_refresh_token(&self, id: &str, f: Updater<RefreshToken>) -> Result<()>;
    fn delete_refresh_token(&self, id: &str) -> Result<()>;

    // Passwords. The email key is normalized to lower case by every
    // implementation on create, get, update and delete.
    fn create_password(&self, password: Password) -> Result<()>;
    fn get_password(&self, email: &str) -> Result<Password>;
    fn list_passwords(&self) -> Result<Vec<Password>>;
    fn update_password(&self, email: &str, f: Updater<Password>) -> Result<()>;
    fn delete_password(&self, email: &str) -> Result<()>;

    // Offline sessions, keyed by (user_id, conn_id).
    fn create_offline_session(&self, session: OfflineSession) -> Result<()>;
    fn get_offline_session(&self, user_id: &str, conn_id: &str) -> Result<OfflineSession>;
    fn update_offline_session(
        &self,
        user_id: &str,
        conn_id: &str,
        f: Updater<OfflineSession>,
    ) -> Result<()>;
    fn delete_offline_session(&self, user_id: &str, conn_id: &str) -> Result<()>;

    // Connectors.
    fn create_connector(&self, connector: ConnectorRecord) -> Result<()>;
    fn get_connector(&self, id: &str) -> Result<ConnectorRecord>;
    fn list_connectors(&self) -> Result<Vec<ConnectorRecord>>;
    fn update_connector(&self, id: &str, f: Updater<ConnectorRecord>) -> Result<()>;
    fn delete_connector(&self, id: &str) -> Result<()>;

    // Device flow.
    fn create_device_request(&self, req: DeviceRequest) -> Result<()>;
    fn get_device_request(&self, user_code: &str) -> Result<DeviceRequest>;
    fn create_device_token(&self, token: DeviceToken) -> Result<()>;
    fn get_device_token(&self, device_code: &str) -> Result<DeviceToken>;
    fn update_device_token(&self, device_code: &str, f: Updater<DeviceToken>) -> Result<()>;
    fn delete_device_token(&self, device_code: &str) -> Result<()>;
    fn delete_device_request(&self, user_code: &str) -> Result<()>;

    // The singleton signing-key row. The updater receives `None` when the
    // row has never been written; its return value is inserted.
    fn get_keys(&self) -> Result<Keys>;
    fn update_keys(&self, f: &mut dyn FnMut(Option<Keys>) -> Result<Keys>) -> Result<()>;

    /// Deletes every auth request, auth code, device request and device
    /// token whose expiry is strictly before `now`. Idempotent and safe to
    /// run concurrently with any other operation.
    fn garbage_collect(&self, now: DateTime<Utc>) -> Result<GcResult>;
}

/// Length of generated entity IDs, before encoding.
const ID_BYTES: usize = 16;

/// Returns a fresh URL-safe opaque identifier.
///
/// 128 bits of `OsRng` output, hex-encoded. Used for auth request IDs, auth
/// codes, refresh token IDs and secrets.
pub fn new_id() -> String {
    let mut buf = [0u8; ID_BYTES];
    rand::rng().fill_bytes(&mut buf);
    hex_encode(&buf)
}

/// Returns a fresh 32-byte secret, base64url encoded (no padding).
pub fn new_secret() -> String {
    use base64::Engine;
    let mut buf = [0u8; 32];
    rand::rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Returns a fresh per-request HMAC key.
pub fn new_hmac_key() -> Vec<u8> {
    let mut buf = vec![0u8; 32];
    rand::rng().fill_bytes(&mut buf);
    buf
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_url_safe() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), ID_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn secrets_are_url_safe() {
        let s = new_secret();
        assert!(!s.contains('+'));
        assert!(!s.contains('/'));
        assert!(!s.contains('='));
    }
}
