//! Read-only overlay for statically configured clients, passwords and
//! connectors.
//!
//! Entries declared in the config document shadow the backing store: reads
//! prefer the overlay, lists merge with overlay precedence, and any write
//! addressing an overlaid ID is rejected so the config file stays the
//! single source of truth for those entries.

use super::{
    AuthCode, AuthRequest, Client, ConnectorRecord, DeviceRequest, DeviceToken, GcResult, Keys,
    OfflineSession, Password, RefreshToken, Result, Storage, StorageError, Updater,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

pub struct StaticStorage {
    inner: Arc<dyn Storage>,
    clients: HashMap<String, Client>,
    passwords: HashMap<String, Password>,
    connectors: HashMap<String, ConnectorRecord>,
}

impl StaticStorage {
    pub fn new(
        inner: Arc<dyn Storage>,
        clients: Vec<Client>,
        passwords: Vec<Password>,
        connectors: Vec<ConnectorRecord>,
    ) -> Self {
        Self {
            inner,
            clients: clients.into_iter().map(|c| (c.id.clone(), c)).collect(),
            passwords: passwords
                .into_iter()
                .map(|mut p| {
                    p.email = p.email.to_lowercase();
                    (p.email.clone(), p)
                })
                .collect(),
            connectors: connectors.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    fn read_only(kind: &str, id: &str) -> StorageError {
        StorageError::Internal(format!(
            "{} {:?} is defined in the static config and is read-only",
            kind, id
        ))
    }
}

impl Storage for StaticStorage {
    fn create_client(&self, client: Client) -> Result<()> {
        if self.clients.contains_key(&client.id) {
            return Err(StorageError::AlreadyExists);
        }
        self.inner.create_client(client)
    }

    fn get_client(&self, id: &str) -> Result<Client> {
        match self.clients.get(id) {
            Some(client) => Ok(client.clone()),
            None => self.inner.get_client(id),
        }
    }

    fn list_clients(&self) -> Result<Vec<Client>> {
        let mut out: Vec<Client> = self
            .inner
            .list_clients()?
            .into_iter()
            .filter(|c| !self.clients.contains_key(&c.id))
            .collect();
        out.extend(self.clients.values().cloned());
        Ok(out)
    }

    fn update_client(&self, id: &str, f: Updater<Client>) -> Result<()> {
        if self.clients.contains_key(id) {
            return Err(Self::read_only("client", id));
        }
        self.inner.update_client(id, f)
    }

    fn delete_client(&self, id: &str) -> Result<()> {
        if self.clients.contains_key(id) {
            return Err(Self::read_only("client", id));
        }
        self.inner.delete_client(id)
    }

    fn create_auth_request(&self, req: AuthRequest) -> Result<()> {
        self.inner.create_auth_request(req)
    }

    fn get_auth_request(&self, id: &str) -> Result<AuthRequest> {
        self.inner.get_auth_request(id)
    }

    fn update_auth_request(&self, id: &str, f: Updater<AuthRequest>) -> Result<()> {
        self.inner.update_auth_request(id, f)
    }

    fn delete_auth_request(&self, id: &str) -> Result<()> {
        self.inner.delete_auth_request(id)
    }

    fn create_auth_code(&self, code: AuthCode) -> Result<()> {
        self.inner.create_auth_code(code)
    }

    fn get_auth_code(&self, id: &str) -> Result<AuthCode> {
        self.inner.get_auth_code(id)
    }

    fn delete_auth_code(&self, id: &str) -> Result<()> {
        self.inner.delete_auth_code(id)
    }

    fn create_refresh_token(&self, token: RefreshToken) -> Result<()> {
        self.inner.create_refresh_token(token)
    }

    fn get_refresh_token(&self, id: &str) -> Result<RefreshToken> {
        self.inner.get_refresh_token(id)
    }

    fn list_refresh_tokens(&self) -> Result<Vec<RefreshToken>> {
        self.inner.list_refresh_tokens()
    }

    fn update_refresh_token(&self, id: &str, f: Updater<RefreshToken>) -> Result<()> {
        self.inner.update_refresh_token(id, f)
    }

    fn delete_refresh_token(&self, id: &str) -> Result<()> {
        self.inner.delete_refresh_token(id)
    }

    fn create_password(&self, password: Password) -> Result<()> {
        if self.passwords.contains_key(&password.email.to_lowercase()) {
            return Err(StorageError::AlreadyExists);
        }
        self.inner.create_password(password)
    }

    fn get_password(&self, email: &str) -> Result<Password> {
        match self.passwords.get(&email.to_lowercase()) {
            Some(password) => Ok(password.clone()),
            None => self.inner.get_password(email),
        }
    }

    fn list_passwords(&self) -> Result<Vec<Password>> {
        let mut out: Vec<Password> = self
            .inner
            .list_passwords()?
            .into_iter()
            .filter(|p| !self.passwords.contains_key(&p.email))
            .collect();
        out.extend(self.passwords.values().cloned());
        Ok(out)
    }

    fn update_password(&self, email: &str, f: Updater<Password>) -> Result<()> {
        if self.passwords.contains_key(&email.to_lowercase()) {
            return Err(Self::read_only("password", email));
        }
        self.inner.update_password(email, f)
    }

    fn delete_password(&self, email: &str) -> Result<()> {
        if self.passwords.contains_key(&email.to_lowercase()) {
            return Err(Self::read_only("password", email));
        }
        self.inner.delete_password(email)
    }

    fn create_offline_session(&self, session: OfflineSession) -> Result<()> {
        self.inner.create_offline_session(session)
    }

    fn get_offline_session(&self, user_id: &str, conn_id: &str) -> Result<OfflineSession> {
        self.inner.get_offline_session(user_id, conn_id)
    }

    fn update_offline_session(
        &self,
        user_id: &str,
        conn_id: &str,
        f: Updater<OfflineSession>,
    ) -> Result<()> {
        self.inner.update_offline_session(user_id, conn_id, f)
    }

    fn delete_offline_session(&self, user_id: &str, conn_id: &str) -> Result<()> {
        self.inner.delete_offline_session(user_id, conn_id)
    }

    fn create_connector(&self, connector: ConnectorRecord) -> Result<()> {
        if self.connectors.contains_key(&connector.id) {
            return Err(StorageError::AlreadyExists);
        }
        self.inner.create_connector(connector)
    }

    fn get_connector(&self, id: &str) -> Result<ConnectorRecord> {
        match self.connectors.get(id) {
            Some(rec) => Ok(rec.clone()),
            None => self.inner.get_connector(id),
        }
    }

    fn list_connectors(&self) -> Result<Vec<ConnectorRecord>> {
        let mut out: Vec<ConnectorRecord> = self
            .inner
            .list_connectors()?
            .into_iter()
            .filter(|c| !self.connectors.contains_key(&c.id))
            .collect();
        out.extend(self.connectors.values().cloned());
        Ok(out)
    }

    fn update_connector(&self, id: &str, f: Updater<ConnectorRecord>) -> Result<()> {
        if self.connectors.contains_key(id) {
            return Err(Self::read_only("connector", id));
        }
        self.inner.update_connector(id, f)
    }

    fn delete_connector(&self, id: &str) -> Result<()> {
        if self.connectors.contains_key(id) {
            return Err(Self::read_only("connector", id));
        }
        self.inner.delete_connector(id)
    }

    fn create_device_request(&self, req: DeviceRequest) -> Result<()> {
        self.inner.create_device_request(req)
    }

    fn get_device_request(&self, user_code: &str) -> Result<DeviceRequest> {
        self.inner.get_device_request(user_code)
    }

    fn create_device_token(&self, token: DeviceToken) -> Result<()> {
        self.inner.create_device_token(token)
    }

    fn get_device_token(&self, device_code: &str) -> Result<DeviceToken> {
        self.inner.get_device_token(device_code)
    }

    fn update_device_token(&self, device_code: &str, f: Updater<DeviceToken>) -> Result<()> {
        self.inner.update_device_token(device_code, f)
    }

    fn delete_device_token(&self, device_code: &str) -> Result<()> {
        self.inner.delete_device_token(device_code)
    }

    fn delete_device_request(&self, user_code: &str) -> Result<()> {
        self.inner.delete_device_request(user_code)
    }

    fn get_keys(&self) -> Result<Keys> {
        self.inner.get_keys()
    }

    fn update_keys(&self, f: &mut dyn FnMut(Option<Keys>) -> Result<Keys>) -> Result<()> {
        self.inner.update_keys(f)
    }

    fn garbage_collect(&self, now: DateTime<Utc>) -> Result<GcResult> {
        self.inner.garbage_collect(now)
    }
}

#[cfg(test)]
mod tests {
    use super::super::memory::MemStorage;
    use super::*;

    fn overlay() -> StaticStorage {
        StaticStorage::new(
            Arc::new(MemStorage::new()),
            vec![Client {
                id: "static-app".to_string(),
                secret: "s".to_string(),
                redirect_uris: vec![],
                trusted_peers: vec![],
                public: false,
                name: "Static".to_string(),
                logo_url: String::new(),
            }],
            vec![Password {
                email: "Admin@Example.com".to_string(),
                hash: b"$2a$10$x".to_vec(),
                username: "admin".to_string(),
                user_id: "admin-id".to_string(),
            }],
            vec![],
        )
    }

    #[test]
    fn reads_prefer_overlay() {
        let s = overlay();
        assert_eq!(s.get_client("static-app").unwrap().name, "Static");
        assert_eq!(s.get_password("admin@example.com").unwrap().user_id, "admin-id");
    }

    #[test]
    fn writes_to_overlaid_ids_are_rejected() {
        let s = overlay();
        assert!(matches!(
            s.create_client(Client {
                id: "static-app".to_string(),
                ..Default::default()
            }),
            Err(StorageError::AlreadyExists)
        ));
        assert!(s.delete_client("static-app").is_err());
        assert!(s
            .update_client("static-app", &mut |c| Ok(c))
            .is_err());
    }

    #[test]
    fn lists_merge_with_overlay_precedence() {
        let s = overlay();
        s.create_client(Client {
            id: "dynamic-app".to_string(),
            ..Default::default()
        })
        .unwrap();
        let ids: Vec<String> = s.list_clients().unwrap().into_iter().map(|c| c.id).collect();
        assert!(ids.contains(&"static-app".to_string()));
        assert!(ids.contains(&"dynamic-app".to_string()));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn dynamic_entries_pass_through() {
        let s = overlay();
        s.create_password(Password {
            email: "user@example.com".to_string(),
            hash: b"$2a$10$y".to_vec(),
            username: "user".to_string(),
            user_id: "user-id".to_string(),
        })
        .unwrap();
        assert_eq!(s.get_password("user@example.com").unwrap().username, "user");
        s.delete_password("user@example.com").unwrap();
    }
}
