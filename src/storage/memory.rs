//! In-memory storage backend.
//!
//! Every operation takes the single interior mutex, which trivially gives
//! the updater-atomicity contract. Intended for tests and single-instance
//! evaluation deployments; state is lost on restart.

use super::{
    AuthCode, AuthRequest, Client, ConnectorRecord, DeviceRequest, DeviceToken, GcResult, Keys,
    OfflineSession, Password, RefreshToken, Result, Storage, StorageError, Updater,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    clients: HashMap<String, Client>,
    auth_requests: HashMap<String, AuthRequest>,
    auth_codes: HashMap<String, AuthCode>,
    refresh_tokens: HashMap<String, RefreshToken>,
    passwords: HashMap<String, Password>,
    offline_sessions: HashMap<(String, String), OfflineSession>,
    connectors: HashMap<String, ConnectorRecord>,
    device_requests: HashMap<String, DeviceRequest>,
    device_tokens: HashMap<String, DeviceToken>,
    keys: Option<Keys>,
}

#[derive(Default)]
pub struct MemStorage {
    inner: Mutex<Inner>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn create<T>(map: &mut HashMap<String, T>, key: String, value: T) -> Result<()> {
    if map.contains_key(&key) {
        return Err(StorageError::AlreadyExists);
    }
    map.insert(key, value);
    Ok(())
}

fn get<T: Clone>(map: &HashMap<String, T>, key: &str) -> Result<T> {
    map.get(key).cloned().ok_or(StorageError::NotFound)
}

fn delete<T>(map: &mut HashMap<String, T>, key: &str) -> Result<()> {
    map.remove(key).map(|_| ()).ok_or(StorageError::NotFound)
}

fn update<T: Clone>(map: &mut HashMap<String, T>, key: &str, f: Updater<T>) -> Result<()> {
    let old = map.get(key).cloned().ok_or(StorageError::NotFound)?;
    let new = f(old)?;
    map.insert(key.to_string(), new);
    Ok(())
}

impl Storage for MemStorage {
    fn create_client(&self, client: Client) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        create(&mut inner.clients, client.id.clone(), client)
    }

    fn get_client(&self, id: &str) -> Result<Client> {
        get(&self.inner.lock().unwrap().clients, id)
    }

    fn list_clients(&self) -> Result<Vec<Client>> {
        Ok(self.inner.lock().unwrap().clients.values().cloned().collect())
    }

    fn update_client(&self, id: &str, f: Updater<Client>) -> Result<()> {
        update(&mut self.inner.lock().unwrap().clients, id, f)
    }

    fn delete_client(&self, id: &str) -> Result<()> {
        delete(&mut self.inner.lock().unwrap().clients, id)
    }

    fn create_auth_request(&self, req: AuthRequest) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        create(&mut inner.auth_requests, req.id.clone(), req)
    }

    fn get_auth_request(&self, id: &str) -> Result<AuthRequest> {
        get(&self.inner.lock().unwrap().auth_requests, id)
    }

    fn update_auth_request(&self, id: &str, f: Updater<AuthRequest>) -> Result<()> {
        update(&mut self.inner.lock().unwrap().auth_requests, id, f)
    }

    fn delete_auth_request(&self, id: &str) -> Result<()> {
        delete(&mut self.inner.lock().unwrap().auth_requests, id)
    }

    fn create_auth_code(&self, code: AuthCode) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        create(&mut inner.auth_codes, code.id.clone(), code)
    }

    fn get_auth_code(&self, id: &str) -> Result<AuthCode> {
        get(&self.inner.lock().unwrap().auth_codes, id)
    }

    fn delete_auth_code(&self, id: &str) -> Result<()> {
        delete(&mut self.inner.lock().unwrap().auth_codes, id)
    }

    fn create_refresh_token(&self, token: RefreshToken) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        create(&mut inner.refresh_tokens, token.id.clone(), token)
    }

    fn get_refresh_token(&self, id: &str) -> Result<RefreshToken> {
        get(&self.inner.lock().unwrap().refresh_tokens, id)
    }

    fn list_refresh_tokens(&self) -> Result<Vec<RefreshToken>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .refresh_tokens
            .values()
            .cloned()
            .collect())
    }

    fn update_refresh_token(&self, id: &str, f: Updater<RefreshToken>) -> Result<()> {
        update(&mut self.inner.lock().unwrap().refresh_tokens, id, f)
    }

    fn delete_refresh_token(&self, id: &str) -> Result<()> {
        delete(&mut self.inner.lock().unwrap().refresh_tokens, id)
    }

    fn create_password(&self, mut password: Password) -> Result<()> {
        password.email = password.email.to_lowercase();
        let mut inner = self.inner.lock().unwrap();
        create(&mut inner.passwords, password.email.clone(), password)
    }

    fn get_password(&self, email: &str) -> Result<Password> {
        get(&self.inner.lock().unwrap().passwords, &email.to_lowercase())
    }

    fn list_passwords(&self) -> Result<Vec<Password>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .passwords
            .values()
            .cloned()
            .collect())
    }

    fn update_password(&self, email: &str, f: Updater<Password>) -> Result<()> {
        let email = email.to_lowercase();
        let mut inner = self.inner.lock().unwrap();
        let old = inner
            .passwords
            .get(&email)
            .cloned()
            .ok_or(StorageError::NotFound)?;
        let mut new = f(old)?;
        new.email = new.email.to_lowercase();
        inner.passwords.insert(email, new);
        Ok(())
    }

    fn delete_password(&self, email: &str) -> Result<()> {
        delete(
            &mut self.inner.lock().unwrap().passwords,
            &email.to_lowercase(),
        )
    }

    fn create_offline_session(&self, session: OfflineSession) -> Result<()> {
        let key = (session.user_id.clone(), session.conn_id.clone());
        let mut inner = self.inner.lock().unwrap();
        if inner.offline_sessions.contains_key(&key) {
            return Err(StorageError::AlreadyExists);
        }
        inner.offline_sessions.insert(key, session);
        Ok(())
    }

    fn get_offline_session(&self, user_id: &str, conn_id: &str) -> Result<OfflineSession> {
        self.inner
            .lock()
            .unwrap()
            .offline_sessions
            .get(&(user_id.to_string(), conn_id.to_string()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn update_offline_session(
        &self,
        user_id: &str,
        conn_id: &str,
        f: Updater<OfflineSession>,
    ) -> Result<()> {
        let key = (user_id.to_string(), conn_id.to_string());
        let mut inner = self.inner.lock().unwrap();
        let old = inner
            .offline_sessions
            .get(&key)
            .cloned()
            .ok_or(StorageError::NotFound)?;
        let new = f(old)?;
        inner.offline_sessions.insert(key, new);
        Ok(())
    }

    fn delete_offline_session(&self, user_id: &str, conn_id: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .offline_sessions
            .remove(&(user_id.to_string(), conn_id.to_string()))
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    fn create_connector(&self, connector: ConnectorRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        create(&mut inner.connectors, connector.id.clone(), connector)
    }

    fn get_connector(&self, id: &str) -> Result<ConnectorRecord> {
        get(&self.inner.lock().unwrap().connectors, id)
    }

    fn list_connectors(&self) -> Result<Vec<ConnectorRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .connectors
            .values()
            .cloned()
            .collect())
    }

    fn update_connector(&self, id: &str, f: Updater<ConnectorRecord>) -> Result<()> {
        update(&mut self.inner.lock().unwrap().connectors, id, f)
    }

    fn delete_connector(&self, id: &str) -> Result<()> {
        delete(&mut self.inner.lock().unwrap().connectors, id)
    }

    fn create_device_request(&self, req: DeviceRequest) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        create(&mut inner.device_requests, req.user_code.clone(), req)
    }

    fn get_device_request(&self, user_code: &str) -> Result<DeviceRequest> {
        get(&self.inner.lock().unwrap().device_requests, user_code)
    }

    fn create_device_token(&self, token: DeviceToken) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        create(&mut inner.device_tokens, token.device_code.clone(), token)
    }

    fn get_device_token(&self, device_code: &str) -> Result<DeviceToken> {
        get(&self.inner.lock().unwrap().device_tokens, device_code)
    }

    fn update_device_token(&self, device_code: &str, f: Updater<DeviceToken>) -> Result<()> {
        update(&mut self.inner.lock().unwrap().device_tokens, device_code, f)
    }

    fn delete_device_token(&self, device_code: &str) -> Result<()> {
        delete(&mut self.inner.lock().unwrap().device_tokens, device_code)
    }

    fn delete_device_request(&self, user_code: &str) -> Result<()> {
        delete(&mut self.inner.lock().unwrap().device_requests, user_code)
    }

    fn get_keys(&self) -> Result<Keys> {
        self.inner
            .lock()
            .unwrap()
            .keys
            .clone()
            .ok_or(StorageError::NotFound)
    }

    fn update_keys(&self, f: &mut dyn FnMut(Option<Keys>) -> Result<Keys>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let new = f(inner.keys.clone())?;
        inner.keys = Some(new);
        Ok(())
    }

    fn garbage_collect(&self, now: DateTime<Utc>) -> Result<GcResult> {
        let mut inner = self.inner.lock().unwrap();
        let mut result = GcResult::default();

        let before = inner.auth_requests.len();
        inner.auth_requests.retain(|_, r| r.expiry >= now);
        result.auth_requests = (before - inner.auth_requests.len()) as u64;

        let before = inner.auth_codes.len();
        inner.auth_codes.retain(|_, c| c.expiry >= now);
        result.auth_codes = (before - inner.auth_codes.len()) as u64;

        let before = inner.device_requests.len();
        inner.device_requests.retain(|_, r| r.expiry >= now);
        result.device_requests = (before - inner.device_requests.len()) as u64;

        let before = inner.device_tokens.len();
        inner.device_tokens.retain(|_, t| t.expiry >= now);
        result.device_tokens = (before - inner.device_tokens.len()) as u64;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::conformance;

    #[test]
    fn conformance_suite() {
        conformance::run_all(&MemStorage::new());
    }

    #[test]
    fn password_email_is_normalized() {
        let s = MemStorage::new();
        s.create_password(Password {
            email: "Admin@Example.com".to_string(),
            hash: b"$2a$10$x".to_vec(),
            username: "admin".to_string(),
            user_id: "123".to_string(),
        })
        .unwrap();
        let p = s.get_password("ADMIN@EXAMPLE.COM").unwrap();
        assert_eq!(p.email, "admin@example.com");
    }
}
