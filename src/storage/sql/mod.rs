//! SQL storage backend.
//!
//! Queries are written in Postgres dialect and rewritten per flavor by
//! [`dialect::Translator`]; the shipped driver is SQLite (rusqlite). The
//! whole backend runs on a single connection behind a mutex, which is also
//! what gives updaters their atomicity: each update runs in an IMMEDIATE
//! transaction, so the closure sees a consistent snapshot and either the
//! commit lands or nothing does.

pub mod dialect;
pub mod schema;

use super::encrypt::{self, Crypto};
use super::{
    AuthCode, AuthRequest, Client, ConnectorRecord, DeviceRequest, DeviceToken, GcResult, Keys,
    OfflineSession, Password, RefreshToken, Result, Storage, StorageError, Updater,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use dialect::Translator;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

/// Fixed primary key of the singleton keys row.
const KEYS_ROW_ID: &str = "openid-connect";

pub struct SqlStore {
    conn: Mutex<Connection>,
    translator: Translator,
    crypto: Option<Crypto>,
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound,
            _ if is_already_exists(&err) => StorageError::AlreadyExists,
            other => StorageError::Internal(other.to_string()),
        }
    }
}

/// Flavor-specific classification of driver duplicate-key errors, so the
/// uniform `AlreadyExists` contract holds.
fn is_already_exists(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn js<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(StorageError::internal)
}

fn unjs<T: DeserializeOwned>(bytes: Vec<u8>) -> Result<T> {
    serde_json::from_slice(&bytes).map_err(StorageError::internal)
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn unts(s: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(StorageError::internal)
}

impl SqlStore {
    /// Opens (creating if needed) the database at `path` and applies any
    /// pending migrations. `encryption_keys` enables connector-config
    /// encryption at rest; the first key encrypts, all keys decrypt.
    pub fn open(path: &Path, encryption_keys: Vec<[u8; 32]>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database at {:?}", path))?;
        Self::init(conn, encryption_keys)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?, Vec::new())
    }

    fn init(conn: Connection, encryption_keys: Vec<[u8; 32]>) -> anyhow::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let translator = Translator::new(&dialect::SQLITE);
        let applied = migrate(&conn, &translator)?;
        if applied > 0 {
            info!("Applied {} storage migration(s)", applied);
        }

        let crypto = if encryption_keys.is_empty() {
            None
        } else {
            Some(Crypto::new(encryption_keys)?)
        };

        let store = Self {
            conn: Mutex::new(conn),
            translator,
            crypto,
        };
        store.reencrypt_plaintext_connectors();
        Ok(store)
    }

    fn t(&self, query: &str) -> String {
        self.translator.translate(query)
    }

    /// Encrypts any connector row that still stores plaintext config.
    /// Per-row failures are logged and skipped so startup never aborts on
    /// one bad row.
    fn reencrypt_plaintext_connectors(&self) {
        let Some(crypto) = &self.crypto else { return };
        let rows = {
            let conn = self.conn.lock().unwrap();
            let q = self.t("select id, config from connector");
            let mut stmt = match conn.prepare(&q) {
                Ok(stmt) => stmt,
                Err(err) => {
                    warn!("Connector re-encryption scan failed: {}", err);
                    return;
                }
            };
            let rows: Vec<(String, Vec<u8>)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map(|iter| iter.filter_map(|r| r.ok()).collect())
                .unwrap_or_default();
            rows
        };

        for (id, config) in rows {
            if encrypt::has_encrypted_fields(&config) {
                continue;
            }
            let encrypted = match crypto.encrypt_config(&config) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("Could not encrypt config of connector {}: {}", id, err);
                    continue;
                }
            };
            let conn = self.conn.lock().unwrap();
            let q = self.t("update connector set config = $1 where id = $2");
            if let Err(err) = conn.execute(&q, params![encrypted, id]) {
                warn!("Could not store encrypted config of connector {}: {}", id, err);
            } else {
                info!("Encrypted config of connector {}", id);
            }
        }
    }

    fn encrypt_connector_config(&self, config: &[u8]) -> Result<Vec<u8>> {
        match &self.crypto {
            Some(crypto) => crypto.encrypt_config(config).map_err(StorageError::internal),
            None => Ok(config.to_vec()),
        }
    }

    fn decrypt_connector_config(&self, config: Vec<u8>) -> Result<Vec<u8>> {
        match &self.crypto {
            Some(crypto) if encrypt::has_encrypted_fields(&config) => crypto
                .decrypt_config(&config)
                .map_err(StorageError::internal),
            _ => Ok(config),
        }
    }
}

/// Applies pending migrations and returns how many ran.
fn migrate(conn: &Connection, translator: &Translator) -> anyhow::Result<usize> {
    conn.execute(&translator.translate(schema::MIGRATIONS_TABLE), [])?;

    let applied: Option<u32> = conn.query_row(
        &translator.translate("select max(num) from migrations"),
        [],
        |row| row.get(0),
    )?;
    let applied = applied.unwrap_or(0);

    let mut count = 0;
    for migration in schema::MIGRATIONS {
        if migration.num <= applied {
            continue;
        }
        if let Some(flavor) = migration.flavor {
            if flavor != dialect::SQLITE.name {
                continue;
            }
        }
        let tx = conn.unchecked_transaction()?;
        for stmt in migration.stmts {
            tx.execute(&translator.translate(stmt), [])
                .with_context(|| format!("migration {}", migration.num))?;
        }
        tx.execute(
            &translator.translate("insert into migrations (num, applied_at) values ($1, $2)"),
            params![migration.num, ts(&Utc::now())],
        )?;
        tx.commit()?;
        count += 1;
    }
    Ok(count)
}

fn client_from_row(row: &rusqlite::Row) -> rusqlite::Result<(Client, Vec<u8>, Vec<u8>)> {
    Ok((
        Client {
            id: row.get(0)?,
            secret: row.get(1)?,
            redirect_uris: Vec::new(),
            trusted_peers: Vec::new(),
            public: row.get(4)?,
            name: row.get(5)?,
            logo_url: row.get(6)?,
        },
        row.get(2)?,
        row.get(3)?,
    ))
}

fn finish_client((mut client, uris, peers): (Client, Vec<u8>, Vec<u8>)) -> Result<Client> {
    client.redirect_uris = unjs(uris)?;
    client.trusted_peers = unjs(peers)?;
    Ok(client)
}

const CLIENT_COLS: &str = "id, secret, redirect_uris, trusted_peers, public, name, logo_url";

fn auth_request_from_row(row: &rusqlite::Row) -> Result<AuthRequest> {
    Ok(AuthRequest {
        id: row.get::<_, String>(0)?,
        client_id: row.get(1)?,
        response_types: unjs(row.get::<_, Vec<u8>>(2)?)?,
        scopes: unjs(row.get::<_, Vec<u8>>(3)?)?,
        redirect_uri: row.get(4)?,
        nonce: row.get(5)?,
        state: row.get(6)?,
        force_approval_prompt: row.get(7)?,
        logged_in: row.get(8)?,
        claims: unjs(row.get::<_, Vec<u8>>(9)?)?,
        connector_id: row.get(10)?,
        connector_data: row.get(11)?,
        expiry: unts(row.get(12)?)?,
        pkce: super::Pkce {
            code_challenge: row.get(13)?,
            code_challenge_method: row.get(14)?,
        },
        hmac_key: row.get(15)?,
    })
}

const AUTH_REQUEST_COLS: &str = "id, client_id, response_types, scopes, redirect_uri, nonce, \
     state, force_approval_prompt, logged_in, claims, connector_id, connector_data, expiry, \
     code_challenge, code_challenge_method, hmac_key";

fn auth_code_from_row(row: &rusqlite::Row) -> Result<AuthCode> {
    Ok(AuthCode {
        id: row.get::<_, String>(0)?,
        client_id: row.get(1)?,
        scopes: unjs(row.get::<_, Vec<u8>>(2)?)?,
        nonce: row.get(3)?,
        redirect_uri: row.get(4)?,
        claims: unjs(row.get::<_, Vec<u8>>(5)?)?,
        connector_id: row.get(6)?,
        connector_data: row.get(7)?,
        expiry: unts(row.get(8)?)?,
        pkce: super::Pkce {
            code_challenge: row.get(9)?,
            code_challenge_method: row.get(10)?,
        },
    })
}

const AUTH_CODE_COLS: &str = "id, client_id, scopes, nonce, redirect_uri, claims, connector_id, \
     connector_data, expiry, code_challenge, code_challenge_method";

fn refresh_from_row(row: &rusqlite::Row) -> Result<RefreshToken> {
    Ok(RefreshToken {
        id: row.get::<_, String>(0)?,
        token: row.get(1)?,
        obsolete_token: row.get(2)?,
        client_id: row.get(3)?,
        scopes: unjs(row.get::<_, Vec<u8>>(4)?)?,
        nonce: row.get(5)?,
        claims: unjs(row.get::<_, Vec<u8>>(6)?)?,
        connector_id: row.get(7)?,
        connector_data: row.get(8)?,
        created_at: unts(row.get(9)?)?,
        last_used: unts(row.get(10)?)?,
    })
}

const REFRESH_COLS: &str = "id, token, obsolete_token, client_id, scopes, nonce, claims, \
     connector_id, connector_data, created_at, last_used";

fn device_token_from_row(row: &rusqlite::Row) -> Result<DeviceToken> {
    Ok(DeviceToken {
        device_code: row.get::<_, String>(0)?,
        status: row.get(1)?,
        token: String::from_utf8(row.get::<_, Vec<u8>>(2)?).map_err(StorageError::internal)?,
        expiry: unts(row.get(3)?)?,
        last_request: unts(row.get(4)?)?,
        poll_interval_seconds: row.get(5)?,
        pkce: super::Pkce {
            code_challenge: row.get(6)?,
            code_challenge_method: row.get(7)?,
        },
    })
}

const DEVICE_TOKEN_COLS: &str = "device_code, status, token, expiry, last_request, \
     poll_interval_seconds, code_challenge, code_challenge_method";

impl Storage for SqlStore {
    fn create_client(&self, client: Client) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(
            "insert into client (id, secret, redirect_uris, trusted_peers, public, name, logo_url) \
             values ($1, $2, $3, $4, $5, $6, $7)",
        );
        conn.execute(
            &q,
            params![
                client.id,
                client.secret,
                js(&client.redirect_uris)?,
                js(&client.trusted_peers)?,
                client.public,
                client.name,
                client.logo_url
            ],
        )?;
        Ok(())
    }

    fn get_client(&self, id: &str) -> Result<Client> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(&format!("select {} from client where id = $1", CLIENT_COLS));
        let raw = conn.query_row(&q, params![id], client_from_row)?;
        finish_client(raw)
    }

    fn list_clients(&self) -> Result<Vec<Client>> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(&format!("select {} from client", CLIENT_COLS));
        let mut stmt = conn.prepare(&q).map_err(StorageError::from)?;
        let rows = stmt
            .query_map([], client_from_row)
            .map_err(StorageError::from)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(finish_client(raw.map_err(StorageError::from)?)?);
        }
        Ok(out)
    }

    fn update_client(&self, id: &str, f: Updater<Client>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let q = self
            .translator
            .translate(&format!("select {} from client where id = $1", CLIENT_COLS));
        let old = finish_client(tx.query_row(&q, params![id], client_from_row)?)?;
        let new = f(old)?;
        let q = self.translator.translate(
            "update client set secret = $1, redirect_uris = $2, trusted_peers = $3, \
             public = $4, name = $5, logo_url = $6 where id = $7",
        );
        tx.execute(
            &q,
            params![
                new.secret,
                js(&new.redirect_uris)?,
                js(&new.trusted_peers)?,
                new.public,
                new.name,
                new.logo_url,
                id
            ],
        )?;
        tx.commit().map_err(StorageError::from)
    }

    fn delete_client(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(&self.t("delete from client where id = $1"), params![id])?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn create_auth_request(&self, req: AuthRequest) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(&format!(
            "insert into auth_request ({}) values \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            AUTH_REQUEST_COLS
        ));
        conn.execute(
            &q,
            params![
                req.id,
                req.client_id,
                js(&req.response_types)?,
                js(&req.scopes)?,
                req.redirect_uri,
                req.nonce,
                req.state,
                req.force_approval_prompt,
                req.logged_in,
                js(&req.claims)?,
                req.connector_id,
                req.connector_data,
                ts(&req.expiry),
                req.pkce.code_challenge,
                req.pkce.code_challenge_method,
                req.hmac_key
            ],
        )?;
        Ok(())
    }

    fn get_auth_request(&self, id: &str) -> Result<AuthRequest> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(&format!(
            "select {} from auth_request where id = $1",
            AUTH_REQUEST_COLS
        ));
        let mut stmt = conn.prepare(&q).map_err(StorageError::from)?;
        let row = stmt
            .query_row(params![id], |row| {
                Ok(auth_request_from_row(row))
            })
            .optional()
            .map_err(StorageError::from)?;
        row.ok_or(StorageError::NotFound)?
    }

    fn update_auth_request(&self, id: &str, f: Updater<AuthRequest>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let q = self.translator.translate(&format!(
            "select {} from auth_request where id = $1",
            AUTH_REQUEST_COLS
        ));
        let old = tx
            .query_row(&q, params![id], |row| Ok(auth_request_from_row(row)))
            .optional()
            .map_err(StorageError::from)?
            .ok_or(StorageError::NotFound)??;
        let new = f(old)?;
        let q = self.translator.translate(
            "update auth_request set client_id = $1, response_types = $2, scopes = $3, \
             redirect_uri = $4, nonce = $5, state = $6, force_approval_prompt = $7, \
             logged_in = $8, claims = $9, connector_id = $10, connector_data = $11, \
             expiry = $12, code_challenge = $13, code_challenge_method = $14, hmac_key = $15 \
             where id = $16",
        );
        tx.execute(
            &q,
            params![
                new.client_id,
                js(&new.response_types)?,
                js(&new.scopes)?,
                new.redirect_uri,
                new.nonce,
                new.state,
                new.force_approval_prompt,
                new.logged_in,
                js(&new.claims)?,
                new.connector_id,
                new.connector_data,
                ts(&new.expiry),
                new.pkce.code_challenge,
                new.pkce.code_challenge_method,
                new.hmac_key,
                id
            ],
        )?;
        tx.commit().map_err(StorageError::from)
    }

    fn delete_auth_request(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &self.t("delete from auth_request where id = $1"),
            params![id],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn create_auth_code(&self, code: AuthCode) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(&format!(
            "insert into auth_code ({}) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            AUTH_CODE_COLS
        ));
        conn.execute(
            &q,
            params![
                code.id,
                code.client_id,
                js(&code.scopes)?,
                code.nonce,
                code.redirect_uri,
                js(&code.claims)?,
                code.connector_id,
                code.connector_data,
                ts(&code.expiry),
                code.pkce.code_challenge,
                code.pkce.code_challenge_method
            ],
        )?;
        Ok(())
    }

    fn get_auth_code(&self, id: &str) -> Result<AuthCode> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(&format!(
            "select {} from auth_code where id = $1",
            AUTH_CODE_COLS
        ));
        let row = conn
            .query_row(&q, params![id], |row| Ok(auth_code_from_row(row)))
            .optional()
            .map_err(StorageError::from)?;
        row.ok_or(StorageError::NotFound)?
    }

    fn delete_auth_code(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(&self.t("delete from auth_code where id = $1"), params![id])?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn create_refresh_token(&self, token: RefreshToken) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(&format!(
            "insert into refresh_token ({}) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            REFRESH_COLS
        ));
        conn.execute(
            &q,
            params![
                token.id,
                token.token,
                token.obsolete_token,
                token.client_id,
                js(&token.scopes)?,
                token.nonce,
                js(&token.claims)?,
                token.connector_id,
                token.connector_data,
                ts(&token.created_at),
                ts(&token.last_used)
            ],
        )?;
        Ok(())
    }

    fn get_refresh_token(&self, id: &str) -> Result<RefreshToken> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(&format!(
            "select {} from refresh_token where id = $1",
            REFRESH_COLS
        ));
        let row = conn
            .query_row(&q, params![id], |row| Ok(refresh_from_row(row)))
            .optional()
            .map_err(StorageError::from)?;
        row.ok_or(StorageError::NotFound)?
    }

    fn list_refresh_tokens(&self) -> Result<Vec<RefreshToken>> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(&format!("select {} from refresh_token", REFRESH_COLS));
        let mut stmt = conn.prepare(&q).map_err(StorageError::from)?;
        let rows = stmt
            .query_map([], |row| Ok(refresh_from_row(row)))
            .map_err(StorageError::from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(StorageError::from)??);
        }
        Ok(out)
    }

    fn update_refresh_token(&self, id: &str, f: Updater<RefreshToken>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let q = self.translator.translate(&format!(
            "select {} from refresh_token where id = $1",
            REFRESH_COLS
        ));
        let old = tx
            .query_row(&q, params![id], |row| Ok(refresh_from_row(row)))
            .optional()
            .map_err(StorageError::from)?
            .ok_or(StorageError::NotFound)??;
        let new = f(old)?;
        let q = self.translator.translate(
            "update refresh_token set token = $1, obsolete_token = $2, client_id = $3, \
             scopes = $4, nonce = $5, claims = $6, connector_id = $7, connector_data = $8, \
             created_at = $9, last_used = $10 where id = $11",
        );
        tx.execute(
            &q,
            params![
                new.token,
                new.obsolete_token,
                new.client_id,
                js(&new.scopes)?,
                new.nonce,
                js(&new.claims)?,
                new.connector_id,
                new.connector_data,
                ts(&new.created_at),
                ts(&new.last_used),
                id
            ],
        )?;
        tx.commit().map_err(StorageError::from)
    }

    fn delete_refresh_token(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &self.t("delete from refresh_token where id = $1"),
            params![id],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn create_password(&self, mut password: Password) -> Result<()> {
        password.email = password.email.to_lowercase();
        let conn = self.conn.lock().unwrap();
        let q = self.t(
            "insert into password (email, hash, username, user_id) values ($1, $2, $3, $4)",
        );
        conn.execute(
            &q,
            params![password.email, password.hash, password.username, password.user_id],
        )?;
        Ok(())
    }

    fn get_password(&self, email: &str) -> Result<Password> {
        let conn = self.conn.lock().unwrap();
        let q = self.t("select email, hash, username, user_id from password where email = $1");
        conn.query_row(&q, params![email.to_lowercase()], |row| {
            Ok(Password {
                email: row.get(0)?,
                hash: row.get(1)?,
                username: row.get(2)?,
                user_id: row.get(3)?,
            })
        })
        .map_err(StorageError::from)
    }

    fn list_passwords(&self) -> Result<Vec<Password>> {
        let conn = self.conn.lock().unwrap();
        let q = self.t("select email, hash, username, user_id from password");
        let mut stmt = conn.prepare(&q).map_err(StorageError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Password {
                    email: row.get(0)?,
                    hash: row.get(1)?,
                    username: row.get(2)?,
                    user_id: row.get(3)?,
                })
            })
            .map_err(StorageError::from)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StorageError::from)
    }

    fn update_password(&self, email: &str, f: Updater<Password>) -> Result<()> {
        let email = email.to_lowercase();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let q = self
            .translator
            .translate("select email, hash, username, user_id from password where email = $1");
        let old = tx
            .query_row(&q, params![email], |row| {
                Ok(Password {
                    email: row.get(0)?,
                    hash: row.get(1)?,
                    username: row.get(2)?,
                    user_id: row.get(3)?,
                })
            })
            .optional()
            .map_err(StorageError::from)?
            .ok_or(StorageError::NotFound)?;
        let mut new = f(old)?;
        new.email = new.email.to_lowercase();
        let q = self.translator.translate(
            "update password set email = $1, hash = $2, username = $3, user_id = $4 \
             where email = $5",
        );
        tx.execute(
            &q,
            params![new.email, new.hash, new.username, new.user_id, email],
        )?;
        tx.commit().map_err(StorageError::from)
    }

    fn delete_password(&self, email: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &self.t("delete from password where email = $1"),
            params![email.to_lowercase()],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn create_offline_session(&self, session: OfflineSession) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(
            "insert into offline_session (user_id, conn_id, refresh, connector_data) \
             values ($1, $2, $3, $4)",
        );
        conn.execute(
            &q,
            params![
                session.user_id,
                session.conn_id,
                js(&session.refresh)?,
                session.connector_data
            ],
        )?;
        Ok(())
    }

    fn get_offline_session(&self, user_id: &str, conn_id: &str) -> Result<OfflineSession> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(
            "select user_id, conn_id, refresh, connector_data from offline_session \
             where user_id = $1 and conn_id = $2",
        );
        let row = conn
            .query_row(&q, params![user_id, conn_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .optional()
            .map_err(StorageError::from)?
            .ok_or(StorageError::NotFound)?;
        Ok(OfflineSession {
            user_id: row.0,
            conn_id: row.1,
            refresh: unjs(row.2)?,
            connector_data: row.3,
        })
    }

    fn update_offline_session(
        &self,
        user_id: &str,
        conn_id: &str,
        f: Updater<OfflineSession>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let q = self.translator.translate(
            "select refresh, connector_data from offline_session \
             where user_id = $1 and conn_id = $2",
        );
        let row = tx
            .query_row(&q, params![user_id, conn_id], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .optional()
            .map_err(StorageError::from)?
            .ok_or(StorageError::NotFound)?;
        let old = OfflineSession {
            user_id: user_id.to_string(),
            conn_id: conn_id.to_string(),
            refresh: unjs(row.0)?,
            connector_data: row.1,
        };
        let new = f(old)?;
        let q = self.translator.translate(
            "update offline_session set refresh = $1, connector_data = $2 \
             where user_id = $3 and conn_id = $4",
        );
        tx.execute(
            &q,
            params![js(&new.refresh)?, new.connector_data, user_id, conn_id],
        )?;
        tx.commit().map_err(StorageError::from)
    }

    fn delete_offline_session(&self, user_id: &str, conn_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &self.t("delete from offline_session where user_id = $1 and conn_id = $2"),
            params![user_id, conn_id],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn create_connector(&self, connector: ConnectorRecord) -> Result<()> {
        let config = self.encrypt_connector_config(&connector.config)?;
        let conn = self.conn.lock().unwrap();
        let q = self.t(
            "insert into connector (id, \"type\", name, resource_version, config) \
             values ($1, $2, $3, $4, $5)",
        );
        conn.execute(
            &q,
            params![
                connector.id,
                connector.type_,
                connector.name,
                connector.resource_version,
                config
            ],
        )?;
        Ok(())
    }

    fn get_connector(&self, id: &str) -> Result<ConnectorRecord> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(
            "select id, \"type\", name, resource_version, config from connector where id = $1",
        );
        let rec = conn
            .query_row(&q, params![id], |row| {
                Ok(ConnectorRecord {
                    id: row.get(0)?,
                    type_: row.get(1)?,
                    name: row.get(2)?,
                    resource_version: row.get(3)?,
                    config: row.get(4)?,
                })
            })
            .optional()
            .map_err(StorageError::from)?
            .ok_or(StorageError::NotFound)?;
        drop(conn);
        Ok(ConnectorRecord {
            config: self.decrypt_connector_config(rec.config)?,
            ..rec
        })
    }

    fn list_connectors(&self) -> Result<Vec<ConnectorRecord>> {
        let records = {
            let conn = self.conn.lock().unwrap();
            let q = self.t("select id, \"type\", name, resource_version, config from connector");
            let mut stmt = conn.prepare(&q).map_err(StorageError::from)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ConnectorRecord {
                        id: row.get(0)?,
                        type_: row.get(1)?,
                        name: row.get(2)?,
                        resource_version: row.get(3)?,
                        config: row.get(4)?,
                    })
                })
                .map_err(StorageError::from)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StorageError::from)?
        };
        records
            .into_iter()
            .map(|rec| {
                Ok(ConnectorRecord {
                    config: self.decrypt_connector_config(rec.config)?,
                    ..rec
                })
            })
            .collect()
    }

    fn update_connector(&self, id: &str, f: Updater<ConnectorRecord>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let q = self.translator.translate(
            "select id, \"type\", name, resource_version, config from connector where id = $1",
        );
        let rec = tx
            .query_row(&q, params![id], |row| {
                Ok(ConnectorRecord {
                    id: row.get(0)?,
                    type_: row.get(1)?,
                    name: row.get(2)?,
                    resource_version: row.get(3)?,
                    config: row.get(4)?,
                })
            })
            .optional()
            .map_err(StorageError::from)?
            .ok_or(StorageError::NotFound)?;
        let old = ConnectorRecord {
            config: self.decrypt_connector_config(rec.config)?,
            ..rec
        };
        let new = f(old)?;
        let config = self.encrypt_connector_config(&new.config)?;
        let q = self.translator.translate(
            "update connector set \"type\" = $1, name = $2, resource_version = $3, config = $4 \
             where id = $5",
        );
        tx.execute(
            &q,
            params![new.type_, new.name, new.resource_version, config, id],
        )?;
        tx.commit().map_err(StorageError::from)
    }

    fn delete_connector(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(&self.t("delete from connector where id = $1"), params![id])?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn create_device_request(&self, req: DeviceRequest) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(
            "insert into device_request \
             (user_code, device_code, client_id, client_secret, scopes, expiry) \
             values ($1, $2, $3, $4, $5, $6)",
        );
        conn.execute(
            &q,
            params![
                req.user_code,
                req.device_code,
                req.client_id,
                req.client_secret,
                js(&req.scopes)?,
                ts(&req.expiry)
            ],
        )?;
        Ok(())
    }

    fn get_device_request(&self, user_code: &str) -> Result<DeviceRequest> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(
            "select user_code, device_code, client_id, client_secret, scopes, expiry \
             from device_request where user_code = $1",
        );
        let row = conn
            .query_row(&q, params![user_code], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .optional()
            .map_err(StorageError::from)?
            .ok_or(StorageError::NotFound)?;
        Ok(DeviceRequest {
            user_code: row.0,
            device_code: row.1,
            client_id: row.2,
            client_secret: row.3,
            scopes: unjs(row.4)?,
            expiry: unts(row.5)?,
        })
    }

    fn create_device_token(&self, token: DeviceToken) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(&format!(
            "insert into device_token ({}) values ($1, $2, $3, $4, $5, $6, $7, $8)",
            DEVICE_TOKEN_COLS
        ));
        conn.execute(
            &q,
            params![
                token.device_code,
                token.status,
                token.token.as_bytes(),
                ts(&token.expiry),
                ts(&token.last_request),
                token.poll_interval_seconds,
                token.pkce.code_challenge,
                token.pkce.code_challenge_method
            ],
        )?;
        Ok(())
    }

    fn get_device_token(&self, device_code: &str) -> Result<DeviceToken> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(&format!(
            "select {} from device_token where device_code = $1",
            DEVICE_TOKEN_COLS
        ));
        let row = conn
            .query_row(&q, params![device_code], |row| Ok(device_token_from_row(row)))
            .optional()
            .map_err(StorageError::from)?;
        row.ok_or(StorageError::NotFound)?
    }

    fn update_device_token(&self, device_code: &str, f: Updater<DeviceToken>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let q = self.translator.translate(&format!(
            "select {} from device_token where device_code = $1",
            DEVICE_TOKEN_COLS
        ));
        let old = tx
            .query_row(&q, params![device_code], |row| Ok(device_token_from_row(row)))
            .optional()
            .map_err(StorageError::from)?
            .ok_or(StorageError::NotFound)??;
        let new = f(old)?;
        let q = self.translator.translate(
            "update device_token set status = $1, token = $2, expiry = $3, last_request = $4, \
             poll_interval_seconds = $5, code_challenge = $6, code_challenge_method = $7 \
             where device_code = $8",
        );
        tx.execute(
            &q,
            params![
                new.status,
                new.token.as_bytes(),
                ts(&new.expiry),
                ts(&new.last_request),
                new.poll_interval_seconds,
                new.pkce.code_challenge,
                new.pkce.code_challenge_method,
                device_code
            ],
        )?;
        tx.commit().map_err(StorageError::from)
    }

    fn delete_device_token(&self, device_code: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &self.t("delete from device_token where device_code = $1"),
            params![device_code],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn delete_device_request(&self, user_code: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &self.t("delete from device_request where user_code = $1"),
            params![user_code],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn get_keys(&self) -> Result<Keys> {
        let conn = self.conn.lock().unwrap();
        let q = self.t(
            "select signing_key, verification_keys, next_rotation from keys where id = $1",
        );
        let row = conn
            .query_row(&q, params![KEYS_ROW_ID], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .optional()
            .map_err(StorageError::from)?
            .ok_or(StorageError::NotFound)?;
        Ok(Keys {
            signing_key: unjs(row.0)?,
            verification_keys: unjs(row.1)?,
            next_rotation: unts(row.2)?,
        })
    }

    fn update_keys(&self, f: &mut dyn FnMut(Option<Keys>) -> Result<Keys>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let q = self.translator.translate(
            "select signing_key, verification_keys, next_rotation from keys where id = $1",
        );
        let old = tx
            .query_row(&q, params![KEYS_ROW_ID], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .optional()
            .map_err(StorageError::from)?;
        let existed = old.is_some();
        let old = match old {
            Some(row) => Some(Keys {
                signing_key: unjs(row.0)?,
                verification_keys: unjs(row.1)?,
                next_rotation: unts(row.2)?,
            }),
            None => None,
        };
        let new = f(old)?;
        let q = if existed {
            self.translator.translate(
                "update keys set signing_key = $1, verification_keys = $2, next_rotation = $3 \
                 where id = $4",
            )
        } else {
            self.translator.translate(
                "insert into keys (signing_key, verification_keys, next_rotation, id) \
                 values ($1, $2, $3, $4)",
            )
        };
        tx.execute(
            &q,
            params![
                js(&new.signing_key)?,
                js(&new.verification_keys)?,
                ts(&new.next_rotation),
                KEYS_ROW_ID
            ],
        )?;
        tx.commit().map_err(StorageError::from)
    }

    fn garbage_collect(&self, now: DateTime<Utc>) -> Result<GcResult> {
        let conn = self.conn.lock().unwrap();
        let cutoff = ts(&now);
        let mut result = GcResult::default();
        result.auth_requests = conn.execute(
            &self.t("delete from auth_request where expiry < $1"),
            params![cutoff],
        )? as u64;
        result.auth_codes = conn.execute(
            &self.t("delete from auth_code where expiry < $1"),
            params![cutoff],
        )? as u64;
        result.device_requests = conn.execute(
            &self.t("delete from device_request where expiry < $1"),
            params![cutoff],
        )? as u64;
        result.device_tokens = conn.execute(
            &self.t("delete from device_token where expiry < $1"),
            params![cutoff],
        )? as u64;
        Ok(result)
    }
}
