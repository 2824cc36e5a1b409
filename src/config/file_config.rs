//! The on-disk configuration document.
//!
//! Everything is optional here; `AppConfig::resolve` fills defaults and
//! reports every problem it finds in one pass. Tagged sections (`storage`,
//! `connectors`) carry a `type` key and an opaque payload that is decoded
//! by the component owning the type, not here.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub issuer: Option<String>,
    pub storage: Option<StorageSection>,
    pub web: Option<WebSection>,
    /// Admin API listener. Named for compatibility with deployments that
    /// configured the admin surface under this key.
    pub grpc: Option<GrpcSection>,
    pub oauth2: Option<Oauth2Section>,
    pub expiry: Option<ExpirySection>,
    pub logger: Option<LoggerSection>,
    pub connectors: Option<Vec<ConnectorSection>>,
    pub static_clients: Option<Vec<StaticClient>>,
    pub enable_password_db: Option<bool>,
    pub static_passwords: Option<Vec<StaticPassword>>,
    pub telemetry: Option<TelemetrySection>,
    pub frontend: Option<FrontendSection>,
    /// Period between garbage-collection sweeps of expired rows.
    pub gc_interval: Option<String>,
}

/// Tagged union: `type` picks the backend, `config` is decoded by it.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(rename = "type")]
    pub type_: String,
    pub config: Option<toml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebSection {
    pub http: Option<String>,
    pub https: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_min_version: Option<String>,
    pub tls_max_version: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GrpcSection {
    pub addr: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_client_ca: Option<String>,
    pub reflection: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Oauth2Section {
    pub response_types: Option<Vec<String>>,
    pub skip_approval_screen: Option<bool>,
    pub always_show_login_screen: Option<bool>,
    pub password_connector: Option<String>,
    pub grant_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpirySection {
    pub signing_keys: Option<String>,
    pub id_tokens: Option<String>,
    pub auth_requests: Option<String>,
    pub device_requests: Option<String>,
    pub refresh_tokens: Option<RefreshTokensSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshTokensSection {
    pub disable_rotation: Option<bool>,
    pub reuse_interval: Option<String>,
    pub absolute_lifetime: Option<String>,
    pub valid_if_not_used_for: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggerSection {
    pub level: Option<String>,
    pub format: Option<String>,
}

/// Tagged union: `type` is resolved through the connector registry.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorSection {
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub name: Option<String>,
    pub config: Option<toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticClient {
    pub id: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub trusted_peers: Vec<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub logo_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticPassword {
    pub email: String,
    /// A bcrypt digest. Watch out for env expansion: `$2a$10$...`
    /// contains `$` and needs VARLOCK_EXPAND_ENV=false or `$$` escaping.
    pub hash: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetrySection {
    pub http: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrontendSection {
    pub dir: Option<String>,
    pub theme: Option<String>,
    pub issuer_name: Option<String>,
}

/// Env var controlling `$VAR` expansion over the raw document. Unset or
/// truthy means expand.
pub const EXPAND_ENV_VAR: &str = "VARLOCK_EXPAND_ENV";

/// Replaces `$VAR` and `${VAR}` with environment values; `$$` escapes a
/// literal dollar. Unset variables expand to the empty string. Shell-style
/// single-character parameters (`$1`, `$2`, ...) expand too, which is what
/// mangles unescaped bcrypt hashes; that behavior is deliberately kept,
/// with [`EXPAND_ENV_VAR`] and `$$` as the operator escape hatches.
pub fn expand_env(raw: &str) -> String {
    let pattern = Regex::new(
        r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)|\$([0-9*#@!?-])",
    )
    .expect("expansion pattern is valid");
    pattern
        .replace_all(raw, |caps: &regex::Captures| {
            if &caps[0] == "$$" {
                return "$".to_string();
            }
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

fn expansion_enabled() -> bool {
    match std::env::var(EXPAND_ENV_VAR) {
        Err(_) => true,
        Ok(value) => {
            let value = value.to_lowercase();
            !(value == "false" || value == "0" || value == "no")
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let raw = if expansion_enabled() {
            expand_env(raw)
        } else {
            raw.to_string()
        };
        toml::from_str(&raw).context("parsing config file")
    }
}

/// Converts a TOML payload into the JSON form the connector registry and
/// storage openers consume.
pub fn toml_to_json(value: &toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s.clone()),
        toml::Value::Integer(i) => serde_json::Value::from(*i),
        toml::Value::Float(f) => serde_json::Value::from(*f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(*b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(values) => {
            serde_json::Value::Array(values.iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_representative_document() {
        let config = FileConfig::parse(
            r#"
            issuer = "http://127.0.0.1:5556"
            enable_password_db = true

            [storage]
            type = "sqlite3"
            [storage.config]
            file = "/var/varlock/varlock.db"

            [web]
            http = "0.0.0.0:5556"
            allowed_origins = ["*"]

            [oauth2]
            skip_approval_screen = true
            response_types = ["code"]

            [expiry]
            signing_keys = "6h"
            id_tokens = "24h"
            [expiry.refresh_tokens]
            reuse_interval = "3s"
            valid_if_not_used_for = "2160h"

            [[connectors]]
            type = "mockCallback"
            id = "mock"
            name = "Example"

            [[static_clients]]
            id = "example-app"
            secret = "example-app-secret"
            redirect_uris = ["http://127.0.0.1:5555/callback"]
            name = "Example App"

            [[static_passwords]]
            email = "admin@example.com"
            hash = "$$2a$$10$$33EMT0cVYVlPy6WAMCLsceLYjWhuHpbz5yuZxu/GAFj03J9Lytjuy"
            username = "admin"
            user_id = "08a8684b-db88-4b73-90a9-3cd1661f5466"
            "#,
        )
        .unwrap();

        assert_eq!(config.issuer.as_deref(), Some("http://127.0.0.1:5556"));
        assert_eq!(config.storage.as_ref().unwrap().type_, "sqlite3");
        assert_eq!(config.connectors.as_ref().unwrap().len(), 1);
        let password = &config.static_passwords.as_ref().unwrap()[0];
        // $$ unescaped back to single dollars by expansion.
        assert!(password.hash.starts_with("$2a$10$"));
    }

    #[test]
    fn env_expansion_substitutes_both_forms() {
        std::env::set_var("VARLOCK_TEST_SECRET", "hunter2");
        let out = expand_env("a=$VARLOCK_TEST_SECRET b=${VARLOCK_TEST_SECRET} c=$$HOME");
        assert_eq!(out, "a=hunter2 b=hunter2 c=$HOME");
        std::env::remove_var("VARLOCK_TEST_SECRET");
    }

    #[test]
    fn unset_vars_expand_to_empty() {
        assert_eq!(expand_env("x=$VARLOCK_DEFINITELY_UNSET_VAR!"), "x=!");
    }

    #[test]
    fn bcrypt_hash_without_escaping_is_mangled() {
        // The documented operator hazard: expansion eats the cost marker.
        let out = expand_env("$2a$10$abcdef");
        assert_ne!(out, "$2a$10$abcdef");
    }

    #[test]
    fn toml_payloads_become_json() {
        let value: toml::Value = toml::from_str(
            r#"
            clientID = "app"
            scopes = ["openid", "email"]
            insecureSkipEmailVerified = true
            "#,
        )
        .unwrap();
        let json = toml_to_json(&value);
        assert_eq!(json["clientID"], "app");
        assert_eq!(json["scopes"][1], "email");
        assert_eq!(json["insecureSkipEmailVerified"], true);
    }
}
