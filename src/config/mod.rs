//! Configuration resolution.
//!
//! `FileConfig` is the raw document; `AppConfig` is the validated,
//! defaulted form the rest of the process consumes. Validation walks the
//! whole document and reports every problem in a single error, one line
//! per problem, instead of failing on the first.

mod file_config;

pub use file_config::{
    expand_env, toml_to_json, ConnectorSection, ExpirySection, FileConfig, GrpcSection,
    LoggerSection, Oauth2Section, RefreshTokensSection, StaticClient, StaticPassword,
    StorageSection, TelemetrySection, WebSection, EXPAND_ENV_VAR,
};

use crate::server::{default_grant_types, RefreshPolicy, ServerConfig};
use crate::storage::{Client, ConnectorRecord, Password};
use anyhow::{bail, Result};
use base64::Engine;
use chrono::Duration;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments that take part in config resolution. Values in the
/// config file override CLI arguments.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub issuer: Option<String>,
    pub http: Option<String>,
    pub grpc: Option<String>,
    pub telemetry: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StorageSettings {
    Memory,
    Sqlite3 {
        file: PathBuf,
        encryption_keys: Vec<[u8; 32]>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct SqliteConfig {
    file: String,
    /// Base64 of 32 bytes each; the first encrypts, all decrypt.
    #[serde(default)]
    encryption_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExpirySettings {
    pub signing_keys: Duration,
    pub id_tokens: Duration,
    pub auth_requests: Duration,
    pub device_requests: Duration,
    pub refresh: RefreshPolicy,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub issuer: String,
    pub storage: StorageSettings,
    pub web_addr: SocketAddr,
    pub allowed_origins: Vec<String>,
    pub admin_addr: Option<SocketAddr>,
    pub telemetry_addr: Option<SocketAddr>,
    pub log_level: String,
    pub log_format: String,
    pub response_types: Vec<String>,
    pub grant_types: Vec<String>,
    pub skip_approval_screen: bool,
    pub always_show_login_screen: bool,
    pub password_connector: Option<String>,
    pub expiry: ExpirySettings,
    pub static_connectors: Vec<ConnectorRecord>,
    pub static_clients: Vec<Client>,
    pub enable_password_db: bool,
    pub static_passwords: Vec<Password>,
    pub gc_interval: Duration,
    /// Non-fatal findings surfaced at startup.
    pub warnings: Vec<String>,
}

/// Parses durations like "90s", "5m", "24h", "30d" and combinations
/// ("1h30m").
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty duration");
    }
    let mut total = Duration::zero();
    let mut digits = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            bail!("invalid duration {:?}", input);
        }
        let value: i64 = digits.parse()?;
        digits.clear();
        total = total
            + match c {
                's' => Duration::seconds(value),
                'm' => Duration::minutes(value),
                'h' => Duration::hours(value),
                'd' => Duration::days(value),
                other => bail!("unknown duration unit {:?} in {:?}", other, input),
            };
    }
    if !digits.is_empty() {
        bail!("duration {:?} is missing a unit", input);
    }
    Ok(total)
}

struct Problems(Vec<String>);

impl Problems {
    fn push(&mut self, problem: impl Into<String>) {
        self.0.push(problem.into());
    }

    fn duration(
        &mut self,
        field: &str,
        value: &Option<String>,
        default: Duration,
    ) -> Duration {
        match value {
            None => default,
            Some(raw) => match parse_duration(raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.push(format!("{}: {}", field, err));
                    default
                }
            },
        }
    }

    fn addr(&mut self, field: &str, value: &str) -> Option<SocketAddr> {
        match value.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                self.push(format!("{}: invalid listen address {:?}", field, value));
                None
            }
        }
    }
}

impl AppConfig {
    pub fn resolve(cli: &CliConfig, file: Option<FileConfig>) -> Result<Self> {
        let file = file.unwrap_or_default();
        let mut problems = Problems(Vec::new());
        let mut warnings = Vec::new();

        let issuer = file
            .issuer
            .or_else(|| cli.issuer.clone())
            .unwrap_or_else(|| "http://127.0.0.1:5556".to_string());
        if !issuer.starts_with("http://") && !issuer.starts_with("https://") {
            problems.push(format!("issuer: {:?} is not an absolute http(s) URL", issuer));
        }

        // Storage.
        let storage = match &file.storage {
            None => {
                warnings.push(
                    "no storage configured, using the in-memory backend; state is lost on restart"
                        .to_string(),
                );
                StorageSettings::Memory
            }
            Some(section) => match section.type_.as_str() {
                "memory" => StorageSettings::Memory,
                "sqlite3" => {
                    let payload = section
                        .config
                        .as_ref()
                        .map(toml_to_json)
                        .unwrap_or_else(|| serde_json::json!({}));
                    match serde_json::from_value::<SqliteConfig>(payload) {
                        Ok(config) => {
                            let mut keys = Vec::new();
                            for (i, raw) in config.encryption_keys.iter().enumerate() {
                                match decode_encryption_key(raw) {
                                    Ok(key) => keys.push(key),
                                    Err(err) => problems.push(format!(
                                        "storage.config.encryption_keys[{}]: {}",
                                        i, err
                                    )),
                                }
                            }
                            StorageSettings::Sqlite3 {
                                file: PathBuf::from(config.file),
                                encryption_keys: keys,
                            }
                        }
                        Err(err) => {
                            problems.push(format!("storage.config: {}", err));
                            StorageSettings::Memory
                        }
                    }
                }
                other @ ("postgres" | "mysql" | "kubernetes" | "etcd") => {
                    problems.push(format!(
                        "storage.type: {:?} is not compiled into this build (supported: memory, sqlite3)",
                        other
                    ));
                    StorageSettings::Memory
                }
                other => {
                    problems.push(format!("storage.type: unknown type {:?}", other));
                    StorageSettings::Memory
                }
            },
        };

        // Listeners.
        let web = file.web.unwrap_or_default();
        if web.https.is_some() || web.tls_cert.is_some() || web.tls_key.is_some() {
            warnings.push(
                "web.https/tls_*: TLS termination is not compiled in, front with a TLS proxy"
                    .to_string(),
            );
        }
        let web_http = web
            .http
            .or_else(|| cli.http.clone())
            .unwrap_or_else(|| "127.0.0.1:5556".to_string());
        let web_addr = problems
            .addr("web.http", &web_http)
            .unwrap_or_else(|| "127.0.0.1:5556".parse().expect("default addr parses"));

        let grpc = file.grpc.unwrap_or_default();
        let admin_addr = grpc
            .addr
            .or_else(|| cli.grpc.clone())
            .and_then(|addr| problems.addr("grpc.addr", &addr));
        if grpc.tls_client_ca.is_some() {
            warnings.push(
                "grpc.tls_client_ca: mutual TLS is terminated by the fronting proxy in this build"
                    .to_string(),
            );
        }

        let telemetry_addr = file
            .telemetry
            .unwrap_or_default()
            .http
            .or_else(|| cli.telemetry.clone())
            .and_then(|addr| problems.addr("telemetry.http", &addr));

        // Logger.
        let logger = file.logger.unwrap_or_default();
        let log_level = logger.level.unwrap_or_else(|| "info".to_string());
        let log_format = logger.format.unwrap_or_else(|| "text".to_string());
        if log_format != "text" && log_format != "json" {
            problems.push(format!(
                "logger.format: {:?} (expected \"text\" or \"json\")",
                log_format
            ));
        }

        // OAuth2 behavior.
        let oauth2 = file.oauth2.unwrap_or_default();
        let response_types = oauth2
            .response_types
            .unwrap_or_else(|| vec!["code".to_string()]);
        for rt in &response_types {
            if !matches!(rt.as_str(), "code" | "token" | "id_token") {
                problems.push(format!("oauth2.response_types: unknown type {:?}", rt));
            }
        }
        let grant_types = oauth2.grant_types.unwrap_or_else(default_grant_types);
        for gt in &grant_types {
            let known = matches!(
                gt.as_str(),
                "authorization_code"
                    | "refresh_token"
                    | "password"
                    | "implicit"
                    | "urn:ietf:params:oauth:grant-type:device_code"
                    | "urn:ietf:params:oauth:grant-type:token-exchange"
            );
            if !known {
                problems.push(format!("oauth2.grant_types: unknown type {:?}", gt));
            }
        }

        // Expiries.
        let expiry_section = file.expiry.unwrap_or_default();
        let refresh_section = expiry_section.refresh_tokens.clone().unwrap_or_default();
        let refresh_defaults = RefreshPolicy::default();
        let expiry = ExpirySettings {
            signing_keys: problems.duration(
                "expiry.signing_keys",
                &expiry_section.signing_keys,
                Duration::hours(6),
            ),
            id_tokens: problems.duration(
                "expiry.id_tokens",
                &expiry_section.id_tokens,
                Duration::hours(24),
            ),
            auth_requests: problems.duration(
                "expiry.auth_requests",
                &expiry_section.auth_requests,
                Duration::hours(24),
            ),
            device_requests: problems.duration(
                "expiry.device_requests",
                &expiry_section.device_requests,
                Duration::minutes(5),
            ),
            refresh: RefreshPolicy {
                disable_rotation: refresh_section.disable_rotation.unwrap_or(false),
                reuse_interval: problems.duration(
                    "expiry.refresh_tokens.reuse_interval",
                    &refresh_section.reuse_interval,
                    refresh_defaults.reuse_interval,
                ),
                absolute_lifetime: refresh_section
                    .absolute_lifetime
                    .as_ref()
                    .map(|raw| {
                        problems.duration(
                            "expiry.refresh_tokens.absolute_lifetime",
                            &Some(raw.clone()),
                            Duration::zero(),
                        )
                    })
                    .filter(|d| *d > Duration::zero()),
                valid_if_not_used_for: refresh_section
                    .valid_if_not_used_for
                    .as_ref()
                    .map(|raw| {
                        problems.duration(
                            "expiry.refresh_tokens.valid_if_not_used_for",
                            &Some(raw.clone()),
                            Duration::zero(),
                        )
                    })
                    .filter(|d| *d > Duration::zero()),
            },
        };

        // Static entities.
        let mut static_clients = Vec::new();
        for (i, c) in file.static_clients.unwrap_or_default().into_iter().enumerate() {
            if c.id.is_empty() {
                problems.push(format!("static_clients[{}]: missing id", i));
                continue;
            }
            if !c.public && c.secret.is_empty() {
                problems.push(format!(
                    "static_clients[{}] ({}): confidential clients need a secret",
                    i, c.id
                ));
            }
            if c.redirect_uris.is_empty() {
                problems.push(format!(
                    "static_clients[{}] ({}): at least one redirect URI is required",
                    i, c.id
                ));
            }
            static_clients.push(Client {
                id: c.id,
                secret: c.secret,
                redirect_uris: c.redirect_uris,
                trusted_peers: c.trusted_peers,
                public: c.public,
                name: c.name,
                logo_url: c.logo_url,
            });
        }

        let enable_password_db = file.enable_password_db.unwrap_or(false);
        let mut static_passwords = Vec::new();
        for (i, p) in file.static_passwords.unwrap_or_default().into_iter().enumerate() {
            if !enable_password_db {
                problems.push(format!(
                    "static_passwords[{}]: set enable_password_db = true to use static passwords",
                    i
                ));
                break;
            }
            if !p.hash.starts_with("$2") {
                problems.push(format!(
                    "static_passwords[{}] ({}): hash is not a bcrypt digest \
                     (hint: env expansion mangles unescaped \"$\", see {})",
                    i, p.email, EXPAND_ENV_VAR
                ));
            }
            static_passwords.push(Password {
                email: p.email.to_lowercase(),
                hash: p.hash.into_bytes(),
                username: p.username,
                user_id: p.user_id,
            });
        }

        let mut static_connectors = Vec::new();
        for (i, c) in file.connectors.unwrap_or_default().into_iter().enumerate() {
            if c.id.is_empty() || c.type_.is_empty() {
                problems.push(format!("connectors[{}]: id and type are required", i));
                continue;
            }
            if static_connectors
                .iter()
                .any(|existing: &ConnectorRecord| existing.id == c.id)
            {
                problems.push(format!("connectors[{}]: duplicate id {:?}", i, c.id));
                continue;
            }
            let payload = c
                .config
                .as_ref()
                .map(toml_to_json)
                .unwrap_or_else(|| serde_json::json!({}));
            static_connectors.push(ConnectorRecord {
                id: c.id.clone(),
                type_: c.type_,
                name: c.name.unwrap_or(c.id),
                resource_version: String::new(),
                config: serde_json::to_vec(&payload).expect("json payload serializes"),
            });
        }

        if let Some(pc) = &oauth2.password_connector {
            let is_local = enable_password_db && pc == "local";
            if !is_local && !static_connectors.iter().any(|c| c.id == *pc) {
                problems.push(format!(
                    "oauth2.password_connector: no connector with id {:?}",
                    pc
                ));
            }
        }

        let gc_interval =
            problems.duration("gc_interval", &file.gc_interval, Duration::minutes(5));

        if !problems.0.is_empty() {
            bail!("invalid configuration:\n  {}", problems.0.join("\n  "));
        }

        Ok(AppConfig {
            issuer,
            storage,
            web_addr,
            allowed_origins: web.allowed_origins.unwrap_or_default(),
            admin_addr,
            telemetry_addr,
            log_level,
            log_format,
            response_types,
            grant_types,
            skip_approval_screen: oauth2.skip_approval_screen.unwrap_or(false),
            always_show_login_screen: oauth2.always_show_login_screen.unwrap_or(false),
            password_connector: oauth2.password_connector,
            expiry,
            static_connectors,
            static_clients,
            enable_password_db,
            static_passwords,
            gc_interval,
            warnings,
        })
    }

    /// The protocol-engine view of this configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            issuer: self.issuer.clone(),
            supported_response_types: self.response_types.clone(),
            allowed_grant_types: self.grant_types.clone(),
            skip_approval_screen: self.skip_approval_screen,
            always_show_login_screen: self.always_show_login_screen,
            password_connector: self.password_connector.clone(),
            auth_requests_valid_for: self.expiry.auth_requests,
            auth_codes_valid_for: Duration::minutes(5),
            id_tokens_valid_for: self.expiry.id_tokens,
            device_requests_valid_for: self.expiry.device_requests,
            refresh: self.expiry.refresh.clone(),
        }
    }
}

fn decode_encryption_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|e| anyhow::anyhow!("not valid base64: {e}"))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 32 bytes, got {}", len))
}
