use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use varlock::config::{AppConfig, CliConfig, FileConfig, StorageSettings};
use varlock::connector::{ConnectorRegistry, LOCAL_CONNECTOR_ID};
use varlock::server::{self, metrics, ServerState};
use varlock::signer::{run_rotation_loop, RotationStrategy, Signer};
use varlock::storage::{
    memory::MemStorage, overlay::StaticStorage, sql::SqlStore, ConnectorRecord, Storage,
};

#[derive(Parser, Debug)]
#[clap(name = "varlock-server", about = "Federated OpenID Connect identity provider")]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI
    /// arguments.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Canonical external URL of this IdP.
    #[clap(long)]
    pub issuer: Option<String>,

    /// Listen address for the public protocol endpoints.
    #[clap(long)]
    pub http: Option<String>,

    /// Listen address for the admin API.
    #[clap(long)]
    pub grpc: Option<String>,

    /// Listen address for Prometheus metrics.
    #[clap(long)]
    pub telemetry: Option<String>,
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            issuer: args.issuer.clone(),
            http: args.http.clone(),
            grpc: args.grpc.clone(),
            telemetry: args.telemetry.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config: CliConfig = (&cli_args).into();
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    let default_level: LevelFilter = app_config
        .log_level
        .parse()
        .unwrap_or(LevelFilter::INFO);
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("LOG_LEVEL")
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);
    if app_config.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .unwrap();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .unwrap();
    }

    info!("Configuration loaded:");
    info!("  issuer: {}", app_config.issuer);
    info!("  web.http: {}", app_config.web_addr);
    info!("  storage: {:?}", storage_label(&app_config.storage));
    for warning in &app_config.warnings {
        warn!("Config: {}", warning);
    }

    // Storage backend plus the read-only overlay for everything the
    // config document declares.
    let backend: Arc<dyn Storage> = match &app_config.storage {
        StorageSettings::Memory => Arc::new(MemStorage::new()),
        StorageSettings::Sqlite3 {
            file,
            encryption_keys,
        } => Arc::new(SqlStore::open(file, encryption_keys.clone())?),
    };

    let mut static_connectors = app_config.static_connectors.clone();
    if app_config.enable_password_db
        && !static_connectors.iter().any(|c| c.id == LOCAL_CONNECTOR_ID)
    {
        static_connectors.push(ConnectorRecord {
            id: LOCAL_CONNECTOR_ID.to_string(),
            type_: LOCAL_CONNECTOR_ID.to_string(),
            name: "Email".to_string(),
            resource_version: String::new(),
            config: Vec::new(),
        });
    }
    let storage: Arc<dyn Storage> = Arc::new(StaticStorage::new(
        backend,
        app_config.static_clients.clone(),
        app_config.static_passwords.clone(),
        static_connectors,
    ));

    let registry = Arc::new(ConnectorRegistry::with_builtins(storage.clone()));
    for record in storage.list_connectors()? {
        if !registry.supports(&record.type_) {
            bail!(
                "connector {:?} has unsupported type {:?}",
                record.id,
                record.type_
            );
        }
    }

    let signer = Arc::new(Signer::new(
        storage.clone(),
        RotationStrategy::Periodic {
            period: app_config.expiry.signing_keys,
        },
        app_config.expiry.id_tokens,
    ));
    // Make sure a signing key exists before the first request arrives.
    {
        let signer = signer.clone();
        tokio::task::spawn_blocking(move || signer.rotate(chrono::Utc::now()))
            .await
            .context("initial key setup")??;
    }

    metrics::init_metrics();

    let shutdown_token = CancellationToken::new();
    let state = ServerState {
        config: app_config.server_config(),
        storage: storage.clone(),
        signer: signer.clone(),
        registry,
        start_time: Instant::now(),
    };

    tokio::spawn(run_rotation_loop(signer, shutdown_token.child_token()));
    let gc_period = app_config
        .gc_interval
        .to_std()
        .unwrap_or(Duration::from_secs(5 * 60));
    tokio::spawn(server::run_gc_loop(
        storage.clone(),
        gc_period,
        shutdown_token.child_token(),
    ));

    if let Some(addr) = app_config.telemetry_addr {
        tokio::spawn(server::run_metrics_server(
            addr,
            shutdown_token.child_token(),
        ));
    }
    if let Some(addr) = app_config.admin_addr {
        tokio::spawn(varlock::admin::run_admin_server(
            storage.clone(),
            addr,
            shutdown_token.child_token(),
        ));
    }

    info!("Ready to serve at {}!", app_config.web_addr);
    tokio::select! {
        result = server::run_server(
            state,
            app_config.web_addr,
            app_config.allowed_origins.clone(),
            shutdown_token.child_token(),
        ) => {
            info!("HTTP server stopped: {:?}", result);
            shutdown_token.cancel();
            result
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            shutdown_token.cancel();
            // Give the background loops a moment to shut down gracefully
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
    }
}

fn storage_label(settings: &StorageSettings) -> String {
    match settings {
        StorageSettings::Memory => "memory".to_string(),
        StorageSettings::Sqlite3 { file, .. } => format!("sqlite3 ({})", file.display()),
    }
}
