//! Shared end-to-end test harness.
//!
//! Spawns a full server (memory storage, mock connector, optionally the
//! local password DB) on an ephemeral port and drives it over real HTTP.

#![allow(dead_code)]

use base64::Engine;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use varlock::connector::{ConnectorRegistry, LOCAL_CONNECTOR_ID};
use varlock::server::{build_router, default_grant_types, RefreshPolicy, ServerConfig, ServerState};
use varlock::signer::{RotationStrategy, Signer};
use varlock::storage::{
    memory::MemStorage, overlay::StaticStorage, Client, ConnectorRecord, Password, Storage,
};

pub const CLIENT_ID: &str = "example-app";
pub const CLIENT_SECRET: &str = "example-app-secret";
pub const REDIRECT_URI: &str = "http://127.0.0.1:5555/callback";
pub const PEER_CLIENT_ID: &str = "backend";
pub const PEER_CLIENT_SECRET: &str = "backend-secret";
pub const PUBLIC_CLIENT_ID: &str = "cli-app";

pub const ADMIN_EMAIL: &str = "admin@example.com";
pub const ADMIN_PASSWORD: &str = "password";
// bcrypt("password"), cost 10.
pub const ADMIN_HASH: &str = "$2a$10$33EMT0cVYVlPy6WAMCLsceLYjWhuHpbz5yuZxu/GAFj03J9Lytjuy";

pub const MOCK_USER_ID: &str = "0-385-28089-0";
pub const MOCK_EMAIL: &str = "kilgore@kilgore.trout";

pub struct TestOptions {
    pub password_db: bool,
    pub password_connector: Option<String>,
    pub reuse_interval: chrono::Duration,
    pub skip_approval: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            password_db: false,
            password_connector: None,
            reuse_interval: chrono::Duration::seconds(30),
            skip_approval: true,
        }
    }
}

pub struct TestServer {
    pub base_url: String,
    pub storage: Arc<dyn Storage>,
    pub signer: Arc<Signer>,
    shutdown: CancellationToken,
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(TestOptions::default()).await
    }

    /// Adds the password DB and enables the password grant on "local".
    pub async fn spawn_full() -> Self {
        Self::spawn_with(TestOptions {
            password_db: true,
            password_connector: Some(LOCAL_CONNECTOR_ID.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn spawn_with(options: TestOptions) -> Self {
        let clients = vec![
            Client {
                id: CLIENT_ID.to_string(),
                secret: CLIENT_SECRET.to_string(),
                redirect_uris: vec![REDIRECT_URI.to_string()],
                trusted_peers: vec![PEER_CLIENT_ID.to_string()],
                public: false,
                name: "Example App".to_string(),
                logo_url: String::new(),
            },
            Client {
                id: PEER_CLIENT_ID.to_string(),
                secret: PEER_CLIENT_SECRET.to_string(),
                redirect_uris: vec![REDIRECT_URI.to_string()],
                trusted_peers: Vec::new(),
                public: false,
                name: "Backend".to_string(),
                logo_url: String::new(),
            },
            Client {
                id: PUBLIC_CLIENT_ID.to_string(),
                secret: String::new(),
                redirect_uris: vec![REDIRECT_URI.to_string()],
                trusted_peers: Vec::new(),
                public: true,
                name: "CLI".to_string(),
                logo_url: String::new(),
            },
        ];

        let mut connectors = vec![ConnectorRecord {
            id: "mock".to_string(),
            type_: "mockCallback".to_string(),
            name: "Mock".to_string(),
            resource_version: String::new(),
            config: Vec::new(),
        }];
        let mut passwords = Vec::new();
        if options.password_db {
            connectors.push(ConnectorRecord {
                id: LOCAL_CONNECTOR_ID.to_string(),
                type_: LOCAL_CONNECTOR_ID.to_string(),
                name: "Email".to_string(),
                resource_version: String::new(),
                config: Vec::new(),
            });
            passwords.push(Password {
                email: ADMIN_EMAIL.to_string(),
                hash: ADMIN_HASH.as_bytes().to_vec(),
                username: "admin".to_string(),
                user_id: "08a8684b-db88-4b73-90a9-3cd1661f5466".to_string(),
            });
        }

        let storage: Arc<dyn Storage> = Arc::new(StaticStorage::new(
            Arc::new(MemStorage::new()),
            clients,
            passwords,
            connectors,
        ));
        let registry = Arc::new(ConnectorRegistry::with_builtins(storage.clone()));

        let signer = Arc::new(Signer::new(
            storage.clone(),
            RotationStrategy::Periodic {
                period: chrono::Duration::hours(6),
            },
            chrono::Duration::hours(24),
        ));
        {
            let signer = signer.clone();
            tokio::task::spawn_blocking(move || signer.rotate(chrono::Utc::now()))
                .await
                .unwrap()
                .unwrap();
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let mut grant_types = default_grant_types();
        grant_types.push("urn:ietf:params:oauth:grant-type:token-exchange".to_string());

        let config = ServerConfig {
            issuer: base_url.clone(),
            allowed_grant_types: grant_types,
            skip_approval_screen: options.skip_approval,
            password_connector: options.password_connector,
            refresh: RefreshPolicy {
                reuse_interval: options.reuse_interval,
                ..Default::default()
            },
            ..Default::default()
        };
        let state = ServerState {
            config,
            storage: storage.clone(),
            signer: signer.clone(),
            registry,
            start_time: Instant::now(),
        };

        let shutdown = CancellationToken::new();
        let router = build_router(state, &[]);
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(server_shutdown.cancelled_owned())
                .await
                .unwrap();
        });

        TestServer {
            base_url,
            storage,
            signer,
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// HTTP client that never follows redirects, so tests can inspect every
/// Location header of the browser legs.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Decodes a JWT payload without verifying; signature checks go through
/// the server's own /keys.
pub fn decode_jwt_payload(token: &str) -> serde_json::Value {
    let payload = token.split('.').nth(1).expect("jwt has three segments");
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .expect("jwt payload is base64url");
    serde_json::from_slice(&bytes).expect("jwt payload is json")
}

pub fn location(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::LOCATION)
        .expect("redirect carries a Location header")
        .to_str()
        .unwrap()
        .to_string()
}

/// Runs the whole browser leg of the code flow against the mock connector
/// and returns the authorization code.
pub async fn run_code_flow(
    server: &TestServer,
    client: &reqwest::Client,
    client_id: &str,
    scope: &str,
    extra: &[(&str, &str)],
) -> String {
    let mut params = vec![
        ("response_type", "code"),
        ("client_id", client_id),
        ("redirect_uri", REDIRECT_URI),
        ("scope", scope),
        ("state", "teststate"),
        ("nonce", "a-nonce"),
    ];
    params.extend_from_slice(extra);

    let response = client
        .get(server.url("/auth"))
        .query(&params)
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.status(),
        reqwest::StatusCode::SEE_OTHER,
        "auth endpoint should redirect to the connector"
    );
    let connector_url = location(&response);
    assert!(connector_url.starts_with(&server.url("/callback/mock")));

    // The mock connector "authenticates" immediately.
    let response = client.get(&connector_url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SEE_OTHER);
    let callback = location(&response);
    assert!(
        callback.starts_with(REDIRECT_URI),
        "expected client redirect, got {callback}"
    );

    let url = url::Url::parse(&callback).unwrap();
    let mut code = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => assert_eq!(value, "teststate"),
            _ => {}
        }
    }
    code.expect("redirect carries a code")
}
