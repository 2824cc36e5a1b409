use axum::extract::FromRef;

use super::ServerConfig;
use crate::connector::ConnectorRegistry;
use crate::signer::Signer;
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Instant;

pub type GuardedStorage = Arc<dyn Storage>;
pub type GuardedSigner = Arc<Signer>;
pub type GuardedRegistry = Arc<ConnectorRegistry>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub storage: GuardedStorage,
    pub signer: GuardedSigner,
    pub registry: GuardedRegistry,
    pub start_time: Instant,
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for GuardedStorage {
    fn from_ref(input: &ServerState) -> Self {
        input.storage.clone()
    }
}

impl FromRef<ServerState> for GuardedSigner {
    fn from_ref(input: &ServerState) -> Self {
        input.signer.clone()
    }
}

impl FromRef<ServerState> for GuardedRegistry {
    fn from_ref(input: &ServerState) -> Self {
        input.registry.clone()
    }
}
