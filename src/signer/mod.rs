//! Token signing, verification and key rotation.
//!
//! Varlock signs with exactly one RSA key at a time. When the key rotates,
//! the previous public key is demoted into the verification set and kept
//! until every ID token signed with it has expired, so rotation never
//! invalidates in-flight tokens. All coordination between instances goes
//! through the storage keys-row updater: whichever instance commits first
//! wins, the others observe `next_rotation` moving forward and do nothing.

use crate::storage::{Keys, SigningKey, Storage, StorageError, VerificationKey};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const RSA_BITS: usize = 2048;
const KID_BYTES: usize = 20;

/// Rotation period used when a static key is configured; in practice the
/// key never rotates.
pub const STATIC_ROTATION_PERIOD_DAYS: i64 = 365 * 100;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("no signing key available")]
    NoSigningKey,
    #[error("token verification failed")]
    Verification,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// How the signer obtains its key material.
pub enum RotationStrategy {
    /// Generate keys and rotate every `period`.
    Periodic { period: Duration },
    /// Operator-provided key, never rotated.
    Static { key: SigningKey },
}

/// A single JWKS member. Only RSA signature keys are emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}

/// Generates a fresh 2048-bit RSA signing key with a random key ID.
pub fn generate_signing_key() -> Result<SigningKey, SignerError> {
    let mut rng = rand_core::OsRng;
    let private = RsaPrivateKey::new(&mut rng, RSA_BITS)
        .map_err(|e| SignerError::KeyGeneration(e.to_string()))?;
    let public = private.to_public_key();

    let mut kid_bytes = [0u8; KID_BYTES];
    rand::rng().fill_bytes(&mut kid_bytes);

    Ok(SigningKey {
        kid: crate::storage::hex_encode(&kid_bytes),
        private_der: private
            .to_pkcs1_der()
            .map_err(|e| SignerError::KeyGeneration(e.to_string()))?
            .as_bytes()
            .to_vec(),
        public_der: public
            .to_pkcs1_der()
            .map_err(|e| SignerError::KeyGeneration(e.to_string()))?
            .as_bytes()
            .to_vec(),
    })
}

fn jwk_from_der(kid: &str, public_der: &[u8]) -> Result<JsonWebKey, SignerError> {
    let public = rsa::RsaPublicKey::from_pkcs1_der(public_der)
        .map_err(|e| SignerError::KeyGeneration(e.to_string()))?;
    let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    Ok(JsonWebKey {
        kty: "RSA".to_string(),
        use_: "sig".to_string(),
        alg: "RS256".to_string(),
        kid: kid.to_string(),
        n: b64.encode(public.n().to_bytes_be()),
        e: b64.encode(public.e().to_bytes_be()),
    })
}

struct CachedKeys {
    keys: Keys,
}

/// Signs and verifies RS256 JWTs against the active key set.
pub struct Signer {
    storage: Arc<dyn Storage>,
    strategy: RotationStrategy,
    id_tokens_valid_for: Duration,
    // Last Keys row read from storage. Replaced wholesale under the write
    // lock; readers only hold the lock long enough to clone.
    cache: RwLock<Option<CachedKeys>>,
}

impl Signer {
    pub fn new(
        storage: Arc<dyn Storage>,
        strategy: RotationStrategy,
        id_tokens_valid_for: Duration,
    ) -> Self {
        Self {
            storage,
            strategy,
            id_tokens_valid_for,
            cache: RwLock::new(None),
        }
    }

    fn rotation_period(&self) -> Duration {
        match &self.strategy {
            RotationStrategy::Periodic { period } => *period,
            RotationStrategy::Static { .. } => Duration::days(STATIC_ROTATION_PERIOD_DAYS),
        }
    }

    /// Returns the current keys row, from cache when it is still fresh.
    pub fn keys(&self) -> Result<Keys, SignerError> {
        let now = Utc::now();
        if let Some(cached) = self.cache.read().unwrap().as_ref() {
            if now < cached.keys.next_rotation {
                return Ok(cached.keys.clone());
            }
        }
        let keys = self.storage.get_keys()?;
        *self.cache.write().unwrap() = Some(CachedKeys { keys: keys.clone() });
        Ok(keys)
    }

    fn invalidate_cache(&self) {
        *self.cache.write().unwrap() = None;
    }

    /// Signs `claims` with the current key. The `kid` header lets verifiers
    /// pick the right JWKS member without trial verification.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, SignerError> {
        let keys = self.keys()?;
        let signing_key = keys.signing_key.as_ref().ok_or(SignerError::NoSigningKey)?;
        let encoding_key = EncodingKey::from_rsa_der(&signing_key.private_der);
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(signing_key.kid.clone());
        jsonwebtoken::encode(&header, claims, &encoding_key)
            .map_err(|e| SignerError::Signing(e.to_string()))
    }

    /// Verifies a JWT against the active set: the current signing key plus
    /// every demoted key that has not expired. Returns the payload of the
    /// first key that validates.
    pub fn verify(&self, token: &str) -> Result<serde_json::Value, SignerError> {
        let keys = self.keys()?;
        let now = Utc::now();

        let mut active: Vec<(&str, &[u8])> = Vec::new();
        if let Some(signing_key) = &keys.signing_key {
            active.push((&signing_key.kid, &signing_key.public_der));
        }
        for vk in &keys.verification_keys {
            if vk.expiry > now {
                active.push((&vk.kid, &vk.public_der));
            }
        }

        let header = jsonwebtoken::decode_header(token).map_err(|_| SignerError::Verification)?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;

        let candidates: Vec<&(&str, &[u8])> = match &header.kid {
            Some(kid) => {
                let matched: Vec<_> = active.iter().filter(|(k, _)| k == kid).collect();
                if matched.is_empty() {
                    return Err(SignerError::Verification);
                }
                matched
            }
            None => active.iter().collect(),
        };

        for (_, public_der) in candidates {
            let public = match rsa::RsaPublicKey::from_pkcs1_der(public_der) {
                Ok(key) => key,
                Err(_) => continue,
            };
            let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
            let decoding_key = match DecodingKey::from_rsa_components(
                &b64.encode(public.n().to_bytes_be()),
                &b64.encode(public.e().to_bytes_be()),
            ) {
                Ok(key) => key,
                Err(_) => continue,
            };
            if let Ok(data) = jsonwebtoken::decode::<serde_json::Value>(
                token,
                &decoding_key,
                &validation,
            ) {
                return Ok(data.claims);
            }
        }
        Err(SignerError::Verification)
    }

    /// The JWKS served at `/keys`.
    pub fn jwks(&self) -> Result<JsonWebKeySet, SignerError> {
        let keys = self.keys()?;
        let now = Utc::now();
        let mut out = Vec::new();
        if let Some(signing_key) = &keys.signing_key {
            out.push(jwk_from_der(&signing_key.kid, &signing_key.public_der)?);
        }
        for vk in &keys.verification_keys {
            if vk.expiry > now {
                out.push(jwk_from_der(&vk.kid, &vk.public_der)?);
            }
        }
        Ok(JsonWebKeySet { keys: out })
    }

    /// Runs one rotation attempt. Returns `true` when this instance
    /// rotated, `false` when rotation was not due (or another instance got
    /// there first).
    ///
    /// The fresh key is generated before entering the updater so the
    /// closure stays pure; losing the race wastes one keygen, nothing else.
    pub fn rotate(&self, now: DateTime<Utc>) -> Result<bool, SignerError> {
        let fresh = match &self.strategy {
            RotationStrategy::Periodic { .. } => generate_signing_key()?,
            RotationStrategy::Static { key } => key.clone(),
        };
        let period = self.rotation_period();
        let valid_for = self.id_tokens_valid_for;

        let mut rotated = false;
        self.storage.update_keys(&mut |old| {
            rotated = false;
            match old {
                Some(keys) if now < keys.next_rotation => Ok(keys),
                Some(mut keys) => {
                    if let Some(previous) = keys.signing_key.take() {
                        keys.verification_keys.push(VerificationKey {
                            kid: previous.kid,
                            public_der: previous.public_der,
                            expiry: now + valid_for,
                        });
                    }
                    keys.verification_keys.retain(|vk| vk.expiry > now);
                    rotated = true;
                    Ok(Keys {
                        signing_key: Some(fresh.clone()),
                        verification_keys: keys.verification_keys,
                        next_rotation: now + period,
                    })
                }
                None => {
                    rotated = true;
                    Ok(Keys {
                        signing_key: Some(fresh.clone()),
                        verification_keys: Vec::new(),
                        next_rotation: now + period,
                    })
                }
            }
        })?;

        if rotated {
            self.invalidate_cache();
            info!("Rotated signing key, next rotation in {}", period);
        }
        Ok(rotated)
    }
}

/// Background rotation loop. Ticks well below the rotation period; each
/// tick is a cheap no-op until `next_rotation` passes.
pub async fn run_rotation_loop(signer: Arc<Signer>, shutdown: CancellationToken) {
    let tick = std::time::Duration::from_secs(30);
    let mut ticker = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let signer = signer.clone();
                // Keygen is CPU-bound, keep it off the async workers.
                let result = tokio::task::spawn_blocking(move || signer.rotate(Utc::now())).await;
                match result {
                    Ok(Ok(rotated)) => {
                        if rotated {
                            crate::server::metrics::KEY_ROTATIONS_TOTAL.inc();
                        }
                    }
                    Ok(Err(err)) => error!("Key rotation failed, will retry: {}", err),
                    Err(err) => error!("Key rotation task panicked: {}", err),
                }
            }
            _ = shutdown.cancelled() => {
                info!("Key rotation loop stopped");
                return;
            }
        }
    }
}
