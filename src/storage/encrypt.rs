//! Field-level encryption for connector configs at rest.
//!
//! The token format is an authenticated symmetric container: a version
//! byte, a 16-byte IV, AES-128-CBC ciphertext, and an HMAC-SHA256 tag over
//! everything before it. Each configured 32-byte key is split into a
//! signing half and an encryption half. The first configured key encrypts;
//! every configured key is tried on decrypt, so keys rotate by prepending a
//! new one and keeping the old around until re-encryption has happened.
//!
//! Encrypted values carry a fixed ASCII marker prefix so plaintext and
//! ciphertext can coexist in the same table during a migration.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Marker prepended to every encrypted field value.
pub const ENC_PREFIX: &str = "$varlock-enc$";

const TOKEN_VERSION: u8 = 0x80;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("at least one 32-byte key is required")]
    NoKeys,
    #[error("malformed encrypted value")]
    Malformed,
    #[error("decryption failed with every configured key")]
    Verification,
    #[error("config is not a JSON object: {0}")]
    BadConfig(String),
}

pub struct Crypto {
    keys: Vec<[u8; 32]>,
}

impl Crypto {
    pub fn new(keys: Vec<[u8; 32]>) -> Result<Self, CryptoError> {
        if keys.is_empty() {
            return Err(CryptoError::NoKeys);
        }
        Ok(Self { keys })
    }

    /// Encrypts one value under the primary key.
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let key = &self.keys[0];
        let (sign_key, enc_key) = key.split_at(16);

        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = Aes128CbcEnc::new_from_slices(enc_key, &iv)
            .expect("fixed-length key and iv")
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut token = Vec::with_capacity(1 + IV_LEN + ciphertext.len() + TAG_LEN);
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&iv);
        token.extend_from_slice(&ciphertext);

        let mut mac = HmacSha256::new_from_slice(sign_key).expect("hmac accepts any key length");
        mac.update(&token);
        token.extend_from_slice(&mac.finalize().into_bytes());

        format!(
            "{}{}",
            ENC_PREFIX,
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(token)
        )
    }

    /// Decrypts a marked value, trying every configured key in order.
    pub fn decrypt(&self, value: &str) -> Result<Vec<u8>, CryptoError> {
        let encoded = value.strip_prefix(ENC_PREFIX).ok_or(CryptoError::Malformed)?;
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| CryptoError::Malformed)?;
        if token.len() < 1 + IV_LEN + TAG_LEN || token[0] != TOKEN_VERSION {
            return Err(CryptoError::Malformed);
        }

        let (body, tag) = token.split_at(token.len() - TAG_LEN);
        let iv = &body[1..1 + IV_LEN];
        let ciphertext = &body[1 + IV_LEN..];

        for key in &self.keys {
            let (sign_key, enc_key) = key.split_at(16);

            let mut mac = HmacSha256::new_from_slice(sign_key).expect("hmac accepts any key length");
            mac.update(body);
            if mac.verify_slice(tag).is_err() {
                continue;
            }

            return Aes128CbcDec::new_from_slices(enc_key, iv)
                .expect("fixed-length key and iv")
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::Verification);
        }
        Err(CryptoError::Verification)
    }

    /// Encrypts every top-level string value of a JSON config object.
    /// Non-object configs and non-string values pass through unchanged.
    pub fn encrypt_config(&self, config: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut doc: Value =
            serde_json::from_slice(config).map_err(|e| CryptoError::BadConfig(e.to_string()))?;
        if let Some(obj) = doc.as_object_mut() {
            for value in obj.values_mut() {
                if let Some(s) = value.as_str() {
                    if !s.starts_with(ENC_PREFIX) {
                        *value = Value::String(self.encrypt(s.as_bytes()));
                    }
                }
            }
        }
        serde_json::to_vec(&doc).map_err(|e| CryptoError::BadConfig(e.to_string()))
    }

    /// Reverses [`encrypt_config`]. Unmarked string values pass through,
    /// which is what makes the plaintext -> encrypted migration safe.
    pub fn decrypt_config(&self, config: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut doc: Value =
            serde_json::from_slice(config).map_err(|e| CryptoError::BadConfig(e.to_string()))?;
        if let Some(obj) = doc.as_object_mut() {
            for value in obj.values_mut() {
                if let Some(s) = value.as_str() {
                    if s.starts_with(ENC_PREFIX) {
                        let plain = self.decrypt(s)?;
                        let plain = String::from_utf8(plain).map_err(|_| CryptoError::Malformed)?;
                        *value = Value::String(plain);
                    }
                }
            }
        }
        serde_json::to_vec(&doc).map_err(|e| CryptoError::BadConfig(e.to_string()))
    }
}

/// True when any top-level string value of the config carries the marker.
pub fn has_encrypted_fields(config: &[u8]) -> bool {
    let Ok(doc) = serde_json::from_slice::<Value>(config) else {
        return false;
    };
    doc.as_object()
        .map(|obj| {
            obj.values()
                .any(|v| v.as_str().is_some_and(|s| s.starts_with(ENC_PREFIX)))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8) -> [u8; 32] {
        [fill; 32]
    }

    #[test]
    fn value_round_trip() {
        let crypto = Crypto::new(vec![key(1)]).unwrap();
        let token = crypto.encrypt(b"hunter2");
        assert!(token.starts_with(ENC_PREFIX));
        assert_eq!(crypto.decrypt(&token).unwrap(), b"hunter2");
    }

    #[test]
    fn wrong_key_fails() {
        let crypto = Crypto::new(vec![key(1)]).unwrap();
        let token = crypto.encrypt(b"hunter2");
        let other = Crypto::new(vec![key(2)]).unwrap();
        assert!(matches!(
            other.decrypt(&token),
            Err(CryptoError::Verification)
        ));
    }

    #[test]
    fn rolling_keys_accept_old_tokens() {
        let old = Crypto::new(vec![key(1)]).unwrap();
        let token = old.encrypt(b"secret");
        // New primary key prepended, old key retained.
        let rolled = Crypto::new(vec![key(2), key(1)]).unwrap();
        assert_eq!(rolled.decrypt(&token).unwrap(), b"secret");
        // Fresh tokens use the new primary.
        let fresh = rolled.encrypt(b"secret");
        assert!(Crypto::new(vec![key(2)]).unwrap().decrypt(&fresh).is_ok());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let crypto = Crypto::new(vec![key(1)]).unwrap();
        let token = crypto.encrypt(b"secret");
        let mut broken = token.into_bytes();
        let last = broken.len() - 1;
        broken[last] = if broken[last] == b'A' { b'B' } else { b'A' };
        let broken = String::from_utf8(broken).unwrap();
        assert!(crypto.decrypt(&broken).is_err());
    }

    #[test]
    fn config_round_trip_encrypts_only_strings() {
        let crypto = Crypto::new(vec![key(3)]).unwrap();
        let config = br#"{"client_secret":"hush","port":8080,"insecure":false}"#;
        let enc = crypto.encrypt_config(config).unwrap();
        assert!(has_encrypted_fields(&enc));

        let doc: Value = serde_json::from_slice(&enc).unwrap();
        assert!(doc["client_secret"].as_str().unwrap().starts_with(ENC_PREFIX));
        assert_eq!(doc["port"], 8080);

        let dec = crypto.decrypt_config(&enc).unwrap();
        let doc: Value = serde_json::from_slice(&dec).unwrap();
        assert_eq!(doc["client_secret"], "hush");
        assert!(!has_encrypted_fields(&dec));
    }

    #[test]
    fn plaintext_config_has_no_encrypted_fields() {
        assert!(!has_encrypted_fields(br#"{"client_secret":"hush"}"#));
        assert!(!has_encrypted_fields(b"not json"));
    }
}
