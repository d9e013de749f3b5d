//! Ordered set of AES-256-GCM decryption keys.
//!
//! Keys are loaded once at startup from `ACTION_SERVER_DECRYPT_KEYS`, a JSON
//! array of base64-encoded 32-byte keys. Configuration order is trial order:
//! during a rotation the new key goes first and the old one stays behind it
//! until every caller has switched.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{ActionsError, Result};

pub const KEYS_ENV: &str = "ACTION_SERVER_DECRYPT_KEYS";

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Algorithm
// ---------------------------------------------------------------------------

/// Symmetric ciphers accepted in an encrypted context envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Aes256Gcm,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "aes256-gcm",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        match id {
            "aes256-gcm" => Some(Algorithm::Aes256Gcm),
            _ => None,
        }
    }
}

/// Ciphertext, nonce and detached tag produced by [`KeyRing::encrypt`].
#[derive(Debug, Clone)]
pub struct Sealed {
    pub cipher: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

// ---------------------------------------------------------------------------
// KeyRing
// ---------------------------------------------------------------------------

/// Immutable, ordered decryption keys. Key bytes are zeroized on drop.
#[derive(Default)]
pub struct KeyRing {
    keys: Vec<Zeroizing<[u8; KEY_LEN]>>,
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl KeyRing {
    pub fn new(keys: Vec<[u8; KEY_LEN]>) -> Self {
        Self {
            keys: keys.into_iter().map(Zeroizing::new).collect(),
        }
    }

    /// Parse a JSON array of base64-encoded keys.
    ///
    /// Errors name the offending position only, never the value.
    pub fn from_json(raw: &str) -> Result<Self> {
        let encoded: Vec<Zeroizing<String>> = serde_json::from_str::<Vec<String>>(raw)
            .map_err(|_| {
                ActionsError::InvalidKeyConfig(format!(
                    "{KEYS_ENV} must be a JSON array of base64 strings"
                ))
            })?
            .into_iter()
            .map(Zeroizing::new)
            .collect();

        let mut keys = Vec::with_capacity(encoded.len());
        for (index, value) in encoded.iter().enumerate() {
            let bytes = Zeroizing::new(STANDARD.decode(value.trim().as_bytes()).map_err(|_| {
                ActionsError::InvalidKeyConfig(format!("key #{index} is not valid base64"))
            })?);
            if bytes.len() != KEY_LEN {
                return Err(ActionsError::InvalidKeyConfig(format!(
                    "key #{index} is {} bytes, expected {KEY_LEN}",
                    bytes.len()
                )));
            }
            let mut key = Zeroizing::new([0u8; KEY_LEN]);
            key.copy_from_slice(&bytes);
            keys.push(key);
        }
        Ok(Self { keys })
    }

    /// Load from the process environment. Unset or blank yields an empty ring.
    pub fn from_env() -> Result<Self> {
        match std::env::var(KEYS_ENV) {
            Ok(raw) if !raw.trim().is_empty() => Self::from_json(&raw),
            _ => Ok(Self::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Try each key in configured order; the first one whose tag verifies wins.
    ///
    /// Returns `None` when no key authenticates, including when the nonce or
    /// tag has the wrong length for the algorithm.
    pub fn try_decrypt(
        &self,
        cipher: &[u8],
        iv: &[u8],
        auth_tag: &[u8],
        algorithm: Algorithm,
    ) -> Option<(Vec<u8>, usize)> {
        match algorithm {
            Algorithm::Aes256Gcm => {
                if iv.len() != IV_LEN || auth_tag.len() != TAG_LEN {
                    return None;
                }
                let nonce = Nonce::from_slice(iv);
                let tag = Tag::from_slice(auth_tag);
                for (index, key) in self.keys.iter().enumerate() {
                    let Ok(aead) = Aes256Gcm::new_from_slice(key.as_slice()) else {
                        continue;
                    };
                    let mut buffer = cipher.to_vec();
                    if aead
                        .decrypt_in_place_detached(nonce, b"", &mut buffer, tag)
                        .is_ok()
                    {
                        tracing::debug!(key_index = index, "context authenticated");
                        return Some((buffer, index));
                    }
                }
                None
            }
        }
    }

    /// Encrypt `plaintext` under the key at `key_index` with a fresh random nonce.
    pub fn encrypt(&self, key_index: usize, plaintext: &[u8]) -> Result<Sealed> {
        let key = self.keys.get(key_index).ok_or_else(|| {
            ActionsError::InvalidKeyConfig(format!("no key at index {key_index}"))
        })?;
        let aead = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|_| ActionsError::InvalidKeyConfig("key has invalid length".into()))?;

        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let mut buffer = plaintext.to_vec();
        let tag = aead
            .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| ActionsError::InvalidKeyConfig("encryption failed".into()))?;

        Ok(Sealed {
            cipher: buffer,
            iv: iv.to_vec(),
            auth_tag: tag.to_vec(),
        })
    }
}

/// Generate a random key, base64-encoded, for use in `ACTION_SERVER_DECRYPT_KEYS`.
pub fn generate_key() -> String {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::rngs::OsRng.fill_bytes(key.as_mut_slice());
    STANDARD.encode(key.as_slice())
}
