//! Decoding of the per-request `x-action-context` header.
//!
//! The header is always `base64(JSON object)`. Two shapes are accepted:
//!
//! ```text
//! plain:     {"secrets": {"name": "value", ...}, ...extra fields}
//! encrypted: {"cipher": b64, "algorithm": "aes256-gcm", "iv": b64, "auth-tag": b64}
//! ```
//!
//! The encrypted plaintext is itself the plain shape. An object carrying any
//! envelope field is treated as an envelope and must carry all four.

use std::collections::BTreeMap;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ActionsError, Result};
use crate::keyring::{Algorithm, KeyRing};

pub const CONTEXT_HEADER: &str = "x-action-context";

const ENVELOPE_FIELDS: [&str; 4] = ["cipher", "algorithm", "iv", "auth-tag"];

// ---------------------------------------------------------------------------
// SecretValue
// ---------------------------------------------------------------------------

/// A decoded secret. Zeroized on drop and redacted in `Debug`/`Display`.
///
/// Deliberately not `Serialize`: the only way out is [`SecretValue::expose`].
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl std::fmt::Display for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

// ---------------------------------------------------------------------------
// ActionContext
// ---------------------------------------------------------------------------

/// Secrets and context decoded for exactly one invocation.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub secrets: BTreeMap<String, SecretValue>,
    /// Every top-level field other than `secrets`, passed through unvalidated.
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// Key ring position that authenticated an encrypted context.
    pub key_index: Option<usize>,
}

impl ActionContext {
    pub fn secret(&self, name: &str) -> Option<&SecretValue> {
        self.secrets.get(name)
    }
}

// ---------------------------------------------------------------------------
// EncryptedEnvelope
// ---------------------------------------------------------------------------

/// Wire form of an encrypted context. Binary fields are base64 strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub cipher: String,
    pub algorithm: String,
    pub iv: String,
    #[serde(rename = "auth-tag")]
    pub auth_tag: String,
}

impl EncryptedEnvelope {
    fn from_object(obj: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            match obj.get(name) {
                Some(serde_json::Value::String(s)) => Ok(s.clone()),
                Some(_) => Err(ActionsError::MalformedPayload(format!(
                    "envelope field '{name}' must be a string"
                ))),
                None => Err(ActionsError::MalformedPayload(format!(
                    "missing envelope field '{name}'"
                ))),
            }
        };
        Ok(Self {
            cipher: field("cipher")?,
            algorithm: field("algorithm")?,
            iv: field("iv")?,
            auth_tag: field("auth-tag")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn decode_b64(data: &[u8]) -> Result<Vec<u8>> {
    let data = data.trim_ascii();
    STANDARD
        .decode(data)
        .or_else(|_| STANDARD_NO_PAD.decode(data))
        .or_else(|_| URL_SAFE.decode(data))
        .or_else(|_| URL_SAFE_NO_PAD.decode(data))
        .map_err(|_| ActionsError::MalformedEncoding)
}

fn parse_object(bytes: &[u8]) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(serde_json::Value::Object(obj)) => Ok(obj),
        Ok(_) => Err(ActionsError::MalformedPayload(
            "context must be a JSON object".into(),
        )),
        Err(e) => Err(ActionsError::MalformedPayload(format!(
            "invalid JSON at line {} column {}",
            e.line(),
            e.column()
        ))),
    }
}

fn from_plain(mut obj: serde_json::Map<String, serde_json::Value>) -> Result<ActionContext> {
    let mut secrets = BTreeMap::new();
    match obj.remove("secrets") {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::Object(map)) => {
            for (name, value) in map {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                secrets.insert(name, SecretValue(value));
            }
        }
        Some(_) => {
            return Err(ActionsError::MalformedPayload(
                "'secrets' must be a JSON object".into(),
            ))
        }
    }
    Ok(ActionContext {
        secrets,
        extra: obj,
        key_index: None,
    })
}

/// A `secrets` key always means a plain context, whatever extra fields it
/// carries. Otherwise any envelope field means an envelope.
fn is_envelope(obj: &serde_json::Map<String, serde_json::Value>) -> bool {
    !obj.contains_key("secrets") && ENVELOPE_FIELDS.iter().any(|f| obj.contains_key(*f))
}

/// Decode a raw context header into an [`ActionContext`].
///
/// Errors are distinguishable by variant and carry no header content.
pub fn decode(raw_header: &[u8], keyring: &KeyRing) -> Result<ActionContext> {
    let result = decode_inner(raw_header, keyring);
    if let Err(ref e) = result {
        if let Some(kind) = e.kind() {
            tracing::warn!(%kind, "context decode failed");
        }
    }
    result
}

fn decode_inner(raw_header: &[u8], keyring: &KeyRing) -> Result<ActionContext> {
    let json = decode_b64(raw_header)?;
    let obj = parse_object(&json)?;

    if !is_envelope(&obj) {
        return from_plain(obj);
    }

    let envelope = EncryptedEnvelope::from_object(&obj)?;
    let algorithm = Algorithm::parse(&envelope.algorithm)
        .ok_or_else(|| ActionsError::UnsupportedAlgorithm(envelope.algorithm.clone()))?;
    let cipher = decode_b64(envelope.cipher.as_bytes())?;
    let iv = decode_b64(envelope.iv.as_bytes())?;
    let auth_tag = decode_b64(envelope.auth_tag.as_bytes())?;

    let (plaintext, key_index) = keyring
        .try_decrypt(&cipher, &iv, &auth_tag, algorithm)
        .ok_or(ActionsError::DecryptionFailed)?;
    let plaintext = zeroize::Zeroizing::new(plaintext);

    let mut context = from_plain(parse_object(&plaintext)?)?;
    context.key_index = Some(key_index);
    Ok(context)
}

// ---------------------------------------------------------------------------
// Encoding (callers and tests)
// ---------------------------------------------------------------------------

/// Build a plain-shape header value.
pub fn encode_plain(content: &serde_json::Value) -> String {
    STANDARD.encode(content.to_string())
}

/// Encrypt `content` under the key at `key_index` and build an envelope header value.
pub fn encode_encrypted(
    content: &serde_json::Value,
    keyring: &KeyRing,
    key_index: usize,
) -> Result<String> {
    let sealed = keyring.encrypt(key_index, content.to_string().as_bytes())?;
    let envelope = EncryptedEnvelope {
        cipher: STANDARD.encode(&sealed.cipher),
        algorithm: Algorithm::Aes256Gcm.as_str().to_string(),
        iv: STANDARD.encode(&sealed.iv),
        auth_tag: STANDARD.encode(&sealed.auth_tag),
    };
    Ok(STANDARD.encode(serde_json::to_vec(&envelope)?))
}
