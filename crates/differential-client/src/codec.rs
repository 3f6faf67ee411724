//! Payload codec: how call arguments and results become packed bytes.
//!
//! The engine treats payloads as opaque; the codec is a caller concern. The
//! default packs JSON. Symmetric encryption is pluggable through [`Cipher`]
//! with the keyring enforcing the 32-byte key precondition; the cipher
//! implementation itself lives with the caller.

use std::sync::Arc;

use crate::error::ClientError;

/// Exact length every encryption key must have.
pub const ENCRYPTION_KEY_LEN: usize = 32;

pub trait Codec: Send + Sync {
    fn pack(&self, value: &serde_json::Value) -> Result<Vec<u8>, ClientError>;
    fn unpack(&self, bytes: &[u8]) -> Result<serde_json::Value, ClientError>;
}

/// Plain JSON packing.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn pack(&self, value: &serde_json::Value) -> Result<Vec<u8>, ClientError> {
        serde_json::to_vec(value).map_err(|e| ClientError::Codec(e.to_string()))
    }

    fn unpack(&self, bytes: &[u8]) -> Result<serde_json::Value, ClientError> {
        serde_json::from_slice(bytes).map_err(|e| ClientError::Codec(e.to_string()))
    }
}

/// Symmetric cipher seam. Encrypt always uses the primary key; decrypt is
/// attempted with every key so rotation keeps old results readable.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, key: &[u8; ENCRYPTION_KEY_LEN], plain: &[u8]) -> Vec<u8>;
    fn decrypt(&self, key: &[u8; ENCRYPTION_KEY_LEN], data: &[u8]) -> Option<Vec<u8>>;
}

#[derive(Clone)]
pub struct EncryptionKeyring {
    keys: Vec<[u8; ENCRYPTION_KEY_LEN]>,
}

impl EncryptionKeyring {
    /// Every key must be exactly 32 bytes; the first is the primary.
    pub fn new(keys: Vec<Vec<u8>>) -> Result<Self, ClientError> {
        if keys.is_empty() {
            return Err(ClientError::Codec(
                "at least one encryption key is required".to_string(),
            ));
        }
        let mut fixed = Vec::with_capacity(keys.len());
        for key in keys {
            let len = key.len();
            let key: [u8; ENCRYPTION_KEY_LEN] = key.try_into().map_err(|_| {
                ClientError::Codec(format!(
                    "encryption keys must be exactly {} bytes, got {}",
                    ENCRYPTION_KEY_LEN, len
                ))
            })?;
            fixed.push(key);
        }
        Ok(Self { keys: fixed })
    }

    pub fn primary(&self) -> &[u8; ENCRYPTION_KEY_LEN] {
        &self.keys[0]
    }

    pub fn keys(&self) -> &[[u8; ENCRYPTION_KEY_LEN]] {
        &self.keys
    }
}

/// Codec decorator that encrypts packed bytes with the caller's cipher.
#[derive(Clone)]
pub struct EncryptedCodec {
    inner: Arc<dyn Codec>,
    cipher: Arc<dyn Cipher>,
    keyring: EncryptionKeyring,
}

impl EncryptedCodec {
    pub fn new(inner: Arc<dyn Codec>, cipher: Arc<dyn Cipher>, keyring: EncryptionKeyring) -> Self {
        Self {
            inner,
            cipher,
            keyring,
        }
    }
}

impl Codec for EncryptedCodec {
    fn pack(&self, value: &serde_json::Value) -> Result<Vec<u8>, ClientError> {
        let plain = self.inner.pack(value)?;
        Ok(self.cipher.encrypt(self.keyring.primary(), &plain))
    }

    fn unpack(&self, bytes: &[u8]) -> Result<serde_json::Value, ClientError> {
        for key in self.keyring.keys() {
            if let Some(plain) = self.cipher.decrypt(key, bytes) {
                return self.inner.unpack(&plain);
            }
        }
        Err(ClientError::Codec(
            "payload does not decrypt with any configured key".to_string(),
        ))
    }
}
