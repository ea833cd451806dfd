//! Encrypted payload fields.
//!
//! Sensitive values (OTP secrets, for instance) travel inside event payloads
//! as [`CryptoValue`]s. The event store treats them as opaque bytes; only a
//! holder of the [`EncryptionCodec`] can read them back.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors of the key-storage collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The key referenced by a value is not available.
    #[error("Unknown encryption key: {0}")]
    UnknownKey(String),

    /// Encryption failed.
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Decryption failed or produced invalid data.
    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// Encrypts and decrypts bytes with named keys.
pub trait EncryptionCodec: Send + Sync {
    /// Key used for new values.
    fn default_key_id(&self) -> &str;

    /// Encrypt `plain` with the key `key_id`.
    ///
    /// # Errors
    ///
    /// [`CryptoError`] if the key is unknown or encryption fails.
    fn encrypt(&self, key_id: &str, plain: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt `crypted` with the key `key_id`.
    ///
    /// # Errors
    ///
    /// [`CryptoError`] if the key is unknown or decryption fails.
    fn decrypt(&self, key_id: &str, crypted: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// An encrypted value together with the key it was encrypted with.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoValue {
    /// Key identifier.
    pub key_id: String,
    /// Ciphertext.
    pub crypted: Vec<u8>,
}

impl CryptoValue {
    /// Encrypt with the codec's default key.
    ///
    /// # Errors
    ///
    /// [`CryptoError`] from the codec.
    pub fn encrypt(codec: &dyn EncryptionCodec, plain: &[u8]) -> Result<Self, CryptoError> {
        let key_id = codec.default_key_id().to_string();
        let crypted = codec.encrypt(&key_id, plain)?;
        Ok(Self { key_id, crypted })
    }

    /// Decrypt to raw bytes.
    ///
    /// # Errors
    ///
    /// [`CryptoError`] from the codec.
    pub fn decrypt(&self, codec: &dyn EncryptionCodec) -> Result<Vec<u8>, CryptoError> {
        codec.decrypt(&self.key_id, &self.crypted)
    }

    /// Decrypt to a UTF-8 string.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Decrypt`] if the plaintext is not UTF-8.
    pub fn decrypt_string(&self, codec: &dyn EncryptionCodec) -> Result<String, CryptoError> {
        String::from_utf8(self.decrypt(codec)?).map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}

// Ciphertext stays out of logs.
impl std::fmt::Debug for CryptoValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoValue")
            .field("key_id", &self.key_id)
            .field("crypted", &format_args!("<{} bytes>", self.crypted.len()))
            .finish()
    }
}
