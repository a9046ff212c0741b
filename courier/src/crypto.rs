use crate::codec::{CodecError, WireFormat};
use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secure_string::SecureString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The self-describing prefix of every portable hash produced by [`Cipher`].
const SEAL_PREFIX: &str = "gcm1:";

/// The AES-GCM nonce length, in bytes.
const NONCE_LEN: usize = 12;

/// The XML document element used when sealing a structured value. JSON bodies
/// ignore it.
const VALUE_ROOT: &str = "value";

/// Defines the symmetric encryption applied to message payloads and stored
/// documents: a shared secret and the number of recursive passes.
///
/// The pass count is honored symmetrically: a value sealed with `n` passes
/// opens only with `n` passes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EncryptionConfig {
    secret: SecureString,
    #[serde(default = "EncryptionConfig::default_passes")]
    passes: u32,
}

impl EncryptionConfig {
    /// Creates a new configuration around the given secret, with a single
    /// pass.
    pub fn new(secret: impl Into<SecureString>) -> Self {
        Self {
            secret: secret.into(),
            passes: Self::default_passes(),
        }
    }

    /// Re-creates this configuration with the given pass count. A count of
    /// zero is treated as one.
    pub fn with_passes(self, passes: u32) -> Self {
        Self { passes, ..self }
    }

    /// Exposes the shared secret.
    pub fn secret(&self) -> &SecureString {
        &self.secret
    }

    /// Reports the effective pass count (at least one).
    pub fn passes(&self) -> u32 {
        self.passes.max(1)
    }

    fn default_passes() -> u32 {
        1
    }
}

/// Represents a failure to seal or open a value.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The input handed to a decrypting operation is not a portable hash
    /// produced by this scheme.
    #[error("the input is not a portable hash")]
    NotSealed,
    /// The hash did not open: wrong secret, wrong pass count, or a tampered
    /// ciphertext.
    #[error("failed to open a portable hash (wrong secret, wrong pass count, or corrupted input)")]
    OpenFailed,
    /// The cipher failed to produce a ciphertext.
    #[error("failed to seal the given bytes")]
    SealFailed,
    /// Sealing or opening a structured value failed at the serialization
    /// layer.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Applies the symmetric scheme of an [`EncryptionConfig`]: AES-256-GCM under
/// a key derived from the secret, rendered as a portable, self-describing
/// hash string (`gcm1:` followed by the base64 of nonce and ciphertext).
///
/// Works uniformly over two shapes: native bytes/strings
/// ([`seal`](Cipher::seal)/[`open`](Cipher::open)) and arbitrary structured
/// values ([`seal_value`](Cipher::seal_value)/[`open_value`](Cipher::open_value),
/// which serialize first).
pub struct Cipher {
    key: [u8; 32],
    passes: u32,
}

impl Cipher {
    /// Derives a cipher from the given configuration.
    pub fn new(config: &EncryptionConfig) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(config.secret().unsecure().as_bytes());

        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());

        Self {
            key,
            passes: config.passes(),
        }
    }

    /// Reports whether the given string is a portable hash produced by this
    /// scheme. This predicate guards every surface that accepts pre-encrypted
    /// values.
    pub fn is_sealed(input: &str) -> bool {
        let Some(encoded) = input.strip_prefix(SEAL_PREFIX) else {
            return false;
        };

        match BASE64.decode(encoded) {
            Ok(combined) => combined.len() > NONCE_LEN,
            Err(_) => false,
        }
    }

    /// Seals the given bytes into a portable hash, applying the configured
    /// number of passes.
    pub fn seal(&self, bytes: &[u8]) -> Result<String, CryptoError> {
        let mut hash = self.seal_once(bytes)?;

        for _ in 1..self.passes {
            hash = self.seal_once(hash.as_bytes())?;
        }

        Ok(hash)
    }

    /// Opens the given portable hash back into the original bytes, applying
    /// the configured number of passes in reverse.
    pub fn open(&self, hash: &str) -> Result<Vec<u8>, CryptoError> {
        let mut current = hash.to_string();

        for _ in 1..self.passes {
            let bytes = self.open_once(&current)?;
            current = String::from_utf8(bytes).map_err(|_| CryptoError::OpenFailed)?;
        }

        self.open_once(&current)
    }

    /// Serializes the given value in the given format, then seals the
    /// resulting bytes.
    pub fn seal_value<T>(&self, format: WireFormat, value: &T) -> Result<String, CryptoError>
    where
        T: Serialize,
    {
        let bytes = format.encode(VALUE_ROOT, value)?;

        self.seal(&bytes)
    }

    /// Opens the given hash, then deserializes the recovered bytes in the
    /// given format.
    pub fn open_value<T>(&self, format: WireFormat, hash: &str) -> Result<T, CryptoError>
    where
        T: DeserializeOwned,
    {
        let bytes = self.open(hash)?;

        Ok(format.decode(&bytes)?)
    }

    /// Applies a single encryption pass.
    fn seal_once(&self, bytes: &[u8]) -> Result<String, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, bytes)
            .map_err(|_| CryptoError::SealFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", SEAL_PREFIX, BASE64.encode(combined)))
    }

    /// Reverses a single encryption pass.
    fn open_once(&self, hash: &str) -> Result<Vec<u8>, CryptoError> {
        let encoded = hash.strip_prefix(SEAL_PREFIX).ok_or(CryptoError::NotSealed)?;
        let combined = BASE64.decode(encoded).map_err(|_| CryptoError::NotSealed)?;

        if combined.len() <= NONCE_LEN {
            return Err(CryptoError::NotSealed);
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::OpenFailed)
    }
}
