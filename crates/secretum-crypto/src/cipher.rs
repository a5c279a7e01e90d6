//! Field cipher - authenticated encryption of individual record fields
//!
//! Every sensitive field is sealed on its own into a self-contained blob:
//!
//! ```text
//! nonce (12 bytes) || ciphertext || tag (16 bytes)
//! ```
//!
//! The layout is part of the on-disk format. Anything that reads old data
//! must split at the same nonce length.

use aes_gcm::Aes256Gcm;
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305,
};
use parking_lot::Mutex;
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::keychain::{Algorithm, KeyHandle, KeySpec, KeyStore, KeyStoreError};

/// 96-bit nonce (12 bytes)
pub const NONCE_SIZE: usize = 12;
/// 128-bit authentication tag (16 bytes)
pub const TAG_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Master key unavailable: {0}")]
    KeyUnavailable(#[from] KeyStoreError),

    #[error("Decryption failed - data may be corrupted or tampered")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,
}

/// Sealed form of one field. Immutable; an edit replaces it wholesale.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherBlob(Vec<u8>);

impl CipherBlob {
    /// Wrap raw bytes read back from storage. Nothing is validated here;
    /// a malformed blob is rejected when it is opened.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        STANDARD
            .decode(encoded.trim())
            .map(Self)
            .map_err(|_| CipherError::DecryptionFailed)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The leading nonce, if the blob is long enough to carry one
    pub fn nonce(&self) -> Option<&[u8]> {
        self.0.get(..NONCE_SIZE)
    }
}

impl fmt::Debug for CipherBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CipherBlob({} bytes)", self.0.len())
    }
}

/// Seals and opens fields under the installation's master key.
///
/// The key is fetched lazily from the key store on first use and then kept
/// resident. The fetch runs inside a single critical section, so concurrent
/// first callers converge on one key instead of racing to create two.
pub struct FieldCipher {
    store: Arc<dyn KeyStore>,
    alias: String,
    spec: KeySpec,
    resident: Mutex<Option<KeyHandle>>,
}

impl FieldCipher {
    pub fn new(store: Arc<dyn KeyStore>, alias: &str, spec: KeySpec) -> Self {
        Self {
            store,
            alias: alias.to_string(),
            spec,
            resident: Mutex::new(None),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.spec.algorithm
    }

    /// Get-or-create the master key.
    ///
    /// A failed lookup is not cached; the next call tries the store again.
    pub fn key(&self) -> Result<KeyHandle, CipherError> {
        let mut resident = self.resident.lock();
        if let Some(key) = resident.as_ref() {
            return Ok(key.clone());
        }

        let key = self.store.get_or_create_key(&self.alias, &self.spec).map_err(|e| {
            warn!(alias = %self.alias, error = %e, "Master key unavailable");
            CipherError::KeyUnavailable(e)
        })?;
        *resident = Some(key.clone());
        Ok(key)
    }

    /// Encrypt a field under a fresh random nonce.
    pub fn seal(&self, plaintext: &str) -> Result<CipherBlob, CipherError> {
        let key = self.key()?;

        let mut nonce = [0u8; NONCE_SIZE];
        SystemRandom::new()
            .fill(&mut nonce)
            .map_err(|_| CipherError::EncryptionFailed)?;

        let ciphertext = encrypt_with(&key, &nonce, plaintext.as_bytes())?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(CipherBlob(blob))
    }

    /// Decrypt a field. Fails closed: a short blob, a tag that does not
    /// verify, or bytes that are not UTF-8 all yield `DecryptionFailed`.
    pub fn open(&self, blob: &CipherBlob) -> Result<Zeroizing<String>, CipherError> {
        let bytes = blob.as_bytes();
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            debug!(len = bytes.len(), "Blob shorter than nonce + tag");
            return Err(CipherError::DecryptionFailed);
        }

        let key = self.key()?;
        let (nonce, sealed) = bytes.split_at(NONCE_SIZE);
        let plaintext = Zeroizing::new(decrypt_with(&key, nonce, sealed)?);

        let text = std::str::from_utf8(&plaintext).map_err(|_| CipherError::DecryptionFailed)?;
        Ok(Zeroizing::new(text.to_owned()))
    }
}

fn encrypt_with(key: &KeyHandle, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    match key.algorithm() {
        Algorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key.material())
            .map_err(|_| CipherError::EncryptionFailed)?
            .encrypt(chacha20poly1305::Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CipherError::EncryptionFailed),
        Algorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key.material())
            .map_err(|_| CipherError::EncryptionFailed)?
            .encrypt(aes_gcm::Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CipherError::EncryptionFailed),
    }
}

fn decrypt_with(key: &KeyHandle, nonce: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
    match key.algorithm() {
        Algorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key.material())
            .map_err(|_| CipherError::DecryptionFailed)?
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::DecryptionFailed),
        Algorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key.material())
            .map_err(|_| CipherError::DecryptionFailed)?
            .decrypt(aes_gcm::Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::DecryptionFailed),
    }
}
