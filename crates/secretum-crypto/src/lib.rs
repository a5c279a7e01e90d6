//! Secretum Crypto - encryption at rest for sensitive record fields
//!
//! This crate provides:
//! - `FieldCipher`: seal/open of single fields with an AEAD
//! - `CipherBlob`: the `nonce || ciphertext || tag` on-disk form
//! - `KeyStore`: get-or-create custody of the master key, backed by the
//!   OS keychain in production

pub mod cipher;
pub mod keychain;

pub use cipher::{CipherBlob, CipherError, FieldCipher, NONCE_SIZE, TAG_SIZE};
pub use keychain::{
    Algorithm, KeyHandle, KeySpec, KeyStore, KeyStoreError, KeyringKeyStore, MemoryKeyStore, KEY_SIZE,
};
