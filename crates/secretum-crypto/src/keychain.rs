//! Master key custody
//!
//! The master key is generated once per installation and lives in a key
//! store we do not implement ourselves: the OS keychain in production, a
//! process-local map in tests. Callers only ever see an opaque
//! [`KeyHandle`]; raw key bytes never leave this crate.

use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// 256-bit key (32 bytes)
pub const KEY_SIZE: usize = 32;

/// AEAD constructions a master key can be bound to.
///
/// Both use a 96-bit nonce and a 128-bit tag, so the blob layout is the
/// same whichever one a key was generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::ChaCha20Poly1305 => "chacha20-poly1305",
            Algorithm::Aes256Gcm => "aes-256-gcm",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "chacha20-poly1305" => Some(Algorithm::ChaCha20Poly1305),
            "aes-256-gcm" => Some(Algorithm::Aes256Gcm),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy a key is created under. Keys are always 256-bit and
/// non-exportable; the only choice is which AEAD they are restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeySpec {
    pub algorithm: Algorithm,
}

impl KeySpec {
    pub const fn new(algorithm: Algorithm) -> Self {
        Self { algorithm }
    }
}

#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("Key store not available: {0}")]
    NotAvailable(String),

    #[error("Key '{alias}' is restricted to {found}, requested {expected}")]
    AlgorithmMismatch {
        alias: String,
        expected: Algorithm,
        found: String,
    },

    #[error("Key '{0}' is unreadable or was invalidated")]
    Invalidated(String),

    #[error("System random generator failed")]
    Rng,
}

/// Opaque reference to a resident master key.
///
/// Cloning shares the same zeroizing allocation; the bytes are scrubbed
/// when the last handle drops.
#[derive(Clone)]
pub struct KeyHandle {
    alias: Arc<str>,
    algorithm: Algorithm,
    material: Arc<Zeroizing<[u8; KEY_SIZE]>>,
}

impl KeyHandle {
    /// Wrap key material produced by a [`KeyStore`] implementation.
    pub fn from_material(alias: &str, algorithm: Algorithm, material: Zeroizing<[u8; KEY_SIZE]>) -> Self {
        Self {
            alias: Arc::from(alias),
            algorithm,
            material: Arc::new(material),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// True when both handles refer to the same key material.
    pub fn same_key(&self, other: &KeyHandle) -> bool {
        Arc::ptr_eq(&self.material, &other.material) || self.material[..] == other.material[..]
    }

    pub(crate) fn material(&self) -> &[u8; KEY_SIZE] {
        &self.material
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("alias", &self.alias)
            .field("algorithm", &self.algorithm)
            .field("material", &"<redacted>")
            .finish()
    }
}

/// Key-store collaborator.
///
/// Implementations must make the check-then-create sequence atomic with
/// respect to concurrent callers: at most one key is ever generated per
/// alias.
pub trait KeyStore: Send + Sync {
    /// Return the key stored under `alias`, generating and persisting one
    /// under `spec` first if none exists.
    fn get_or_create_key(&self, alias: &str, spec: &KeySpec) -> Result<KeyHandle, KeyStoreError>;
}

/// Generate fresh key material from the system CSPRNG
pub fn generate_material() -> Result<Zeroizing<[u8; KEY_SIZE]>, KeyStoreError> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    SystemRandom::new()
        .fill(key.as_mut())
        .map_err(|_| KeyStoreError::Rng)?;
    Ok(key)
}

/// OS keychain backend (macOS Keychain, Secret Service, Windows Credential
/// Manager) via the `keyring` crate.
///
/// The entry value is `<algorithm>:<base64 key>`, which is how the
/// algorithm restriction survives restarts.
pub struct KeyringKeyStore {
    service: String,
    create_lock: Mutex<()>,
    lock_file: Option<PathBuf>,
}

impl KeyringKeyStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            create_lock: Mutex::new(()),
            lock_file: None,
        }
    }

    /// Also serialize key creation with other processes through an
    /// exclusive lock on `path`.
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file = Some(path.into());
        self
    }

    fn entry(&self, alias: &str) -> Result<keyring::Entry, KeyStoreError> {
        keyring::Entry::new(&self.service, alias).map_err(|e| KeyStoreError::NotAvailable(e.to_string()))
    }
}

impl KeyStore for KeyringKeyStore {
    fn get_or_create_key(&self, alias: &str, spec: &KeySpec) -> Result<KeyHandle, KeyStoreError> {
        let _guard = self.create_lock.lock();
        let entry = self.entry(alias)?;
        get_or_create_entry(&entry, self.lock_file.as_deref(), alias, spec)
    }
}

/// One keychain entry holding an encoded key
trait StoredEntry {
    fn read(&self) -> Result<Option<Zeroizing<String>>, KeyStoreError>;

    fn write(&self, encoded: &str) -> Result<(), KeyStoreError>;
}

impl StoredEntry for keyring::Entry {
    fn read(&self) -> Result<Option<Zeroizing<String>>, KeyStoreError> {
        match self.get_password() {
            Ok(stored) => Ok(Some(Zeroizing::new(stored))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeyStoreError::NotAvailable(e.to_string())),
        }
    }

    fn write(&self, encoded: &str) -> Result<(), KeyStoreError> {
        self.set_password(encoded)
            .map_err(|e| KeyStoreError::NotAvailable(e.to_string()))
    }
}

fn lock_exclusive(path: &Path) -> Result<File, KeyStoreError> {
    let unavailable = |e: std::io::Error| KeyStoreError::NotAvailable(format!("{}: {}", path.display(), e));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(unavailable)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(unavailable)?;
    file.lock().map_err(unavailable)?;
    Ok(file)
}

/// Check-then-create under the lock file, if any. The returned key is what
/// the entry holds after the write, not what this call generated.
fn get_or_create_entry(
    entry: &dyn StoredEntry,
    lock_file: Option<&Path>,
    alias: &str,
    spec: &KeySpec,
) -> Result<KeyHandle, KeyStoreError> {
    let _held = lock_file.map(lock_exclusive).transpose()?;

    if let Some(stored) = entry.read()? {
        return decode_entry(alias, spec, &stored);
    }

    let material = generate_material()?;
    entry.write(&encode_entry(spec.algorithm, &material))?;

    let stored = entry
        .read()?
        .ok_or_else(|| KeyStoreError::NotAvailable(format!("key '{}' missing right after creation", alias)))?;
    let handle = decode_entry(alias, spec, &stored)?;
    info!(alias, algorithm = %spec.algorithm, "Generated new master key");
    Ok(handle)
}

fn encode_entry(algorithm: Algorithm, material: &[u8; KEY_SIZE]) -> Zeroizing<String> {
    Zeroizing::new(format!("{}:{}", algorithm.as_str(), STANDARD.encode(material)))
}

fn decode_entry(alias: &str, spec: &KeySpec, stored: &str) -> Result<KeyHandle, KeyStoreError> {
    let (tag, encoded) = stored
        .split_once(':')
        .ok_or_else(|| KeyStoreError::Invalidated(alias.to_string()))?;

    if Algorithm::parse(tag) != Some(spec.algorithm) {
        return Err(KeyStoreError::AlgorithmMismatch {
            alias: alias.to_string(),
            expected: spec.algorithm,
            found: tag.to_string(),
        });
    }

    let decoded = Zeroizing::new(
        STANDARD
            .decode(encoded)
            .map_err(|_| KeyStoreError::Invalidated(alias.to_string()))?,
    );
    if decoded.len() != KEY_SIZE {
        return Err(KeyStoreError::Invalidated(alias.to_string()));
    }

    let mut material = Zeroizing::new([0u8; KEY_SIZE]);
    material.copy_from_slice(&decoded);
    debug!(alias, "Loaded master key from keychain");
    Ok(KeyHandle::from_material(alias, spec.algorithm, material))
}

/// Process-local key store. Shared behind an `Arc`, it outlives the
/// ciphers built on it, which is how tests simulate a restart.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, KeyHandle>>,
    generated: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys generated so far
    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    /// Make every subsequent lookup fail, as when the OS invalidates a key
    /// after a credential change.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_or_create_key(&self, alias: &str, spec: &KeySpec) -> Result<KeyHandle, KeyStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KeyStoreError::NotAvailable("key store disabled".to_string()));
        }

        let mut keys = self.keys.lock();
        if let Some(existing) = keys.get(alias) {
            if existing.algorithm() != spec.algorithm {
                return Err(KeyStoreError::AlgorithmMismatch {
                    alias: alias.to_string(),
                    expected: spec.algorithm,
                    found: existing.algorithm().to_string(),
                });
            }
            return Ok(existing.clone());
        }

        let handle = KeyHandle::from_material(alias, spec.algorithm, generate_material()?);
        self.generated.fetch_add(1, Ordering::SeqCst);
        keys.insert(alias.to_string(), handle.clone());
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let store = MemoryKeyStore::new();
        let spec = KeySpec::default();

        let first = store.get_or_create_key("master", &spec).unwrap();
        let second = store.get_or_create_key("master", &spec).unwrap();

        assert!(first.same_key(&second));
        assert_eq!(store.generated(), 1);
    }

    #[test]
    fn test_distinct_aliases_get_distinct_keys() {
        let store = MemoryKeyStore::new();
        let spec = KeySpec::default();

        let a = store.get_or_create_key("a", &spec).unwrap();
        let b = store.get_or_create_key("b", &spec).unwrap();

        assert!(!a.same_key(&b));
        assert_eq!(store.generated(), 2);
    }

    #[test]
    fn test_concurrent_first_use_generates_one_key() {
        let store = Arc::new(MemoryKeyStore::new());
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.get_or_create_key("master", &KeySpec::default()).unwrap()
                })
            })
            .collect();

        let keys: Vec<KeyHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(store.generated(), 1);
        assert!(keys.iter().all(|k| k.same_key(&keys[0])));
    }

    #[test]
    fn test_algorithm_restriction_is_enforced() {
        let store = MemoryKeyStore::new();
        store
            .get_or_create_key("master", &KeySpec::new(Algorithm::ChaCha20Poly1305))
            .unwrap();

        let err = store
            .get_or_create_key("master", &KeySpec::new(Algorithm::Aes256Gcm))
            .unwrap_err();
        assert!(matches!(err, KeyStoreError::AlgorithmMismatch { .. }));
    }

    #[test]
    fn test_unavailable_store_errors() {
        let store = MemoryKeyStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get_or_create_key("master", &KeySpec::default()),
            Err(KeyStoreError::NotAvailable(_))
        ));
    }

    #[test]
    fn test_keychain_entry_roundtrip() {
        let spec = KeySpec::new(Algorithm::Aes256Gcm);
        let material = generate_material().unwrap();
        let encoded = encode_entry(spec.algorithm, &material);
        assert!(encoded.starts_with("aes-256-gcm:"));

        let handle = decode_entry("master", &spec, &encoded).unwrap();
        assert_eq!(handle.material(), &*material);
        assert_eq!(handle.algorithm(), Algorithm::Aes256Gcm);
    }

    #[test]
    fn test_keychain_entry_rejects_garbage() {
        let spec = KeySpec::default();
        assert!(matches!(
            decode_entry("master", &spec, "no-separator"),
            Err(KeyStoreError::Invalidated(_))
        ));
        assert!(matches!(
            decode_entry("master", &spec, "chacha20-poly1305:AAAA"),
            Err(KeyStoreError::Invalidated(_))
        ));
        assert!(matches!(
            decode_entry("master", &spec, "aes-256-gcm:AAAA"),
            Err(KeyStoreError::AlgorithmMismatch { .. })
        ));
    }

    /// Keychain entry shared by every "process" in a test, with a slow
    /// read to widen the check-then-create window.
    #[derive(Default)]
    struct SharedEntry {
        value: Mutex<Option<String>>,
        writes: AtomicUsize,
        overwrite_with: Option<String>,
    }

    impl StoredEntry for SharedEntry {
        fn read(&self) -> Result<Option<Zeroizing<String>>, KeyStoreError> {
            let value = self.value.lock().clone();
            thread::sleep(std::time::Duration::from_millis(5));
            Ok(value.map(Zeroizing::new))
        }

        fn write(&self, encoded: &str) -> Result<(), KeyStoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let stored = self.overwrite_with.clone().unwrap_or_else(|| encoded.to_string());
            *self.value.lock() = Some(stored);
            Ok(())
        }
    }

    #[test]
    fn test_lock_file_serializes_first_run_across_stores() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("keychain.lock");
        let entry = Arc::new(SharedEntry::default());
        let barrier = Arc::new(Barrier::new(8));

        // No shared in-process mutex: each thread stands in for a process
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let entry = Arc::clone(&entry);
                let barrier = Arc::clone(&barrier);
                let lock_path = lock_path.clone();
                thread::spawn(move || {
                    barrier.wait();
                    get_or_create_entry(&*entry, Some(lock_path.as_path()), "master", &KeySpec::default()).unwrap()
                })
            })
            .collect();

        let keys: Vec<KeyHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(entry.writes.load(Ordering::SeqCst), 1);
        assert!(keys.iter().all(|k| k.same_key(&keys[0])));
    }

    #[test]
    fn test_created_key_is_what_the_entry_holds() {
        let spec = KeySpec::default();
        let winner = generate_material().unwrap();
        let entry = SharedEntry {
            overwrite_with: Some((*encode_entry(spec.algorithm, &winner)).clone()),
            ..SharedEntry::default()
        };

        let handle = get_or_create_entry(&entry, None, "master", &spec).unwrap();
        assert_eq!(handle.material(), &*winner);
    }

    #[test]
    fn test_debug_redacts_material() {
        let store = MemoryKeyStore::new();
        let key = store.get_or_create_key("master", &KeySpec::default()).unwrap();
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("master"));
    }
}
