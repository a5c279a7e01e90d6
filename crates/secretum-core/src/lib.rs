//! Secretum Core - secret records and the vault built around them
//!
//! Composes the field cipher and the exposure scheduler over a storage
//! backend. Storage only ever sees sealed records.

pub mod config;
pub mod context;
pub mod model;
pub mod session;
pub mod store;
pub mod vault;

pub use config::{secretum_home, ConfigError, VaultConfig};
pub use context::AppContext;
pub use model::{RecordId, RevealedField, RevealedSecret, SecretDraft, SecretRecord, SecretType, SensitiveField};
pub use session::Session;
pub use store::{MemoryRecordStore, RecordStore, StoreError};
pub use vault::{SecretVault, VaultError};
