//! Application context
//!
//! Everything a front end needs, built once at startup and passed around
//! explicitly. Dropping the context drops the resident key and every
//! in-process pending clear with it.

use secretum_crypto::{FieldCipher, KeySpec, KeyStore};
use secretum_exposure::{DelayedTaskScheduler, ExposeOutcome, ExposureScheduler, SlotRegistry};
use std::sync::Arc;
use tracing::warn;

use crate::config::VaultConfig;
use crate::model::{RecordId, RevealedSecret, SensitiveField};
use crate::session::Session;
use crate::store::RecordStore;
use crate::vault::{SecretVault, VaultError};

pub struct AppContext {
    config: VaultConfig,
    cipher: Arc<FieldCipher>,
    session: Arc<Session>,
    vault: SecretVault,
    exposure: ExposureScheduler,
}

impl AppContext {
    pub fn new(
        config: VaultConfig,
        keys: Arc<dyn KeyStore>,
        store: Arc<dyn RecordStore>,
        slots: Arc<SlotRegistry>,
        timer: Arc<dyn DelayedTaskScheduler>,
    ) -> Self {
        let cipher = Arc::new(FieldCipher::new(keys, &config.key_alias, KeySpec::new(config.algorithm)));
        let session = Arc::new(Session::new());
        if !config.lock_on_start {
            session.unlock(true);
        }

        let vault = SecretVault::new(store, cipher.clone(), session.clone());
        let exposure = ExposureScheduler::new(slots, timer, config.clear_after());

        Self {
            config,
            cipher,
            session,
            vault,
            exposure,
        }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    pub fn exposure(&self) -> &ExposureScheduler {
        &self.exposure
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Get-or-create the master key without touching any record.
    pub fn ensure_key(&self) -> Result<(), VaultError> {
        self.cipher.key()?;
        Ok(())
    }

    /// Unlock after the platform prompt. A positive prompt still fails if
    /// the master key cannot be produced, and the session stays locked.
    pub fn unlock(&self, authenticated: bool) -> Result<bool, VaultError> {
        if !authenticated {
            return Ok(self.session.unlock(false));
        }

        if let Err(e) = self.cipher.key() {
            warn!(error = %e, "Unlock refused, master key unavailable");
            self.session.lock();
            return Err(e.into());
        }
        Ok(self.session.unlock(true))
    }

    pub fn lock(&self) {
        self.session.lock();
    }

    pub fn reveal(&self, id: RecordId) -> Result<RevealedSecret, VaultError> {
        let record = self.vault.get(id)?;
        self.vault.reveal(&record)
    }

    pub fn copy_field(&self, id: RecordId, field: SensitiveField) -> Result<ExposeOutcome, VaultError> {
        let record = self.vault.get(id)?;
        self.vault.copy_field(&record, field, &self.exposure)
    }
}
