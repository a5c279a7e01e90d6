//! Vault repository
//!
//! Seals drafts into records on the way into storage and opens them on
//! demand on the way out. Titles and categories stay plaintext so listing
//! and searching never touch the master key.

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use secretum_crypto::{CipherBlob, CipherError, FieldCipher};
use secretum_exposure::{ExposeOutcome, ExposureError, ExposureScheduler, SlotId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{RecordId, RevealedField, RevealedSecret, SecretDraft, SecretRecord, SecretType, SensitiveField};
use crate::session::Session;
use crate::store::{RecordStore, StoreError};

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Vault is locked")]
    Locked,

    #[error("Secret {0} not found")]
    NotFound(RecordId),

    #[error("Secret has no {0}")]
    FieldAbsent(SensitiveField),

    #[error(transparent)]
    Crypto(#[from] CipherError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Exposure(#[from] ExposureError),
}

impl From<StoreError> for VaultError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => VaultError::NotFound(id),
            other => VaultError::Store(other),
        }
    }
}

impl VaultError {
    /// True when the master key could not be produced; the front end shows
    /// this as a locked/unavailable vault rather than a broken entry.
    pub fn is_key_unavailable(&self) -> bool {
        matches!(self, VaultError::Crypto(CipherError::KeyUnavailable(_)))
    }
}

pub struct SecretVault {
    store: Arc<dyn RecordStore>,
    cipher: Arc<FieldCipher>,
    session: Arc<Session>,
}

impl SecretVault {
    pub fn new(store: Arc<dyn RecordStore>, cipher: Arc<FieldCipher>, session: Arc<Session>) -> Self {
        Self { store, cipher, session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn seal_draft(&self, id: Option<RecordId>, draft: &SecretDraft, created_at: chrono::DateTime<Utc>) -> Result<SecretRecord, VaultError> {
        let note = match &draft.note {
            Some(note) => Some(self.cipher.seal(note.expose_secret())?),
            None => None,
        };

        Ok(SecretRecord {
            id,
            title: draft.title.clone(),
            category: draft.category,
            created_at,
            account: self.cipher.seal(draft.account.expose_secret())?,
            password: self.cipher.seal(draft.password.expose_secret())?,
            note,
        })
    }

    pub fn add(&self, draft: &SecretDraft) -> Result<RecordId, VaultError> {
        let record = self.seal_draft(None, draft, Utc::now())?;
        let id = self.store.put(&record)?;
        info!(id, category = draft.category.tag(), "Secret added");
        Ok(id)
    }

    /// Reseal every sensitive field of an existing record. The creation
    /// time is kept; all blobs are replaced.
    pub fn update(&self, id: RecordId, draft: &SecretDraft) -> Result<(), VaultError> {
        let existing = self.get(id)?;
        let record = self.seal_draft(Some(id), draft, existing.created_at)?;
        self.store.put(&record)?;
        info!(id, "Secret updated");
        Ok(())
    }

    pub fn delete(&self, id: RecordId) -> Result<(), VaultError> {
        self.store.delete(id)?;
        info!(id, "Secret deleted");
        Ok(())
    }

    pub fn get(&self, id: RecordId) -> Result<SecretRecord, VaultError> {
        self.store.get(id)?.ok_or(VaultError::NotFound(id))
    }

    /// All records, newest first. Nothing is decrypted.
    pub fn list(&self) -> Result<Vec<SecretRecord>, VaultError> {
        let mut records = self.store.list_all()?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    pub fn by_category(&self, category: SecretType) -> Result<Vec<SecretRecord>, VaultError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.category == category)
            .collect())
    }

    /// Case-insensitive substring match over title and category label,
    /// ordered by title. A blank query matches nothing.
    pub fn search(&self, query: &str) -> Result<Vec<SecretRecord>, VaultError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SecretRecord> = self
            .store
            .list_all()?
            .into_iter()
            .filter(|r| {
                r.title.to_lowercase().contains(&needle) || r.category.label().to_lowercase().contains(&needle)
            })
            .collect();
        hits.sort_by_cached_key(|r| r.title.to_lowercase());
        debug!(hits = hits.len(), "Search finished");
        Ok(hits)
    }

    fn open_field(&self, blob: Option<&CipherBlob>) -> Result<RevealedField, VaultError> {
        let Some(blob) = blob else {
            return Ok(RevealedField::Absent);
        };

        match self.cipher.open(blob) {
            Ok(mut plain) => Ok(RevealedField::Value(SecretString::new(std::mem::take(&mut *plain)))),
            Err(CipherError::DecryptionFailed) => Ok(RevealedField::Corrupted),
            Err(e) => Err(e.into()),
        }
    }

    /// Decrypt every sensitive field. A field that fails to open comes
    /// back as [`RevealedField::Corrupted`]; an unavailable key fails the
    /// whole call.
    pub fn reveal(&self, record: &SecretRecord) -> Result<RevealedSecret, VaultError> {
        self.session.ensure_unlocked()?;

        let revealed = RevealedSecret {
            id: record.id,
            title: record.title.clone(),
            category: record.category,
            created_at: record.created_at,
            account: self.open_field(Some(&record.account))?,
            password: self.open_field(Some(&record.password))?,
            note: self.open_field(record.note.as_ref())?,
        };

        if !revealed.is_intact() {
            warn!(id = ?record.id, "Secret has fields that failed to decrypt");
        }
        Ok(revealed)
    }

    pub fn reveal_field(&self, record: &SecretRecord, field: SensitiveField) -> Result<SecretString, VaultError> {
        self.session.ensure_unlocked()?;

        let blob = record.blob(field).ok_or(VaultError::FieldAbsent(field))?;
        let mut plain = self.cipher.open(blob).map_err(|e| {
            warn!(id = ?record.id, field = field.name(), error = %e, "Field failed to open");
            e
        })?;
        Ok(SecretString::new(std::mem::take(&mut *plain)))
    }

    /// Reveal one field and expose it through the clipboard slot.
    pub fn copy_field(
        &self,
        record: &SecretRecord,
        field: SensitiveField,
        exposure: &ExposureScheduler,
    ) -> Result<ExposeOutcome, VaultError> {
        let value = self.reveal_field(record, field)?;
        let outcome = exposure.expose(&SlotId::clipboard(), value.expose_secret())?;
        info!(id = ?record.id, field = field.name(), guarded = outcome.is_guarded(), "Copied field to clipboard");
        Ok(outcome)
    }
}
