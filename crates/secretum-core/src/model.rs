//! Secret records
//!
//! A [`SecretRecord`] is what storage holds: plaintext metadata plus one
//! sealed blob per sensitive field. A [`RevealedSecret`] is the transient,
//! never-persisted view produced by decrypting one.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use secretum_crypto::CipherBlob;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned by storage on creation
pub type RecordId = i64;

/// Category tag, stored as plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecretType {
    Work,
    Wifi,
    Education,
    Private,
    #[default]
    Else,
}

impl SecretType {
    pub const ALL: [SecretType; 5] = [
        SecretType::Work,
        SecretType::Wifi,
        SecretType::Education,
        SecretType::Private,
        SecretType::Else,
    ];

    /// Persisted tag
    pub fn tag(&self) -> &'static str {
        match self {
            SecretType::Work => "WORK",
            SecretType::Wifi => "WIFI",
            SecretType::Education => "EDUCATION",
            SecretType::Private => "PRIVATE",
            SecretType::Else => "ELSE",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SecretType::Work => "Work",
            SecretType::Wifi => "WiFi",
            SecretType::Education => "Education",
            SecretType::Private => "Private",
            SecretType::Else => "Other",
        }
    }

    /// Case-insensitive; anything unrecognised files under `Else`.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_uppercase().as_str() {
            "WORK" => SecretType::Work,
            "WIFI" => SecretType::Wifi,
            "EDUCATION" => SecretType::Education,
            "PRIVATE" => SecretType::Private,
            _ => SecretType::Else,
        }
    }
}

impl fmt::Display for SecretType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensitiveField {
    Account,
    Password,
    Note,
}

impl SensitiveField {
    pub fn name(&self) -> &'static str {
        match self {
            SensitiveField::Account => "account",
            SensitiveField::Password => "password",
            SensitiveField::Note => "note",
        }
    }
}

impl fmt::Display for SensitiveField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A record as persisted. Sensitive fields only ever exist here as blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    /// `None` until storage assigns one
    pub id: Option<RecordId>,
    pub title: String,
    pub category: SecretType,
    pub created_at: DateTime<Utc>,
    pub account: CipherBlob,
    pub password: CipherBlob,
    pub note: Option<CipherBlob>,
}

impl SecretRecord {
    pub fn blob(&self, field: SensitiveField) -> Option<&CipherBlob> {
        match field {
            SensitiveField::Account => Some(&self.account),
            SensitiveField::Password => Some(&self.password),
            SensitiveField::Note => self.note.as_ref(),
        }
    }
}

/// Plaintext input for creating or editing a record.
pub struct SecretDraft {
    pub title: String,
    pub category: SecretType,
    pub account: SecretString,
    pub password: SecretString,
    pub note: Option<SecretString>,
}

impl SecretDraft {
    pub fn new(title: &str, category: SecretType, account: SecretString, password: SecretString) -> Self {
        Self {
            title: title.trim().to_string(),
            category,
            account,
            password,
            note: None,
        }
    }

    /// A blank note is treated as no note.
    pub fn with_note(mut self, note: SecretString) -> Self {
        self.note = if note.expose_secret().trim().is_empty() {
            None
        } else {
            Some(note)
        };
        self
    }
}

impl fmt::Debug for SecretDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretDraft")
            .field("title", &self.title)
            .field("category", &self.category)
            .field("has_note", &self.note.is_some())
            .finish_non_exhaustive()
    }
}

/// One decrypted field.
///
/// `Corrupted` means the blob failed to open. It is deliberately distinct
/// from `Absent` (an optional field that was never set) and from an empty
/// `Value`.
pub enum RevealedField {
    Value(SecretString),
    Absent,
    Corrupted,
}

impl RevealedField {
    pub fn expose(&self) -> Option<&str> {
        match self {
            RevealedField::Value(v) => Some(v.expose_secret().as_str()),
            _ => None,
        }
    }

    pub fn is_corrupted(&self) -> bool {
        matches!(self, RevealedField::Corrupted)
    }
}

impl fmt::Debug for RevealedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevealedField::Value(_) => f.write_str("Value(<redacted>)"),
            RevealedField::Absent => f.write_str("Absent"),
            RevealedField::Corrupted => f.write_str("Corrupted"),
        }
    }
}

/// Decrypted view of a record. Lives only as long as the caller holds it.
#[derive(Debug)]
pub struct RevealedSecret {
    pub id: Option<RecordId>,
    pub title: String,
    pub category: SecretType,
    pub created_at: DateTime<Utc>,
    pub account: RevealedField,
    pub password: RevealedField,
    pub note: RevealedField,
}

impl RevealedSecret {
    pub fn field(&self, field: SensitiveField) -> &RevealedField {
        match field {
            SensitiveField::Account => &self.account,
            SensitiveField::Password => &self.password,
            SensitiveField::Note => &self.note,
        }
    }

    /// True when no field failed to decrypt
    pub fn is_intact(&self) -> bool {
        ![&self.account, &self.password, &self.note]
            .iter()
            .any(|f| f.is_corrupted())
    }
}
