//! The entry model — the atomic unit of the vault.
//!
//! An entry is one markdown file on disk, one row in the primary store, and
//! (at most) one representation in each derived index. `Entry` is the fully
//! plaintext view handed to callers; `EntryRecord` is the persistence-facing
//! form whose content may be ciphertext.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{VaultError, VaultResult};
use crate::kind::Category;

// ---------------------------------------------------------------------------
// Field limits
// ---------------------------------------------------------------------------

pub const MAX_TITLE_CHARS: usize = 500;
pub const MAX_BODY_BYTES: usize = 100 * 1024;
pub const MAX_META_BYTES: usize = 10 * 1024;
pub const MAX_TAGS: usize = 20;
pub const MAX_TAG_CHARS: usize = 100;
pub const MAX_SOURCE_CHARS: usize = 200;
pub const MAX_IDENTITY_KEY_CHARS: usize = 200;

/// Length of a ULID in its canonical Crockford base32 form.
pub const ID_CHARS: usize = 26;

/// Generate a fresh entry id (26-char ULID, lexicographically time-ordered).
pub fn new_entry_id() -> String {
    Ulid::new().to_string()
}

/// Check that a string is a well-formed entry id.
pub fn is_entry_id(s: &str) -> bool {
    s.len() == ID_CHARS && Ulid::from_string(s).is_ok()
}

// ---------------------------------------------------------------------------
// Entry (plaintext view)
// ---------------------------------------------------------------------------

/// Free-form per-kind metadata. Never indexed.
pub type Meta = serde_json::Map<String, serde_json::Value>;

/// A fully-populated, plaintext entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub kind: String,
    pub category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Entry {
    /// Whether the entry is expired at `now`. Expired entries never appear
    /// in any response.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    /// Text fed to the embedder: title and body, newline-joined.
    pub fn embedding_text(&self) -> String {
        match &self.title {
            Some(t) if !t.is_empty() => format!("{t}\n{}", self.body),
            _ => self.body.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// EntryContent (persistence-facing)
// ---------------------------------------------------------------------------

/// Content of a stored row: plaintext columns, or ciphertext columns with an
/// IV. A row never carries both — plaintext columns are empty when the
/// ciphertext columns are populated.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryContent {
    Plain {
        title: Option<String>,
        body: String,
        meta: Option<Meta>,
    },
    Encrypted {
        title: Option<Vec<u8>>,
        body: Vec<u8>,
        meta: Option<Vec<u8>>,
        iv: Vec<u8>,
    },
}

impl EntryContent {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, EntryContent::Encrypted { .. })
    }
}

/// Persistence-facing entry: everything in [`Entry`] except that content may
/// still be ciphertext. Decryption happens at the dispatcher boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRecord {
    pub id: String,
    pub kind: String,
    pub category: Category,
    pub content: EntryContent,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub identity_key: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub user_id: Option<String>,
}

impl EntryRecord {
    /// Convert a plaintext record into an [`Entry`]. Fails on ciphertext.
    pub fn into_entry(self) -> VaultResult<Entry> {
        match self.content {
            EntryContent::Plain { title, body, meta } => Ok(Entry {
                id: self.id,
                kind: self.kind,
                category: self.category,
                title,
                body,
                meta,
                tags: self.tags,
                source: self.source,
                identity_key: self.identity_key,
                expires_at: self.expires_at,
                file_path: self.file_path,
                created_at: self.created_at,
                user_id: self.user_id,
            }),
            EntryContent::Encrypted { .. } => Err(VaultError::Internal(
                "attempted to read an encrypted record without a decrypter".into(),
            )),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

impl From<Entry> for EntryRecord {
    fn from(e: Entry) -> Self {
        EntryRecord {
            id: e.id,
            kind: e.kind,
            category: e.category,
            content: EntryContent::Plain { title: e.title, body: e.body, meta: e.meta },
            tags: e.tags,
            source: e.source,
            identity_key: e.identity_key,
            expires_at: e.expires_at,
            file_path: e.file_path,
            created_at: e.created_at,
            user_id: e.user_id,
        }
    }
}

// ---------------------------------------------------------------------------
// EntryInput (capture input)
// ---------------------------------------------------------------------------

/// Caller-supplied fields for a save or update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryInput {
    /// Present → update that entry; absent → create.
    pub id: Option<String>,
    /// Required for creates. Canonical singular (normalized at the boundary).
    pub kind: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub meta: Option<Meta>,
    pub tags: Option<Vec<String>>,
    pub source: Option<String>,
    /// Optional subfolder under the kind directory.
    pub folder: Option<String>,
    pub identity_key: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EntryInput {
    /// Shape and size validation shared by create and update paths.
    pub fn validate(&self) -> VaultResult<()> {
        if let Some(title) = &self.title {
            if title.chars().count() > MAX_TITLE_CHARS {
                return Err(VaultError::InvalidInput(format!(
                    "title exceeds {MAX_TITLE_CHARS} characters"
                )));
            }
            if title.contains('\n') {
                return Err(VaultError::InvalidInput("title must be a single line".into()));
            }
        }
        if let Some(body) = &self.body {
            if body.is_empty() {
                return Err(VaultError::InvalidInput("body must be non-empty".into()));
            }
            if body.len() > MAX_BODY_BYTES {
                return Err(VaultError::InvalidInput(format!(
                    "body exceeds {} KiB",
                    MAX_BODY_BYTES / 1024
                )));
            }
        }
        if let Some(meta) = &self.meta {
            let serialized = serde_json::to_string(meta)
                .map_err(|e| VaultError::InvalidInput(format!("meta is not serializable: {e}")))?;
            if serialized.len() > MAX_META_BYTES {
                return Err(VaultError::InvalidInput(format!(
                    "meta exceeds {} KiB serialized",
                    MAX_META_BYTES / 1024
                )));
            }
        }
        if let Some(tags) = &self.tags {
            if tags.len() > MAX_TAGS {
                return Err(VaultError::InvalidInput(format!("more than {MAX_TAGS} tags")));
            }
            if let Some(bad) = tags.iter().find(|t| t.chars().count() > MAX_TAG_CHARS) {
                return Err(VaultError::InvalidInput(format!(
                    "tag {bad:?} exceeds {MAX_TAG_CHARS} characters"
                )));
            }
        }
        if let Some(source) = &self.source {
            if source.chars().count() > MAX_SOURCE_CHARS {
                return Err(VaultError::InvalidInput(format!(
                    "source exceeds {MAX_SOURCE_CHARS} characters"
                )));
            }
        }
        if let Some(key) = &self.identity_key {
            if key.is_empty() || key.chars().count() > MAX_IDENTITY_KEY_CHARS {
                return Err(VaultError::InvalidInput(format!(
                    "identity_key must be 1..={MAX_IDENTITY_KEY_CHARS} characters"
                )));
            }
        }
        if let Some(folder) = &self.folder {
            if folder.contains("..") || folder.starts_with('/') || folder.contains('\\') {
                return Err(VaultError::PathTraversal(folder.clone()));
            }
        }
        Ok(())
    }
}
