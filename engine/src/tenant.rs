//! Tenant scoping and capabilities.
//!
//! A [`TenantContext`] is the ctx every operation runs under: the store, the
//! embedder, the vault root, the caller's ids, and three optional
//! capabilities (`Encrypter`, `Decrypter`, `LimitChecker`). Hosted and local
//! deployments share one code path and differ only in which capabilities the
//! context carries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use context_vault_core::entry::{EntryContent, EntryRecord, Meta};
use context_vault_core::slug::slugify;
use context_vault_core::{VaultError, VaultResult};

use crate::crypto::EnvelopeCrypto;
use crate::embed::LazyEmbedder;
use crate::store::VaultStore;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

pub trait Encrypter: Send + Sync {
    fn encrypt_content(
        &self,
        user_id: &str,
        title: Option<&str>,
        body: &str,
        meta: Option<&Meta>,
    ) -> VaultResult<EntryContent>;
}

pub trait Decrypter: Send + Sync {
    fn decrypt_record(&self, rec: EntryRecord) -> VaultResult<EntryRecord>;
}

pub trait LimitChecker: Send + Sync {
    /// Called before a write with the incoming content size. Computes live
    /// usage and fails with `LIMIT_EXCEEDED` when the tier cap is reached.
    fn check_write(
        &self,
        store: &VaultStore,
        user_id: Option<&str>,
        incoming_bytes: u64,
    ) -> VaultResult<()>;
}

impl Encrypter for EnvelopeCrypto {
    fn encrypt_content(
        &self,
        user_id: &str,
        title: Option<&str>,
        body: &str,
        meta: Option<&Meta>,
    ) -> VaultResult<EntryContent> {
        EnvelopeCrypto::encrypt_content(self, user_id, title, body, meta)
    }
}

impl Decrypter for EnvelopeCrypto {
    fn decrypt_record(&self, rec: EntryRecord) -> VaultResult<EntryRecord> {
        EnvelopeCrypto::decrypt_record(self, rec)
    }
}

// ---------------------------------------------------------------------------
// Tier limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct TierLimits {
    pub max_entries: Option<u64>,
    pub max_storage_bytes: Option<u64>,
}

impl TierLimits {
    pub const fn unlimited() -> Self {
        Self { max_entries: None, max_storage_bytes: None }
    }
}

/// Limit checker backed by a static tier. The read-then-write race is
/// accepted: limits are advisory and checked once per request.
#[derive(Debug, Clone, Copy)]
pub struct TierLimitChecker {
    pub limits: TierLimits,
}

impl LimitChecker for TierLimitChecker {
    fn check_write(
        &self,
        store: &VaultStore,
        user_id: Option<&str>,
        incoming_bytes: u64,
    ) -> VaultResult<()> {
        if let Some(max_entries) = self.limits.max_entries {
            let count = store.entry_count(user_id)?;
            if count >= max_entries {
                return Err(VaultError::LimitExceeded(format!(
                    "entry cap reached ({count}/{max_entries})"
                )));
            }
        }
        if let Some(max_storage) = self.limits.max_storage_bytes {
            let used = store.storage_bytes(user_id)?;
            if used.saturating_add(incoming_bytes) > max_storage {
                return Err(VaultError::LimitExceeded(format!(
                    "storage cap reached ({used} + {incoming_bytes} > {max_storage} bytes)"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TenantContext
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TenantContext {
    pub store: Arc<VaultStore>,
    pub embedder: Arc<LazyEmbedder>,
    pub vault_root: PathBuf,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub limits: Option<Arc<dyn LimitChecker>>,
    pub encrypter: Option<Arc<dyn Encrypter>>,
    pub decrypter: Option<Arc<dyn Decrypter>>,
    /// Hosted per-tenant mode: writes index inline, auto-reindex is skipped.
    pub inline_index: bool,
}

impl std::fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantContext")
            .field("vault_root", &self.vault_root)
            .field("user_id", &self.user_id)
            .field("encrypted", &self.encrypter.is_some())
            .finish_non_exhaustive()
    }
}

impl TenantContext {
    /// Single-tenant local mode: no limits, no encryption.
    pub fn local(store: Arc<VaultStore>, embedder: Arc<LazyEmbedder>, vault_root: PathBuf) -> Self {
        Self {
            store,
            embedder,
            vault_root,
            user_id: None,
            team_id: None,
            limits: None,
            encrypter: None,
            decrypter: None,
            inline_index: false,
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn encrypts(&self) -> bool {
        self.encrypter.is_some() && self.user_id.is_some()
    }

    pub fn check_limits(&self, incoming_bytes: u64) -> VaultResult<()> {
        match &self.limits {
            Some(checker) => checker.check_write(&self.store, self.user(), incoming_bytes),
            None => Ok(()),
        }
    }

    /// Decrypt a record when a decrypter is present; otherwise require it to
    /// already be plaintext.
    pub fn decrypt(&self, rec: EntryRecord) -> VaultResult<EntryRecord> {
        if rec.content.is_encrypted() {
            match &self.decrypter {
                Some(d) => d.decrypt_record(rec),
                None => Err(VaultError::Internal(
                    "encrypted record but context has no decrypter".into(),
                )),
            }
        } else {
            Ok(rec)
        }
    }
}

// ---------------------------------------------------------------------------
// Per-tenant store pool
// ---------------------------------------------------------------------------

/// Lazily-opened physical store per tenant, keyed by `user_id`. Each store
/// contains only that tenant's rows; path scoping is enforced here.
pub struct StorePool {
    data_dir: PathBuf,
    stores: DashMap<String, Arc<VaultStore>>,
}

impl StorePool {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir, stores: DashMap::new() }
    }

    /// Open (or reuse) the store for a tenant. The user id is slugified into
    /// the path so it can never traverse outside `data_dir`.
    pub fn store_for(&self, user_id: &str) -> VaultResult<Arc<VaultStore>> {
        if let Some(existing) = self.stores.get(user_id) {
            return Ok(existing.clone());
        }
        let dir_name = slugify(user_id);
        let db_path = self.data_dir.join("tenants").join(&dir_name).join("vault.db");
        if !db_path.starts_with(&self.data_dir) {
            return Err(VaultError::PathTraversal(db_path.display().to_string()));
        }
        let store = Arc::new(VaultStore::open(&db_path)?);
        info!(user_id, path = %db_path.display(), "opened tenant store");
        self.stores.insert(user_id.to_string(), store.clone());
        Ok(store)
    }

    /// Drop the pooled handle (tenant deletion). The database file is left
    /// to the caller.
    pub fn evict(&self, user_id: &str) {
        self.stores.remove(user_id);
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
