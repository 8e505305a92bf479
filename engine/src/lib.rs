//! Context Vault engine — a local-first, file-backed, hybrid-search
//! knowledge store.
//!
//! Markdown files under the vault root are the source of truth; a SQLite
//! primary store with an FTS5 shadow and a 384-float vector table is the
//! derived, queryable copy, reconciled by [`reindex`]. The
//! [`dispatch::Dispatcher`] exposes the seven engine operations behind a
//! shared wrapper (auto-reindex, 60-second timeout, degradation notes);
//! [`tenant::TenantContext`] scopes everything to one tenant and carries the
//! optional encryption and limit capabilities.

pub mod capture;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod embed;
pub mod import;
pub mod reindex;
pub mod retrieve;
pub mod status;
pub mod store;
pub mod tenant;

pub use config::{ConfigOverrides, VaultConfig};
pub use dispatch::{tool_definitions, Dispatcher, ToolResponse, UrlIngestor};
pub use embed::LazyEmbedder;
pub use reindex::ReindexReport;
pub use store::VaultStore;
pub use tenant::{StorePool, TenantContext, TierLimits};

use std::sync::Arc;

/// Open a local single-tenant engine from resolved configuration: store,
/// embedder, vault root, dispatcher.
pub fn open_local(config: &VaultConfig) -> context_vault_core::VaultResult<Dispatcher> {
    capture::init_vault(&config.vault_dir)?;
    let store = Arc::new(VaultStore::open(&config.db_path)?);
    #[cfg(feature = "semantic")]
    let embedder = Arc::new(LazyEmbedder::fastembed());
    #[cfg(not(feature = "semantic"))]
    let embedder = Arc::new(LazyEmbedder::disabled("built without semantic search"));
    let ctx = TenantContext::local(store, embedder, config.vault_dir.clone());
    Ok(Dispatcher::new(ctx, config))
}
