//! Test harness for engine operation tests.
//!
//! Builds dispatchers over a temp vault root and an in-process store, with a
//! deterministic embedding backend — no transport, no model downloads.

use std::sync::Arc;

use tempfile::TempDir;

use context_vault_engine::capture::init_vault;
use context_vault_engine::config::VaultConfig;
use context_vault_engine::embed::testing::hash_embedder;
use context_vault_engine::embed::LazyEmbedder;
use context_vault_engine::store::VaultStore;
use context_vault_engine::tenant::TenantContext;
use context_vault_engine::Dispatcher;

pub struct TestHarness {
    pub store: Arc<VaultStore>,
    pub root: std::path::PathBuf,
    pub config: VaultConfig,
    _tmp: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("temp dir");
        let root = tmp.path().join("vault");
        init_vault(&root).expect("init vault");
        let db_path = tmp.path().join("vault.db");
        let store = Arc::new(VaultStore::open(&db_path).expect("open store"));
        let config = VaultConfig::resolve_with(
            Default::default(),
            &|_| None,
            Some(tmp.path().to_path_buf()),
            tmp.path(),
        )
        .expect("config");
        Self { store, root, config, _tmp: tmp }
    }

    /// Context for one tenant over the shared store and vault root.
    pub fn context_for(&self, user: Option<&str>) -> TenantContext {
        let mut ctx = TenantContext::local(
            self.store.clone(),
            Arc::new(hash_embedder()),
            self.root.clone(),
        );
        ctx.user_id = user.map(String::from);
        ctx
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.context_for(None), &self.config)
    }

    pub fn dispatcher_for(&self, user: &str) -> Dispatcher {
        Dispatcher::new(self.context_for(Some(user)), &self.config)
    }

    /// Dispatcher whose embedder never loads — lexical-only retrieval.
    pub fn dispatcher_without_embeddings(&self) -> Dispatcher {
        let mut ctx = self.context_for(None);
        ctx.embedder = Arc::new(LazyEmbedder::disabled("offline test"));
        Dispatcher::new(ctx, &self.config)
    }
}
