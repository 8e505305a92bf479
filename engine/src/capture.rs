//! Capture: produce a canonical entry on disk and in the primary store,
//! exactly once, under safe paths.
//!
//! The file is written whole in a single call, then the row is inserted and
//! the derived indices refreshed. Entities upsert on
//! `(user_id, kind, identity_key)`; everything else is append-only. When the
//! context encrypts, the store is authoritative and no plaintext file is
//! written.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use context_vault_core::entry::{Entry, EntryContent, EntryInput, EntryRecord, Meta};
use context_vault_core::frontmatter::{serialize_document, RESERVED_KEYS};
use context_vault_core::kind::{category_for, kind_dir, validate_kind, Category};
use context_vault_core::slug::slugify;
use context_vault_core::{VaultError, VaultResult};

use crate::clock::now;
use crate::tenant::TenantContext;

/// Marker file identifying an initialized vault root.
pub const VAULT_MARKER: &str = ".context-mcp";

// ---------------------------------------------------------------------------
// Vault root
// ---------------------------------------------------------------------------

/// Initialize a vault root: category directories plus the marker file.
pub fn init_vault(root: &Path) -> VaultResult<()> {
    for category in Category::ALL {
        std::fs::create_dir_all(root.join(category.as_str()))?;
    }
    let marker = root.join(VAULT_MARKER);
    if !marker.exists() {
        let payload = serde_json::json!({
            "created": crate::clock::fmt_ts(&now()),
            "version": env!("CARGO_PKG_VERSION"),
        });
        std::fs::write(&marker, serde_json::to_string(&payload).unwrap_or_default())?;
        info!(root = %root.display(), "initialized vault");
    }
    Ok(())
}

/// Every operation requires an initialized root.
pub fn ensure_vault(root: &Path) -> VaultResult<()> {
    if root.is_dir() && root.join(VAULT_MARKER).is_file() {
        Ok(())
    } else {
        Err(VaultError::VaultNotFound(root.display().to_string()))
    }
}

// ---------------------------------------------------------------------------
// Paths and filenames
// ---------------------------------------------------------------------------

/// Absolute target directory for a kind (plus optional subfolder), rejected
/// unless it stays strictly within the vault root.
pub fn entry_dir(root: &Path, kind: &str, folder: Option<&str>) -> VaultResult<PathBuf> {
    let mut dir = root.join(kind_dir(kind));
    if let Some(folder) = folder {
        if folder.contains("..") || folder.starts_with('/') || folder.contains('\\') {
            return Err(VaultError::PathTraversal(folder.to_string()));
        }
        dir = dir.join(folder);
    }
    if !dir.starts_with(root) {
        return Err(VaultError::PathTraversal(dir.display().to_string()));
    }
    Ok(dir)
}

/// Filename policy. Entities with an identity key get a deterministic name
/// (enables upsert-by-file); everything else carries an id suffix.
pub(crate) fn filename_for(category: Category, identity_key: Option<&str>, title: Option<&str>, body: &str, id: &str) -> String {
    if category == Category::Entity {
        if let Some(key) = identity_key {
            return format!("{}.md", slugify(key));
        }
    }
    let stem_source = match title {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => body.chars().take(40).collect(),
    };
    let suffix = &id[id.len().saturating_sub(8)..];
    format!("{}-{}.md", slugify(&stem_source), suffix.to_lowercase())
}

// ---------------------------------------------------------------------------
// Indexing helper
// ---------------------------------------------------------------------------

/// Refresh the vector index for one row. The FTS shadow follows the primary
/// write via triggers; the vector is explicit. A failed or unavailable
/// embedder removes any stale vector so the index never lags the content.
pub(crate) fn index_vector(ctx: &TenantContext, rowid: i64, entry: &Entry) -> VaultResult<()> {
    if ctx.encrypts() {
        // Ciphertext rows carry no vector; ranking is degraded by design of
        // the encrypted deployment mode.
        ctx.store.delete_vector(rowid)?;
        return Ok(());
    }
    match ctx.embedder.embed_batch(&[entry.embedding_text()]) {
        Some(vectors) if !vectors.is_empty() => ctx.store.upsert_vector(rowid, &vectors[0]),
        _ => ctx.store.delete_vector(rowid),
    }
}

fn strip_reserved_meta(meta: Option<Meta>) -> Option<Meta> {
    let mut meta = meta?;
    meta.retain(|k, _| !RESERVED_KEYS.contains(&k.as_str()));
    if meta.is_empty() {
        None
    } else {
        Some(meta)
    }
}

fn content_for(ctx: &TenantContext, entry: &Entry) -> VaultResult<EntryContent> {
    if ctx.encrypts() {
        let user = ctx.user().expect("encrypts() implies user");
        let encrypter = ctx.encrypter.as_ref().expect("encrypts() implies encrypter");
        encrypter.encrypt_content(user, entry.title.as_deref(), &entry.body, entry.meta.as_ref())
    } else {
        Ok(EntryContent::Plain {
            title: entry.title.clone(),
            body: entry.body.clone(),
            meta: entry.meta.clone(),
        })
    }
}

pub(crate) fn record_for(ctx: &TenantContext, entry: &Entry) -> VaultResult<EntryRecord> {
    Ok(EntryRecord {
        id: entry.id.clone(),
        kind: entry.kind.clone(),
        category: entry.category,
        content: content_for(ctx, entry)?,
        tags: entry.tags.clone(),
        source: entry.source.clone(),
        identity_key: entry.identity_key.clone(),
        expires_at: entry.expires_at,
        file_path: entry.file_path.clone(),
        created_at: entry.created_at,
        user_id: entry.user_id.clone(),
    })
}

pub(crate) fn write_entry_file(ctx: &TenantContext, entry: &Entry) -> VaultResult<()> {
    if ctx.encrypts() {
        // Never persist a plaintext counterpart of a ciphertext row.
        return Ok(());
    }
    if let Some(parent) = entry.file_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&entry.file_path, serialize_document(entry))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Capture (create / entity upsert)
// ---------------------------------------------------------------------------

/// Create a new entry, or upsert when the kind is an entity kind and a row
/// already exists for `(user_id, kind, identity_key)`.
pub fn capture(ctx: &TenantContext, input: EntryInput) -> VaultResult<Entry> {
    ensure_vault(&ctx.vault_root)?;
    input.validate()?;

    let kind = input
        .kind
        .clone()
        .ok_or_else(|| VaultError::InvalidInput("kind is required".into()))?;
    validate_kind(&kind)?;
    let body = input
        .body
        .clone()
        .ok_or_else(|| VaultError::InvalidInput("body is required".into()))?;
    let category = category_for(&kind);

    if category == Category::Entity && input.identity_key.is_none() {
        return Err(VaultError::MissingIdentityKey(kind));
    }

    // Entity upsert path.
    if category == Category::Entity {
        let key = input.identity_key.as_deref().expect("checked above");
        if let Some(existing) =
            ctx.store.get_by_identity(ctx.user(), &kind, key, now())?
        {
            let existing = ctx.decrypt(existing)?.into_entry()?;
            return upsert_entity(ctx, existing, input);
        }
    }

    ctx.check_limits(body.len() as u64)?;

    let id = context_vault_core::entry::new_entry_id();
    let dir = entry_dir(&ctx.vault_root, &kind, input.folder.as_deref())?;
    let filename = filename_for(category, input.identity_key.as_deref(), input.title.as_deref(), &body, &id);
    let mut file_path = dir.join(&filename);
    if category == Category::Entity && ctx.store.path_taken(&file_path)? {
        // Slug collision between distinct identity keys.
        let suffix = &id[id.len() - 8..];
        file_path = dir.join(format!(
            "{}-{}.md",
            filename.trim_end_matches(".md"),
            suffix.to_lowercase()
        ));
    }

    let entry = Entry {
        id,
        kind,
        category,
        title: input.title.filter(|t| !t.is_empty()),
        body,
        meta: strip_reserved_meta(input.meta),
        tags: input.tags.unwrap_or_default(),
        source: input.source,
        identity_key: input.identity_key,
        expires_at: input.expires_at,
        file_path,
        created_at: now(),
        user_id: ctx.user_id.clone(),
    };

    write_entry_file(ctx, &entry)?;
    let rowid = ctx.store.insert(&record_for(ctx, &entry)?)?;
    index_vector(ctx, rowid, &entry)?;
    debug!(id = entry.id.as_str(), kind = entry.kind.as_str(), "captured entry");
    Ok(entry)
}

/// Entity in-place replacement: same id, new content, file renamed only when
/// the deterministic name changed.
fn upsert_entity(ctx: &TenantContext, existing: Entry, input: EntryInput) -> VaultResult<Entry> {
    let mut entry = existing;
    if let Some(title) = input.title {
        entry.title = (!title.is_empty()).then_some(title);
    }
    if let Some(body) = input.body {
        entry.body = body;
    }
    if let Some(meta) = strip_reserved_meta(input.meta) {
        entry.meta = Some(meta);
    }
    if let Some(tags) = input.tags {
        entry.tags = tags;
    }
    if let Some(source) = input.source {
        entry.source = Some(source);
    }
    if input.expires_at.is_some() {
        entry.expires_at = input.expires_at;
    }

    let dir = entry_dir(&ctx.vault_root, &entry.kind, input.folder.as_deref())?;
    let new_path = dir.join(filename_for(
        entry.category,
        entry.identity_key.as_deref(),
        entry.title.as_deref(),
        &entry.body,
        &entry.id,
    ));
    if new_path != entry.file_path {
        if !ctx.encrypts() && entry.file_path.exists() {
            let _ = std::fs::remove_file(&entry.file_path);
        }
        entry.file_path = new_path;
    }

    write_entry_file(ctx, &entry)?;
    let rowid = ctx.store.update(&record_for(ctx, &entry)?)?;
    index_vector(ctx, rowid, &entry)?;
    debug!(id = entry.id.as_str(), "upserted entity");
    Ok(entry)
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// Merge-update an existing entry by id. `id`, `kind`, and `identity_key`
/// are immutable; attempting to change them is `INVALID_UPDATE`.
pub fn update(ctx: &TenantContext, input: EntryInput) -> VaultResult<Entry> {
    ensure_vault(&ctx.vault_root)?;
    input.validate()?;

    let id = input
        .id
        .clone()
        .ok_or_else(|| VaultError::InvalidInput("id is required for update".into()))?;
    let existing = ctx
        .store
        .get(ctx.user(), &id, now())?
        .ok_or(VaultError::NotFound)?;
    let mut entry = ctx.decrypt(existing)?.into_entry()?;

    if let Some(kind) = &input.kind {
        if *kind != entry.kind {
            return Err(VaultError::InvalidUpdate(format!(
                "kind is immutable ({} -> {kind})",
                entry.kind
            )));
        }
    }
    if let Some(key) = &input.identity_key {
        if Some(key.as_str()) != entry.identity_key.as_deref() {
            return Err(VaultError::InvalidUpdate("identity_key is immutable".into()));
        }
    }

    if let Some(title) = input.title {
        entry.title = (!title.is_empty()).then_some(title);
    }
    if let Some(body) = input.body {
        entry.body = body;
    }
    if let Some(meta) = strip_reserved_meta(input.meta) {
        entry.meta = Some(meta);
    }
    if let Some(tags) = input.tags {
        entry.tags = tags;
    }
    if let Some(source) = input.source {
        entry.source = Some(source);
    }
    if input.expires_at.is_some() {
        entry.expires_at = input.expires_at;
    }

    write_entry_file(ctx, &entry)?;
    let rowid = ctx.store.update(&record_for(ctx, &entry)?)?;
    index_vector(ctx, rowid, &entry)?;
    debug!(id = entry.id.as_str(), "updated entry");
    Ok(entry)
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// Remove an entry: file first, then the vector, then the row (the FTS
/// shadow follows via triggers). A crash between the steps leaves an orphan
/// row for the next reindex to reap. Foreign or absent ids are `NOT_FOUND`.
pub fn delete(ctx: &TenantContext, id: &str) -> VaultResult<()> {
    ensure_vault(&ctx.vault_root)?;
    let rowid = ctx.store.rowid_of(ctx.user(), id)?.ok_or(VaultError::NotFound)?;
    let record = ctx.store.record_by_rowid(rowid)?.ok_or(VaultError::NotFound)?;

    if record.file_path.as_os_str().len() > 0 && record.file_path.exists() {
        std::fs::remove_file(&record.file_path)?;
    }
    ctx.store.delete_vector(rowid)?;
    ctx.store.delete(ctx.user(), id)?;
    info!(id, "deleted entry");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::testing::hash_embedder;
    use crate::store::VaultStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx() -> (TempDir, TenantContext) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("vault");
        init_vault(&root).unwrap();
        let store = Arc::new(VaultStore::open_in_memory().unwrap());
        let embedder = Arc::new(hash_embedder());
        (tmp, TenantContext::local(store, embedder, root))
    }

    fn insight(body: &str) -> EntryInput {
        EntryInput {
            kind: Some("insight".into()),
            body: Some(body.into()),
            ..Default::default()
        }
    }

    #[test]
    fn capture_writes_file_and_row() {
        let (_tmp, ctx) = ctx();
        let entry = capture(&ctx, insight("use parameterized queries")).unwrap();
        assert!(entry.file_path.exists());
        assert!(entry.file_path.starts_with(&ctx.vault_root));
        assert!(entry.file_path.to_string_lossy().contains("knowledge/insights/"));
        let stored = ctx.store.get(None, &entry.id, now()).unwrap().unwrap();
        assert_eq!(stored.id, entry.id);
        // Vector indexed via the fake embedder.
        assert_eq!(ctx.store.candidate_vectors(None, now()).unwrap().len(), 1);
    }

    #[test]
    fn capture_requires_vault() {
        let (_tmp, mut ctx) = ctx();
        ctx.vault_root = ctx.vault_root.join("missing");
        let err = capture(&ctx, insight("x")).unwrap_err();
        assert_eq!(err.code(), "VAULT_NOT_FOUND");
    }

    #[test]
    fn capture_rejects_bad_kind_and_missing_body() {
        let (_tmp, ctx) = ctx();
        let mut bad = insight("x");
        bad.kind = Some("Bad Kind".into());
        assert_eq!(capture(&ctx, bad).unwrap_err().code(), "INVALID_KIND");

        let mut no_body = insight("x");
        no_body.body = None;
        assert_eq!(capture(&ctx, no_body).unwrap_err().code(), "INVALID_INPUT");
    }

    #[test]
    fn entity_requires_identity_key() {
        let (_tmp, ctx) = ctx();
        let mut contact = insight("Role: PM");
        contact.kind = Some("contact".into());
        assert_eq!(capture(&ctx, contact).unwrap_err().code(), "MISSING_IDENTITY_KEY");
    }

    #[test]
    fn entity_filename_is_deterministic() {
        let (_tmp, ctx) = ctx();
        let mut contact = insight("Role: PM");
        contact.kind = Some("contact".into());
        contact.identity_key = Some("alice@example.com".into());
        let entry = capture(&ctx, contact).unwrap();
        assert!(entry.file_path.ends_with("entity/contacts/alice-example-com.md"));
    }

    #[test]
    fn entity_upsert_keeps_id_and_replaces_body() {
        let (_tmp, ctx) = ctx();
        let mut first = insight("Role: PM");
        first.kind = Some("contact".into());
        first.identity_key = Some("alice@example.com".into());
        let created = capture(&ctx, first.clone()).unwrap();

        first.body = Some("Role: CTO".into());
        let updated = capture(&ctx, first).unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.body, "Role: CTO");
        assert_eq!(ctx.store.entry_count(None).unwrap(), 1);
    }

    #[test]
    fn update_merges_and_guards_immutables() {
        let (_tmp, ctx) = ctx();
        let created = capture(&ctx, insight("original")).unwrap();

        let mut patch = EntryInput { id: Some(created.id.clone()), ..Default::default() };
        patch.title = Some("Now titled".into());
        let updated = update(&ctx, patch).unwrap();
        assert_eq!(updated.title.as_deref(), Some("Now titled"));
        assert_eq!(updated.body, "original");

        let bad = EntryInput {
            id: Some(created.id.clone()),
            kind: Some("decision".into()),
            ..Default::default()
        };
        assert_eq!(update(&ctx, bad).unwrap_err().code(), "INVALID_UPDATE");
    }

    #[test]
    fn update_of_missing_id_is_not_found() {
        let (_tmp, ctx) = ctx();
        let patch = EntryInput {
            id: Some(context_vault_core::entry::new_entry_id()),
            body: Some("x".into()),
            ..Default::default()
        };
        assert_eq!(update(&ctx, patch).unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn delete_removes_file_vector_row() {
        let (_tmp, ctx) = ctx();
        let entry = capture(&ctx, insight("short-lived")).unwrap();
        delete(&ctx, &entry.id).unwrap();
        assert!(!entry.file_path.exists());
        assert!(ctx.store.get(None, &entry.id, now()).unwrap().is_none());
        assert!(ctx.store.candidate_vectors(None, now()).unwrap().is_empty());
    }

    #[test]
    fn delete_foreign_id_is_not_found() {
        let (_tmp, ctx) = ctx();
        let entry = capture(&ctx, insight("mine")).unwrap();
        let mut foreign = ctx.clone();
        foreign.user_id = Some("intruder".into());
        assert_eq!(delete(&foreign, &entry.id).unwrap_err().code(), "NOT_FOUND");
        assert!(entry.file_path.exists());
    }

    #[test]
    fn saved_document_roundtrips_through_codec() {
        let (_tmp, ctx) = ctx();
        let mut input = insight("Use parameterized queries to prevent injection.");
        input.tags = Some(vec!["security".into()]);
        input.source = Some("code review".into());
        let entry = capture(&ctx, input).unwrap();

        let raw = std::fs::read_to_string(&entry.file_path).unwrap();
        let parsed = context_vault_core::frontmatter::parse_document(&entry.kind, &raw).unwrap();
        assert_eq!(parsed.id.as_deref(), Some(entry.id.as_str()));
        assert_eq!(parsed.created, Some(entry.created_at));
        assert_eq!(parsed.body, entry.body);
        assert_eq!(parsed.tags, entry.tags);
        assert_eq!(parsed.source, entry.source);
    }

    #[test]
    fn unknown_kind_lands_under_knowledge() {
        let (_tmp, ctx) = ctx();
        let mut input = insight("chili needs 40 minutes");
        input.kind = Some("recipe".into());
        let entry = capture(&ctx, input).unwrap();
        assert_eq!(entry.category, Category::Knowledge);
        assert!(entry.file_path.to_string_lossy().contains("knowledge/recipes/"));
    }

    #[test]
    fn folder_is_honored_and_traversal_rejected() {
        let (_tmp, ctx) = ctx();
        let mut input = insight("nested");
        input.folder = Some("project-x".into());
        let entry = capture(&ctx, input).unwrap();
        assert!(entry.file_path.to_string_lossy().contains("insights/project-x/"));

        let mut evil = insight("escape");
        evil.folder = Some("../../outside".into());
        assert_eq!(capture(&ctx, evil).unwrap_err().code(), "PATH_TRAVERSAL");
    }
}
