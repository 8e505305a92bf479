//! Reindex: the reconciliation pass that makes the primary store converge
//! to the on-disk markdown tree.
//!
//! Files are enumerated and parsed in parallel, classified against the store
//! as added / updated / unchanged by content hash, rows whose file vanished
//! are reaped, and the embeddings for everything added or updated are
//! generated in one batched call. Idempotent and retryable; serialized with
//! capture by the store's single writer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use context_vault_core::entry::{new_entry_id, Entry, EntryRecord};
use context_vault_core::frontmatter::{parse_document, serialize_document, ParsedDocument};
use context_vault_core::kind::{category_for, kind_from_plural};
use context_vault_core::VaultResult;

use crate::capture::{ensure_vault, VAULT_MARKER};
use crate::clock::now;
use crate::tenant::TenantContext;

/// Counts reported by one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

struct DiskEntry {
    path: PathBuf,
    kind: String,
    doc: ParsedDocument,
    /// Hash of the normalized file text, compared against the stored row's
    /// re-serialized form.
    content_hash: [u8; 32],
}

fn hash_text(text: &str) -> [u8; 32] {
    Sha256::digest(text.as_bytes()).into()
}

/// Kind is derived from the file's directory: `<category>/<plural>/...`.
fn kind_for_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut components = rel.components();
    let _category = components.next()?;
    let plural = components.next()?.as_os_str().to_str()?;
    Some(kind_from_plural(plural))
}

fn enumerate_markdown(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build()
        .flatten()
    {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.into_path();
        if path.extension().and_then(|e| e.to_str()) == Some("md")
            && path.file_name().and_then(|n| n.to_str()) != Some(VAULT_MARKER)
        {
            files.push(path);
        }
    }
    files.sort();
    files
}

/// Parse one on-disk file; `None` means unparseable (logged, skipped).
fn load_disk_entry(root: &Path, path: PathBuf) -> Option<DiskEntry> {
    let kind = kind_for_path(root, &path)?;
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable vault file");
            return None;
        }
    };
    let normalized = raw.replace("\r\n", "\n");
    match parse_document(&kind, &normalized) {
        Ok(doc) => {
            let content_hash = hash_text(&normalized);
            Some(DiskEntry { path, kind, doc, content_hash })
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unparseable vault file, skipping");
            None
        }
    }
}

fn entry_from_disk(ctx: &TenantContext, disk: &DiskEntry) -> Entry {
    Entry {
        id: disk.doc.id.clone().unwrap_or_else(new_entry_id),
        kind: disk.kind.clone(),
        category: category_for(&disk.kind),
        title: disk.doc.title.clone(),
        body: disk.doc.body.clone(),
        meta: disk.doc.meta.clone(),
        tags: disk.doc.tags.clone(),
        source: disk.doc.source.clone(),
        identity_key: disk.doc.identity_key.clone(),
        expires_at: disk.doc.expires_at,
        file_path: disk.path.clone(),
        created_at: disk.doc.created.unwrap_or_else(now),
        user_id: ctx.user_id.clone(),
    }
}

/// Run one reconciliation pass. `backfill_embeddings` clears a sticky
/// embedder failure first so a manual reindex can repopulate vectors.
pub fn reindex(ctx: &TenantContext, backfill_embeddings: bool) -> VaultResult<ReindexReport> {
    ensure_vault(&ctx.vault_root)?;
    if backfill_embeddings {
        ctx.embedder.reset_for_retry();
    }

    let files = enumerate_markdown(&ctx.vault_root);
    let disk_entries: Vec<DiskEntry> = files
        .into_par_iter()
        .filter_map(|path| load_disk_entry(&ctx.vault_root, path))
        .collect();

    // Stored rows by file path. Encrypted rows have no plaintext file and are
    // never reconciled from disk.
    let mut by_path: HashMap<PathBuf, (i64, EntryRecord)> = HashMap::new();
    for (rowid, rec) in ctx.store.rows_for_user(ctx.user())? {
        by_path.insert(rec.file_path.clone(), (rowid, rec));
    }

    let mut report = ReindexReport::default();
    let mut to_embed: Vec<(i64, String)> = Vec::new();

    // Pass 1: removals — rows whose file no longer exists.
    let disk_paths: std::collections::HashSet<&Path> =
        disk_entries.iter().map(|d| d.path.as_path()).collect();
    let removed: Vec<(i64, String)> = by_path
        .iter()
        .filter(|(path, (_, rec))| {
            !rec.content.is_encrypted() && !disk_paths.contains(path.as_path())
        })
        .map(|(_, (rowid, rec))| (*rowid, rec.id.clone()))
        .collect();
    for (rowid, id) in &removed {
        ctx.store.delete_vector(*rowid)?;
        ctx.store.delete(ctx.user(), id)?;
        report.removed += 1;
    }

    // Pass 2: additions and updates.
    for disk in &disk_entries {
        match by_path.get(&disk.path) {
            None => {
                let mut entry = entry_from_disk(ctx, disk);
                if disk.doc.id.is_none() {
                    // Self-heal: persist the generated id back to the file.
                    std::fs::write(&disk.path, serialize_document(&entry))?;
                    info!(path = %disk.path.display(), id = entry.id.as_str(), "healed file without id");
                }
                entry.file_path = disk.path.clone();
                let record: EntryRecord = entry.clone().into();
                match ctx.store.insert(&record) {
                    Ok(rowid) => {
                        to_embed.push((rowid, entry.embedding_text()));
                        report.added += 1;
                    }
                    Err(e) => {
                        warn!(path = %disk.path.display(), error = %e, "could not index file");
                    }
                }
            }
            Some((rowid, stored)) => {
                let stored_text = match stored.clone().into_entry() {
                    Ok(entry) => serialize_document(&entry),
                    Err(_) => continue,
                };
                if hash_text(&stored_text) == disk.content_hash {
                    report.unchanged += 1;
                    continue;
                }
                // Disk wins: the tree is the source of truth.
                let mut entry = entry_from_disk(ctx, disk);
                entry.id = stored.id.clone();
                entry.created_at = disk.doc.created.unwrap_or(stored.created_at);
                let record: EntryRecord = entry.clone().into();
                match ctx.store.update(&record) {
                    Ok(_) => {
                        to_embed.push((*rowid, entry.embedding_text()));
                        report.updated += 1;
                    }
                    Err(e) => {
                        warn!(path = %disk.path.display(), error = %e, "could not update row from file");
                    }
                }
            }
        }
    }

    // Pass 3: batch-embed everything added or updated in one call.
    if !to_embed.is_empty() {
        let texts: Vec<String> = to_embed.iter().map(|(_, t)| t.clone()).collect();
        match ctx.embedder.embed_batch(&texts) {
            Some(vectors) => {
                for ((rowid, _), vector) in to_embed.iter().zip(vectors.iter()) {
                    ctx.store.upsert_vector(*rowid, vector)?;
                }
            }
            None => {
                // Lexical index still covers these rows; drop any stale vectors.
                for (rowid, _) in &to_embed {
                    ctx.store.delete_vector(*rowid)?;
                }
            }
        }
    }

    info!(
        added = report.added,
        updated = report.updated,
        removed = report.removed,
        unchanged = report.unchanged,
        "reindex complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{capture, init_vault};
    use crate::embed::testing::hash_embedder;
    use crate::embed::LazyEmbedder;
    use crate::store::VaultStore;
    use context_vault_core::entry::EntryInput;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx() -> (TempDir, TenantContext) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("vault");
        init_vault(&root).unwrap();
        let store = Arc::new(VaultStore::open_in_memory().unwrap());
        (tmp, TenantContext::local(store, Arc::new(hash_embedder()), root))
    }

    fn insight(body: &str) -> EntryInput {
        EntryInput { kind: Some("insight".into()), body: Some(body.into()), ..Default::default() }
    }

    #[test]
    fn clean_vault_reports_all_unchanged() {
        let (_tmp, ctx) = ctx();
        capture(&ctx, insight("one")).unwrap();
        capture(&ctx, insight("two")).unwrap();
        let report = reindex(&ctx, false).unwrap();
        assert_eq!(report, ReindexReport { added: 0, updated: 0, removed: 0, unchanged: 2 });
    }

    #[test]
    fn reindex_is_idempotent() {
        let (_tmp, ctx) = ctx();
        capture(&ctx, insight("stable")).unwrap();
        let first = reindex(&ctx, false).unwrap();
        let second = reindex(&ctx, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.unchanged, 1);
    }

    #[test]
    fn new_file_on_disk_is_added() {
        let (_tmp, ctx) = ctx();
        let dir = ctx.vault_root.join("knowledge/notes");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("dropped-in.md"),
            "---\nid: 01ARZ3NDEKTSV4RRFFQ69G5FAV\ncreated: 2026-01-02T03:04:05.000000Z\n---\n\ndropped in by hand",
        )
        .unwrap();

        let report = reindex(&ctx, false).unwrap();
        assert_eq!(report.added, 1);
        let rec = ctx
            .store
            .get(None, "01ARZ3NDEKTSV4RRFFQ69G5FAV", now())
            .unwrap()
            .expect("row created from file");
        assert_eq!(rec.kind, "note");
        // The fake embedder indexed it.
        assert_eq!(ctx.store.candidate_vectors(None, now()).unwrap().len(), 1);
    }

    #[test]
    fn file_without_id_is_healed() {
        let (_tmp, ctx) = ctx();
        let dir = ctx.vault_root.join("knowledge/insights");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("handwritten.md");
        std::fs::write(&path, "---\ncreated: 2026-01-02T03:04:05.000000Z\n---\n\nno id yet").unwrap();

        let report = reindex(&ctx, false).unwrap();
        assert_eq!(report.added, 1);
        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("id: 01"), "file should gain a ULID: {rewritten}");

        // Second pass sees the healed file as unchanged.
        let second = reindex(&ctx, false).unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.unchanged, 1);
    }

    #[test]
    fn deleted_file_reaps_row_and_vector() {
        let (_tmp, ctx) = ctx();
        let entry = capture(&ctx, insight("doomed")).unwrap();
        std::fs::remove_file(&entry.file_path).unwrap();

        let report = reindex(&ctx, false).unwrap();
        assert_eq!(report.removed, 1);
        assert!(ctx.store.get(None, &entry.id, now()).unwrap().is_none());
        assert!(ctx.store.candidate_vectors(None, now()).unwrap().is_empty());
    }

    #[test]
    fn edited_file_updates_row() {
        let (_tmp, ctx) = ctx();
        let entry = capture(&ctx, insight("first draft")).unwrap();
        let raw = std::fs::read_to_string(&entry.file_path).unwrap();
        std::fs::write(&entry.file_path, raw.replace("first draft", "second draft")).unwrap();

        let report = reindex(&ctx, false).unwrap();
        assert_eq!(report.updated, 1);
        let rec = ctx.store.get(None, &entry.id, now()).unwrap().unwrap();
        match rec.content {
            context_vault_core::entry::EntryContent::Plain { body, .. } => {
                assert_eq!(body, "second draft")
            }
            _ => panic!("expected plaintext"),
        }
    }

    #[test]
    fn no_content_drift_through_capture_and_reindex() {
        let (_tmp, ctx) = ctx();
        let mut input = insight("Exact bytes matter.");
        input.tags = Some(vec!["law".into()]);
        input.title = Some("Drift check".into());
        let entry = capture(&ctx, input).unwrap();

        reindex(&ctx, false).unwrap();
        let rec = ctx.store.get(None, &entry.id, now()).unwrap().unwrap();
        let roundtripped = rec.into_entry().unwrap();
        assert_eq!(roundtripped.body, entry.body);
        assert_eq!(roundtripped.title, entry.title);
        assert_eq!(roundtripped.tags, entry.tags);
        assert_eq!(roundtripped.created_at, entry.created_at);
    }

    #[test]
    fn unavailable_embedder_still_indexes_lexically() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("vault");
        init_vault(&root).unwrap();
        let store = Arc::new(VaultStore::open_in_memory().unwrap());
        let ctx = TenantContext::local(
            store,
            Arc::new(LazyEmbedder::disabled("offline")),
            root,
        );

        let dir = ctx.vault_root.join("knowledge/insights");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("lexical-only.md"),
            "---\nid: 01BX5ZZKBKACTAV9WEVGEMMVRY\ncreated: 2026-01-02T03:04:05.000000Z\n---\n\nsearchable without vectors",
        )
        .unwrap();

        let report = reindex(&ctx, false).unwrap();
        assert_eq!(report.added, 1);
        assert!(ctx.store.candidate_vectors(None, now()).unwrap().is_empty());
        let hits = ctx
            .store
            .fts_search(None, "\"searchable\"", &Default::default(), now(), 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
