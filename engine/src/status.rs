//! Diagnostic status snapshot (`context_status`) and the sync manifest.

use serde::Serialize;

use context_vault_core::VaultResult;

use crate::capture::VAULT_MARKER;
use crate::clock::now;
use crate::store::ManifestEntry;
use crate::tenant::TenantContext;

#[derive(Debug, Serialize)]
pub struct SubdirCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct KindCount {
    pub kind: String,
    pub c: u64,
}

#[derive(Debug, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub c: u64,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingStatus {
    pub indexed: u64,
    pub total: u64,
    pub missing: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub file_count: u64,
    pub subdirs: Vec<SubdirCount>,
    pub kind_counts: Vec<KindCount>,
    pub category_counts: Vec<CategoryCount>,
    pub db_size: String,
    pub db_size_bytes: u64,
    pub stale_paths: bool,
    pub stale_count: u64,
    pub expired_count: u64,
    pub embedding_status: Option<EmbeddingStatus>,
    pub embed_model_available: Option<bool>,
    pub schema_version: i32,
    pub resolved_from: String,
    pub errors: Vec<String>,
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

fn count_markdown(dir: &std::path::Path) -> u64 {
    let mut count = 0;
    let walker = ignore::WalkBuilder::new(dir)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build();
    for entry in walker.flatten() {
        if entry.file_type().is_some_and(|ft| ft.is_file())
            && entry.path().extension().and_then(|e| e.to_str()) == Some("md")
            && entry.path().file_name().and_then(|n| n.to_str()) != Some(VAULT_MARKER)
        {
            count += 1;
        }
    }
    count
}

/// Build the full diagnostic snapshot. Individual probe failures land in
/// `errors` instead of failing the operation.
pub fn gather_vault_status(ctx: &TenantContext, resolved_from: &str) -> StatusSnapshot {
    let at = now();
    let mut errors = Vec::new();

    let file_count = if ctx.vault_root.is_dir() {
        count_markdown(&ctx.vault_root)
    } else {
        errors.push(format!("vault root missing: {}", ctx.vault_root.display()));
        0
    };

    let mut subdirs = Vec::new();
    if ctx.vault_root.is_dir() {
        if let Ok(entries) = std::fs::read_dir(&ctx.vault_root) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    let name = entry.file_name().to_string_lossy().to_string();
                    subdirs.push(SubdirCount { count: count_markdown(&entry.path()), name });
                }
            }
        }
        subdirs.sort_by(|a, b| a.name.cmp(&b.name));
    }

    let kind_counts = match ctx.store.kind_counts(ctx.user()) {
        Ok(counts) => counts.into_iter().map(|(kind, c)| KindCount { kind, c }).collect(),
        Err(e) => {
            errors.push(format!("kind counts: {e}"));
            Vec::new()
        }
    };
    let category_counts = match ctx.store.category_counts(ctx.user()) {
        Ok(counts) => {
            counts.into_iter().map(|(category, c)| CategoryCount { category, c }).collect()
        }
        Err(e) => {
            errors.push(format!("category counts: {e}"));
            Vec::new()
        }
    };

    // Stale paths: plaintext rows whose file no longer exists (reindex reaps
    // them on its next pass).
    let (stale_count, row_errors) = match ctx.store.rows_for_user(ctx.user()) {
        Ok(rows) => {
            let stale = rows
                .iter()
                .filter(|(_, rec)| !rec.content.is_encrypted() && !rec.file_path.exists())
                .count() as u64;
            (stale, None)
        }
        Err(e) => (0, Some(format!("stale scan: {e}"))),
    };
    if let Some(e) = row_errors {
        errors.push(e);
    }

    let expired_count = ctx.store.expired_count(ctx.user(), at).unwrap_or_else(|e| {
        errors.push(format!("expired count: {e}"));
        0
    });

    let embedding_status = match ctx.store.embedding_stats(ctx.user()) {
        Ok((indexed, total)) => {
            Some(EmbeddingStatus { indexed, total, missing: total.saturating_sub(indexed) })
        }
        Err(e) => {
            errors.push(format!("embedding stats: {e}"));
            None
        }
    };

    let db_size_bytes = ctx.store.db_size_bytes();
    let schema_version = ctx.store.schema_version().unwrap_or_else(|e| {
        errors.push(format!("schema version: {e}"));
        0
    });

    StatusSnapshot {
        file_count,
        subdirs,
        kind_counts,
        category_counts,
        db_size: human_size(db_size_bytes),
        db_size_bytes,
        stale_paths: stale_count > 0,
        stale_count,
        expired_count,
        embedding_status,
        embed_model_available: ctx.embedder.availability(),
        schema_version,
        resolved_from: resolved_from.to_string(),
        errors,
    }
}

/// The manifest handed to the sync collaborator: non-expired entries only.
#[derive(Debug, Serialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

pub fn gather_manifest(ctx: &TenantContext) -> VaultResult<Manifest> {
    Ok(Manifest { entries: ctx.store.manifest(ctx.user(), now())? })
}
