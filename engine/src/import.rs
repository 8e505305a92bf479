//! Import and export pipelines.
//!
//! Export writes one decrypted entry per line (JSON Lines) over the current
//! non-expired rows. Import reads the same format sequentially through the
//! capture invariants: per-entry limit checks abort the batch on the first
//! `LIMIT_EXCEEDED`, a progress callback fires per entry, and original ids
//! are preserved when they do not collide with an existing row.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use context_vault_core::entry::{Entry, EntryInput, Meta};
use context_vault_core::kind::{category_for, validate_kind, Category};
use context_vault_core::{VaultError, VaultResult};

use crate::capture::{
    self, ensure_vault, entry_dir, filename_for, index_vector, record_for, write_entry_file,
};
use crate::clock::now;
use crate::store::Filter;
use crate::tenant::TenantContext;

/// One exported line. A superset of [`EntryInput`] carrying identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortableEntry {
    pub id: Option<String>,
    pub kind: String,
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
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<Entry> for PortableEntry {
    fn from(e: Entry) -> Self {
        PortableEntry {
            id: Some(e.id),
            kind: e.kind,
            title: e.title,
            body: e.body,
            meta: e.meta,
            tags: e.tags,
            source: e.source,
            identity_key: e.identity_key,
            expires_at: e.expires_at,
            created_at: Some(e.created_at),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Write every live entry for the tenant as JSON Lines. Encrypted rows are
/// decrypted in-memory through the context's decrypter.
pub fn export_jsonl<W: Write>(ctx: &TenantContext, out: &mut W) -> VaultResult<usize> {
    ensure_vault(&ctx.vault_root)?;
    let mut exported = 0;
    let mut offset = 0;
    const PAGE: usize = 500;
    loop {
        let page = ctx.store.list(ctx.user(), &Filter::default(), now(), PAGE, offset)?;
        let done = page.len() < PAGE;
        for record in page {
            let entry = ctx.decrypt(record)?.into_entry()?;
            let line = serde_json::to_string(&PortableEntry::from(entry))
                .map_err(|e| VaultError::Internal(format!("export serialize: {e}")))?;
            writeln!(out, "{line}")?;
            exported += 1;
        }
        if done {
            break;
        }
        offset += PAGE;
    }
    info!(exported, "export complete");
    Ok(exported)
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

fn import_one(ctx: &TenantContext, portable: PortableEntry) -> VaultResult<Entry> {
    validate_kind(&portable.kind)?;
    let input = EntryInput {
        id: None,
        kind: Some(portable.kind.clone()),
        title: portable.title.clone(),
        body: Some(portable.body.clone()),
        meta: portable.meta.clone(),
        tags: Some(portable.tags.clone()),
        source: portable.source.clone(),
        folder: None,
        identity_key: portable.identity_key.clone(),
        expires_at: portable.expires_at,
    };
    input.validate()?;

    let category = category_for(&portable.kind);
    let preserve_id = portable
        .id
        .filter(|id| context_vault_core::entry::is_entry_id(id))
        .filter(|id| matches!(ctx.store.rowid_of(ctx.user(), id), Ok(None)));

    // Entities and id-less lines route through plain capture (upsert included).
    let Some(id) = preserve_id else {
        return capture::capture(ctx, input);
    };
    if category == Category::Entity {
        return capture::capture(ctx, input);
    }

    ctx.check_limits(portable.body.len() as u64)?;

    let dir = entry_dir(&ctx.vault_root, &portable.kind, None)?;
    let file_path = dir.join(filename_for(
        category,
        portable.identity_key.as_deref(),
        portable.title.as_deref(),
        &portable.body,
        &id,
    ));
    let entry = Entry {
        id,
        kind: portable.kind,
        category,
        title: portable.title.filter(|t| !t.is_empty()),
        body: portable.body,
        meta: portable.meta,
        tags: portable.tags,
        source: portable.source,
        identity_key: portable.identity_key,
        expires_at: portable.expires_at,
        file_path,
        created_at: portable.created_at.unwrap_or_else(now),
        user_id: ctx.user_id.clone(),
    };
    write_entry_file(ctx, &entry)?;
    let rowid = ctx.store.insert(&record_for(ctx, &entry)?)?;
    index_vector(ctx, rowid, &entry)?;
    Ok(entry)
}

/// Sequential import with a per-entry progress callback. The batch aborts on
/// the first `LIMIT_EXCEEDED`; malformed lines are skipped and counted.
pub fn import_jsonl<R: BufRead>(
    ctx: &TenantContext,
    reader: R,
    mut progress: Option<&mut dyn FnMut(usize)>,
) -> VaultResult<ImportReport> {
    ensure_vault(&ctx.vault_root)?;
    let mut report = ImportReport::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let portable: PortableEntry = match serde_json::from_str(&line) {
            Ok(p) => p,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping malformed import line");
                report.skipped += 1;
                continue;
            }
        };
        match import_one(ctx, portable) {
            Ok(_) => report.imported += 1,
            Err(e @ VaultError::LimitExceeded(_)) => {
                warn!(line = line_no + 1, "import aborted at tier limit");
                return Err(e);
            }
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping unimportable line");
                report.skipped += 1;
            }
        }
        if let Some(cb) = progress.as_mut() {
            cb(report.imported + report.skipped);
        }
    }
    info!(imported = report.imported, skipped = report.skipped, "import complete");
    Ok(report)
}
