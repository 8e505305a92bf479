//! Tool dispatcher: the seven engine operations behind one shared wrapper.
//!
//! Every call is counted in-flight, bounded by a 60-second timeout, and
//! preceded by the once-per-lifecycle auto-reindex. Kinds are normalized to
//! canonical singular here; ciphertext is decrypted here after retrieval.
//! Degradation (reindex failed, embeddings unavailable) is surfaced as notes
//! on the response, never as a hard failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use context_vault_core::entry::{Entry, EntryInput, EntryRecord, Meta};
use context_vault_core::kind::{normalize_kind, Category};
use context_vault_core::{VaultError, VaultResult};

use crate::capture;
use crate::clock::parse_ts;
use crate::config::VaultConfig;
use crate::import::{export_jsonl, import_jsonl, ImportReport};
use crate::reindex::{reindex, ReindexReport};
use crate::retrieve::{self, SearchRequest, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
use crate::status::{gather_manifest, gather_vault_status, Manifest, StatusSnapshot};
use crate::store::Filter;
use crate::tenant::TenantContext;

/// Wall-clock bound per operation. Cancels the caller; committed writes stay.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// URL ingest collaborator
// ---------------------------------------------------------------------------

/// Already-parsed page data handed back by the external URL parser.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestedPage {
    pub title: Option<String>,
    pub body: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The engine never fetches URLs itself; a collaborator does and returns
/// entry data that goes through capture.
pub trait UrlIngestor: Send + Sync {
    fn ingest(&self, url: &str) -> Result<IngestedPage, String>;
}

// ---------------------------------------------------------------------------
// Auto-reindex state machine
// ---------------------------------------------------------------------------

/// `not-started → in-progress → done | failed`, bound to this dispatcher
/// (one per serve-time lifecycle). Concurrent callers queue on the gate lock
/// and so await the same in-progress pass. A failed pass retries on the next
/// call, twice at most, then sticks as failed and responses carry a warning.
struct ReindexGate {
    state: tokio::sync::Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    attempts: u32,
    done: Option<ReindexReport>,
    failed: bool,
}

const REINDEX_MAX_ATTEMPTS: u32 = 2;
const NOTE_REINDEX_FAILED: &str = "reindex_failed";

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ToolResponse {
    pub body: Value,
    pub notes: Vec<String>,
}

impl ToolResponse {
    fn new(body: Value) -> Self {
        Self { body, notes: Vec::new() }
    }

    /// Wire form with notes folded in.
    pub fn into_json(mut self) -> Value {
        if !self.notes.is_empty() {
            if let Some(obj) = self.body.as_object_mut() {
                obj.insert("notes".into(), json!(self.notes));
            }
        }
        self.body
    }
}

/// Wire form of an error: the stable code plus a human message.
pub fn error_payload(e: &VaultError) -> Value {
    json!({ "error": { "code": e.code(), "message": e.to_string() } })
}

// ---------------------------------------------------------------------------
// Argument schemas (validated before dispatch)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GetContextArgs {
    query: Option<String>,
    kind: Option<String>,
    category: Option<String>,
    identity_key: Option<String>,
    tags: Option<Vec<String>>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SaveContextArgs {
    id: Option<String>,
    kind: Option<String>,
    title: Option<String>,
    body: Option<String>,
    meta: Option<Meta>,
    tags: Option<Vec<String>>,
    source: Option<String>,
    folder: Option<String>,
    identity_key: Option<String>,
    expires_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListContextArgs {
    kind: Option<String>,
    category: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeleteContextArgs {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitFeedbackArgs {
    message: String,
    feedback_type: Option<String>,
    severity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IngestUrlArgs {
    url: String,
    kind: Option<String>,
    folder: Option<String>,
    tags: Option<Vec<String>>,
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> VaultResult<T> {
    serde_json::from_value(args).map_err(|e| VaultError::InvalidInput(e.to_string()))
}

fn parse_time(field: &str, raw: Option<String>) -> VaultResult<Option<DateTime<Utc>>> {
    match raw {
        None => Ok(None),
        Some(raw) => parse_ts(&raw)
            .map(Some)
            .ok_or_else(|| VaultError::InvalidInput(format!("{field} is not a valid timestamp"))),
    }
}

fn parse_category(raw: Option<String>) -> VaultResult<Option<Category>> {
    match raw {
        None => Ok(None),
        Some(raw) => Category::parse(&raw)
            .map(Some)
            .ok_or_else(|| VaultError::InvalidInput(format!("unknown category {raw:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

/// JSON schemas for the seven operations, in MCP tool-definition shape.
pub fn tool_definitions() -> Value {
    json!([
        {
            "name": "get_context",
            "description": "Hybrid search over the vault (lexical + semantic + recency). Provide a query and/or filters.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Natural-language or keyword query" },
                    "kind": { "type": "string", "description": "Entry kind, singular or plural (e.g. 'insight', 'contacts')" },
                    "category": { "type": "string", "enum": ["knowledge", "entity", "event"] },
                    "identity_key": { "type": "string", "description": "Entity identity for exact lookup (with kind)" },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "since": { "type": "string", "description": "ISO-8601 lower bound on created_at" },
                    "until": { "type": "string", "description": "ISO-8601 upper bound on created_at" },
                    "limit": { "type": "integer", "description": "Max results (default: 10)" }
                }
            }
        },
        {
            "name": "save_context",
            "description": "Create or update an entry. Provide 'id' to update; entity kinds upsert on identity_key.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": { "type": "string", "description": "Existing entry id (update mode)" },
                    "kind": { "type": "string", "description": "Entry kind (required for new entries)" },
                    "title": { "type": "string" },
                    "body": { "type": "string", "description": "Markdown body (required for new entries)" },
                    "meta": { "type": "object", "description": "Free-form per-kind metadata" },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "source": { "type": "string", "description": "Provenance label" },
                    "folder": { "type": "string", "description": "Optional subfolder under the kind directory" },
                    "identity_key": { "type": "string", "description": "Required for entity kinds" },
                    "expires_at": { "type": "string", "description": "ISO-8601 TTL" }
                }
            }
        },
        {
            "name": "list_context",
            "description": "Filter-only browse, newest first, paginated.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "kind": { "type": "string" },
                    "category": { "type": "string", "enum": ["knowledge", "entity", "event"] },
                    "since": { "type": "string" },
                    "until": { "type": "string" },
                    "limit": { "type": "integer", "description": "Max results (default: 20, max: 100)" },
                    "offset": { "type": "integer" }
                }
            }
        },
        {
            "name": "delete_context",
            "description": "Delete an entry by id. Removes the file, the vector, then the row.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": { "type": "string" }
                },
                "required": ["id"]
            }
        },
        {
            "name": "submit_feedback",
            "description": "File feedback about the vault itself (stored as kind=feedback).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "message": { "type": "string" },
                    "feedback_type": { "type": "string", "enum": ["bug", "feature", "praise", "other"] },
                    "severity": { "type": "string", "enum": ["low", "medium", "high"] }
                },
                "required": ["message"]
            }
        },
        {
            "name": "ingest_url",
            "description": "Fetch a URL through the configured parser and capture the result as an entry.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "url": { "type": "string" },
                    "kind": { "type": "string", "description": "Kind for the captured entry (default: reference)" },
                    "folder": { "type": "string" },
                    "tags": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["url"]
            }
        },
        {
            "name": "context_status",
            "description": "Diagnostic snapshot: file/kind/category counts, db size, stale paths, embedding status.",
            "inputSchema": { "type": "object", "properties": {}, "additionalProperties": false }
        }
    ])
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    ctx: TenantContext,
    event_decay_days: i64,
    resolved_from: String,
    ingestor: Option<Arc<dyn UrlIngestor>>,
    gate: ReindexGate,
    in_flight: AtomicU64,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(ctx: TenantContext, config: &VaultConfig) -> Self {
        Self {
            ctx,
            event_decay_days: config.event_decay_days,
            resolved_from: config.resolved_from.join(","),
            ingestor: None,
            gate: ReindexGate { state: tokio::sync::Mutex::new(GateState::default()) },
            in_flight: AtomicU64::new(0),
            timeout: OPERATION_TIMEOUT,
        }
    }

    pub fn with_ingestor(mut self, ingestor: Arc<dyn UrlIngestor>) -> Self {
        self.ingestor = Some(ingestor);
        self
    }

    /// Override the per-operation wall-clock bound (default 60 s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn context(&self) -> &TenantContext {
        &self.ctx
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Shared wrapper
    // -----------------------------------------------------------------------

    /// Run one tool call: count it, await auto-reindex, enforce the timeout,
    /// attach degradation notes.
    pub async fn dispatch(&self, tool: &str, args: Value) -> VaultResult<ToolResponse> {
        struct InFlight<'a>(&'a AtomicU64);
        impl Drop for InFlight<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let _guard = InFlight(&self.in_flight);
        match tokio::time::timeout(self.timeout, self.run(tool, args)).await {
            Ok(inner) => inner,
            Err(_) => Err(VaultError::Timeout(self.timeout.as_secs())),
        }
    }

    async fn run(&self, tool: &str, args: Value) -> VaultResult<ToolResponse> {
        let reindex_note = self.ensure_reindexed().await;

        let ctx = self.ctx.clone();
        let decay = self.event_decay_days;
        let resolved_from = self.resolved_from.clone();
        let ingestor = self.ingestor.clone();
        let tool_name = tool.to_string();
        let mut response = tokio::task::spawn_blocking(move || {
            handle_sync(&ctx, decay, &resolved_from, ingestor, &tool_name, args)
        })
        .await
        .map_err(|e| VaultError::Internal(format!("operation task failed: {e}")))??;

        if let Some(note) = reindex_note {
            response.notes.push(note.to_string());
        }
        Ok(response)
    }

    async fn ensure_reindexed(&self) -> Option<&'static str> {
        // Only the local unscoped tenant reconciles from disk. Hosted
        // tenants index inline, encrypted tenants have no plaintext files,
        // and on-disk documents carry no owner to restore for a scoped
        // context over a shared root.
        if self.ctx.inline_index || self.ctx.encrypts() || self.ctx.user_id.is_some() {
            return None;
        }
        let mut gate = self.gate.state.lock().await;
        if gate.done.is_some() {
            return None;
        }
        if gate.failed {
            return Some(NOTE_REINDEX_FAILED);
        }

        let ctx = self.ctx.clone();
        let result = tokio::task::spawn_blocking(move || reindex(&ctx, false)).await;
        gate.attempts += 1;
        match result {
            Ok(Ok(report)) => {
                info!(
                    added = report.added,
                    updated = report.updated,
                    removed = report.removed,
                    unchanged = report.unchanged,
                    "auto-reindex complete"
                );
                gate.done = Some(report);
                None
            }
            Ok(Err(e)) => {
                warn!(attempt = gate.attempts, error = %e, "auto-reindex failed");
                if gate.attempts >= REINDEX_MAX_ATTEMPTS {
                    gate.failed = true;
                }
                Some(NOTE_REINDEX_FAILED)
            }
            Err(e) => {
                warn!(attempt = gate.attempts, error = %e, "auto-reindex task died");
                if gate.attempts >= REINDEX_MAX_ATTEMPTS {
                    gate.failed = true;
                }
                Some(NOTE_REINDEX_FAILED)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Administrative operations
    // -----------------------------------------------------------------------

    /// Manual full reindex; clears a sticky embedder failure to backfill.
    pub async fn admin_reindex(&self) -> VaultResult<ReindexReport> {
        let ctx = self.ctx.clone();
        tokio::task::spawn_blocking(move || reindex(&ctx, true))
            .await
            .map_err(|e| VaultError::Internal(format!("reindex task failed: {e}")))?
    }

    pub fn manifest(&self) -> VaultResult<Manifest> {
        gather_manifest(&self.ctx)
    }

    pub fn export<W: std::io::Write>(&self, out: &mut W) -> VaultResult<usize> {
        export_jsonl(&self.ctx, out)
    }

    pub fn import<R: std::io::BufRead>(
        &self,
        reader: R,
        progress: Option<&mut dyn FnMut(usize)>,
    ) -> VaultResult<ImportReport> {
        import_jsonl(&self.ctx, reader, progress)
    }
}

// ---------------------------------------------------------------------------
// Handlers (synchronous; run on the blocking pool)
// ---------------------------------------------------------------------------

fn handle_sync(
    ctx: &TenantContext,
    event_decay_days: i64,
    resolved_from: &str,
    ingestor: Option<Arc<dyn UrlIngestor>>,
    tool: &str,
    args: Value,
) -> VaultResult<ToolResponse> {
    match tool {
        "get_context" => get_context(ctx, event_decay_days, args),
        "save_context" => save_context(ctx, args),
        "list_context" => list_context(ctx, args),
        "delete_context" => delete_context(ctx, args),
        "submit_feedback" => submit_feedback(ctx, args),
        "ingest_url" => ingest_url(ctx, ingestor, args),
        "context_status" => context_status(ctx, resolved_from),
        other => Err(VaultError::InvalidInput(format!("unknown tool {other:?}"))),
    }
}

/// Decrypt at the boundary and shape an entry for the wire.
fn present(ctx: &TenantContext, record: EntryRecord) -> VaultResult<Value> {
    let entry = ctx.decrypt(record)?.into_entry()?;
    entry_json(&entry)
}

fn entry_json(entry: &Entry) -> VaultResult<Value> {
    serde_json::to_value(entry).map_err(|e| VaultError::Internal(format!("serialize entry: {e}")))
}

fn get_context(ctx: &TenantContext, event_decay_days: i64, args: Value) -> VaultResult<ToolResponse> {
    let args: GetContextArgs = parse_args(args)?;
    let has_filter = args.kind.is_some()
        || args.category.is_some()
        || args.identity_key.is_some()
        || args.tags.as_ref().is_some_and(|t| !t.is_empty())
        || args.since.is_some()
        || args.until.is_some();
    if args.query.as_deref().map_or(true, str::is_empty) && !has_filter {
        return Err(VaultError::InvalidInput(
            "provide a query and/or at least one filter".into(),
        ));
    }

    let req = SearchRequest {
        query: args.query,
        kind: args.kind.as_deref().map(normalize_kind),
        category: parse_category(args.category)?,
        identity_key: args.identity_key,
        tags: args.tags,
        since: parse_time("since", args.since)?,
        until: parse_time("until", args.until)?,
        limit: args.limit.unwrap_or(0).min(MAX_LIST_LIMIT),
        event_decay_days: Some(event_decay_days),
    };
    let outcome = retrieve::search(ctx, &req)?;

    let mut results = Vec::with_capacity(outcome.hits.len());
    for hit in outcome.hits {
        let mut shaped = present(ctx, hit.record)?;
        if let Some(obj) = shaped.as_object_mut() {
            obj.insert("score".into(), json!((hit.score * 1000.0).round() / 1000.0));
        }
        results.push(shaped);
    }
    let mut response = ToolResponse::new(json!({ "count": results.len(), "results": results }));
    response.notes = outcome.notes;
    Ok(response)
}

fn save_context(ctx: &TenantContext, args: Value) -> VaultResult<ToolResponse> {
    let args: SaveContextArgs = parse_args(args)?;
    let input = EntryInput {
        id: args.id.clone(),
        kind: args.kind.as_deref().map(normalize_kind),
        title: args.title,
        body: args.body,
        meta: args.meta,
        tags: args.tags,
        source: args.source,
        folder: args.folder,
        identity_key: args.identity_key,
        expires_at: parse_time("expires_at", args.expires_at)?,
    };
    let entry = if input.id.is_some() {
        capture::update(ctx, input)?
    } else {
        capture::capture(ctx, input)?
    };
    Ok(ToolResponse::new(json!({ "saved": entry_json(&entry)? })))
}

fn list_context(ctx: &TenantContext, args: Value) -> VaultResult<ToolResponse> {
    let args: ListContextArgs = parse_args(args)?;
    let filter = Filter {
        kind: args.kind.as_deref().map(normalize_kind),
        category: parse_category(args.category)?,
        since: parse_time("since", args.since)?,
        until: parse_time("until", args.until)?,
    };
    let limit = args.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit > MAX_LIST_LIMIT {
        return Err(VaultError::InvalidInput(format!("limit must be <= {MAX_LIST_LIMIT}")));
    }
    let records = retrieve::list(ctx, &filter, limit, args.offset.unwrap_or(0))?;
    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        entries.push(present(ctx, record)?);
    }
    Ok(ToolResponse::new(json!({ "count": entries.len(), "entries": entries })))
}

fn delete_context(ctx: &TenantContext, args: Value) -> VaultResult<ToolResponse> {
    let args: DeleteContextArgs = parse_args(args)?;
    capture::delete(ctx, &args.id)?;
    Ok(ToolResponse::new(json!({ "deleted": args.id })))
}

fn submit_feedback(ctx: &TenantContext, args: Value) -> VaultResult<ToolResponse> {
    let args: SubmitFeedbackArgs = parse_args(args)?;
    let feedback_type = args.feedback_type.unwrap_or_else(|| "other".into()).to_lowercase();
    let severity = args.severity.unwrap_or_else(|| "low".into()).to_lowercase();

    let mut meta = Meta::new();
    meta.insert("feedback_type".into(), json!(feedback_type));
    meta.insert("severity".into(), json!(severity));
    meta.insert("status".into(), json!("new"));

    let entry = capture::capture(
        ctx,
        EntryInput {
            kind: Some("feedback".into()),
            body: Some(args.message),
            tags: Some(vec![feedback_type, severity]),
            meta: Some(meta),
            ..Default::default()
        },
    )?;
    Ok(ToolResponse::new(json!({ "saved": entry_json(&entry)? })))
}

fn ingest_url(
    ctx: &TenantContext,
    ingestor: Option<Arc<dyn UrlIngestor>>,
    args: Value,
) -> VaultResult<ToolResponse> {
    let args: IngestUrlArgs = parse_args(args)?;
    let ingestor =
        ingestor.ok_or_else(|| VaultError::IngestFailed("no URL parser configured".into()))?;
    let page = ingestor.ingest(&args.url).map_err(VaultError::IngestFailed)?;

    let kind = args
        .kind
        .or(page.kind)
        .map(|k| normalize_kind(&k))
        .unwrap_or_else(|| "reference".into());
    let mut tags = page.tags;
    if let Some(extra) = args.tags {
        tags.extend(extra);
    }
    let entry = capture::capture(
        ctx,
        EntryInput {
            kind: Some(kind),
            title: page.title,
            body: Some(page.body),
            tags: Some(tags),
            source: Some(args.url),
            folder: args.folder,
            ..Default::default()
        },
    )?;
    Ok(ToolResponse::new(json!({ "saved": entry_json(&entry)? })))
}

fn context_status(ctx: &TenantContext, resolved_from: &str) -> VaultResult<ToolResponse> {
    let snapshot: StatusSnapshot = gather_vault_status(ctx, resolved_from);
    let body = serde_json::to_value(&snapshot)
        .map_err(|e| VaultError::Internal(format!("serialize status: {e}")))?;
    Ok(ToolResponse::new(body))
}
