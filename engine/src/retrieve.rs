//! Hybrid retrieval: lexical + vector fusion with category-aware recency.
//!
//! Pipeline per query: entity exact-match short-circuit, event auto-window,
//! FTS5 phrase-AND candidates (rank-normalized), cosine KNN over the vector
//! table, weighted fusion, hyperbolic event decay, filters, tag post-filter,
//! deterministic ordering.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use context_vault_core::entry::EntryRecord;
use context_vault_core::kind::{category_for, Category};
use context_vault_core::VaultResult;

use crate::clock::now;
use crate::store::Filter;
use crate::tenant::TenantContext;

pub const DEFAULT_SEARCH_LIMIT: usize = 10;
pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

/// Candidate pool sizes per phase.
const LEXICAL_CANDIDATES: usize = 15;
const VECTOR_CANDIDATES: usize = 15;
/// Kind-filtered vector phase over-fetches to compensate post-filter loss.
const VECTOR_CANDIDATES_FILTERED: usize = 30;
/// Tag filtering happens after ranking; both phases over-fetch to preserve
/// the caller's limit.
const TAG_OVERFETCH: usize = 10;

const LEXICAL_WEIGHT: f64 = 0.4;
const VECTOR_WEIGHT: f64 = 0.6;

/// Default event window and decay half-life, in days.
pub const DEFAULT_EVENT_DECAY_DAYS: i64 = 30;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: Option<String>,
    /// Canonical singular (normalized at the dispatcher boundary).
    pub kind: Option<String>,
    pub category: Option<Category>,
    pub identity_key: Option<String>,
    pub tags: Option<Vec<String>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    /// Event window/decay override (config `event_decay_days`).
    pub event_decay_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    #[serde(skip)]
    pub record: EntryRecord,
    pub score: f64,
}

#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    /// Degradation notes surfaced to the caller (`embeddings-unavailable`).
    pub notes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Query sanitation
// ---------------------------------------------------------------------------

/// Whitespace-tokenize, strip FTS metacharacters, emit a phrase-AND match
/// query: every token quoted, all tokens required.
pub fn fts_match_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| token.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Recency
// ---------------------------------------------------------------------------

/// Hyperbolic decay for events (half-life = `decay_days`); no decay for
/// knowledge and entities.
pub fn recency_boost(
    category: Category,
    created_at: DateTime<Utc>,
    at: DateTime<Utc>,
    decay_days: i64,
) -> f64 {
    match category {
        Category::Knowledge | Category::Entity => 1.0,
        Category::Event => {
            let age_days = (at - created_at).num_seconds().max(0) as f64 / 86_400.0;
            1.0 / (1.0 + age_days / decay_days.max(1) as f64)
        }
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

struct Fused {
    rowid: i64,
    record: EntryRecord,
    lexical: f64,
    vector: f64,
}

/// Run the hybrid pipeline of one search. Returned records may still be
/// ciphertext; decryption happens at the dispatcher boundary.
pub fn search(ctx: &TenantContext, req: &SearchRequest) -> VaultResult<SearchOutcome> {
    let at = now();
    let limit = if req.limit == 0 { DEFAULT_SEARCH_LIMIT } else { req.limit };
    let decay_days = req.event_decay_days.unwrap_or(DEFAULT_EVENT_DECAY_DAYS);
    let mut outcome = SearchOutcome::default();

    // Phase 1: entity exact-match short-circuit.
    if let (Some(key), Some(kind)) = (&req.identity_key, &req.kind) {
        if let Some(record) = ctx.store.get_by_identity(ctx.user(), kind, key, at)? {
            outcome.hits.push(SearchHit { record, score: 1.0 });
            return Ok(outcome);
        }
    }

    // Phase 2: event auto-window.
    let resolved_category = req.category.or_else(|| req.kind.as_deref().map(category_for));
    let mut since = req.since;
    let until = req.until;
    if resolved_category == Some(Category::Event) && since.is_none() && until.is_none() {
        since = Some(at - Duration::days(decay_days));
    }

    let filter = Filter { kind: req.kind.clone(), category: req.category, since, until };
    let overfetch = if req.tags.as_ref().is_some_and(|t| !t.is_empty()) { TAG_OVERFETCH } else { 1 };

    let query = req.query.as_deref().unwrap_or("").trim();
    let mut fused: Vec<Fused> = Vec::new();

    if !query.is_empty() {
        // Phase 3: lexical candidates, rank-normalized into [0, 1].
        let match_query = fts_match_query(query);
        let lexical = ctx.store.fts_search(
            ctx.user(),
            &match_query,
            &filter,
            at,
            LEXICAL_CANDIDATES * overfetch,
        )?;
        let max_abs_rank =
            lexical.iter().map(|hit| hit.rank.abs()).fold(0.0_f64, f64::max);
        for hit in lexical {
            let normalized = if max_abs_rank > 0.0 { hit.rank.abs() / max_abs_rank } else { 1.0 };
            fused.push(Fused {
                rowid: hit.rowid,
                record: hit.record,
                lexical: normalized,
                vector: 0.0,
            });
        }

        // Phase 4: vector candidates (cosine over L2-normalized embeddings,
        // so similarity is exactly `1 - distance`).
        match ctx.embedder.embed_query(query) {
            Some(query_vec) => {
                let k = if req.kind.is_some() {
                    VECTOR_CANDIDATES_FILTERED
                } else {
                    VECTOR_CANDIDATES
                } * overfetch;
                let mut scored: Vec<(i64, f64)> = ctx
                    .store
                    .candidate_vectors(ctx.user(), at)?
                    .into_iter()
                    .map(|(rowid, emb)| {
                        let dot: f32 =
                            query_vec.iter().zip(emb.iter()).map(|(a, b)| a * b).sum();
                        (rowid, dot as f64)
                    })
                    .collect();
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                scored.truncate(k);

                for (rowid, score) in scored {
                    match fused.iter().position(|f| f.rowid == rowid) {
                        Some(i) => fused[i].vector = score,
                        None => {
                            if let Some(record) = ctx.store.record_by_rowid(rowid)? {
                                fused.push(Fused { rowid, record, lexical: 0.0, vector: score });
                            }
                        }
                    }
                }
            }
            None => {
                outcome.notes.push("embeddings-unavailable".into());
            }
        }
    } else {
        // Pure filter query: reuse the list pipeline and give every hit a
        // neutral score so ordering falls to recency.
        for record in ctx.store.list(ctx.user(), &filter, at, limit * overfetch, 0)? {
            fused.push(Fused { rowid: 0, record, lexical: 0.0, vector: 0.0 });
        }
    }

    if ctx.encrypts() {
        outcome.notes.push("encrypted_ranking_degraded".into());
    }

    // Phases 5-8: fusion, recency, filters, tag post-filter.
    let requested_tags = req.tags.clone().unwrap_or_default();
    let mut hits: Vec<SearchHit> = fused
        .into_iter()
        .filter(|f| f.record.user_id.as_deref() == ctx.user())
        .filter(|f| !f.record.is_expired(at))
        .filter(|f| filter.matches(&f.record))
        .filter(|f| {
            requested_tags.is_empty()
                || f.record.tags.iter().any(|t| requested_tags.contains(t))
        })
        .map(|f| {
            let combined = if query.is_empty() {
                1.0
            } else {
                LEXICAL_WEIGHT * f.lexical + VECTOR_WEIGHT * f.vector
            };
            let boost = recency_boost(f.record.category, f.record.created_at, at, decay_days);
            SearchHit { record: f.record, score: combined * boost }
        })
        .collect();

    // Phase 9: deterministic order — score desc, newer first, id desc.
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.record.created_at.cmp(&a.record.created_at))
            .then_with(|| b.record.id.cmp(&a.record.id))
    });
    hits.truncate(limit);

    debug!(
        query = query,
        hits = hits.len(),
        notes = outcome.notes.join(",").as_str(),
        "search complete"
    );
    outcome.hits = hits;
    Ok(outcome)
}

/// Filter-only browse: the same pipeline without the ranking phases,
/// ordered by `created_at` descending.
pub fn list(
    ctx: &TenantContext,
    filter: &Filter,
    limit: usize,
    offset: usize,
) -> VaultResult<Vec<EntryRecord>> {
    let limit = limit.clamp(1, MAX_LIST_LIMIT);
    ctx.store.list(ctx.user(), filter, now(), limit, offset)
}
