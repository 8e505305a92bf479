//! Kind → category resolution and vault path layout.
//!
//! A kind is a short lowercase identifier (`insight`, `contact`, `meeting`).
//! Well-known kinds map to a category through a closed table; unknown kinds
//! are accepted and default to `knowledge`. Callers normalize plural forms
//! once at the dispatcher boundary — everything below it sees canonical
//! singular kinds only.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Write and retrieval semantics of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Append-only facts; no decay.
    Knowledge,
    /// Upserted on `(user_id, kind, identity_key)`; exact-match first.
    Entity,
    /// Append-only, time-windowed by default, hyperbolic recency decay.
    Event,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Knowledge => "knowledge",
            Category::Entity => "entity",
            Category::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "knowledge" => Some(Category::Knowledge),
            "entity" => Some(Category::Entity),
            "event" => Some(Category::Event),
            _ => None,
        }
    }

    pub const ALL: [Category; 3] = [Category::Knowledge, Category::Entity, Category::Event];
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Well-known kind table (closed)
// ---------------------------------------------------------------------------

/// `(singular, category, plural)` — plural is the on-disk directory segment.
const KIND_TABLE: &[(&str, Category, &str)] = &[
    // knowledge
    ("insight", Category::Knowledge, "insights"),
    ("decision", Category::Knowledge, "decisions"),
    ("pattern", Category::Knowledge, "patterns"),
    ("preference", Category::Knowledge, "preferences"),
    ("reference", Category::Knowledge, "references"),
    ("note", Category::Knowledge, "notes"),
    ("feedback", Category::Knowledge, "feedback"),
    // entity
    ("contact", Category::Entity, "contacts"),
    ("project", Category::Entity, "projects"),
    ("tool", Category::Entity, "tools"),
    ("team", Category::Entity, "teams"),
    // event
    ("event", Category::Event, "events"),
    ("meeting", Category::Event, "meetings"),
    ("conversation", Category::Event, "conversations"),
    ("log", Category::Event, "logs"),
];

/// Resolve the category for a kind. Unknown kinds default to `knowledge`.
pub fn category_for(kind: &str) -> Category {
    KIND_TABLE
        .iter()
        .find(|(k, _, _)| *k == kind)
        .map(|(_, c, _)| *c)
        .unwrap_or(Category::Knowledge)
}

/// Plural form used as the directory segment under the category dir.
pub fn kind_plural(kind: &str) -> String {
    if let Some((_, _, plural)) = KIND_TABLE.iter().find(|(k, _, _)| *k == kind) {
        return (*plural).to_string();
    }
    // Unknown kind: naive pluralization, stable across calls.
    if kind.ends_with('s') {
        kind.to_string()
    } else if kind.ends_with('y') && kind.len() > 1 {
        format!("{}ies", &kind[..kind.len() - 1])
    } else {
        format!("{kind}s")
    }
}

/// Map a plural or singular variant to the canonical singular kind.
///
/// Unknown kinds pass through unchanged (after a trailing-`s` check against
/// the known table, so `insights` still resolves even though only `insight`
/// is listed).
pub fn normalize_kind(input: &str) -> String {
    let lowered = input.trim().to_lowercase();
    if KIND_TABLE.iter().any(|(k, _, _)| *k == lowered) {
        return lowered;
    }
    if let Some((k, _, _)) = KIND_TABLE.iter().find(|(_, _, p)| *p == lowered) {
        return (*k).to_string();
    }
    lowered
}

/// Inverse of [`kind_plural`] for directory names found on disk.
pub fn kind_from_plural(plural: &str) -> String {
    if let Some((k, _, _)) = KIND_TABLE.iter().find(|(_, _, p)| *p == plural) {
        return (*k).to_string();
    }
    if let Some(stem) = plural.strip_suffix("ies") {
        return format!("{stem}y");
    }
    if plural.len() > 1 && plural.ends_with('s') && !plural.ends_with("ss") {
        return plural[..plural.len() - 1].to_string();
    }
    plural.to_string()
}

// ---------------------------------------------------------------------------
// Kind syntax
// ---------------------------------------------------------------------------

fn kind_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-z][a-z0-9_-]*$").unwrap())
}

/// Validate kind syntax: `^[a-z][a-z0-9_-]*$`.
pub fn validate_kind(kind: &str) -> VaultResult<()> {
    if kind_regex().is_match(kind) {
        Ok(())
    } else {
        Err(VaultError::InvalidKind(kind.to_string()))
    }
}

/// Relative directory for a kind: `<category>/<plural>`.
pub fn kind_dir(kind: &str) -> String {
    format!("{}/{}", category_for(kind).as_str(), kind_plural(kind))
}
