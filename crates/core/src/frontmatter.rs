//! Markdown document codec: YAML frontmatter plus kind-specific body
//! templates.
//!
//! Reserved frontmatter keys are `id, tags, source, created, identity_key,
//! expires_at`; every other key is free-form meta written flat and read back
//! as meta. Strings containing YAML-significant characters are JSON-quoted;
//! arrays and nested values are JSON. `parse_document(serialize_document(e))`
//! round-trips exactly over the model fields.

use chrono::{DateTime, Utc};

use crate::entry::{Entry, Meta};
use crate::error::{VaultError, VaultResult};

/// Frontmatter keys owned by the engine; everything else is meta.
pub const RESERVED_KEYS: &[&str] = &["id", "tags", "source", "created", "identity_key", "expires_at"];

// ---------------------------------------------------------------------------
// Scalar quoting
// ---------------------------------------------------------------------------

/// A string value is written raw only when reading it back cannot change it:
/// it must not parse as JSON (numbers, booleans, null, quoted strings,
/// arrays), must be single-line, and must avoid YAML plain-scalar hazards.
fn needs_quoting(s: &str) -> bool {
    if s.is_empty() || s != s.trim() {
        return true;
    }
    if s.contains('\n') || s.contains(": ") || s.contains(" #") {
        return true;
    }
    if s.starts_with(['#', '&', '*', '!', '|', '>', '\'', '"', '%', '@', '`', '[', '{', '-', '?']) {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(s).is_ok()
}

fn write_string(out: &mut String, key: &str, value: &str) {
    if needs_quoting(value) {
        out.push_str(&format!("{key}: {}\n", serde_json::Value::String(value.to_string())));
    } else {
        out.push_str(&format!("{key}: {value}\n"));
    }
}

fn write_value(out: &mut String, key: &str, value: &serde_json::Value) {
    match value {
        serde_json::Value::String(s) => write_string(out, key, s),
        other => out.push_str(&format!("{key}: {other}\n")),
    }
}

/// Inverse of the writers above: JSON when it parses, raw string otherwise.
fn read_value(raw: &str) -> serde_json::Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn read_string(raw: &str) -> String {
    match read_value(raw) {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn parse_timestamp(raw: &str) -> VaultResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VaultError::InvalidInput(format!("bad timestamp {raw:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Body templates
// ---------------------------------------------------------------------------

fn meta_language(meta: Option<&Meta>) -> String {
    meta.and_then(|m| m.get("language"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// Render the markdown body for a kind. `insight` is verbatim (its template
/// falls back to the default heading form when a title is present, so the
/// title survives the round trip).
pub fn render_body(kind: &str, title: Option<&str>, body: &str, meta: Option<&Meta>) -> String {
    let title_str = title.unwrap_or("");
    match kind {
        "insight" if title.is_none() => body.to_string(),
        "decision" => format!("## Decision\n{title_str}\n\n## Rationale\n{body}"),
        "pattern" => {
            let lang = meta_language(meta);
            format!("# {title_str}\n\n```{lang}\n{body}\n```")
        }
        _ => {
            if title_str.is_empty() {
                body.to_string()
            } else {
                format!("# {title_str}\n\n{body}")
            }
        }
    }
}

/// Invert [`render_body`]. Unrecognized shapes fall back to `(None, text)`.
pub fn parse_body(kind: &str, text: &str) -> (Option<String>, String) {
    match kind {
        "decision" => {
            if let Some(rest) = text.strip_prefix("## Decision\n") {
                if let Some((title_part, body)) = rest.split_once("\n\n## Rationale\n") {
                    let title = title_part.trim();
                    let title = if title.is_empty() { None } else { Some(title.to_string()) };
                    return (title, body.to_string());
                }
            }
            (None, text.to_string())
        }
        "pattern" => {
            if let Some(rest) = text.strip_prefix("# ") {
                if let Some((title, fenced)) = rest.split_once("\n\n```") {
                    if let Some((_lang, after_lang)) = fenced.split_once('\n') {
                        if let Some(body) = after_lang.strip_suffix("\n```") {
                            let title =
                                if title.is_empty() { None } else { Some(title.to_string()) };
                            return (title, body.to_string());
                        }
                    }
                }
            }
            (None, text.to_string())
        }
        _ => {
            if let Some(rest) = text.strip_prefix("# ") {
                if let Some((title, body)) = rest.split_once("\n\n") {
                    if !title.is_empty() && !title.contains('\n') {
                        return (Some(title.to_string()), body.to_string());
                    }
                }
            }
            (None, text.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Document serialization
// ---------------------------------------------------------------------------

/// Serialize an entry to its on-disk markdown form.
pub fn serialize_document(entry: &Entry) -> String {
    let mut fm = String::new();
    write_string(&mut fm, "id", &entry.id);
    fm.push_str(&format!("created: {}\n", entry.created_at.to_rfc3339()));
    if !entry.tags.is_empty() {
        let tags = serde_json::Value::Array(
            entry.tags.iter().map(|t| serde_json::Value::String(t.clone())).collect(),
        );
        fm.push_str(&format!("tags: {tags}\n"));
    }
    if let Some(source) = &entry.source {
        write_string(&mut fm, "source", source);
    }
    if let Some(key) = &entry.identity_key {
        write_string(&mut fm, "identity_key", key);
    }
    if let Some(expires) = &entry.expires_at {
        fm.push_str(&format!("expires_at: {}\n", expires.to_rfc3339()));
    }
    if let Some(meta) = &entry.meta {
        for (key, value) in meta {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            write_value(&mut fm, key, value);
        }
    }

    let body = render_body(&entry.kind, entry.title.as_deref(), &entry.body, entry.meta.as_ref());
    format!("---\n{fm}---\n\n{body}")
}

// ---------------------------------------------------------------------------
// Document parsing
// ---------------------------------------------------------------------------

/// Everything recoverable from an on-disk document. `id`/`created` are
/// optional so reindex can self-heal files written by hand.
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub id: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub identity_key: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub meta: Option<Meta>,
    pub title: Option<String>,
    pub body: String,
}

/// Parse an on-disk document. Line endings are normalized to `\n` first.
/// `kind` selects the body template inverse (derived from the file's
/// directory by the caller).
pub fn parse_document(kind: &str, raw: &str) -> VaultResult<ParsedDocument> {
    let normalized = raw.replace("\r\n", "\n");
    let rest = normalized
        .strip_prefix("---\n")
        .ok_or_else(|| VaultError::InvalidInput("missing frontmatter open marker".into()))?;
    let (fm_block, after) = rest
        .split_once("\n---\n")
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .or_else(|| {
            // Empty frontmatter: "---\n---\n..."
            rest.strip_prefix("---\n").map(|b| (String::new(), b.to_string()))
        })
        .ok_or_else(|| VaultError::InvalidInput("missing frontmatter close marker".into()))?;

    let rendered = after.strip_prefix('\n').unwrap_or(&after).to_string();

    let mut doc = ParsedDocument::default();
    let mut meta = Meta::new();
    for line in fm_block.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(VaultError::InvalidInput(format!("bad frontmatter line {line:?}")));
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "id" => doc.id = Some(read_string(value)),
            "created" => doc.created = Some(parse_timestamp(&read_string(value))?),
            "expires_at" => doc.expires_at = Some(parse_timestamp(&read_string(value))?),
            "source" => doc.source = Some(read_string(value)),
            "identity_key" => doc.identity_key = Some(read_string(value)),
            "tags" => {
                let parsed = read_value(value);
                if let serde_json::Value::Array(items) = parsed {
                    doc.tags = items
                        .into_iter()
                        .map(|v| match v {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        })
                        .collect();
                } else {
                    return Err(VaultError::InvalidInput("tags must be a JSON array".into()));
                }
            }
            _ => {
                meta.insert(key.to_string(), read_value(value));
            }
        }
    }
    if !meta.is_empty() {
        doc.meta = Some(meta);
    }

    let (title, body) = parse_body(kind, &rendered);
    doc.title = title;
    doc.body = body;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::new_entry_id;
    use crate::kind::category_for;
    use std::path::PathBuf;

    fn entry(kind: &str, title: Option<&str>, body: &str) -> Entry {
        Entry {
            id: new_entry_id(),
            kind: kind.into(),
            category: category_for(kind),
            title: title.map(String::from),
            body: body.into(),
            meta: None,
            tags: vec![],
            source: None,
            identity_key: None,
            expires_at: None,
            file_path: PathBuf::from("/vault/x.md"),
            created_at: Utc::now(),
            user_id: None,
        }
    }

    fn roundtrip(e: &Entry) -> ParsedDocument {
        parse_document(&e.kind, &serialize_document(e)).unwrap()
    }

    #[test]
    fn insight_body_is_verbatim() {
        let e = entry("insight", None, "Plain observation.\n\nSecond paragraph.");
        let doc = serialize_document(&e);
        assert!(doc.ends_with("Plain observation.\n\nSecond paragraph."));
        let parsed = roundtrip(&e);
        assert_eq!(parsed.body, e.body);
        assert_eq!(parsed.title, None);
    }

    #[test]
    fn decision_template_roundtrips() {
        let e = entry("decision", Some("Use SQLite"), "It is embedded and boring.");
        let doc = serialize_document(&e);
        assert!(doc.contains("## Decision\nUse SQLite\n\n## Rationale\n"));
        let parsed = roundtrip(&e);
        assert_eq!(parsed.title.as_deref(), Some("Use SQLite"));
        assert_eq!(parsed.body, e.body);
    }

    #[test]
    fn pattern_template_roundtrips_with_language() {
        let mut e = entry("pattern", Some("Retry loop"), "loop { try(); }");
        let mut meta = Meta::new();
        meta.insert("language".into(), serde_json::Value::String("rust".into()));
        e.meta = Some(meta);
        let doc = serialize_document(&e);
        assert!(doc.contains("```rust\n"));
        let parsed = roundtrip(&e);
        assert_eq!(parsed.title.as_deref(), Some("Retry loop"));
        assert_eq!(parsed.body, e.body);
        assert_eq!(
            parsed.meta.unwrap().get("language").and_then(|v| v.as_str()),
            Some("rust")
        );
    }

    #[test]
    fn default_template_titles() {
        let e = entry("note", Some("Groceries"), "milk\neggs");
        let parsed = roundtrip(&e);
        assert_eq!(parsed.title.as_deref(), Some("Groceries"));
        assert_eq!(parsed.body, "milk\neggs");

        let e = entry("note", None, "no title here");
        let parsed = roundtrip(&e);
        assert_eq!(parsed.title, None);
        assert_eq!(parsed.body, "no title here");
    }

    #[test]
    fn reserved_keys_roundtrip_exactly() {
        let mut e = entry("contact", None, "Role: PM");
        e.identity_key = Some("alice@example.com".into());
        e.source = Some("crm: import".into()); // ": " forces quoting
        e.tags = vec!["people".into(), "vip".into()];
        e.expires_at = Some(Utc::now() + chrono::Duration::days(30));
        let parsed = roundtrip(&e);
        assert_eq!(parsed.id.as_deref(), Some(e.id.as_str()));
        assert_eq!(parsed.created, Some(e.created_at));
        assert_eq!(parsed.identity_key, e.identity_key);
        assert_eq!(parsed.source, e.source);
        assert_eq!(parsed.tags, e.tags);
        assert_eq!(parsed.expires_at, e.expires_at);
    }

    #[test]
    fn meta_values_roundtrip_with_types() {
        let mut e = entry("insight", None, "body");
        let mut meta = Meta::new();
        meta.insert("confidence".into(), serde_json::json!(0.9));
        meta.insert("count".into(), serde_json::json!(3));
        meta.insert("flag".into(), serde_json::json!(true));
        meta.insert("label".into(), serde_json::json!("plain words"));
        meta.insert("tricky".into(), serde_json::json!("looks: quoted"));
        meta.insert("numeric_string".into(), serde_json::json!("42"));
        meta.insert("nested".into(), serde_json::json!({"a": [1, 2]}));
        e.meta = Some(meta.clone());
        let parsed = roundtrip(&e);
        assert_eq!(parsed.meta, Some(meta));
    }

    #[test]
    fn crlf_normalized_on_read() {
        let e = entry("note", Some("T"), "line1\nline2");
        let doc = serialize_document(&e).replace('\n', "\r\n");
        let parsed = parse_document("note", &doc).unwrap();
        assert_eq!(parsed.body, "line1\nline2");
        assert_eq!(parsed.title.as_deref(), Some("T"));
    }

    #[test]
    fn missing_id_is_tolerated() {
        let doc = "---\ncreated: 2026-01-01T00:00:00+00:00\n---\n\nhand-written";
        let parsed = parse_document("note", doc).unwrap();
        assert_eq!(parsed.id, None);
        assert_eq!(parsed.body, "hand-written");
    }

    #[test]
    fn missing_frontmatter_rejected() {
        assert!(parse_document("note", "just text").is_err());
    }
}
