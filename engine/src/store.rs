//! Primary store: the authoritative queryable copy of the vault.
//!
//! One SQLite database per store. The `vault` table is mirrored into a FTS5
//! shadow (`vault_fts`, over `title, body, tags, kind`) by triggers, and a
//! `vault_vec` table holds one 384-float embedding per row, keyed by rowid.
//! All statements are parameterized by `user_id`; `user_id IS NULL` denotes
//! the local/unscoped tenant.
//!
//! Uses a single `Mutex<Connection>` — the single-writer serialization point.
//! Statements go through rusqlite's prepared-statement cache.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{info, warn};

use context_vault_core::entry::{EntryContent, EntryRecord, Meta};
use context_vault_core::kind::Category;
use context_vault_core::{VaultError, VaultResult};

use crate::clock::{fmt_ts, parse_ts};

/// Current schema version (SQLite `user_version`).
pub const SCHEMA_VERSION: i32 = 6;

/// Databases older than this are backed up and rebuilt instead of migrated.
const REBUILD_CUTOFF: i32 = 3;

/// Embedding dimensionality of the vector table.
pub const EMBED_DIM: usize = 384;

fn db_err(e: rusqlite::Error) -> VaultError {
    VaultError::Internal(format!("store: {e}"))
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Row-level filter shared by list, lexical search, and the vector
/// post-filter.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub kind: Option<String>,
    pub category: Option<Category>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl Filter {
    /// Append WHERE fragments and their parameters for this filter.
    fn push_sql(&self, sql: &mut String, args: &mut Vec<SqlValue>) {
        if let Some(kind) = &self.kind {
            sql.push_str(" AND kind = ?");
            args.push(SqlValue::Text(kind.clone()));
        }
        if let Some(category) = self.category {
            sql.push_str(" AND category = ?");
            args.push(SqlValue::Text(category.as_str().to_string()));
        }
        if let Some(since) = &self.since {
            sql.push_str(" AND created_at >= ?");
            args.push(SqlValue::Text(fmt_ts(since)));
        }
        if let Some(until) = &self.until {
            sql.push_str(" AND created_at <= ?");
            args.push(SqlValue::Text(fmt_ts(until)));
        }
    }

    /// In-memory version used after the vector phase.
    pub fn matches(&self, rec: &EntryRecord) -> bool {
        if let Some(kind) = &self.kind {
            if &rec.kind != kind {
                return false;
            }
        }
        if let Some(category) = self.category {
            if rec.category != category {
                return false;
            }
        }
        if let Some(since) = &self.since {
            if rec.created_at < *since {
                return false;
            }
        }
        if let Some(until) = &self.until {
            if rec.created_at > *until {
                return false;
            }
        }
        true
    }
}

/// A lexical (FTS5) candidate with its native bm25 rank.
#[derive(Debug)]
pub struct LexicalHit {
    pub rowid: i64,
    pub record: EntryRecord,
    /// bm25 rank — more negative is better.
    pub rank: f64,
}

/// Row of the sync manifest.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManifestEntry {
    pub id: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// VaultStore
// ---------------------------------------------------------------------------

pub struct VaultStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for VaultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultStore").field("path", &self.path).finish_non_exhaustive()
    }
}

impl VaultStore {
    /// Open (or create) the store at `db_path`, creating parent directories
    /// and running migrations.
    pub fn open(db_path: &Path) -> VaultResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(db_err)?;
        Self::migrate(&conn, Some(db_path))?;
        Ok(Self { conn: Mutex::new(conn), path: Some(db_path.to_path_buf()) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> VaultResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::migrate(&conn, None)?;
        Ok(Self { conn: Mutex::new(conn), path: None })
    }

    fn lock(&self) -> VaultResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| VaultError::Internal(format!("store lock poisoned: {e}")))
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Size of the database file on disk (0 for in-memory stores).
    pub fn db_size_bytes(&self) -> u64 {
        self.path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Schema & migrations
    // -----------------------------------------------------------------------

    fn user_version(conn: &Connection) -> VaultResult<i32> {
        conn.query_row("PRAGMA user_version", [], |row| row.get(0)).map_err(db_err)
    }

    fn set_user_version(conn: &Connection, v: i32) -> VaultResult<()> {
        conn.pragma_update(None, "user_version", v).map_err(db_err)
    }

    /// Guarded ALTER: adding an existing column is not an error.
    fn add_column(conn: &Connection, ddl: &str) -> VaultResult<()> {
        match conn.execute_batch(ddl) {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
            Err(e) => Err(db_err(e)),
        }
    }

    fn migrate(conn: &Connection, db_path: Option<&Path>) -> VaultResult<()> {
        let version = Self::user_version(conn)?;
        if version == 0 {
            Self::create_schema(conn)?;
            Self::set_user_version(conn, SCHEMA_VERSION)?;
            return Ok(());
        }
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        if version < REBUILD_CUTOFF {
            warn!(from = version, "schema predates rebuild cutoff, rebuilding store");
            if let Some(path) = db_path {
                let backup = path.with_extension(format!("v{version}.bak.db"));
                conn.execute(
                    "VACUUM INTO ?1",
                    params![backup.to_string_lossy().to_string()],
                )
                .map_err(db_err)?;
                info!(backup = %backup.display(), "backed up old store before rebuild");
            }
            conn.execute_batch(
                "DROP TRIGGER IF EXISTS vault_ai;
                 DROP TRIGGER IF EXISTS vault_ad;
                 DROP TRIGGER IF EXISTS vault_au;
                 DROP TABLE IF EXISTS vault_fts;
                 DROP TABLE IF EXISTS vault_vec;
                 DROP TABLE IF EXISTS vault;",
            )
            .map_err(db_err)?;
            Self::create_schema(conn)?;
            Self::set_user_version(conn, SCHEMA_VERSION)?;
            return Ok(());
        }

        // Forward-only additive migrations, idempotent by construction.
        let tx_guard = conn.unchecked_transaction().map_err(db_err)?;
        if version < 4 {
            Self::add_column(
                conn,
                "ALTER TABLE vault ADD COLUMN category TEXT NOT NULL DEFAULT 'knowledge'",
            )?;
            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_vault_category ON vault(category);
                 CREATE INDEX IF NOT EXISTS idx_vault_category_created
                     ON vault(category, created_at DESC);",
            )
            .map_err(db_err)?;
        }
        if version < 5 {
            Self::add_column(conn, "ALTER TABLE vault ADD COLUMN user_id TEXT")?;
            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_vault_user ON vault(user_id);
                 CREATE UNIQUE INDEX IF NOT EXISTS idx_vault_identity
                     ON vault(COALESCE(user_id, ''), kind, identity_key)
                     WHERE identity_key IS NOT NULL;",
            )
            .map_err(db_err)?;
        }
        if version < 6 {
            Self::add_column(conn, "ALTER TABLE vault ADD COLUMN body_encrypted BLOB")?;
            Self::add_column(conn, "ALTER TABLE vault ADD COLUMN title_encrypted BLOB")?;
            Self::add_column(conn, "ALTER TABLE vault ADD COLUMN meta_encrypted BLOB")?;
            Self::add_column(conn, "ALTER TABLE vault ADD COLUMN iv BLOB")?;
        }
        // Everything in the base schema is IF NOT EXISTS; re-running it fills
        // in any index or trigger a partial migration left behind.
        Self::create_schema(conn)?;
        Self::set_user_version(conn, SCHEMA_VERSION)?;
        tx_guard.commit().map_err(db_err)?;
        info!(from = version, to = SCHEMA_VERSION, "migrated store schema");
        Ok(())
    }

    fn create_schema(conn: &Connection) -> VaultResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vault (
                id             TEXT PRIMARY KEY,
                kind           TEXT NOT NULL,
                category       TEXT NOT NULL DEFAULT 'knowledge',
                title          TEXT,
                body           TEXT NOT NULL,
                meta           TEXT,
                tags           TEXT NOT NULL DEFAULT '[]',
                source         TEXT,
                file_path      TEXT UNIQUE,
                identity_key   TEXT,
                expires_at     TEXT,
                created_at     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                user_id        TEXT,
                body_encrypted  BLOB,
                title_encrypted BLOB,
                meta_encrypted  BLOB,
                iv              BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_vault_kind ON vault(kind);
            CREATE INDEX IF NOT EXISTS idx_vault_category ON vault(category);
            CREATE INDEX IF NOT EXISTS idx_vault_category_created
                ON vault(category, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_vault_user ON vault(user_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_vault_identity
                ON vault(COALESCE(user_id, ''), kind, identity_key)
                WHERE identity_key IS NOT NULL;

            CREATE VIRTUAL TABLE IF NOT EXISTS vault_fts USING fts5(
                title, body, tags, kind,
                content=vault,
                content_rowid=rowid
            );

            CREATE TRIGGER IF NOT EXISTS vault_ai
                AFTER INSERT ON vault BEGIN
                    INSERT INTO vault_fts(rowid, title, body, tags, kind)
                    VALUES (new.rowid, new.title, new.body, new.tags, new.kind);
                END;
            CREATE TRIGGER IF NOT EXISTS vault_ad
                AFTER DELETE ON vault BEGIN
                    INSERT INTO vault_fts(vault_fts, rowid, title, body, tags, kind)
                    VALUES ('delete', old.rowid, old.title, old.body, old.tags, old.kind);
                END;
            CREATE TRIGGER IF NOT EXISTS vault_au
                AFTER UPDATE ON vault BEGIN
                    INSERT INTO vault_fts(vault_fts, rowid, title, body, tags, kind)
                    VALUES ('delete', old.rowid, old.title, old.body, old.tags, old.kind);
                    INSERT INTO vault_fts(rowid, title, body, tags, kind)
                    VALUES (new.rowid, new.title, new.body, new.tags, new.kind);
                END;

            CREATE TABLE IF NOT EXISTS vault_vec (
                rowid     INTEGER PRIMARY KEY,
                embedding BLOB NOT NULL
            );",
        )
        .map_err(db_err)
    }

    pub fn schema_version(&self) -> VaultResult<i32> {
        let conn = self.lock()?;
        Self::user_version(&conn)
    }

    // -----------------------------------------------------------------------
    // Row mapping
    // -----------------------------------------------------------------------

    const COLS: &'static str = "id, kind, category, title, body, meta, tags, source, file_path, \
         identity_key, expires_at, created_at, user_id, \
         body_encrypted, title_encrypted, meta_encrypted, iv";

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRecord> {
        Self::row_to_record_offset(row, 0)
    }

    fn content_columns(
        rec: &EntryRecord,
    ) -> (Option<String>, String, Option<String>, Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>)
    {
        match &rec.content {
            EntryContent::Plain { title, body, meta } => (
                title.clone(),
                body.clone(),
                meta.as_ref().and_then(|m| serde_json::to_string(m).ok()),
                None,
                None,
                None,
                None,
            ),
            EntryContent::Encrypted { title, body, meta, iv } => (
                None,
                String::new(),
                None,
                Some(body.clone()),
                title.clone(),
                meta.clone(),
                Some(iv.clone()),
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert a new row. The FTS shadow follows via triggers. Returns the
    /// assigned rowid.
    pub fn insert(&self, rec: &EntryRecord) -> VaultResult<i64> {
        let conn = self.lock()?;
        let (title, body, meta, body_ct, title_ct, meta_ct, iv) = Self::content_columns(rec);
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO vault (id, kind, category, title, body, meta, tags, source, \
                 file_path, identity_key, expires_at, created_at, user_id, \
                 body_encrypted, title_encrypted, meta_encrypted, iv)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            )
            .map_err(db_err)?;
        stmt.execute(params![
            rec.id,
            rec.kind,
            rec.category.as_str(),
            title,
            body,
            meta,
            serde_json::to_string(&rec.tags).unwrap_or_else(|_| "[]".into()),
            rec.source,
            rec.file_path.to_string_lossy().to_string(),
            rec.identity_key,
            rec.expires_at.map(|t| fmt_ts(&t)),
            fmt_ts(&rec.created_at),
            rec.user_id,
            body_ct,
            title_ct,
            meta_ct,
            iv,
        ])
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    /// Overwrite a row by id within the caller's scope. Returns the rowid.
    pub fn update(&self, rec: &EntryRecord) -> VaultResult<i64> {
        let conn = self.lock()?;
        let (title, body, meta, body_ct, title_ct, meta_ct, iv) = Self::content_columns(rec);
        let mut stmt = conn
            .prepare_cached(
                "UPDATE vault SET title = ?1, body = ?2, meta = ?3, tags = ?4, source = ?5, \
                 file_path = ?6, expires_at = ?7, \
                 body_encrypted = ?8, title_encrypted = ?9, meta_encrypted = ?10, iv = ?11
                 WHERE id = ?12 AND user_id IS ?13",
            )
            .map_err(db_err)?;
        let changed = stmt
            .execute(params![
                title,
                body,
                meta,
                serde_json::to_string(&rec.tags).unwrap_or_else(|_| "[]".into()),
                rec.source,
                rec.file_path.to_string_lossy().to_string(),
                rec.expires_at.map(|t| fmt_ts(&t)),
                body_ct,
                title_ct,
                meta_ct,
                iv,
                rec.id,
                rec.user_id,
            ])
            .map_err(db_err)?;
        if changed == 0 {
            return Err(VaultError::NotFound);
        }
        let rowid: i64 = conn
            .query_row(
                "SELECT rowid FROM vault WHERE id = ?1 AND user_id IS ?2",
                params![rec.id, rec.user_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(rowid)
    }

    /// Delete a row by id within the caller's scope. Returns the old rowid,
    /// or `None` when the id is absent or foreign-owned.
    pub fn delete(&self, user: Option<&str>, id: &str) -> VaultResult<Option<i64>> {
        let conn = self.lock()?;
        let rowid: Option<i64> = conn
            .query_row(
                "SELECT rowid FROM vault WHERE id = ?1 AND user_id IS ?2",
                params![id, user],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if let Some(rowid) = rowid {
            conn.execute("DELETE FROM vault WHERE rowid = ?1", params![rowid]).map_err(db_err)?;
        }
        Ok(rowid)
    }

    // -----------------------------------------------------------------------
    // Reads (all expiry-filtered and user-scoped)
    // -----------------------------------------------------------------------

    pub fn get(
        &self,
        user: Option<&str>,
        id: &str,
        now: DateTime<Utc>,
    ) -> VaultResult<Option<EntryRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM vault WHERE id = ?1 AND user_id IS ?2 \
             AND (expires_at IS NULL OR expires_at > ?3)",
            Self::COLS
        );
        let result = conn
            .prepare_cached(&sql)
            .map_err(db_err)?
            .query_row(params![id, user, fmt_ts(&now)], Self::row_to_record)
            .optional()
            .map_err(db_err);
        result
    }

    /// Whether any row (any tenant) already claims a file path. Used by the
    /// filename policy to dodge slug collisions.
    pub fn path_taken(&self, path: &Path) -> VaultResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .prepare_cached("SELECT COUNT(*) FROM vault WHERE file_path = ?1")
            .map_err(db_err)?
            .query_row(params![path.to_string_lossy().to_string()], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count > 0)
    }

    pub fn rowid_of(&self, user: Option<&str>, id: &str) -> VaultResult<Option<i64>> {
        let conn = self.lock()?;
        let result = conn
            .prepare_cached("SELECT rowid FROM vault WHERE id = ?1 AND user_id IS ?2")
            .map_err(db_err)?
            .query_row(params![id, user], |row| row.get(0))
            .optional()
            .map_err(db_err);
        result
    }

    pub fn record_by_rowid(&self, rowid: i64) -> VaultResult<Option<EntryRecord>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM vault WHERE rowid = ?1", Self::COLS);
        let result = conn
            .prepare_cached(&sql)
            .map_err(db_err)?
            .query_row(params![rowid], Self::row_to_record)
            .optional()
            .map_err(db_err);
        result
    }

    /// Entity lookup on `(user_id, kind, identity_key)`.
    pub fn get_by_identity(
        &self,
        user: Option<&str>,
        kind: &str,
        identity_key: &str,
        now: DateTime<Utc>,
    ) -> VaultResult<Option<EntryRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM vault WHERE user_id IS ?1 AND kind = ?2 AND identity_key = ?3 \
             AND (expires_at IS NULL OR expires_at > ?4)",
            Self::COLS
        );
        let result = conn
            .prepare_cached(&sql)
            .map_err(db_err)?
            .query_row(params![user, kind, identity_key, fmt_ts(&now)], Self::row_to_record)
            .optional()
            .map_err(db_err);
        result
    }

    /// Filter-only browse ordered by `created_at` descending, id descending
    /// as the tie-break.
    pub fn list(
        &self,
        user: Option<&str>,
        filter: &Filter,
        now: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> VaultResult<Vec<EntryRecord>> {
        let conn = self.lock()?;
        let mut sql = format!(
            "SELECT {} FROM vault WHERE user_id IS ? \
             AND (expires_at IS NULL OR expires_at > ?)",
            Self::COLS
        );
        let mut args: Vec<SqlValue> = vec![
            user.map(|u| SqlValue::Text(u.into())).unwrap_or(SqlValue::Null),
            SqlValue::Text(fmt_ts(&now)),
        ];
        filter.push_sql(&mut sql, &mut args);
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
        args.push(SqlValue::Integer(limit as i64));
        args.push(SqlValue::Integer(offset as i64));

        let mut stmt = conn.prepare_cached(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args), Self::row_to_record)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Ranked FTS5 candidates for an already-sanitized match query.
    pub fn fts_search(
        &self,
        user: Option<&str>,
        match_query: &str,
        filter: &Filter,
        now: DateTime<Utc>,
        limit: usize,
    ) -> VaultResult<Vec<LexicalHit>> {
        if match_query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut sql = format!(
            "SELECT v.rowid, {}, bm25(vault_fts) AS rank \
             FROM vault_fts JOIN vault v ON v.rowid = vault_fts.rowid \
             WHERE vault_fts MATCH ? AND v.user_id IS ? \
             AND (v.expires_at IS NULL OR v.expires_at > ?)",
            Self::COLS
                .split(", ")
                .map(|c| format!("v.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut args: Vec<SqlValue> = vec![
            SqlValue::Text(match_query.to_string()),
            user.map(|u| SqlValue::Text(u.into())).unwrap_or(SqlValue::Null),
            SqlValue::Text(fmt_ts(&now)),
        ];
        // Filter fragments reference unqualified columns; qualify via the join alias.
        let mut extra = String::new();
        filter.push_sql(&mut extra, &mut args);
        sql.push_str(&extra.replace(" AND ", " AND v."));
        sql.push_str(" ORDER BY rank LIMIT ?");
        args.push(SqlValue::Integer(limit as i64));

        let mut stmt = conn.prepare_cached(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                let rowid: i64 = row.get(0)?;
                let rank: f64 = row.get(18)?;
                // Column offsets are shifted by the leading rowid.
                let record = Self::row_to_record_offset(row, 1)?;
                Ok(LexicalHit { rowid, record, rank })
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn row_to_record_offset(row: &rusqlite::Row<'_>, off: usize) -> rusqlite::Result<EntryRecord> {
        let id: String = row.get(off)?;
        let kind: String = row.get(off + 1)?;
        let category: String = row.get(off + 2)?;
        let title: Option<String> = row.get(off + 3)?;
        let body: String = row.get(off + 4)?;
        let meta_json: Option<String> = row.get(off + 5)?;
        let tags_json: String = row.get(off + 6)?;
        let source: Option<String> = row.get(off + 7)?;
        let file_path: Option<String> = row.get(off + 8)?;
        let identity_key: Option<String> = row.get(off + 9)?;
        let expires_at: Option<String> = row.get(off + 10)?;
        let created_at: String = row.get(off + 11)?;
        let user_id: Option<String> = row.get(off + 12)?;
        let body_encrypted: Option<Vec<u8>> = row.get(off + 13)?;
        let title_encrypted: Option<Vec<u8>> = row.get(off + 14)?;
        let meta_encrypted: Option<Vec<u8>> = row.get(off + 15)?;
        let iv: Option<Vec<u8>> = row.get(off + 16)?;

        let content = match (body_encrypted, iv) {
            (Some(body_ct), Some(iv)) => EntryContent::Encrypted {
                title: title_encrypted,
                body: body_ct,
                meta: meta_encrypted,
                iv,
            },
            _ => EntryContent::Plain {
                title,
                body,
                meta: meta_json.and_then(|m| serde_json::from_str::<Meta>(&m).ok()),
            },
        };
        Ok(EntryRecord {
            id,
            kind,
            category: Category::parse(&category).unwrap_or(Category::Knowledge),
            content,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            source,
            identity_key,
            expires_at: expires_at.as_deref().and_then(parse_ts),
            file_path: PathBuf::from(file_path.unwrap_or_default()),
            created_at: parse_ts(&created_at).unwrap_or_default(),
            user_id,
        })
    }

    // -----------------------------------------------------------------------
    // Vector index
    // -----------------------------------------------------------------------

    pub fn upsert_vector(&self, rowid: i64, embedding: &[f32]) -> VaultResult<()> {
        let conn = self.lock()?;
        let mut blob = Vec::with_capacity(embedding.len() * 4);
        for v in embedding {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        conn.prepare_cached(
            "INSERT INTO vault_vec (rowid, embedding) VALUES (?1, ?2)
             ON CONFLICT(rowid) DO UPDATE SET embedding = excluded.embedding",
        )
        .map_err(db_err)?
        .execute(params![rowid, blob])
        .map_err(db_err)?;
        Ok(())
    }

    pub fn delete_vector(&self, rowid: i64) -> VaultResult<()> {
        let conn = self.lock()?;
        conn.prepare_cached("DELETE FROM vault_vec WHERE rowid = ?1")
            .map_err(db_err)?
            .execute(params![rowid])
            .map_err(db_err)?;
        Ok(())
    }

    /// All vectors for the tenant's live rows, for the in-memory KNN scan.
    pub fn candidate_vectors(
        &self,
        user: Option<&str>,
        now: DateTime<Utc>,
    ) -> VaultResult<Vec<(i64, Vec<f32>)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT vv.rowid, vv.embedding FROM vault_vec vv \
                 JOIN vault v ON v.rowid = vv.rowid \
                 WHERE v.user_id IS ?1 AND (v.expires_at IS NULL OR v.expires_at > ?2)",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user, fmt_ts(&now)], |row| {
                let rowid: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((rowid, blob))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|(rowid, blob)| {
                let vec = blob
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                (rowid, vec)
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Reindex support
    // -----------------------------------------------------------------------

    /// Every row for one tenant, expired included — reindex reconciles the
    /// tenant's slice of the store against the disk tree.
    pub fn rows_for_user(&self, user: Option<&str>) -> VaultResult<Vec<(i64, EntryRecord)>> {
        let conn = self.lock()?;
        let sql = format!("SELECT rowid, {} FROM vault WHERE user_id IS ?1", Self::COLS);
        let mut stmt = conn.prepare_cached(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![user], |row| {
                let rowid: i64 = row.get(0)?;
                Ok((rowid, Self::row_to_record_offset(row, 1)?))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Stats, limits, manifest
    // -----------------------------------------------------------------------

    pub fn entry_count(&self, user: Option<&str>) -> VaultResult<u64> {
        let conn = self.lock()?;
        let result = conn
            .prepare_cached("SELECT COUNT(*) FROM vault WHERE user_id IS ?1")
            .map_err(db_err)?
            .query_row(params![user], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err);
        result
    }

    /// Live storage estimate: plaintext and ciphertext content bytes.
    pub fn storage_bytes(&self, user: Option<&str>) -> VaultResult<u64> {
        let conn = self.lock()?;
        let result = conn
            .prepare_cached(
                "SELECT COALESCE(SUM(LENGTH(body) + COALESCE(LENGTH(title), 0) \
                 + COALESCE(LENGTH(meta), 0) + COALESCE(LENGTH(body_encrypted), 0) \
                 + COALESCE(LENGTH(title_encrypted), 0) + COALESCE(LENGTH(meta_encrypted), 0)), 0) \
                 FROM vault WHERE user_id IS ?1",
            )
            .map_err(db_err)?
            .query_row(params![user], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err);
        result
    }

    pub fn kind_counts(&self, user: Option<&str>) -> VaultResult<Vec<(String, u64)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT kind, COUNT(*) FROM vault WHERE user_id IS ?1 \
                 GROUP BY kind ORDER BY COUNT(*) DESC, kind",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn category_counts(&self, user: Option<&str>) -> VaultResult<Vec<(String, u64)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT category, COUNT(*) FROM vault WHERE user_id IS ?1 \
                 GROUP BY category ORDER BY category",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn expired_count(&self, user: Option<&str>, now: DateTime<Utc>) -> VaultResult<u64> {
        let conn = self.lock()?;
        let result = conn
            .prepare_cached(
                "SELECT COUNT(*) FROM vault WHERE user_id IS ?1 \
                 AND expires_at IS NOT NULL AND expires_at <= ?2",
            )
            .map_err(db_err)?
            .query_row(params![user, fmt_ts(&now)], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(db_err);
        result
    }

    /// `(vectors, rows)` for the embedding status snapshot.
    pub fn embedding_stats(&self, user: Option<&str>) -> VaultResult<(u64, u64)> {
        let conn = self.lock()?;
        let indexed: i64 = conn
            .prepare_cached(
                "SELECT COUNT(*) FROM vault_vec vv JOIN vault v ON v.rowid = vv.rowid \
                 WHERE v.user_id IS ?1",
            )
            .map_err(db_err)?
            .query_row(params![user], |row| row.get(0))
            .map_err(db_err)?;
        let total: i64 = conn
            .prepare_cached("SELECT COUNT(*) FROM vault WHERE user_id IS ?1")
            .map_err(db_err)?
            .query_row(params![user], |row| row.get(0))
            .map_err(db_err)?;
        Ok((indexed as u64, total as u64))
    }

    /// Manifest rows for the sync collaborator: non-expired, newest first.
    pub fn manifest(
        &self,
        user: Option<&str>,
        now: DateTime<Utc>,
    ) -> VaultResult<Vec<ManifestEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, kind, title, created_at FROM vault WHERE user_id IS ?1 \
                 AND (expires_at IS NULL OR expires_at > ?2) \
                 ORDER BY created_at DESC, id DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user, fmt_ts(&now)], |row| {
                Ok(ManifestEntry {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    title: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::now;
    use context_vault_core::entry::new_entry_id;

    fn record(user: Option<&str>, kind: &str, body: &str) -> EntryRecord {
        let id = new_entry_id();
        EntryRecord {
            id: id.clone(),
            kind: kind.into(),
            category: context_vault_core::kind::category_for(kind),
            content: EntryContent::Plain { title: None, body: body.into(), meta: None },
            tags: vec![],
            source: None,
            identity_key: None,
            expires_at: None,
            file_path: PathBuf::from(format!("/vault/{id}.md")),
            created_at: now(),
            user_id: user.map(String::from),
        }
    }

    #[test]
    fn schema_has_all_tables() {
        let store = VaultStore::open_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        for table in ["vault", "vault_fts", "vault_vec"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1",
                    params![table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "table {table} should exist");
        }
        drop(conn);
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn insert_and_fts_roundtrip() {
        let store = VaultStore::open_in_memory().unwrap();
        let rec = record(None, "insight", "parameterized queries stop injection");
        store.insert(&rec).unwrap();

        let hits = store
            .fts_search(None, "\"injection\"", &Filter::default(), now(), 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, rec.id);
        assert!(hits[0].rank <= 0.0, "bm25 rank should be non-positive, got {}", hits[0].rank);
    }

    #[test]
    fn update_refreshes_fts_shadow() {
        let store = VaultStore::open_in_memory().unwrap();
        let mut rec = record(None, "insight", "zebra_original_token");
        store.insert(&rec).unwrap();

        rec.content = EntryContent::Plain {
            title: None,
            body: "zebra_updated_token".into(),
            meta: None,
        };
        store.update(&rec).unwrap();

        let old = store.fts_search(None, "\"zebra_original_token\"", &Filter::default(), now(), 10).unwrap();
        assert!(old.is_empty());
        let new = store.fts_search(None, "\"zebra_updated_token\"", &Filter::default(), now(), 10).unwrap();
        assert_eq!(new.len(), 1);
    }

    #[test]
    fn delete_cleans_fts() {
        let store = VaultStore::open_in_memory().unwrap();
        let rec = record(None, "insight", "unique_gone_token");
        store.insert(&rec).unwrap();
        let rowid = store.delete(None, &rec.id).unwrap();
        assert!(rowid.is_some());
        let hits = store.fts_search(None, "\"unique_gone_token\"", &Filter::default(), now(), 10).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn user_scoping_is_strict() {
        let store = VaultStore::open_in_memory().unwrap();
        let a = record(Some("alice"), "insight", "alice private fact");
        store.insert(&a).unwrap();

        assert!(store.get(Some("bob"), &a.id, now()).unwrap().is_none());
        assert!(store.get(None, &a.id, now()).unwrap().is_none());
        assert!(store.get(Some("alice"), &a.id, now()).unwrap().is_some());
        assert!(store.delete(Some("bob"), &a.id).unwrap().is_none());
        assert_eq!(store.entry_count(Some("alice")).unwrap(), 1);
        assert_eq!(store.entry_count(Some("bob")).unwrap(), 0);
    }

    #[test]
    fn identity_uniqueness_enforced_per_tenant() {
        let store = VaultStore::open_in_memory().unwrap();
        let mut a = record(None, "contact", "Role: PM");
        a.identity_key = Some("alice@example.com".into());
        store.insert(&a).unwrap();

        let mut dup = record(None, "contact", "Role: CTO");
        dup.identity_key = Some("alice@example.com".into());
        assert!(store.insert(&dup).is_err(), "duplicate identity for the local tenant");

        // Same identity under another tenant is fine.
        let mut other = record(Some("bob"), "contact", "Role: CTO");
        other.identity_key = Some("alice@example.com".into());
        store.insert(&other).unwrap();
    }

    #[test]
    fn expired_rows_hidden_from_reads() {
        let store = VaultStore::open_in_memory().unwrap();
        let mut rec = record(None, "log", "already gone");
        rec.expires_at = Some(now() - chrono::Duration::seconds(1));
        store.insert(&rec).unwrap();

        assert!(store.get(None, &rec.id, now()).unwrap().is_none());
        assert!(store.list(None, &Filter::default(), now(), 100, 0).unwrap().is_empty());
        assert!(store.fts_search(None, "\"gone\"", &Filter::default(), now(), 10).unwrap().is_empty());
        assert_eq!(store.expired_count(None, now()).unwrap(), 1);
        assert!(store.manifest(None, now()).unwrap().is_empty());
    }

    #[test]
    fn vector_roundtrip() {
        let store = VaultStore::open_in_memory().unwrap();
        let rec = record(None, "insight", "vectors");
        let rowid = store.insert(&rec).unwrap();
        let emb: Vec<f32> = (0..EMBED_DIM).map(|i| i as f32 / EMBED_DIM as f32).collect();
        store.upsert_vector(rowid, &emb).unwrap();

        let vecs = store.candidate_vectors(None, now()).unwrap();
        assert_eq!(vecs.len(), 1);
        assert_eq!(vecs[0].0, rowid);
        assert_eq!(vecs[0].1, emb);

        store.delete_vector(rowid).unwrap();
        assert!(store.candidate_vectors(None, now()).unwrap().is_empty());
    }

    #[test]
    fn encrypted_content_keeps_plaintext_columns_empty() {
        let store = VaultStore::open_in_memory().unwrap();
        let mut rec = record(Some("u1"), "insight", "ignored");
        rec.content = EntryContent::Encrypted {
            title: Some(vec![9, 9]),
            body: vec![1, 2, 3],
            meta: None,
            iv: vec![0; 12],
        };
        let rowid = store.insert(&rec).unwrap();

        let conn = store.conn.lock().unwrap();
        let (title, body): (Option<String>, String) = conn
            .query_row(
                "SELECT title, body FROM vault WHERE rowid = ?1",
                params![rowid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(title, None);
        assert_eq!(body, "");
        drop(conn);

        let back = store.get(Some("u1"), &rec.id, now()).unwrap().unwrap();
        assert!(back.content.is_encrypted());
    }

    #[test]
    fn list_filters_by_kind_category_and_window() {
        let store = VaultStore::open_in_memory().unwrap();
        let mut old_event = record(None, "meeting", "standup notes");
        old_event.created_at = now() - chrono::Duration::days(40);
        store.insert(&old_event).unwrap();
        let fresh_event = record(None, "meeting", "retro notes");
        store.insert(&fresh_event).unwrap();
        store.insert(&record(None, "insight", "unrelated")).unwrap();

        let events = store
            .list(
                None,
                &Filter { category: Some(Category::Event), ..Default::default() },
                now(),
                100,
                0,
            )
            .unwrap();
        assert_eq!(events.len(), 2);

        let windowed = store
            .list(
                None,
                &Filter {
                    category: Some(Category::Event),
                    since: Some(now() - chrono::Duration::days(30)),
                    ..Default::default()
                },
                now(),
                100,
                0,
            )
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].id, fresh_event.id);
    }

    #[test]
    fn migration_is_idempotent_on_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("vault.db");
        {
            let store = VaultStore::open(&path).unwrap();
            store.insert(&record(None, "insight", "persists")).unwrap();
        }
        let store = VaultStore::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        assert_eq!(store.entry_count(None).unwrap(), 1);
    }

    #[test]
    fn forward_migration_from_v4_adds_columns() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("vault.db");
        {
            // Hand-build a v4-era schema: no user_id, no encryption columns.
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE vault (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    category TEXT NOT NULL DEFAULT 'knowledge',
                    title TEXT,
                    body TEXT NOT NULL,
                    meta TEXT,
                    tags TEXT NOT NULL DEFAULT '[]',
                    source TEXT,
                    file_path TEXT UNIQUE,
                    identity_key TEXT,
                    expires_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                );
                CREATE VIRTUAL TABLE vault_fts USING fts5(
                    title, body, tags, kind, content=vault, content_rowid=rowid
                );
                CREATE TABLE vault_vec (rowid INTEGER PRIMARY KEY, embedding BLOB NOT NULL);
                PRAGMA user_version = 4;",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO vault (id, kind, body) VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'insight', 'old row')",
                [],
            )
            .unwrap();
        }
        let store = VaultStore::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        // Old row is visible under the local tenant and encryption columns read as plaintext.
        let rec = store.get(None, "01ARZ3NDEKTSV4RRFFQ69G5FAV", now()).unwrap().unwrap();
        assert!(!rec.content.is_encrypted());
    }
}
