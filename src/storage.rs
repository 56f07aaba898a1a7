//! SQLite-backed persistence layer.
//!
//! One file holds the dedup indexes, config audit log and backup ring,
//! price and LLM caches, and small metadata counters. Outcomes are
//! append-only JSON-lines next to the database.
//!
//! WAL mode for concurrent reads during writes; all access goes through a
//! `parking_lot::Mutex<Connection>` so check-and-mark style operations are
//! atomic with respect to other workers.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::OutcomeRecord;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS seen_id (
    key TEXT PRIMARY KEY,
    first_seen_ts INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS seen_sig (
    key TEXT PRIMARY KEY,
    title_norm TEXT NOT NULL DEFAULT '',
    first_seen_ts INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_seen_id_ts ON seen_id(first_seen_ts);
CREATE INDEX IF NOT EXISTS idx_seen_sig_ts ON seen_sig(first_seen_ts);

CREATE TABLE IF NOT EXISTS config_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    revision INTEGER NOT NULL,
    author TEXT NOT NULL,
    source_tag TEXT NOT NULL,
    delta_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config_backups (
    revision INTEGER PRIMARY KEY,
    ts INTEGER NOT NULL,
    values_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS price_cache (
    ticker TEXT PRIMARY KEY,
    last REAL,
    prev_close REAL,
    as_of INTEGER NOT NULL,
    provider TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS llm_cache (
    prompt_hash TEXT NOT NULL,
    model_tier TEXT NOT NULL,
    response TEXT NOT NULL,
    cost REAL NOT NULL,
    created_ts INTEGER NOT NULL,
    PRIMARY KEY (prompt_hash, model_tier)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// How many config backups the ring keeps.
const BACKUP_RING_CAPACITY: u32 = 32;

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub revision: u64,
    pub author: String,
    pub source_tag: String,
    pub delta_json: String,
}

#[derive(Debug, Clone)]
pub struct CachedLlmResponse {
    pub response: String,
    pub cost: f64,
    pub created_ts: i64,
}

/// Shared handle to the embedded store.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        info!(path = %path.display(), "Storage opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- dedup indexes -------------------------------------------------

    /// True if `key` exists in `seen_id` with `first_seen_ts >= cutoff`.
    pub fn seen_id_contains(&self, key: &str, cutoff_ts: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let hit: Option<i64> = conn
            .query_row(
                "SELECT first_seen_ts FROM seen_id WHERE key = ?1 AND first_seen_ts >= ?2",
                params![key, cutoff_ts],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    pub fn seen_sig_contains(&self, key: &str, cutoff_ts: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let hit: Option<i64> = conn
            .query_row(
                "SELECT first_seen_ts FROM seen_sig WHERE key = ?1 AND first_seen_ts >= ?2",
                params![key, cutoff_ts],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// Atomic check-and-mark over both indexes. Returns (id_hit, sig_hit)
    /// as observed before marking; both keys are upserted either way.
    pub fn check_and_mark(
        &self,
        id_key: &str,
        sig_key: &str,
        title_norm: &str,
        now_ts: i64,
        cutoff_ts: i64,
    ) -> Result<(bool, bool)> {
        let conn = self.conn.lock();
        let id_hit: Option<i64> = conn
            .query_row(
                "SELECT first_seen_ts FROM seen_id WHERE key = ?1 AND first_seen_ts >= ?2",
                params![id_key, cutoff_ts],
                |row| row.get(0),
            )
            .optional()?;
        let sig_hit: Option<i64> = conn
            .query_row(
                "SELECT first_seen_ts FROM seen_sig WHERE key = ?1 AND first_seen_ts >= ?2",
                params![sig_key, cutoff_ts],
                |row| row.get(0),
            )
            .optional()?;
        conn.execute(
            "INSERT INTO seen_id (key, first_seen_ts) VALUES (?1, ?2)
             ON CONFLICT(key) DO NOTHING",
            params![id_key, now_ts],
        )?;
        conn.execute(
            "INSERT INTO seen_sig (key, title_norm, first_seen_ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO NOTHING",
            params![sig_key, title_norm, now_ts],
        )?;
        Ok((id_hit.is_some(), sig_hit.is_some()))
    }

    pub fn mark_seen(
        &self,
        id_key: &str,
        sig_key: &str,
        title_norm: &str,
        now_ts: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO seen_id (key, first_seen_ts) VALUES (?1, ?2)
             ON CONFLICT(key) DO NOTHING",
            params![id_key, now_ts],
        )?;
        conn.execute(
            "INSERT INTO seen_sig (key, title_norm, first_seen_ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO NOTHING",
            params![sig_key, title_norm, now_ts],
        )?;
        Ok(())
    }

    pub fn unmark(&self, id_key: &str, sig_key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM seen_id WHERE key = ?1", params![id_key])?;
        conn.execute("DELETE FROM seen_sig WHERE key = ?1", params![sig_key])?;
        Ok(())
    }

    /// Normalized titles of recent non-filing signatures, for fuzzy match.
    pub fn recent_sig_titles(&self, since_ts: i64, limit: u32) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT title_norm FROM seen_sig
             WHERE first_seen_ts >= ?1 AND title_norm != ''
             ORDER BY first_seen_ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since_ts, limit], |row| row.get::<_, String>(0))?;
        let mut titles = Vec::new();
        for row in rows {
            titles.push(row?);
        }
        Ok(titles)
    }

    /// Drop dedup entries older than the cutoff. Returns rows removed.
    pub fn purge_seen(&self, cutoff_ts: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let a = conn.execute(
            "DELETE FROM seen_id WHERE first_seen_ts < ?1",
            params![cutoff_ts],
        )?;
        let b = conn.execute(
            "DELETE FROM seen_sig WHERE first_seen_ts < ?1",
            params![cutoff_ts],
        )?;
        debug!(purged = a + b, "Purged expired dedup entries");
        Ok(a + b)
    }

    // ---- config audit & backups ----------------------------------------

    pub fn append_audit(
        &self,
        revision: u64,
        author: &str,
        source_tag: &str,
        delta_json: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO config_audit (ts, revision, author, source_tag, delta_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Utc::now().timestamp(),
                revision as i64,
                author,
                source_tag,
                delta_json
            ],
        )?;
        Ok(())
    }

    pub fn audit_tail(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ts, revision, author, source_tag, delta_json
             FROM config_audit ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (ts, revision, author, source_tag, delta_json) = row?;
            entries.push(AuditEntry {
                ts: DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_else(Utc::now),
                revision: revision as u64,
                author,
                source_tag,
                delta_json,
            });
        }
        Ok(entries)
    }

    pub fn push_backup(&self, revision: u64, values_json: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO config_backups (revision, ts, values_json)
             VALUES (?1, ?2, ?3)",
            params![revision as i64, Utc::now().timestamp(), values_json],
        )?;
        // Keep the ring bounded.
        conn.execute(
            "DELETE FROM config_backups WHERE revision <= (
                 SELECT MAX(revision) FROM config_backups
             ) - ?1",
            params![BACKUP_RING_CAPACITY as i64],
        )?;
        Ok(())
    }

    /// The n-th most recent backup (n = 1 is the latest). Removes it and
    /// everything newer from the ring so a rollback cannot be replayed.
    pub fn take_backup(&self, n: u32) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT revision, values_json FROM config_backups
                 ORDER BY revision DESC LIMIT 1 OFFSET ?1",
                params![n.saturating_sub(1)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((revision, values_json)) = row else {
            return Ok(None);
        };
        conn.execute(
            "DELETE FROM config_backups WHERE revision >= ?1",
            params![revision],
        )?;
        Ok(Some(values_json))
    }

    // ---- price cache (write-through warm layer) ------------------------

    pub fn upsert_price(
        &self,
        ticker: &str,
        last: Option<f64>,
        prev_close: Option<f64>,
        as_of_ts: i64,
        provider: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO price_cache (ticker, last, prev_close, as_of, provider)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ticker, last, prev_close, as_of_ts, provider],
        )?;
        Ok(())
    }

    pub fn get_price(&self, ticker: &str) -> Result<Option<(Option<f64>, Option<f64>, i64, String)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT last, prev_close, as_of, provider FROM price_cache WHERE ticker = ?1",
                params![ticker],
                |row| {
                    Ok((
                        row.get::<_, Option<f64>>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    // ---- LLM cache -----------------------------------------------------

    pub fn llm_cache_get(&self, prompt_hash: &str, tier: &str) -> Result<Option<CachedLlmResponse>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT response, cost, created_ts FROM llm_cache
                 WHERE prompt_hash = ?1 AND model_tier = ?2",
                params![prompt_hash, tier],
                |row| {
                    Ok(CachedLlmResponse {
                        response: row.get(0)?,
                        cost: row.get(1)?,
                        created_ts: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn llm_cache_put(
        &self,
        prompt_hash: &str,
        tier: &str,
        response: &str,
        cost: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO llm_cache (prompt_hash, model_tier, response, cost, created_ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![prompt_hash, tier, response, cost, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    // ---- metadata counters ---------------------------------------------

    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

/// Append-only JSON-lines outcome log, one file per process.
#[derive(Clone)]
pub struct OutcomeLog {
    path: PathBuf,
    file: Arc<Mutex<std::fs::File>>,
}

impl OutcomeLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open outcome log at {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn append(&self, record: &OutcomeRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = self.file.lock();
        writeln!(file, "{line}").context("append outcome record")?;
        Ok(())
    }

    /// All records whose timestamp falls on the given UTC date.
    pub fn read_day(&self, day: NaiveDate) -> Result<Vec<OutcomeRecord>> {
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("read outcome log at {}", self.path.display()))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // Tolerate torn/corrupt lines; the log is append-only.
            let Ok(record) = serde_json::from_str::<OutcomeRecord>(&line) else {
                continue;
            };
            if record.ts.date_naive() == day {
                records.push(record);
            }
        }
        Ok(records)
    }
}
