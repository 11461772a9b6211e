use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{MemoryRecord, ShortTermEntry, META_LEGACY_IMPORT};

/// Durable per-role memory: short-term log, core memory, counters and
/// bookkeeping. One store instance serves all roles; the connection mutex
/// serializes same-role mutations (different roles share the lock too, which
/// is stricter than required but matches how the rest of the system treats
/// SQLite).
pub struct MemoryStore {
    conn: Mutex<Connection>,
    roles_dir: PathBuf,
}

/// Legacy whole-file representation (`roles/{id}/memory.json`), imported
/// once per role when the durable store has no data for it yet.
#[derive(Debug, Deserialize)]
struct LegacyMemoryFile {
    #[serde(default)]
    core_memory: String,
    #[serde(default)]
    short_term: Vec<LegacyEntry>,
    #[serde(default)]
    message_count_since_summary: u32,
    #[serde(default)]
    last_summarized_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: Option<String>,
}

impl MemoryStore {
    pub fn new<P: AsRef<Path>>(path: P, roles_dir: PathBuf) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            roles_dir,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory store lock poisoned: {}", e))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memory_records (
                role_id TEXT PRIMARY KEY,
                core_memory TEXT NOT NULL DEFAULT '',
                message_count_since_summary INTEGER NOT NULL DEFAULT 0,
                last_summarized_at TEXT,
                updated_at TEXT,
                last_context_block_start INTEGER NOT NULL DEFAULT 0
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS short_term_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                role_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_short_term_role ON short_term_messages(role_id, id)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS bridge_log (
                id TEXT PRIMARY KEY,
                role_id TEXT NOT NULL,
                note TEXT NOT NULL,
                block_start INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memory_meta (
                role_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (role_id, key)
            )"#,
            [],
        )?;

        Ok(())
    }

    fn ensure_record(conn: &Connection, role_id: &str) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO memory_records (role_id) VALUES (?1)",
            [role_id],
        )?;
        Ok(())
    }

    /// Import the legacy whole-file memory once, iff the durable store has
    /// no record for the role yet. Guarded by a meta key so it never
    /// repeats, even when the legacy file sticks around.
    fn maybe_import_legacy(&self, conn: &Connection, role_id: &str) -> Result<()> {
        let done: Option<String> = conn
            .query_row(
                "SELECT value FROM memory_meta WHERE role_id = ?1 AND key = ?2",
                params![role_id, META_LEGACY_IMPORT],
                |row| row.get(0),
            )
            .optional()?;
        if done.is_some() {
            return Ok(());
        }

        let has_record: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM memory_records WHERE role_id = ?1",
                [role_id],
                |row| row.get(0),
            )
            .optional()?;

        let legacy_path = self.roles_dir.join(role_id).join("memory.json");
        if has_record.is_none() && legacy_path.exists() {
            let contents = std::fs::read_to_string(&legacy_path)
                .with_context(|| format!("Failed to read legacy memory {:?}", legacy_path))?;
            match serde_json::from_str::<LegacyMemoryFile>(&contents) {
                Ok(legacy) => {
                    conn.execute(
                        "INSERT INTO memory_records
                         (role_id, core_memory, message_count_since_summary, last_summarized_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            role_id,
                            legacy.core_memory,
                            legacy.message_count_since_summary,
                            legacy.last_summarized_at,
                            legacy.updated_at,
                        ],
                    )?;
                    for entry in &legacy.short_term {
                        let timestamp = entry
                            .timestamp
                            .as_deref()
                            .and_then(parse_timestamp)
                            .unwrap_or_else(Utc::now);
                        conn.execute(
                            "INSERT INTO short_term_messages (role_id, role, content, timestamp)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![role_id, entry.role, entry.content, timestamp.to_rfc3339()],
                        )?;
                    }
                    tracing::info!(
                        "Imported legacy memory for role '{}' ({} entries)",
                        role_id,
                        legacy.short_term.len()
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        "Legacy memory for role '{}' is unparseable, skipping import: {}",
                        role_id,
                        error
                    );
                }
            }
        }

        conn.execute(
            "INSERT OR REPLACE INTO memory_meta (role_id, key, value) VALUES (?1, ?2, ?3)",
            params![role_id, META_LEGACY_IMPORT, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Full record, creating an empty one on first access.
    pub fn load(&self, role_id: &str) -> Result<MemoryRecord> {
        let conn = self.lock_conn()?;
        self.maybe_import_legacy(&conn, role_id)?;
        Self::ensure_record(&conn, role_id)?;

        let mut record = conn.query_row(
            "SELECT core_memory, message_count_since_summary, last_summarized_at, updated_at, last_context_block_start
             FROM memory_records WHERE role_id = ?1",
            [role_id],
            |row| {
                Ok(MemoryRecord {
                    core_memory: row.get(0)?,
                    short_term: Vec::new(),
                    message_count_since_summary: row.get(1)?,
                    last_summarized_at: row
                        .get::<_, Option<String>>(2)?
                        .as_deref()
                        .and_then(parse_timestamp),
                    updated_at: row
                        .get::<_, Option<String>>(3)?
                        .as_deref()
                        .and_then(parse_timestamp),
                    last_context_block_start: row.get::<_, i64>(4)? as usize,
                })
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT role, content, timestamp FROM short_term_messages
             WHERE role_id = ?1 ORDER BY id ASC",
        )?;
        record.short_term = stmt
            .query_map([role_id], |row| {
                Ok(ShortTermEntry {
                    role: row.get(0)?,
                    content: row.get(1)?,
                    timestamp: parse_timestamp_column(row.get::<_, String>(2)?, 2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(record)
    }

    /// Full replace of the record's scalar fields. The short-term log is
    /// not written here; use `append_short_term` / `clear_short_term`.
    pub fn save(&self, role_id: &str, record: &MemoryRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::ensure_record(&conn, role_id)?;
        conn.execute(
            "UPDATE memory_records
             SET core_memory = ?2,
                 message_count_since_summary = ?3,
                 last_summarized_at = ?4,
                 updated_at = ?5,
                 last_context_block_start = ?6
             WHERE role_id = ?1",
            params![
                role_id,
                record.core_memory,
                record.message_count_since_summary,
                record.last_summarized_at.map(|t| t.to_rfc3339()),
                record.updated_at.map(|t| t.to_rfc3339()),
                record.last_context_block_start as i64,
            ],
        )?;
        Ok(())
    }

    /// Atomically append one entry, bump the since-summary counter and
    /// refresh `updated_at`.
    pub fn append_short_term(&self, role_id: &str, role: &str, content: &str) -> Result<()> {
        let mut conn = self.lock_conn()?;
        self.maybe_import_legacy(&conn, role_id)?;
        Self::ensure_record(&conn, role_id)?;

        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO short_term_messages (role_id, role, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![role_id, role, content, now],
        )?;
        tx.execute(
            "UPDATE memory_records
             SET message_count_since_summary = message_count_since_summary + 1,
                 updated_at = ?2
             WHERE role_id = ?1",
            params![role_id, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn short_term_len(&self, role_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM short_term_messages WHERE role_id = ?1",
            [role_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Entries `[start, end)` in insertion order.
    pub fn short_term_slice(
        &self,
        role_id: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<ShortTermEntry>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT role, content, timestamp FROM short_term_messages
             WHERE role_id = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
        )?;
        let entries = stmt
            .query_map(
                params![role_id, (end - start) as i64, start as i64],
                |row| {
                    Ok(ShortTermEntry {
                        role: row.get(0)?,
                        content: row.get(1)?,
                        timestamp: parse_timestamp_column(row.get::<_, String>(2)?, 2)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// The last `limit` entries in insertion order.
    pub fn short_term_tail(&self, role_id: &str, limit: usize) -> Result<Vec<ShortTermEntry>> {
        let total = self.short_term_len(role_id)?;
        let start = total.saturating_sub(limit);
        self.short_term_slice(role_id, start, total)
    }

    pub fn get_core_memory(&self, role_id: &str) -> Result<String> {
        let conn = self.lock_conn()?;
        let core: Option<String> = conn
            .query_row(
                "SELECT core_memory FROM memory_records WHERE role_id = ?1",
                [role_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(core.unwrap_or_default())
    }

    /// Overwrite core memory wholesale, stamp `last_summarized_at` and reset
    /// the since-summary counter.
    pub fn update_core_memory(&self, role_id: &str, text: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::ensure_record(&conn, role_id)?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE memory_records
             SET core_memory = ?2,
                 last_summarized_at = ?3,
                 message_count_since_summary = 0,
                 updated_at = ?3
             WHERE role_id = ?1",
            params![role_id, text, now],
        )?;
        Ok(())
    }

    /// Delete the short-term log, keep core memory and counters.
    pub fn clear_short_term(&self, role_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::ensure_record(&conn, role_id)?;
        conn.execute(
            "DELETE FROM short_term_messages WHERE role_id = ?1",
            [role_id],
        )?;
        conn.execute(
            "UPDATE memory_records SET updated_at = ?2 WHERE role_id = ?1",
            params![role_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn message_count_since_summary(&self, role_id: &str) -> Result<u32> {
        let conn = self.lock_conn()?;
        let count: Option<u32> = conn
            .query_row(
                "SELECT message_count_since_summary FROM memory_records WHERE role_id = ?1",
                [role_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    pub fn updated_at(&self, role_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT updated_at FROM memory_records WHERE role_id = ?1",
                [role_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.flatten().as_deref().and_then(parse_timestamp))
    }

    pub fn last_context_block_start(&self, role_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT last_context_block_start FROM memory_records WHERE role_id = ?1",
                [role_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0) as usize)
    }

    pub fn set_last_context_block_start(&self, role_id: &str, block_start: usize) -> Result<()> {
        let conn = self.lock_conn()?;
        Self::ensure_record(&conn, role_id)?;
        conn.execute(
            "UPDATE memory_records SET last_context_block_start = ?2 WHERE role_id = ?1",
            params![role_id, block_start as i64],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, role_id: &str, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM memory_meta WHERE role_id = ?1 AND key = ?2",
                params![role_id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_meta(&self, role_id: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO memory_meta (role_id, key, value) VALUES (?1, ?2, ?3)",
            params![role_id, key, value],
        )?;
        Ok(())
    }

    /// Rolling note produced by closed-block summarization.
    pub fn append_bridge_note(&self, role_id: &str, note: &str, block_start: usize) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO bridge_log (id, role_id, note, block_start, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                role_id,
                note,
                block_start as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The most recent notes, oldest first.
    pub fn recent_bridge_notes(&self, role_id: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT note FROM bridge_log WHERE role_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let mut notes = stmt
            .query_map(params![role_id, limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        notes.reverse();
        Ok(notes)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Legacy files carry naive ISO timestamps; treat them as UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_timestamp_column(
    value: String,
    column: usize,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    parse_timestamp(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            format!("invalid timestamp '{}'", value).into(),
        )
    })
}
