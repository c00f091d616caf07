//! Skill metadata persistence.
//!
//! One row per skill id, carrying the active version pointer, the full
//! version history and the persistent invocation counter. The SQLite
//! implementation keeps a secondary index on (status, updated_at) so the
//! active list reads the catalog refresh depends on stay cheap.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::skill::SkillStatus;

/// One committed version of a skill and when it was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: u32,
    pub published_at: DateTime<Utc>,
}

/// Metadata row for a skill.
#[derive(Debug, Clone)]
pub struct SkillMeta {
    pub skill_id: String,
    pub name: String,
    pub description: String,
    /// Currently active version.
    pub version: u32,
    pub status: SkillStatus,
    pub object_key: String,
    pub manifest_json: String,
    pub author: Option<String>,
    pub tags: Vec<String>,
    pub all_versions: Vec<VersionEntry>,
    pub invocation_count: u64,
    pub last_invoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SkillMeta {
    pub fn version_numbers(&self) -> Vec<u32> {
        self.all_versions.iter().map(|v| v.version).collect()
    }
}

pub trait MetadataStore: Send + Sync {
    /// Insert or replace a row. `created_at`, `invocation_count` and
    /// `last_invoked_at` of an existing row are preserved.
    fn put(&self, meta: &SkillMeta) -> Result<()>;

    fn get(&self, skill_id: &str) -> Result<Option<SkillMeta>>;

    /// Rows, optionally filtered by status, newest update first.
    fn list(&self, status: Option<SkillStatus>) -> Result<Vec<SkillMeta>>;

    fn delete(&self, skill_id: &str) -> Result<()>;

    fn set_status(&self, skill_id: &str, status: SkillStatus) -> Result<()>;

    /// Atomic counter bump recording `last_invoked_at`. Concurrent replicas
    /// must not lose increments.
    fn increment_invocation(&self, skill_id: &str) -> Result<()>;

    /// Cheap reachability probe for the readiness endpoint.
    fn ping(&self) -> Result<()>;
}

/// Fire-and-forget counter increment with bounded exponential backoff.
/// After the final attempt the increment is dropped; counter drift is
/// acceptable, invocation correctness is not coupled to it.
pub async fn increment_invocation_with_retry(store: Arc<dyn MetadataStore>, skill_id: String) {
    const ATTEMPTS: u32 = 3;
    let mut backoff = Duration::from_millis(50);
    for attempt in 1..=ATTEMPTS {
        match store.increment_invocation(&skill_id) {
            Ok(()) => return,
            Err(e) if attempt == ATTEMPTS => {
                warn!(
                    "dropping invocation count for {} after {} attempts: {}",
                    skill_id, ATTEMPTS, e
                );
            }
            Err(e) => {
                debug!("invocation count retry {} for {}: {}", attempt, skill_id, e);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteMetadataStore {
    pub fn new<P: AsRef<Path>>(db_path: P, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let conn = Connection::open(db_path.as_ref()).context("failed to open metadata db")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                skill_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                object_key TEXT NOT NULL,
                manifest_json TEXT NOT NULL,
                author TEXT,
                tags_json TEXT NOT NULL,
                all_versions_json TEXT NOT NULL,
                invocation_count INTEGER NOT NULL DEFAULT 0,
                last_invoked_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_status_updated
                ON {table} (status, updated_at);"
        ))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
        })
    }

    /// Open the same database file from another handle. Used by tests to
    /// model a second replica sharing the metadata store.
    pub fn open_shared<P: AsRef<Path>>(db_path: P, table: &str) -> Result<Self> {
        Self::new(db_path, table)
    }

    fn row_to_meta(row: &rusqlite::Row) -> rusqlite::Result<SkillMeta> {
        let status_str: String = row.get("status")?;
        let tags_json: String = row.get("tags_json")?;
        let versions_json: String = row.get("all_versions_json")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        let last_invoked_at: Option<String> = row.get("last_invoked_at")?;

        Ok(SkillMeta {
            skill_id: row.get("skill_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            version: row.get::<_, i64>("version")? as u32,
            status: SkillStatus::parse(&status_str).unwrap_or(SkillStatus::Error),
            object_key: row.get("object_key")?,
            manifest_json: row.get("manifest_json")?,
            author: row.get("author")?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            all_versions: serde_json::from_str(&versions_json).unwrap_or_default(),
            invocation_count: row.get::<_, i64>("invocation_count")? as u64,
            last_invoked_at: last_invoked_at.and_then(|s| parse_timestamp(&s)),
            created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
            updated_at: parse_timestamp(&updated_at).unwrap_or_else(Utc::now),
        })
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!("invalid table name: {:?}", table);
    }
    Ok(())
}

impl MetadataStore for SqliteMetadataStore {
    fn put(&self, meta: &SkillMeta) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        // Preserve creation time and counters across republish.
        let existing: Option<(String, i64, Option<String>)> = conn
            .query_row(
                &format!(
                    "SELECT created_at, invocation_count, last_invoked_at
                     FROM {} WHERE skill_id = ?1",
                    self.table
                ),
                params![meta.skill_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (created_at, invocation_count, last_invoked_at) = match existing {
            Some((created, count, last)) => (created, count, last),
            None => (meta.created_at.to_rfc3339(), meta.invocation_count as i64, None),
        };

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {}
                 (skill_id, name, description, version, status, object_key,
                  manifest_json, author, tags_json, all_versions_json,
                  invocation_count, last_invoked_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                self.table
            ),
            params![
                meta.skill_id,
                meta.name,
                meta.description,
                meta.version as i64,
                meta.status.as_str(),
                meta.object_key,
                meta.manifest_json,
                meta.author,
                serde_json::to_string(&meta.tags)?,
                serde_json::to_string(&meta.all_versions)?,
                invocation_count,
                last_invoked_at,
                created_at,
                meta.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, skill_id: &str) -> Result<Option<SkillMeta>> {
        let conn = self.conn.lock().unwrap();
        let meta = conn
            .query_row(
                &format!("SELECT * FROM {} WHERE skill_id = ?1", self.table),
                params![skill_id],
                Self::row_to_meta,
            )
            .optional()?;
        Ok(meta)
    }

    fn list(&self, status: Option<SkillStatus>) -> Result<Vec<SkillMeta>> {
        let conn = self.conn.lock().unwrap();
        let mut result = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT * FROM {} WHERE status = ?1 ORDER BY updated_at DESC",
                    self.table
                ))?;
                let rows = stmt.query_map(params![status.as_str()], Self::row_to_meta)?;
                for row in rows {
                    result.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT * FROM {} ORDER BY updated_at DESC",
                    self.table
                ))?;
                let rows = stmt.query_map([], Self::row_to_meta)?;
                for row in rows {
                    result.push(row?);
                }
            }
        }
        Ok(result)
    }

    fn delete(&self, skill_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("DELETE FROM {} WHERE skill_id = ?1", self.table),
            params![skill_id],
        )?;
        Ok(())
    }

    fn set_status(&self, skill_id: &str, status: SkillStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET status = ?1, updated_at = ?2 WHERE skill_id = ?3",
                self.table
            ),
            params![status.as_str(), Utc::now().to_rfc3339(), skill_id],
        )?;
        if changed == 0 {
            bail!("no metadata row for skill {}", skill_id);
        }
        Ok(())
    }

    fn increment_invocation(&self, skill_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET invocation_count = invocation_count + 1,
                        last_invoked_at = ?1, updated_at = ?1
                 WHERE skill_id = ?2",
                self.table
            ),
            params![now, skill_id],
        )?;
        if changed == 0 {
            bail!("no metadata row for skill {}", skill_id);
        }
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}
