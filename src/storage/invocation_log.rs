//! Append-only invocation log with at-most-once durability.
//!
//! `tools/call` handlers hand events to [`InvocationLog::append`], which
//! never blocks: events land in a bounded in-memory queue and a drain worker
//! writes them to the underlying store in batches. When the queue is full
//! the oldest buffered event is dropped and a counter incremented; the call
//! path is never coupled to log durability.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

const DRAIN_BATCH_SIZE: usize = 256;
const DRAIN_INTERVAL: Duration = Duration::from_millis(500);
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

const MAX_ERROR_LEN: usize = 1000;
const MAX_PARAMS_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Success,
    Error,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Success => "success",
            InvocationStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(InvocationStatus::Success),
            "error" => Some(InvocationStatus::Error),
            _ => None,
        }
    }
}

/// A single tool-call event.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationEvent {
    pub skill_id: String,
    /// RFC 3339 timestamp plus a `#`-separated uuid suffix, unique as a
    /// sort key even for same-instant events.
    pub invoked_at: String,
    pub session_id: String,
    pub method: String,
    pub duration_ms: u64,
    pub status: InvocationStatus,
    pub error_message: Option<String>,
    pub params_excerpt: Option<String>,
    /// Epoch seconds; rows past this are purged by the TTL pass.
    pub expires_at: i64,
}

impl InvocationEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        skill_id: impl Into<String>,
        session_id: impl Into<String>,
        method: impl Into<String>,
        duration_ms: u64,
        status: InvocationStatus,
        error_message: Option<String>,
        params_excerpt: Option<String>,
        retention_days: i64,
    ) -> Self {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            skill_id: skill_id.into(),
            invoked_at: format!("{}#{}", now.to_rfc3339(), &suffix[..8]),
            session_id: session_id.into(),
            method: method.into(),
            duration_ms,
            status,
            error_message: error_message.map(|e| truncate(e, MAX_ERROR_LEN)),
            params_excerpt: params_excerpt.map(|p| truncate(p, MAX_PARAMS_LEN)),
            expires_at: (now + ChronoDuration::days(retention_days)).timestamp(),
        }
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

pub trait InvocationStore: Send + Sync {
    fn append_batch(&self, events: &[InvocationEvent]) -> Result<()>;

    /// Events for a skill, newest first. `since` is an exclusive lower bound
    /// on the `invoked_at` sort key.
    fn query(
        &self,
        skill_id: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InvocationEvent>>;

    /// Drop rows whose TTL has passed. Returns the number removed.
    fn purge_expired(&self, now_epoch: i64) -> Result<usize>;
}

pub struct SqliteInvocationStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteInvocationStore {
    pub fn new<P: AsRef<Path>>(db_path: P, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let conn =
            Connection::open(db_path.as_ref()).context("failed to open invocation log db")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                skill_id TEXT NOT NULL,
                invoked_at TEXT NOT NULL,
                session_id TEXT NOT NULL,
                method TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                params_excerpt TEXT,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (skill_id, invoked_at)
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_expires ON {table} (expires_at);"
        ))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
        })
    }
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

impl InvocationStore for SqliteInvocationStore {
    fn append_batch(&self, events: &[InvocationEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO {}
                 (skill_id, invoked_at, session_id, method, duration_ms,
                  status, error_message, params_excerpt, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                self.table
            ))?;
            for event in events {
                stmt.execute(params![
                    event.skill_id,
                    event.invoked_at,
                    event.session_id,
                    event.method,
                    event.duration_ms as i64,
                    event.status.as_str(),
                    event.error_message,
                    event.params_excerpt,
                    event.expires_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query(
        &self,
        skill_id: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InvocationEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT skill_id, invoked_at, session_id, method, duration_ms,
                    status, error_message, params_excerpt, expires_at
             FROM {} WHERE skill_id = ?1 AND invoked_at > ?2
             ORDER BY invoked_at DESC LIMIT ?3",
            self.table
        ))?;
        let rows = stmt.query_map(
            params![skill_id, since.unwrap_or(""), limit as i64],
            |row| {
                let status_str: String = row.get(5)?;
                Ok(InvocationEvent {
                    skill_id: row.get(0)?,
                    invoked_at: row.get(1)?,
                    session_id: row.get(2)?,
                    method: row.get(3)?,
                    duration_ms: row.get::<_, i64>(4)? as u64,
                    status: InvocationStatus::parse(&status_str)
                        .unwrap_or(InvocationStatus::Error),
                    error_message: row.get(6)?,
                    params_excerpt: row.get(7)?,
                    expires_at: row.get(8)?,
                })
            },
        )?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    fn purge_expired(&self, now_epoch: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE expires_at < ?1", self.table),
            params![now_epoch],
        )?;
        Ok(removed)
    }
}

/// Non-blocking front of the invocation log.
pub struct InvocationLog {
    queue: Mutex<VecDeque<InvocationEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl InvocationLog {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Enqueue an event. Never blocks; on overflow the oldest buffered event
    /// is dropped.
    pub fn append(&self, event: InvocationEvent) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    pub fn dropped_events_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn take_batch(&self, max: usize) -> Vec<InvocationEvent> {
        let mut queue = self.queue.lock().unwrap();
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    /// Start the drain worker. It batches queued events into the store,
    /// runs the TTL purge pass periodically, and flushes once more on
    /// shutdown.
    pub fn spawn_drain(
        self: &Arc<Self>,
        store: Arc<dyn InvocationStore>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let log = Arc::clone(self);
        tokio::spawn(async move {
            let mut purge_timer = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = log.notify.notified() => {}
                    _ = tokio::time::sleep(DRAIN_INTERVAL) => {}
                    _ = purge_timer.tick() => {
                        match store.purge_expired(Utc::now().timestamp()) {
                            Ok(0) => {}
                            Ok(n) => info!("purged {} expired invocation log rows", n),
                            Err(e) => error!("invocation log purge failed: {}", e),
                        }
                    }
                    _ = cancel.cancelled() => {
                        log.drain_all(&store);
                        debug!("invocation log drain worker stopped");
                        return;
                    }
                }
                log.drain_all(&store);
            }
        })
    }

    fn drain_all(&self, store: &Arc<dyn InvocationStore>) {
        loop {
            let batch = self.take_batch(DRAIN_BATCH_SIZE);
            if batch.is_empty() {
                return;
            }
            if let Err(e) = store.append_batch(&batch) {
                // At-most-once: failed batches are dropped, not retried.
                self.dropped
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                error!("dropping {} invocation log events: {}", batch.len(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_event(skill_id: &str, status: InvocationStatus) -> InvocationEvent {
        InvocationEvent::new(
            skill_id,
            "session-1",
            "tools/call",
            12,
            status,
            None,
            Some("{\"msg\":\"hi\"}".to_string()),
            30,
        )
    }

    fn make_sqlite_store() -> (Arc<SqliteInvocationStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store =
            SqliteInvocationStore::new(dir.path().join("log.db"), "invocation_logs").unwrap();
        (Arc::new(store), dir)
    }

    #[test]
    fn test_event_sort_key_is_unique() {
        let a = make_event("echo", InvocationStatus::Success);
        let b = make_event("echo", InvocationStatus::Success);
        assert_ne!(a.invoked_at, b.invoked_at);
        assert!(a.invoked_at.contains('#'));
    }

    #[test]
    fn test_event_truncates_excerpts() {
        let long = "x".repeat(5000);
        let event = InvocationEvent::new(
            "echo",
            "s",
            "tools/call",
            1,
            InvocationStatus::Error,
            Some(long.clone()),
            Some(long),
            30,
        );
        assert_eq!(event.error_message.unwrap().len(), 1000);
        assert_eq!(event.params_excerpt.unwrap().len(), 1024);
    }

    #[test]
    fn test_store_append_and_query_newest_first() {
        let (store, _dir) = make_sqlite_store();
        let events: Vec<_> = (0..3)
            .map(|_| make_event("echo", InvocationStatus::Success))
            .collect();
        store.append_batch(&events).unwrap();

        let queried = store.query("echo", None, 10).unwrap();
        assert_eq!(queried.len(), 3);
        assert!(queried[0].invoked_at > queried[2].invoked_at);
        assert!(store.query("other", None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_store_query_since_and_limit() {
        let (store, _dir) = make_sqlite_store();
        let events: Vec<_> = (0..5)
            .map(|_| make_event("echo", InvocationStatus::Success))
            .collect();
        store.append_batch(&events).unwrap();

        let limited = store.query("echo", None, 2).unwrap();
        assert_eq!(limited.len(), 2);

        let oldest = &store.query("echo", None, 10).unwrap()[4];
        let since = store.query("echo", Some(&oldest.invoked_at), 10).unwrap();
        assert_eq!(since.len(), 4);
    }

    #[test]
    fn test_store_purge_expired() {
        let (store, _dir) = make_sqlite_store();
        let mut expired = make_event("echo", InvocationStatus::Success);
        expired.expires_at = Utc::now().timestamp() - 10;
        let fresh = make_event("echo", InvocationStatus::Success);
        store.append_batch(&[expired, fresh]).unwrap();

        let removed = store.purge_expired(Utc::now().timestamp()).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.query("echo", None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let log = InvocationLog::new(3);
        for i in 0..5 {
            let mut event = make_event("echo", InvocationStatus::Success);
            event.method = format!("call-{i}");
            log.append(event);
        }

        assert_eq!(log.dropped_events_total(), 2);
        let remaining = log.take_batch(10);
        let methods: Vec<_> = remaining.iter().map(|e| e.method.as_str()).collect();
        assert_eq!(methods, vec!["call-2", "call-3", "call-4"]);
    }

    #[test]
    fn test_dropped_counter_is_monotonic() {
        let log = InvocationLog::new(1);
        log.append(make_event("echo", InvocationStatus::Success));
        assert_eq!(log.dropped_events_total(), 0);
        log.append(make_event("echo", InvocationStatus::Success));
        assert_eq!(log.dropped_events_total(), 1);
        log.append(make_event("echo", InvocationStatus::Success));
        assert_eq!(log.dropped_events_total(), 2);
    }

    #[tokio::test]
    async fn test_drain_worker_persists_events() {
        let (store, _dir) = make_sqlite_store();
        let log = InvocationLog::new(DEFAULT_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let handle = log.spawn_drain(store.clone() as Arc<dyn InvocationStore>, cancel.clone());

        log.append(make_event("echo", InvocationStatus::Success));
        log.append(make_event("echo", InvocationStatus::Error));

        // The worker also flushes on shutdown, so cancelling is enough.
        cancel.cancel();
        handle.await.unwrap();

        let events = store.query("echo", None, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(log.queued(), 0);
    }
}
