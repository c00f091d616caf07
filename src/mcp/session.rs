//! MCP session state.
//!
//! Sessions move through `initializing -> active -> suspended -> closed`.
//! Idle sessions suspend after a configurable window; suspended sessions can
//! only be resumed through the notification stream reconnect and are purged
//! after the expiry window. JSON-RPC requests against a suspended, closed or
//! unknown session get a session-not-found error, prompting the client to
//! re-initialize.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Per-session ring buffer size for server-initiated notifications.
const PENDING_NOTIFICATIONS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Active,
    Suspended,
    Closed,
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub protocol_version: Option<String>,
    pub client_info: Option<Value>,
    pub client_capabilities: Value,
    pub server_capabilities: Value,
    pub auth_subject: Option<String>,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pending: VecDeque<Value>,
    dropped_notifications: u64,
}

impl Session {
    fn new(id: String, idle: Duration, expiry: Duration) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: SessionState::Initializing,
            protocol_version: None,
            client_info: None,
            client_capabilities: Value::Null,
            server_capabilities: Value::Null,
            auth_subject: None,
            scopes: Vec::new(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + idle + expiry,
            pending: VecDeque::new(),
            dropped_notifications: 0,
        }
    }

    /// State as of `now`, folding in the idle and expiry deadlines.
    fn effective_state(&self, now: DateTime<Utc>, idle: Duration) -> SessionState {
        match self.state {
            SessionState::Closed => SessionState::Closed,
            state => {
                if now >= self.expires_at {
                    SessionState::Closed
                } else if now >= self.last_activity_at + idle {
                    SessionState::Suspended
                } else {
                    state
                }
            }
        }
    }

    fn touch(&mut self, idle: Duration, expiry: Duration) {
        let now = Utc::now();
        self.last_activity_at = now;
        self.expires_at = now + idle + expiry;
    }

    fn push_pending(&mut self, message: Value) {
        if self.pending.len() >= PENDING_NOTIFICATIONS_CAPACITY {
            self.pending.pop_front();
            self.dropped_notifications += 1;
        }
        self.pending.push_back(message);
    }

    fn take_pending(&mut self) -> Vec<Value> {
        self.pending.drain(..).collect()
    }
}

/// A registered session: the state plus the wake handle its notification
/// stream parks on.
pub struct SessionSlot {
    pub state: Mutex<Session>,
    pub notify: Notify,
}

pub type SessionHandle = Arc<SessionSlot>;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    idle: Duration,
    expiry: Duration,
}

impl SessionRegistry {
    pub fn new(idle: StdDuration, expiry: StdDuration) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            idle: Duration::from_std(idle).expect("idle window fits"),
            expiry: Duration::from_std(expiry).expect("expiry window fits"),
        })
    }

    /// Create a fresh session in `initializing` state.
    pub fn create(&self) -> SessionHandle {
        let id = Uuid::new_v4().to_string();
        let slot = Arc::new(SessionSlot {
            state: Mutex::new(Session::new(id.clone(), self.idle, self.expiry)),
            notify: Notify::new(),
        });
        self.sessions
            .write()
            .unwrap()
            .insert(id.clone(), Arc::clone(&slot));
        debug!("created session {}", id);
        slot
    }

    /// Resolve a session for a JSON-RPC request. Suspended, closed and
    /// unknown sessions are all rejected; the client must re-initialize.
    pub fn resolve_for_request(&self, session_id: &str) -> Option<SessionHandle> {
        let slot = self.lookup(session_id)?;
        {
            let mut session = slot.state.lock().unwrap();
            match session.effective_state(Utc::now(), self.idle) {
                SessionState::Closed | SessionState::Suspended => return None,
                _ => session.touch(self.idle, self.expiry),
            }
        }
        Some(slot)
    }

    /// Resolve a session for a notification stream reconnect. A suspended
    /// session is reactivated and its buffered notifications become
    /// deliverable again.
    pub fn resolve_for_stream(&self, session_id: &str) -> Option<SessionHandle> {
        let slot = self.lookup(session_id)?;
        {
            let mut session = slot.state.lock().unwrap();
            match session.effective_state(Utc::now(), self.idle) {
                SessionState::Closed => return None,
                SessionState::Suspended => {
                    info!("reactivating suspended session {}", session_id);
                    session.state = SessionState::Active;
                    session.touch(self.idle, self.expiry);
                }
                _ => session.touch(self.idle, self.expiry),
            }
        }
        Some(slot)
    }

    fn lookup(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Mark a session active after the `initialized` notification.
    pub fn activate(&self, session_id: &str) {
        if let Some(slot) = self.lookup(session_id) {
            let mut session = slot.state.lock().unwrap();
            if session.state == SessionState::Initializing {
                session.state = SessionState::Active;
            }
            session.touch(self.idle, self.expiry);
        }
    }

    /// Close and remove a session. Idempotent.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().unwrap().remove(session_id);
        match removed {
            Some(slot) => {
                slot.state.lock().unwrap().state = SessionState::Closed;
                slot.notify.notify_waiters();
                debug!("closed session {}", session_id);
                true
            }
            None => false,
        }
    }

    /// Queue a server-initiated notification for one session.
    pub fn push_notification(&self, session_id: &str, message: Value) {
        if let Some(slot) = self.lookup(session_id) {
            slot.state.lock().unwrap().push_pending(message);
            slot.notify.notify_waiters();
        }
    }

    /// Queue a server-initiated notification for every live session.
    pub fn broadcast(&self, message: Value) {
        let slots: Vec<SessionHandle> = self.sessions.read().unwrap().values().cloned().collect();
        for slot in slots {
            slot.state.lock().unwrap().push_pending(message.clone());
            slot.notify.notify_waiters();
        }
    }

    /// Drain buffered notifications for delivery (at-most-once).
    pub fn take_pending(&self, slot: &SessionHandle) -> Vec<Value> {
        slot.state.lock().unwrap().take_pending()
    }

    pub fn active_count(&self) -> usize {
        let now = Utc::now();
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|slot| {
                slot.state.lock().unwrap().effective_state(now, self.idle) == SessionState::Active
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }

    /// Purge sessions past their expiry deadline.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .filter(|(_, slot)| {
                    slot.state.lock().unwrap().effective_state(now, self.idle)
                        == SessionState::Closed
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        let count = expired.len();
        for id in expired {
            self.close(&id);
        }
        if count > 0 {
            info!("purged {} expired sessions", count);
        }
        count
    }

    /// Background purge loop.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: StdDuration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.purge_expired();
                    }
                    _ = cancel.cancelled() => {
                        debug!("session cleanup task stopped");
                        return;
                    }
                }
            }
        })
    }
}
