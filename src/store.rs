//! Session persistence.
//!
//! A [`StoredSession`] bundles session metadata with the full ordered message
//! list. Two backends: an in-process map and SQLite.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationState, Message};
use crate::error::DebateError;

/// Maximum title length in characters.
pub const TITLE_MAX_CHARS: usize = 60;

pub const UNTITLED: &str = "Untitled debate";

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub session_id: i64,
    pub title: String,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub messages: Vec<Message>,
}

impl StoredSession {
    /// Snapshot `state` for saving. Returns `None` until the backend has
    /// assigned a session id. `previous` keeps the original creation time.
    pub fn from_state(state: &ConversationState, previous: Option<&StoredSession>) -> Option<Self> {
        let session_id = state.session_id?;
        let now = now_ms();
        Some(Self {
            session_id,
            title: title_from(state.first_user_text()),
            created_at_ms: previous.map_or(now, |p| p.created_at_ms),
            updated_at_ms: now,
            messages: state.messages.clone(),
        })
    }

    /// Rebuild a conversation from the stored record, indicators off.
    pub fn into_state(self) -> ConversationState {
        ConversationState {
            session_id: Some(self.session_id),
            messages: self.messages,
            ..ConversationState::default()
        }
    }
}

/// First user message, whitespace-collapsed and cut at [`TITLE_MAX_CHARS`].
pub fn title_from(first_user_text: Option<&str>) -> String {
    let collapsed = first_user_text
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    if collapsed.is_empty() {
        return UNTITLED.to_string();
    }
    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(TITLE_MAX_CHARS - 1).collect();
    format!("{}\u{2026}", cut.trim_end())
}

/// Backing store for saved sessions.
pub trait SessionStore: Send + Sync {
    fn load(&self, session_id: i64) -> Result<Option<StoredSession>, DebateError>;
    fn save(&self, session: &StoredSession) -> Result<(), DebateError>;
    /// Saved sessions, most recently updated first, without messages.
    fn list(&self) -> Result<Vec<StoredSession>, DebateError>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<i64, StoredSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, session_id: i64) -> Result<Option<StoredSession>, DebateError> {
        Ok(lock(&self.sessions).get(&session_id).cloned())
    }

    fn save(&self, session: &StoredSession) -> Result<(), DebateError> {
        lock(&self.sessions).insert(session.session_id, session.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<StoredSession>, DebateError> {
        let mut out: Vec<StoredSession> = lock(&self.sessions)
            .values()
            .map(|s| StoredSession { messages: Vec::new(), ..s.clone() })
            .collect();
        out.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite store; messages live in a JSON text column.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DebateError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DebateError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DebateError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id    INTEGER PRIMARY KEY,
                title         TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                messages      TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl SessionStore for SqliteSessionStore {
    fn load(&self, session_id: i64) -> Result<Option<StoredSession>, DebateError> {
        let conn = lock(&self.conn);
        let row = conn
            .query_row(
                "SELECT title, created_at_ms, updated_at_ms, messages FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((title, created, updated, messages)) = row else {
            return Ok(None);
        };
        Ok(Some(StoredSession {
            session_id,
            title,
            created_at_ms: created as u64,
            updated_at_ms: updated as u64,
            messages: serde_json::from_str(&messages)?,
        }))
    }

    fn save(&self, session: &StoredSession) -> Result<(), DebateError> {
        let messages = serde_json::to_string(&session.messages)?;
        let conn = lock(&self.conn);
        conn.execute(
            "INSERT INTO sessions (session_id, title, created_at_ms, updated_at_ms, messages)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                title = excluded.title,
                updated_at_ms = excluded.updated_at_ms,
                messages = excluded.messages",
            params![
                session.session_id,
                session.title,
                session.created_at_ms as i64,
                session.updated_at_ms as i64,
                messages
            ],
        )?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<StoredSession>, DebateError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT session_id, title, created_at_ms, updated_at_ms FROM sessions
             ORDER BY updated_at_ms DESC, session_id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredSession {
                session_id: row.get(0)?,
                title: row.get(1)?,
                created_at_ms: row.get::<_, i64>(2)? as u64,
                updated_at_ms: row.get::<_, i64>(3)? as u64,
                messages: Vec::new(),
            })
        })?;
        let sessions = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }
}
