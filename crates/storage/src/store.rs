//! SQLite event store implementation.

use crate::{Error, Event, EventKind, Result, SessionId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;

/// Per-session rollup returned by [`EventStore::list_sessions`].
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: usize,
}

/// SQLite-backed event store.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Open or create an event store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory event store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_session
                ON events(session_id, seq);
            "#,
        )?;
        Ok(())
    }

    /// Append an event to the store.
    pub fn append(&self, event: &Event) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, session_id, timestamp, kind, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id.to_string(),
                event.session_id.to_string(),
                event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                event.kind.name(),
                serde_json::to_string(&event.kind)?,
            ],
        )?;
        Ok(())
    }

    /// Load all events for a session, in append order.
    pub fn load_session(&self, session_id: SessionId) -> Result<Vec<Event>> {
        self.load_events(session_id, None)
    }

    /// Load a session's events, optionally restricted to one kind
    /// (`message`, `tool_call`, `tool_result`, `session_start`, `session_end`).
    pub fn load_events(&self, session_id: SessionId, kind: Option<&str>) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, timestamp, data FROM events
             WHERE session_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY seq",
        )?;

        let rows = stmt
            .query_map(params![session_id.to_string(), kind], raw_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RawEvent::parse).collect()
    }

    /// Summarize every session, most recently started first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id,
                    MIN(timestamp),
                    MAX(CASE WHEN kind = 'session_end' THEN timestamp END),
                    SUM(CASE WHEN kind = 'message' THEN 1 ELSE 0 END)
             FROM events
             GROUP BY session_id
             ORDER BY MIN(seq) DESC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, started, ended, messages)| {
                Ok(SessionSummary {
                    id: parse_session_id(&id)?,
                    started_at: parse_timestamp(&started)?,
                    ended_at: ended.as_deref().map(parse_timestamp).transpose()?,
                    message_count: usize::try_from(messages).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Whether any event has been recorded for the session.
    pub fn contains(&self, session_id: SessionId) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM events WHERE session_id = ?1 LIMIT 1",
                [session_id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

struct RawEvent {
    id: String,
    session_id: String,
    timestamp: String,
    data: String,
}

fn raw_event(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        id: row.get(0)?,
        session_id: row.get(1)?,
        timestamp: row.get(2)?,
        data: row.get(3)?,
    })
}

impl RawEvent {
    fn parse(self) -> Result<Event> {
        Ok(Event {
            id: self
                .id
                .parse()
                .map_err(|e| Error::Corrupt(format!("event id {}: {e}", self.id)))?,
            session_id: parse_session_id(&self.session_id)?,
            timestamp: parse_timestamp(&self.timestamp)?,
            kind: serde_json::from_str::<EventKind>(&self.data)?,
        })
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    raw.parse()
        .map_err(|e| Error::Corrupt(format!("session id {raw}: {e}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Corrupt(format!("timestamp {raw}: {e}")))
}
