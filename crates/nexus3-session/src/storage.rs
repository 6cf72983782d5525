//! Session Storage (C7): a SQLite database per agent session at
//! `{base_log_dir}/{session_id}/session.db`, schema v2.
//!
//! The connection is wrapped in `Arc<Mutex<Connection>>` and every
//! operation runs inside `spawn_blocking`, since `rusqlite` is
//! synchronous and the concurrency model (§5) calls for a worker thread
//! rather than blocking the async runtime.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nexus3_core::types::{Message, Role, SessionStatus, SessionType, ToolCall};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, SessionError};

/// Hard upper bound on a single `tool_calls`/`events.data` JSON field,
/// guarding against an adversarial provider or tool producing a multi-GB
/// blob that would OOM the process on decode.
const MAX_JSON_FIELD_BYTES: usize = 10 * 1024 * 1024;

const CURRENT_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub role: Role,
    pub content: String,
    pub name: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tokens: i64,
    pub timestamp: f64,
    pub in_context: bool,
    pub summary_of: Option<String>,
}

impl MessageRow {
    pub fn into_message(self) -> Message {
        Message {
            role: self.role,
            content: self.content,
            tool_calls: self.tool_calls,
            tool_call_id: self.tool_call_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub message_id: i64,
    pub event_type: String,
    pub data: Option<serde_json::Value>,
    pub timestamp: f64,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn role_from_str(s: &str) -> rusqlite::Result<Role> {
    match s {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" => Ok(Role::Tool),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown role '{other}'"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn session_type_str(t: SessionType) -> &'static str {
    match t {
        SessionType::Saved => "saved",
        SessionType::Temp => "temp",
        SessionType::Subagent => "subagent",
    }
}

fn session_type_from_str(s: &str) -> SessionType {
    match s {
        "temp" => SessionType::Temp,
        "subagent" => SessionType::Subagent,
        _ => SessionType::Saved,
    }
}

fn session_status_str(s: SessionStatus) -> &'static str {
    match s {
        SessionStatus::Active => "active",
        SessionStatus::Destroyed => "destroyed",
        SessionStatus::Orphaned => "orphaned",
    }
}

fn session_status_from_str(s: &str) -> SessionStatus {
    match s {
        "destroyed" => SessionStatus::Destroyed,
        "orphaned" => SessionStatus::Orphaned,
        _ => SessionStatus::Active,
    }
}

/// Decodes a nullable, length-bounded JSON text column. Returns `Ok(None)`
/// — never an error — for NULL, empty string, oversized, or malformed
/// input; each of those is logged so the caller can investigate without
/// the read itself failing (H7).
fn decode_json_field(raw: Option<String>, context: &str) -> Option<serde_json::Value> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }
    if raw.len() > MAX_JSON_FIELD_BYTES {
        tracing::warn!(context, bytes = raw.len(), "JSON field exceeds 10 MiB bound, dropping");
        return None;
    }
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(context, error = %e, "JSON field failed to parse, dropping");
            None
        }
    }
}

pub struct SessionStorage {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SessionStorage {
    /// Opens (creating if needed) `{base_log_dir}/{session_id}/session.db`
    /// and applies any pending migrations.
    pub async fn open(base_log_dir: impl AsRef<Path>, session_id: &str) -> Result<Self> {
        let dir = base_log_dir.as_ref().join(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await;
        }
        let db_path = dir.join("session.db");

        let path_for_open = db_path.clone();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path_for_open)?;
            conn.execute("PRAGMA foreign_keys = ON", [])?;
            apply_migrations(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| SessionError::Storage(format!("migration task panicked: {e}")))??;

        Ok(Self { conn: Arc::new(Mutex::new(conn)), db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap();
            f(&guard)
        })
        .await
        .map_err(|e| SessionError::Storage(format!("blocking task panicked: {e}")))?
        .map_err(SessionError::from)
    }

    pub async fn insert_message(
        &self,
        role: Role,
        content: &str,
        name: Option<&str>,
        tool_call_id: Option<&str>,
        tool_calls: &[ToolCall],
        tokens: i64,
        timestamp: f64,
    ) -> Result<i64> {
        let content = content.to_string();
        let name = name.map(str::to_string);
        let tool_call_id = tool_call_id.map(str::to_string);
        let tool_calls_json = if tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_string(tool_calls)?)
        };

        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO messages (role, content, name, tool_call_id, tool_calls, tokens, timestamp, in_context, summary_of)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, NULL)",
                params![role_str(role), content, name, tool_call_id, tool_calls_json, tokens, timestamp],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_messages(&self, in_context_only: bool) -> Result<Vec<MessageRow>> {
        self.run_blocking(move |conn| {
            let sql = if in_context_only {
                "SELECT id, role, content, name, tool_call_id, tool_calls, tokens, timestamp, in_context, summary_of
                 FROM messages WHERE in_context = 1 ORDER BY id ASC"
            } else {
                "SELECT id, role, content, name, tool_call_id, tool_calls, tokens, timestamp, in_context, summary_of
                 FROM messages ORDER BY id ASC"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map([], |row| {
                    let role_text: String = row.get(1)?;
                    let tool_calls_raw: Option<String> = row.get(5)?;
                    Ok(MessageRow {
                        id: row.get(0)?,
                        role: role_from_str(&role_text)?,
                        content: row.get(2)?,
                        name: row.get(3)?,
                        tool_call_id: row.get(4)?,
                        tool_calls: decode_tool_calls_field(tool_calls_raw),
                        tokens: row.get(6)?,
                        timestamp: row.get(7)?,
                        in_context: row.get::<_, i64>(8)? != 0,
                        summary_of: row.get(9)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Batch-sets `in_context` on every id in `ids`.
    pub async fn update_context_status(&self, ids: &[i64], in_context: bool) -> Result<()> {
        let ids = ids.to_vec();
        self.run_blocking(move |conn| {
            let flag = if in_context { 1 } else { 0 };
            for id in ids {
                conn.execute("UPDATE messages SET in_context = ?1 WHERE id = ?2", params![flag, id])?;
            }
            Ok(())
        })
        .await
    }

    /// Atomically writes `summary_of` (comma-joined replaced ids) onto the
    /// summary row and flips `in_context = 0` on every replaced id.
    pub async fn mark_as_summary(&self, summary_message_id: i64, replaced_ids: &[i64]) -> Result<()> {
        let replaced_ids = replaced_ids.to_vec();
        let summary_of = replaced_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
        self.run_blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE messages SET summary_of = ?1 WHERE id = ?2",
                params![summary_of, summary_message_id],
            )?;
            for id in &replaced_ids {
                tx.execute("UPDATE messages SET in_context = 0 WHERE id = ?1", params![id])?;
            }
            tx.commit()
        })
        .await
    }

    pub async fn init_markers(
        &self,
        session_type: SessionType,
        parent_agent_id: Option<&str>,
        now: f64,
    ) -> Result<()> {
        let parent_agent_id = parent_agent_id.map(str::to_string);
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO session_markers (id, session_type, session_status, parent_agent_id, created_at, updated_at)
                 VALUES (1, ?1, 'active', ?2, ?3, ?3)",
                params![session_type_str(session_type), parent_agent_id, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_markers(&self) -> Result<Option<nexus3_core::types::SessionMarkers>> {
        self.run_blocking(|conn| {
            conn.query_row(
                "SELECT session_type, session_status, parent_agent_id, created_at, updated_at FROM session_markers WHERE id = 1",
                [],
                |row| {
                    let session_type: String = row.get(0)?;
                    let session_status: String = row.get(1)?;
                    Ok(nexus3_core::types::SessionMarkers {
                        session_type: session_type_from_str(&session_type),
                        session_status: session_status_from_str(&session_status),
                        parent_agent_id: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    pub async fn update_markers_status(&self, status: SessionStatus, now: f64) -> Result<()> {
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE session_markers SET session_status = ?1, updated_at = ?2 WHERE id = 1",
                params![session_status_str(status), now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_token_count(&self) -> Result<i64> {
        self.run_blocking(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(tokens), 0) FROM messages WHERE in_context = 1",
                [],
                |row| row.get(0),
            )
        })
        .await
    }

    pub async fn insert_event(&self, message_id: i64, event_type: &str, data: &serde_json::Value, timestamp: f64) -> Result<i64> {
        let event_type = event_type.to_string();
        let data_json = serde_json::to_string(data)?;
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO events (message_id, event_type, data, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![message_id, event_type, data_json, timestamp],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_events_for_message(&self, message_id: i64) -> Result<Vec<EventRow>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_id, event_type, data, timestamp FROM events WHERE message_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![message_id], |row| {
                    let data_raw: Option<String> = row.get(3)?;
                    Ok(EventRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        event_type: row.get(2)?,
                        data: decode_json_field(data_raw, "events.data"),
                        timestamp: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO metadata (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.run_blocking(move |conn| {
            conn.query_row("SELECT value FROM metadata WHERE key = ?1", params![key], |row| row.get(0)).optional()
        })
        .await
    }
}

fn decode_tool_calls_field(raw: Option<String>) -> Vec<ToolCall> {
    match decode_json_field(raw, "messages.tool_calls") {
        Some(serde_json::Value::Array(items)) => serde_json::from_value(serde_json::Value::Array(items)).unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn apply_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)", [])?;
    let version: i64 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |r| r.get(0))
        .optional()?
        .unwrap_or(0);

    if version >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    let mut applied = version;

    if applied < 1 {
        migration_v1_initial_schema(&tx)?;
        applied = 1;
    }
    if applied < 2 {
        migration_v2_session_markers_and_summaries(&tx)?;
        applied = 2;
    }

    tx.execute("DELETE FROM schema_version", [])?;
    tx.execute("INSERT INTO schema_version (version) VALUES (?1)", params![applied])?;
    tx.commit()
}

fn migration_v1_initial_schema(tx: &rusqlite::Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            tool_call_id TEXT,
            tool_calls TEXT,
            tokens INTEGER NOT NULL DEFAULT 0,
            timestamp REAL NOT NULL,
            in_context INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT
        );
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id INTEGER NOT NULL REFERENCES messages(id),
            event_type TEXT NOT NULL,
            data TEXT,
            timestamp REAL NOT NULL
        );
        ",
    )
}

fn migration_v2_session_markers_and_summaries(tx: &rusqlite::Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        ALTER TABLE messages ADD COLUMN name TEXT;
        ALTER TABLE messages ADD COLUMN summary_of TEXT;

        CREATE TABLE IF NOT EXISTS session_markers (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            session_type TEXT NOT NULL,
            session_status TEXT NOT NULL,
            parent_agent_id TEXT,
            created_at REAL NOT NULL,
            updated_at REAL NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_in_context ON messages(in_context);
        CREATE INDEX IF NOT EXISTS idx_messages_role ON messages(role);
        CREATE INDEX IF NOT EXISTS idx_events_event_type ON events(event_type);
        CREATE INDEX IF NOT EXISTS idx_events_message_id ON events(message_id);
        CREATE INDEX IF NOT EXISTS idx_session_markers_status ON session_markers(session_status);
        CREATE INDEX IF NOT EXISTS idx_session_markers_type ON session_markers(session_type);
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_fetch_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SessionStorage::open(dir.path(), "agent-1").await.unwrap();

        let id = storage.insert_message(Role::User, "hello", None, None, &[], 3, 1.0).await.unwrap();
        assert!(id > 0);

        let rows = storage.get_messages(true).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "hello");
        assert_eq!(rows[0].role, Role::User);
    }

    #[tokio::test]
    async fn update_context_status_is_batched() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SessionStorage::open(dir.path(), "agent-1").await.unwrap();

        let a = storage.insert_message(Role::User, "a", None, None, &[], 1, 1.0).await.unwrap();
        let b = storage.insert_message(Role::User, "b", None, None, &[], 1, 2.0).await.unwrap();

        storage.update_context_status(&[a, b], false).await.unwrap();
        let rows = storage.get_messages(true).await.unwrap();
        assert!(rows.is_empty());

        let all = storage.get_messages(false).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn mark_as_summary_flips_replaced_rows_and_records_summary_of() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SessionStorage::open(dir.path(), "agent-1").await.unwrap();

        let a = storage.insert_message(Role::User, "old-a", None, None, &[], 1, 1.0).await.unwrap();
        let b = storage.insert_message(Role::User, "old-b", None, None, &[], 1, 2.0).await.unwrap();
        let summary = storage.insert_message(Role::User, "[SUMMARY]", None, None, &[], 5, 3.0).await.unwrap();

        storage.mark_as_summary(summary, &[a, b]).await.unwrap();

        let all = storage.get_messages(false).await.unwrap();
        let summary_row = all.iter().find(|m| m.id == summary).unwrap();
        assert_eq!(summary_row.summary_of.as_deref(), Some(format!("{a},{b}").as_str()));

        let in_context = storage.get_messages(true).await.unwrap();
        assert_eq!(in_context.len(), 1);
        assert_eq!(in_context[0].id, summary);
    }

    #[tokio::test]
    async fn token_count_sums_only_in_context_rows() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SessionStorage::open(dir.path(), "agent-1").await.unwrap();

        let a = storage.insert_message(Role::User, "a", None, None, &[], 10, 1.0).await.unwrap();
        storage.insert_message(Role::User, "b", None, None, &[], 20, 2.0).await.unwrap();
        storage.update_context_status(&[a], false).await.unwrap();

        assert_eq!(storage.get_token_count().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn markers_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SessionStorage::open(dir.path(), "agent-1").await.unwrap();

        storage.init_markers(SessionType::Saved, None, 100.0).await.unwrap();
        let markers = storage.get_markers().await.unwrap().unwrap();
        assert_eq!(markers.session_type, SessionType::Saved);
        assert_eq!(markers.session_status, SessionStatus::Active);

        storage.update_markers_status(SessionStatus::Destroyed, 200.0).await.unwrap();
        let markers = storage.get_markers().await.unwrap().unwrap();
        assert_eq!(markers.session_status, SessionStatus::Destroyed);
    }

    #[tokio::test]
    async fn malformed_tool_calls_json_decodes_to_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SessionStorage::open(dir.path(), "agent-1").await.unwrap();

        // Insert directly with malformed JSON in tool_calls, bypassing the
        // normal serializer, to exercise the robust-decode path (H7).
        storage
            .run_blocking(|conn| {
                conn.execute(
                    "INSERT INTO messages (role, content, tool_calls, tokens, timestamp, in_context) VALUES ('assistant', '', 'not json', 0, 1.0, 1)",
                    [],
                )
            })
            .await
            .unwrap();

        let rows = storage.get_messages(true).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].tool_calls.is_empty());
    }

    #[tokio::test]
    async fn reopening_an_existing_database_does_not_error() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = SessionStorage::open(dir.path(), "agent-1").await.unwrap();
            storage.insert_message(Role::User, "hi", None, None, &[], 1, 1.0).await.unwrap();
        }
        let storage = SessionStorage::open(dir.path(), "agent-1").await.unwrap();
        let rows = storage.get_messages(true).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
