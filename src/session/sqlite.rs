// Session persistence in a local SQLite key/value table

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::store::SessionStore;
use super::types::Session;

const KEY_ACCESS_TOKEN: &str = "access_token";
const KEY_REFRESH_TOKEN: &str = "refresh_token";
const KEY_TENANT_ID: &str = "tenant_id";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS session_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

/// Session store backed by a SQLite file, so a restart does not force re-login
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open (or create) the session database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create session directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open session database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Non-persistent database, for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(SCHEMA, [])
            .context("Failed to create session_kv table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// When the access token was last written
    pub fn last_updated(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT updated_at FROM session_kv WHERE key = ?",
                [KEY_ACCESS_TOKEN],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read session timestamp")?;

        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Failed to parse session timestamp: {}", s))
        })
        .transpose()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("session database lock poisoned"))
    }
}

fn read_key(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM session_kv WHERE key = ?",
        [key],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("Failed to read session key: {}", key))
}

impl SessionStore for SqliteSessionStore {
    fn get(&self) -> Result<Option<Session>> {
        let conn = self.lock()?;

        let Some(access_token) = read_key(&conn, KEY_ACCESS_TOKEN)? else {
            return Ok(None);
        };

        Ok(Some(Session {
            access_token,
            refresh_token: read_key(&conn, KEY_REFRESH_TOKEN)?,
            tenant_id: read_key(&conn, KEY_TENANT_ID)?,
        }))
    }

    fn set(&self, session: &Session) -> Result<()> {
        let mut conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction().context("Failed to begin session write")?;

        let fields = [
            (KEY_ACCESS_TOKEN, Some(session.access_token.as_str())),
            (KEY_REFRESH_TOKEN, session.refresh_token.as_deref()),
            (KEY_TENANT_ID, session.tenant_id.as_deref()),
        ];

        for (key, value) in fields {
            match value {
                Some(value) => {
                    tx.execute(
                        "INSERT INTO session_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                        params![key, value, now],
                    )
                    .with_context(|| format!("Failed to write session key: {}", key))?;
                }
                None => {
                    tx.execute("DELETE FROM session_kv WHERE key = ?", [key])
                        .with_context(|| format!("Failed to delete session key: {}", key))?;
                }
            }
        }

        tx.commit().context("Failed to commit session write")?;
        tracing::debug!(tenant_id = ?session.tenant_id, "Session persisted");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM session_kv WHERE key IN (?1, ?2, ?3)",
            params![KEY_ACCESS_TOKEN, KEY_REFRESH_TOKEN, KEY_TENANT_ID],
        )
        .context("Failed to clear session")?;
        Ok(())
    }
}
