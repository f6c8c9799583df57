//! Durable `session_id -> FuzzSession` map, backed by a single `sessions`
//! table holding the session serialized as JSON. The orchestrator owns
//! rebuild-on-startup semantics; this module only persists and retrieves.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{Error, Result, SessionError};
use crate::session::{FuzzSession, SessionStatus};

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            data TEXT NOT NULL
        );",
    )
}

pub struct SessionStore {
    db_path: PathBuf,
}

impl SessionStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)?;
        ensure_schema(&conn)?;
        Ok(Self { db_path })
    }

    fn conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn save(&self, session: &FuzzSession) -> Result<()> {
        let conn = self.conn()?;
        let data = serde_json::to_string(session)?;
        conn.execute(
            "INSERT INTO sessions (id, status, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data",
            rusqlite::params![session.id.to_string(), format!("{:?}", session.status), data],
        )?;
        Ok(())
    }

    pub fn load(&self, id: Uuid) -> Result<FuzzSession> {
        let conn = self.conn()?;
        let data: String = conn
            .query_row("SELECT data FROM sessions WHERE id = ?1", rusqlite::params![id.to_string()], |row| row.get(0))
            .map_err(|_| Error::Session(SessionError::NotFound(id.to_string())))?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn load_all(&self) -> Result<Vec<FuzzSession>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT data FROM sessions")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", rusqlite::params![id.to_string()])?;
        Ok(())
    }
}

/// Runs on process startup: `running`/`paused` sessions had their runtime
/// helpers (stateful session, behavior processors) torn down with the
/// previous process, so they come back as `paused` pending a user-driven
/// resume. If rebuilding fails, the session goes to `failed` instead so it
/// doesn't silently sit unreachable.
pub fn reconcile_on_startup(
    store: &SessionStore,
    mut rebuild: impl FnMut(&FuzzSession) -> Result<()>,
) -> Result<Vec<FuzzSession>> {
    let mut sessions = store.load_all()?;
    for session in &mut sessions {
        if matches!(session.status, SessionStatus::Running | SessionStatus::Paused) {
            match rebuild(session) {
                Ok(()) => {
                    session.status = SessionStatus::Paused;
                    session.touch();
                }
                Err(e) => {
                    session.fail(format!("failed to rebuild runtime state on startup: {e}"));
                }
            }
            store.save(session)?;
        }
    }
    Ok(sessions)
}
