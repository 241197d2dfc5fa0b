use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::User;

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// The persisted login state.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub access_token: String,
    pub user: Option<User>,
    pub next_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("storage: open in-memory database")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn save_token(&self, access_token: &str) -> Result<()> {
        if access_token.trim().is_empty() {
            bail!("storage: access token required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO session (id, access_token, user_json, next_path, updated_at)
VALUES (1, ?1, NULL, NULL, ?2)
ON CONFLICT(id) DO UPDATE SET
  access_token = excluded.access_token,
  updated_at = excluded.updated_at
"#,
            params![access_token, Utc::now().timestamp()],
        )
        .context("storage: save token")?;
        Ok(())
    }

    pub fn save_user(&self, user: &User) -> Result<()> {
        let json = serde_json::to_string(user).context("storage: encode user")?;
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE session SET user_json = ?1, updated_at = ?2 WHERE id = 1",
                params![json, Utc::now().timestamp()],
            )
            .context("storage: save user")?;
        if updated == 0 {
            bail!("storage: no session to attach user to");
        }
        Ok(())
    }

    pub fn set_next_path(&self, path: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE session SET next_path = ?1 WHERE id = 1",
            params![path],
        )
        .context("storage: save next path")?;
        Ok(())
    }

    pub fn load_session(&self) -> Result<Option<StoredSession>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT access_token, user_json, next_path, updated_at
FROM session
WHERE id = 1
"#,
            [],
            session_from_row,
        )
        .optional()
        .context("storage: query session")
    }

    pub fn clear_session(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM session", [])
            .context("storage: clear session")?;
        Ok(())
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<StoredSession> {
    let user_json: Option<String> = row.get(1)?;
    let updated: i64 = row.get(3)?;
    let user = user_json.and_then(|json| match serde_json::from_str(&json) {
        Ok(user) => Some(user),
        Err(err) => {
            log::warn!("storage: discarding unreadable cached user: {err}");
            None
        }
    });
    Ok(StoredSession {
        access_token: row.get(0)?,
        user,
        next_path: row.get(2)?,
        updated_at: Utc
            .timestamp_opt(updated, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![r#"
CREATE TABLE IF NOT EXISTS session (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  access_token TEXT NOT NULL,
  user_json TEXT,
  next_path TEXT,
  updated_at INTEGER NOT NULL
);
"#]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("pourover").join("state.db"))
}
