//! Durable store for sessions, their audit trail, users and platforms.
//!
//! Everything the core writes goes through [`Database`]. The session log is
//! append-only: one row per request or reply, sub-steps hanging off a step
//! for provider-internal retries. Deleting a session cascades through its
//! steps and sub-steps.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PersistenceError>;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unknown session status '{0}'")]
    UnknownStatus(String),
}

/// Persisted session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unknown,
    Waiting,
    Running,
    Succeeded,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Unknown => "unknown",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Running => "running",
            SessionStatus::Succeeded => "succeeded",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "unknown" => Ok(SessionStatus::Unknown),
            "waiting" => Ok(SessionStatus::Waiting),
            "running" => Ok(SessionStatus::Running),
            "succeeded" => Ok(SessionStatus::Succeeded),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(PersistenceError::UnknownStatus(other.to_string())),
        }
    }

    /// Terminal statuses are immutable.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Succeeded | SessionStatus::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input for a new session row.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub name: Option<String>,
    pub user_id: i64,
    pub dc: String,
    pub endpoint_ip: Option<String>,
    pub endpoint_name: Option<String>,
    pub take_screenshot: bool,
    pub run_script: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: i64,
    pub user_id: Option<i64>,
    pub name: String,
    pub dc: String,
    pub endpoint_ip: Option<String>,
    pub endpoint_name: Option<String>,
    pub selenium_session: Option<String>,
    pub take_screenshot: bool,
    pub run_script: Option<String>,
    pub status: SessionStatus,
    pub reason: Option<String>,
    pub error: Option<String>,
    pub timed_out: bool,
    pub closed: bool,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct LogStepRecord {
    pub id: i64,
    pub session_id: i64,
    pub control_line: String,
    pub body: Option<String>,
    pub screenshot: Option<String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SubStepRecord {
    pub id: i64,
    pub session_log_step_id: i64,
    pub control_line: String,
    pub body: Option<String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub allowed_machines: i64,
    pub is_active: bool,
    pub token: Option<String>,
    pub max_stored_sessions: i64,
}

#[derive(Debug, Clone)]
pub struct PlatformRecord {
    pub id: i64,
    pub name: String,
    pub node: String,
}

/// SQLite-backed store. One connection behind a mutex; statements are short
/// and the callers never hold the guard across I/O of their own.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS user_groups (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS users (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT NOT NULL UNIQUE,
              password TEXT,
              allowed_machines INTEGER NOT NULL DEFAULT 1,
              group_id INTEGER REFERENCES user_groups(id) ON DELETE SET NULL,
              is_active INTEGER NOT NULL DEFAULT 1,
              date_joined TEXT NOT NULL,
              last_login TEXT,
              token TEXT,
              max_stored_sessions INTEGER NOT NULL DEFAULT 100
            );

            CREATE TABLE IF NOT EXISTS platforms (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              node TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
              endpoint_ip TEXT,
              endpoint_name TEXT,
              name TEXT,
              dc TEXT NOT NULL,
              selenium_session TEXT,
              take_screenshot INTEGER NOT NULL DEFAULT 0,
              run_script TEXT,
              status TEXT NOT NULL DEFAULT 'waiting',
              reason TEXT,
              error TEXT,
              timed_out INTEGER NOT NULL DEFAULT 0,
              closed INTEGER NOT NULL DEFAULT 0,
              created TEXT NOT NULL,
              modified TEXT NOT NULL,
              deleted TEXT
            );

            CREATE TABLE IF NOT EXISTS session_log_steps (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id INTEGER NOT NULL
                REFERENCES sessions(id) ON DELETE CASCADE,
              control_line TEXT NOT NULL,
              body TEXT,
              screenshot TEXT,
              created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_log_steps_session
              ON session_log_steps(session_id);

            CREATE TABLE IF NOT EXISTS sub_steps (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_log_step_id INTEGER NOT NULL
                REFERENCES session_log_steps(id) ON DELETE CASCADE,
              control_line TEXT NOT NULL,
              body TEXT,
              created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sub_steps_step
              ON sub_steps(session_log_step_id);
            "#,
        )?;

        // Seed the default group and user the way a fresh install expects.
        conn.execute(
            "INSERT OR IGNORE INTO user_groups (name) VALUES ('default')",
            [],
        )?;
        let seeded: Option<i64> = conn
            .query_row(
                "SELECT id FROM users WHERE username = 'default'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if seeded.is_none() {
            conn.execute(
                "INSERT INTO users
                   (username, group_id, date_joined, token)
                 VALUES
                   ('default',
                    (SELECT id FROM user_groups WHERE name = 'default'),
                    ?1, ?2)",
                params![Utc::now().to_rfc3339(), uuid::Uuid::new_v4().to_string()],
            )?;
        }

        Ok(())
    }

    // --- sessions -------------------------------------------------------

    pub fn create_session(&self, new: &NewSession) -> Result<i64> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO sessions
               (user_id, endpoint_ip, endpoint_name, name, dc,
                take_screenshot, run_script, status, created, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                new.user_id,
                new.endpoint_ip,
                new.endpoint_name,
                new.name,
                new.dc,
                new.take_screenshot,
                new.run_script,
                SessionStatus::Waiting.as_str(),
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();

        if new.name.is_none() {
            conn.execute(
                "UPDATE sessions SET name = ?1 WHERE id = ?2",
                params![format!("Unnamed session {id}"), id],
            )?;
        }

        Ok(id)
    }

    pub fn get_session(&self, id: i64) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, name, dc, endpoint_ip, endpoint_name,
                    selenium_session, take_screenshot, run_script, status,
                    reason, error, timed_out, closed, created, modified, deleted
             FROM sessions WHERE id = ?1",
            params![id],
            session_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare(
            "SELECT id, user_id, name, dc, endpoint_ip, endpoint_name,
                    selenium_session, take_screenshot, run_script, status,
                    reason, error, timed_out, closed, created, modified, deleted
             FROM sessions ORDER BY id",
        )?;
        let rows = statement.query_map([], session_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn set_selenium_session(&self, id: i64, selenium_session: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE sessions
             SET selenium_session = ?1, modified = ?2 WHERE id = ?3",
            params![selenium_session, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn set_session_status(&self, id: i64, status: SessionStatus) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE sessions SET status = ?1, modified = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn fail_session(
        &self,
        id: i64,
        reason: &str,
        error: Option<&str>,
        timed_out: bool,
    ) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE sessions
             SET status = ?1, reason = ?2, error = ?3, timed_out = ?4,
                 modified = ?5
             WHERE id = ?6",
            params![
                SessionStatus::Failed.as_str(),
                reason,
                error,
                timed_out,
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        Ok(())
    }

    pub fn close_session(&self, id: i64, status: SessionStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.lock().execute(
            "UPDATE sessions
             SET status = ?1, closed = 1, deleted = ?2, modified = ?2
             WHERE id = ?3",
            params![status.as_str(), now, id],
        )?;
        Ok(())
    }

    /// Drop a user's oldest closed sessions beyond their retention quota.
    /// Steps and sub-steps cascade. Returns the purged session ids so the
    /// caller can remove screenshot directories.
    pub fn purge_stored_sessions(&self, user_id: i64, max_stored: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare(
            "SELECT id FROM sessions
             WHERE user_id = ?1 AND closed = 1
             ORDER BY created DESC, id DESC LIMIT -1 OFFSET ?2",
        )?;
        let stale: Vec<i64> = statement
            .query_map(params![user_id, max_stored], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        if !stale.is_empty() {
            log::info!(
                "purging {} stored session(s) for user {user_id}",
                stale.len()
            );
        }
        for id in &stale {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        }
        Ok(stale)
    }

    // --- log steps ------------------------------------------------------

    pub fn create_log_step(
        &self,
        session_id: i64,
        control_line: &str,
        body: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO session_log_steps (session_id, control_line, body, created)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, control_line, body, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn attach_screenshot(&self, log_step_id: i64, path: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE session_log_steps SET screenshot = ?1 WHERE id = ?2",
            params![path, log_step_id],
        )?;
        Ok(())
    }

    pub fn add_sub_step(
        &self,
        log_step_id: i64,
        control_line: &str,
        body: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sub_steps (session_log_step_id, control_line, body, created)
             VALUES (?1, ?2, ?3, ?4)",
            params![log_step_id, control_line, body, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn log_steps(&self, session_id: i64) -> Result<Vec<LogStepRecord>> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare(
            "SELECT id, session_id, control_line, body, screenshot, created
             FROM session_log_steps WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = statement.query_map(params![session_id], |row| {
            Ok(LogStepRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                control_line: row.get(2)?,
                body: row.get(3)?,
                screenshot: row.get(4)?,
                created: parse_timestamp(row.get::<_, String>(5)?),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn sub_steps(&self, log_step_id: i64) -> Result<Vec<SubStepRecord>> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare(
            "SELECT id, session_log_step_id, control_line, body, created
             FROM sub_steps WHERE session_log_step_id = ?1 ORDER BY id",
        )?;
        let rows = statement.query_map(params![log_step_id], |row| {
            Ok(SubStepRecord {
                id: row.get(0)?,
                session_log_step_id: row.get(1)?,
                control_line: row.get(2)?,
                body: row.get(3)?,
                created: parse_timestamp(row.get::<_, String>(4)?),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // --- users ----------------------------------------------------------

    pub fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, allowed_machines, is_active, token,
                    max_stored_sessions
             FROM users WHERE id = ?1",
            params![id],
            user_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, allowed_machines, is_active, token,
                    max_stored_sessions
             FROM users WHERE username = ?1",
            params![username],
            user_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_user_by_token(&self, token: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, allowed_machines, is_active, token,
                    max_stored_sessions
             FROM users WHERE token = ?1 AND is_active = 1",
            params![token],
            user_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn default_user_id(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id FROM users WHERE username = 'default'",
            [],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    /// Mint a fresh token for the user; returns it, or `None` for an
    /// unknown user.
    pub fn regenerate_token(&self, user_id: i64) -> Result<Option<String>> {
        let token = uuid::Uuid::new_v4().to_string();
        let changed = self.conn.lock().execute(
            "UPDATE users SET token = ?1 WHERE id = ?2",
            params![token, user_id],
        )?;
        Ok((changed > 0).then_some(token))
    }

    // --- platforms ------------------------------------------------------

    /// Replace the platform registry with what the providers discovered.
    pub fn register_platforms(&self, platforms: &[(String, String)]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM platforms", [])?;
        for (name, node) in platforms {
            tx.execute(
                "INSERT INTO platforms (name, node) VALUES (?1, ?2)",
                params![name, node],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_platforms(&self) -> Result<Vec<PlatformRecord>> {
        let conn = self.conn.lock();
        let mut statement =
            conn.prepare("SELECT id, name, node FROM platforms ORDER BY name")?;
        let rows = statement.query_map([], |row| {
            Ok(PlatformRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                node: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let status: String = row.get(9)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        dc: row.get(3)?,
        endpoint_ip: row.get(4)?,
        endpoint_name: row.get(5)?,
        selenium_session: row.get(6)?,
        take_screenshot: row.get(7)?,
        run_script: row.get(8)?,
        status: SessionStatus::from_str(&status).unwrap_or(SessionStatus::Unknown),
        reason: row.get(10)?,
        error: row.get(11)?,
        timed_out: row.get(12)?,
        closed: row.get(13)?,
        created: parse_timestamp(row.get::<_, String>(14)?),
        modified: parse_timestamp(row.get::<_, String>(15)?),
        deleted: row
            .get::<_, Option<String>>(16)?
            .map(parse_timestamp),
    })
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        allowed_machines: row.get(2)?,
        is_active: row.get(3)?,
        token: row.get(4)?,
        max_stored_sessions: row.get(5)?,
    })
}

fn parse_timestamp(text: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(db: &Database, name: Option<&str>) -> i64 {
        db.create_session(&NewSession {
            name: name.map(str::to_string),
            user_id: db.default_user_id().unwrap(),
            dc: r#"{"platform":"origin_1"}"#.to_string(),
            endpoint_ip: Some("127.0.0.1".to_string()),
            endpoint_name: Some("ondemand-x".to_string()),
            take_screenshot: false,
            run_script: None,
        })
        .unwrap()
    }

    #[test]
    fn unnamed_sessions_get_a_name() {
        let db = Database::open_in_memory().unwrap();
        let id = new_session(&db, None);
        let record = db.get_session(id).unwrap().unwrap();
        assert_eq!(record.name, format!("Unnamed session {id}"));
        assert_eq!(record.status, SessionStatus::Waiting);
    }

    #[test]
    fn status_round_trips() {
        for status in [
            SessionStatus::Unknown,
            SessionStatus::Waiting,
            SessionStatus::Running,
            SessionStatus::Succeeded,
            SessionStatus::Failed,
        ] {
            assert_eq!(SessionStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(SessionStatus::from_str("bogus").is_err());
    }

    #[test]
    fn session_lifecycle_updates() {
        let db = Database::open_in_memory().unwrap();
        let id = new_session(&db, Some("lifecycle"));

        db.set_selenium_session(id, "UP123").unwrap();
        db.set_session_status(id, SessionStatus::Running).unwrap();
        db.close_session(id, SessionStatus::Succeeded).unwrap();

        let record = db.get_session(id).unwrap().unwrap();
        assert_eq!(record.selenium_session.as_deref(), Some("UP123"));
        assert_eq!(record.status, SessionStatus::Succeeded);
        assert!(record.closed);
        assert!(record.deleted.is_some());
    }

    #[test]
    fn failed_session_keeps_cause() {
        let db = Database::open_in_memory().unwrap();
        let id = new_session(&db, None);
        db.fail_session(id, "session timeout", Some("no activity"), true)
            .unwrap();

        let record = db.get_session(id).unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Failed);
        assert_eq!(record.reason.as_deref(), Some("session timeout"));
        assert!(record.timed_out);
    }

    #[test]
    fn log_steps_are_ordered_and_cascade() {
        let db = Database::open_in_memory().unwrap();
        let id = new_session(&db, None);

        let request = db
            .create_log_step(id, "POST /wd/hub/session/1/url HTTP/1.1", Some("{}"))
            .unwrap();
        let reply = db
            .create_log_step(id, "HTTP/1.1 200", Some(r#"{"status":0}"#))
            .unwrap();
        db.add_sub_step(request, "boot attempt 1", None).unwrap();
        db.attach_screenshot(request, "screenshots/1/1.png").unwrap();

        let steps = db.log_steps(id).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps[0].id < steps[1].id);
        assert!(steps[0].control_line.starts_with("POST"));
        assert_eq!(
            steps[0].screenshot.as_deref(),
            Some("screenshots/1/1.png")
        );
        assert_eq!(db.sub_steps(request).unwrap().len(), 1);

        // Cascade: deleting the session removes steps and sub-steps.
        db.purge_stored_sessions(db.default_user_id().unwrap(), 0)
            .unwrap();
        // session is not closed yet, so it survives
        assert_eq!(db.log_steps(id).unwrap().len(), 2);

        db.close_session(id, SessionStatus::Succeeded).unwrap();
        let purged = db
            .purge_stored_sessions(db.default_user_id().unwrap(), 0)
            .unwrap();
        assert_eq!(purged, vec![id]);
        assert!(db.get_session(id).unwrap().is_none());
        assert!(db.log_steps(id).unwrap().is_empty());
        assert!(db.sub_steps(request).unwrap().is_empty());
    }

    #[test]
    fn retention_quota_keeps_newest() {
        let db = Database::open_in_memory().unwrap();
        let user = db.default_user_id().unwrap();

        let ids: Vec<i64> = (0..4).map(|_| new_session(&db, None)).collect();
        for id in &ids {
            db.close_session(*id, SessionStatus::Succeeded).unwrap();
        }

        let purged = db.purge_stored_sessions(user, 2).unwrap();
        assert_eq!(purged.len(), 2);
        // the two newest survive
        assert!(db.get_session(ids[3]).unwrap().is_some());
        assert!(db.get_session(ids[2]).unwrap().is_some());
    }

    #[test]
    fn tokens_authenticate_and_regenerate() {
        let db = Database::open_in_memory().unwrap();
        let user_id = db.default_user_id().unwrap();
        let user = db.get_user(user_id).unwrap().unwrap();
        let token = user.token.unwrap();

        assert_eq!(
            db.get_user_by_token(&token).unwrap().unwrap().id,
            user_id
        );

        let fresh = db.regenerate_token(user_id).unwrap().unwrap();
        assert_ne!(fresh, token);
        assert!(db.get_user_by_token(&token).unwrap().is_none());
        assert!(db.get_user_by_token(&fresh).unwrap().is_some());

        assert!(db.regenerate_token(9999).unwrap().is_none());
    }

    #[test]
    fn platform_registry_is_replaced() {
        let db = Database::open_in_memory().unwrap();
        db.register_platforms(&[
            ("origin_1".to_string(), "kvm".to_string()),
            ("origin_2".to_string(), "nova".to_string()),
        ])
        .unwrap();
        db.register_platforms(&[("origin_2".to_string(), "nova".to_string())])
            .unwrap();

        let platforms = db.list_platforms().unwrap();
        assert_eq!(platforms.len(), 1);
        assert_eq!(platforms[0].name, "origin_2");
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmgrid.db");
        let id = {
            let db = Database::open(&path).unwrap();
            new_session(&db, Some("persisted"))
        };
        let db = Database::open(&path).unwrap();
        assert_eq!(db.get_session(id).unwrap().unwrap().name, "persisted");
    }
}
