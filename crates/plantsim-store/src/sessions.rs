use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use plantsim_core::ids::{ConfigId, SessionId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Expired,
    Interrupted,
}

impl SessionStatus {
    /// Active sessions are the ones counted against admission caps.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Expired => write!(f, "expired"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            "expired" => Ok(Self::Expired),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub user_id: UserId,
    pub name: Option<String>,
    pub config_id: Option<ConfigId>,
    /// Config captured at creation; later config edits never reach a live
    /// session.
    pub config_snapshot: Option<String>,
    pub duration_days: u32,
    pub speed_factor: u32,
    pub status: SessionStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub expires_at: Option<String>,
    pub stopped_at: Option<String>,
    pub interrupted_at: Option<String>,
    /// Simulated clock cursor, milliseconds.
    pub simulated_timestamp: Option<i64>,
    pub current_tick: u64,
    pub last_snapshot_at: Option<String>,
}

/// Fields for a new session row.
#[derive(Clone, Debug, Default)]
pub struct NewSession {
    pub name: Option<String>,
    pub config_id: Option<ConfigId>,
    pub config_snapshot: Option<String>,
    pub duration_days: u32,
    pub speed_factor: u32,
}

const SESSION_COLUMNS: &str = "id, user_id, name, config_id, config_snapshot, duration_days, \
     speed_factor, status, created_at, started_at, expires_at, stopped_at, interrupted_at, \
     simulated_timestamp, current_tick, last_snapshot_at";

/// Tables that carry per-session rows, in delete order.
const SESSION_SCOPED_TABLES: [&str; 6] = [
    "car_events",
    "stop_events",
    "buffer_states",
    "plant_snapshots",
    "oee",
    "mttr_mtbf",
];

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new session in `idle`.
    #[instrument(skip(self, new), fields(user_id = %user_id))]
    pub fn create(&self, user_id: &UserId, new: NewSession) -> Result<SessionRow, StoreError> {
        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                &self.db.sql(
                    "INSERT INTO sessions (id, user_id, name, config_id, config_snapshot, \
                     duration_days, speed_factor, status, created_at, current_tick) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'idle', ?8, 0)",
                ),
                rusqlite::params![
                    id.as_str(),
                    user_id.as_str(),
                    new.name,
                    new.config_id.as_ref().map(|c| c.as_str()),
                    new.config_snapshot,
                    new.duration_days,
                    new.speed_factor,
                    now,
                ],
            )?;

            Ok(SessionRow {
                id,
                user_id: user_id.clone(),
                name: new.name.clone(),
                config_id: new.config_id.clone(),
                config_snapshot: new.config_snapshot.clone(),
                duration_days: new.duration_days,
                speed_factor: new.speed_factor,
                status: SessionStatus::Idle,
                created_at: now,
                started_at: None,
                expires_at: None,
                stopped_at: None,
                interrupted_at: None,
                simulated_timestamp: None,
                current_tick: 0,
                last_snapshot_at: None,
            })
        })
    }

    /// Get a session by id alone. Internal paths only — user-facing lookups
    /// go through `get_owned`.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
            let mut stmt = conn.prepare(&self.db.sql(&sql))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// Resolve a session by id and owner together. A missing row and an
    /// ownership mismatch are indistinguishable in the error.
    #[instrument(skip(self), fields(session_id = %id, user_id = %user_id))]
    pub fn get_owned(&self, id: &SessionId, user_id: &UserId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let sql =
                format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1 AND user_id = ?2");
            let mut stmt = conn.prepare(&self.db.sql(&sql))?;
            let mut rows = stmt.query([id.as_str(), user_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List a user's sessions, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list_for_user(&self, user_id: &UserId) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC"
            );
            let mut stmt = conn.prepare(&self.db.sql(&sql))?;
            let mut rows = stmt.query([user_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Sessions currently in `interrupted`.
    pub fn list_interrupted(&self) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = 'interrupted' \
                 ORDER BY interrupted_at DESC"
            );
            let mut stmt = conn.prepare(&self.db.sql(&sql))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Count of sessions in {running, paused}, across all users.
    /// Always read from the table — the store is the admission authority.
    pub fn count_active(&self) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE status IN ('running', 'paused')",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }

    /// Count of one user's sessions in {running, paused}.
    pub fn count_active_for_user(&self, user_id: &UserId) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &self.db.sql(
                    "SELECT COUNT(*) FROM sessions \
                     WHERE user_id = ?1 AND status IN ('running', 'paused')",
                ),
                [user_id.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
    }

    /// Transition to running at first start: stamps `started_at` and derives
    /// `expires_at` once; a restart of a stopped session keeps both.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn mark_started(&self, id: &SessionId, now: DateTime<Utc>) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let duration_days: u32 = conn
                .query_row(
                    &self.db.sql("SELECT duration_days FROM sessions WHERE id = ?1"),
                    [id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|_| StoreError::NotFound(format!("session {id}")))?;

            let expires = now + Duration::milliseconds(i64::from(duration_days) * 86_400_000);
            conn.execute(
                &self.db.sql(
                    "UPDATE sessions SET status = 'running', \
                     started_at = COALESCE(started_at, ?1), \
                     expires_at = COALESCE(expires_at, ?2) \
                     WHERE id = ?3",
                ),
                rusqlite::params![now.to_rfc3339(), expires.to_rfc3339(), id.as_str()],
            )?;
            Ok(())
        })?;
        self.get(id)
    }

    /// Plain status flip for pause/resume.
    #[instrument(skip(self), fields(session_id = %id, status = %status))]
    pub fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                &self.db.sql("UPDATE sessions SET status = ?1 WHERE id = ?2"),
                rusqlite::params![status.to_string(), id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Terminal transition: `stopped` or `expired`, with `stopped_at` stamped
    /// and `interrupted_at` cleared (covers the interrupted → discard path).
    #[instrument(skip(self), fields(session_id = %id, status = %status))]
    pub fn mark_stopped(
        &self,
        id: &SessionId,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        debug_assert!(matches!(status, SessionStatus::Stopped | SessionStatus::Expired));
        self.db.with_conn(|conn| {
            let n = conn.execute(
                &self.db.sql(
                    "UPDATE sessions SET status = ?1, stopped_at = ?2, interrupted_at = NULL \
                     WHERE id = ?3",
                ),
                rusqlite::params![status.to_string(), now.to_rfc3339(), id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Interrupted → running after a successful recovery handshake.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn mark_recovered(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                &self.db.sql(
                    "UPDATE sessions SET status = 'running', interrupted_at = NULL WHERE id = ?1",
                ),
                [id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Persist the simulation clock cursor. The tick never moves backwards.
    pub fn update_checkpoint(
        &self,
        id: &SessionId,
        simulated_timestamp: i64,
        tick: u64,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                &self.db.sql(
                    "UPDATE sessions SET simulated_timestamp = ?1, \
                     current_tick = MAX(current_tick, ?2) WHERE id = ?3",
                ),
                rusqlite::params![simulated_timestamp, tick as i64, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Stamp `last_snapshot_at` when a plant snapshot lands.
    pub fn touch_snapshot(&self, id: &SessionId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                &self.db.sql("UPDATE sessions SET last_snapshot_at = ?1 WHERE id = ?2"),
                rusqlite::params![now.to_rfc3339(), id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Startup reconciliation step 1: everything that was live when the
    /// orchestrator died becomes `interrupted`. Returns the affected rows.
    #[instrument(skip(self))]
    pub fn mark_active_interrupted(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRow>, StoreError> {
        let now_str = now.to_rfc3339();
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE status IN ('running', 'paused')"
            );
            let mut stmt = conn.prepare(&self.db.sql(&sql))?;
            let mut rows = stmt.query([])?;
            let mut affected = Vec::new();
            while let Some(row) = rows.next()? {
                affected.push(row_to_session(row)?);
            }

            conn.execute(
                &self.db.sql(
                    "UPDATE sessions SET status = 'interrupted', interrupted_at = ?1 \
                     WHERE status IN ('running', 'paused')",
                ),
                [&now_str],
            )?;

            for session in &mut affected {
                session.status = SessionStatus::Interrupted;
                session.interrupted_at = Some(now_str.clone());
            }
            Ok(affected)
        })
    }

    /// Startup reconciliation step 2: expire rows whose lifetime has passed
    /// and that are not already terminal or interrupted.
    #[instrument(skip(self))]
    pub fn mark_expired_due(&self, now: DateTime<Utc>) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                &self.db.sql(
                    "UPDATE sessions SET status = 'expired', stopped_at = ?1 \
                     WHERE expires_at IS NOT NULL AND expires_at < ?1 \
                     AND status NOT IN ('stopped', 'expired', 'interrupted')",
                ),
                [now.to_rfc3339()],
            )?;
            Ok(n as u32)
        })
    }

    /// Startup reconciliation step 3: interrupted rows older than the cutoff
    /// are garbage-collected to `stopped`.
    #[instrument(skip(self))]
    pub fn stop_stale_interrupted(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                &self.db.sql(
                    "UPDATE sessions SET status = 'stopped', stopped_at = ?1, \
                     interrupted_at = NULL \
                     WHERE status = 'interrupted' AND interrupted_at < ?2",
                ),
                rusqlite::params![now.to_rfc3339(), cutoff.to_rfc3339()],
            )?;
            Ok(n as u32)
        })
    }

    /// Live sessions whose `expires_at` has passed — the expiration scan.
    pub fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions \
                 WHERE status IN ('running', 'paused') \
                 AND expires_at IS NOT NULL AND expires_at < ?1"
            );
            let mut stmt = conn.prepare(&self.db.sql(&sql))?;
            let mut rows = stmt.query([now.to_rfc3339()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Hard delete: every session-scoped row across all event tables plus the
    /// session row itself, in one transaction.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            for table in SESSION_SCOPED_TABLES {
                tx.execute(
                    &self.db.sql(&format!("DELETE FROM {table} WHERE session_id = ?1")),
                    [id.as_str()],
                )?;
            }
            let n = tx.execute(&self.db.sql("DELETE FROM sessions WHERE id = ?1"), [id.as_str()])?;
            if n == 0 {
                // Roll back the fan-out; the session never existed
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            tx.commit()?;
            Ok(())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let status_str: String = row_helpers::get(row, 7, "sessions", "status")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "sessions", "user_id")?),
        name: row_helpers::get_opt(row, 2, "sessions", "name")?,
        config_id: row_helpers::get_opt::<String>(row, 3, "sessions", "config_id")?
            .map(ConfigId::from_raw),
        config_snapshot: row_helpers::get_opt(row, 4, "sessions", "config_snapshot")?,
        duration_days: row_helpers::get(row, 5, "sessions", "duration_days")?,
        speed_factor: row_helpers::get(row, 6, "sessions", "speed_factor")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        created_at: row_helpers::get(row, 8, "sessions", "created_at")?,
        started_at: row_helpers::get_opt(row, 9, "sessions", "started_at")?,
        expires_at: row_helpers::get_opt(row, 10, "sessions", "expires_at")?,
        stopped_at: row_helpers::get_opt(row, 11, "sessions", "stopped_at")?,
        interrupted_at: row_helpers::get_opt(row, 12, "sessions", "interrupted_at")?,
        simulated_timestamp: row_helpers::get_opt(row, 13, "sessions", "simulated_timestamp")?,
        current_tick: row_helpers::get::<i64>(row, 14, "sessions", "current_tick")? as u64,
        last_snapshot_at: row_helpers::get_opt(row, 15, "sessions", "last_snapshot_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, UserId) {
        let db = Database::in_memory().unwrap();
        (db, UserId::new())
    }

    fn default_new() -> NewSession {
        NewSession {
            name: Some("line 1".into()),
            config_id: None,
            config_snapshot: None,
            duration_days: 7,
            speed_factor: 60,
        }
    }

    #[test]
    fn create_session_idle() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&user, default_new()).unwrap();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.started_at.is_none());
        assert!(session.expires_at.is_none());
        assert_eq!(session.current_tick, 0);
    }

    #[test]
    fn get_owned_rejects_other_user() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&user, default_new()).unwrap();

        let other = UserId::new();
        let result = repo.get_owned(&session.id, &other);
        assert!(matches!(result, Err(StoreError::NotFound(_))));

        // The error for a nonexistent id is indistinguishable
        let missing = repo.get_owned(&SessionId::new(), &user);
        let (a, b) = (result.unwrap_err().to_string(), missing.unwrap_err().to_string());
        assert!(a.starts_with("not found: session "));
        assert!(b.starts_with("not found: session "));
    }

    #[test]
    fn list_for_user_scopes_by_owner() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        repo.create(&user, default_new()).unwrap();
        repo.create(&user, default_new()).unwrap();
        repo.create(&UserId::new(), default_new()).unwrap();

        assert_eq!(repo.list_for_user(&user).unwrap().len(), 2);
    }

    #[test]
    fn mark_started_sets_expiry_once() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&user, default_new()).unwrap();

        let t0 = Utc::now();
        let started = repo.mark_started(&session.id, t0).unwrap();
        assert_eq!(started.status, SessionStatus::Running);
        let first_expiry = started.expires_at.clone().unwrap();

        // Stop and restart a day later: started_at/expires_at must not move
        repo.mark_stopped(&session.id, SessionStatus::Stopped, t0).unwrap();
        let restarted = repo
            .mark_started(&session.id, t0 + Duration::days(1))
            .unwrap();
        assert_eq!(restarted.expires_at.unwrap(), first_expiry);
        assert_eq!(restarted.started_at, started.started_at);
    }

    #[test]
    fn expires_at_is_duration_days_after_start() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        let mut new = default_new();
        new.duration_days = 2;
        let session = repo.create(&user, new).unwrap();

        let t0 = Utc::now();
        let started = repo.mark_started(&session.id, t0).unwrap();
        let expires: DateTime<Utc> = started.expires_at.unwrap().parse().unwrap();
        assert_eq!((expires - t0).num_milliseconds(), 2 * 86_400_000);
    }

    #[test]
    fn active_counts() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        let a = repo.create(&user, default_new()).unwrap();
        let b = repo.create(&user, default_new()).unwrap();
        let c = repo.create(&UserId::new(), default_new()).unwrap();

        let now = Utc::now();
        repo.mark_started(&a.id, now).unwrap();
        repo.mark_started(&b.id, now).unwrap();
        repo.update_status(&b.id, SessionStatus::Paused).unwrap();
        repo.mark_started(&c.id, now).unwrap();

        assert_eq!(repo.count_active().unwrap(), 3);
        assert_eq!(repo.count_active_for_user(&user).unwrap(), 2);

        repo.mark_stopped(&a.id, SessionStatus::Stopped, now).unwrap();
        assert_eq!(repo.count_active_for_user(&user).unwrap(), 1);
    }

    #[test]
    fn mark_stopped_clears_interrupted_at() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&user, default_new()).unwrap();
        let now = Utc::now();
        repo.mark_started(&session.id, now).unwrap();
        repo.mark_active_interrupted(now).unwrap();

        repo.mark_stopped(&session.id, SessionStatus::Stopped, now).unwrap();
        let row = repo.get(&session.id).unwrap();
        assert_eq!(row.status, SessionStatus::Stopped);
        assert!(row.stopped_at.is_some());
        assert!(row.interrupted_at.is_none());
    }

    #[test]
    fn checkpoint_tick_never_regresses() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        let session = repo.create(&user, default_new()).unwrap();

        repo.update_checkpoint(&session.id, 120_000, 2).unwrap();
        repo.update_checkpoint(&session.id, 60_000, 1).unwrap();

        let row = repo.get(&session.id).unwrap();
        assert_eq!(row.current_tick, 2);
        // The simulated cursor itself follows the latest write
        assert_eq!(row.simulated_timestamp, Some(60_000));
    }

    #[test]
    fn mark_active_interrupted_returns_affected() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        let a = repo.create(&user, default_new()).unwrap();
        let b = repo.create(&user, default_new()).unwrap();
        repo.create(&user, default_new()).unwrap(); // stays idle

        let now = Utc::now();
        repo.mark_started(&a.id, now).unwrap();
        repo.mark_started(&b.id, now).unwrap();
        repo.update_status(&b.id, SessionStatus::Paused).unwrap();

        let affected = repo.mark_active_interrupted(now).unwrap();
        assert_eq!(affected.len(), 2);
        for session in &affected {
            assert_eq!(session.status, SessionStatus::Interrupted);
            assert!(session.interrupted_at.is_some());
        }

        // Nothing is left running or paused
        assert_eq!(repo.count_active().unwrap(), 0);
    }

    #[test]
    fn mark_expired_due_skips_terminal_and_interrupted() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        let mut new = default_new();
        new.duration_days = 0;

        let expired = repo.create(&user, new.clone()).unwrap();
        let interrupted = repo.create(&user, new.clone()).unwrap();
        let stopped = repo.create(&user, new).unwrap();

        let past = Utc::now() - Duration::hours(1);
        repo.mark_started(&expired.id, past).unwrap();
        repo.mark_started(&interrupted.id, past).unwrap();
        repo.mark_started(&stopped.id, past).unwrap();
        repo.mark_stopped(&stopped.id, SessionStatus::Stopped, past).unwrap();

        // Interrupt one of them first (startup step 1 runs before step 2)
        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE sessions SET status = 'interrupted', interrupted_at = ?1 WHERE id = ?2",
                    rusqlite::params![past.to_rfc3339(), interrupted.id.as_str()],
                )?;
                Ok(())
            })
            .unwrap();
        repo.update_status(&expired.id, SessionStatus::Running).unwrap();

        let n = repo.mark_expired_due(Utc::now()).unwrap();
        assert_eq!(n, 1);
        assert_eq!(repo.get(&expired.id).unwrap().status, SessionStatus::Expired);
        assert_eq!(repo.get(&interrupted.id).unwrap().status, SessionStatus::Interrupted);
        assert_eq!(repo.get(&stopped.id).unwrap().status, SessionStatus::Stopped);
    }

    #[test]
    fn stale_interrupted_stopped_fresh_kept() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        let stale = repo.create(&user, default_new()).unwrap();
        let fresh = repo.create(&user, default_new()).unwrap();

        let now = Utc::now();
        repo.mark_started(&stale.id, now).unwrap();
        repo.mark_started(&fresh.id, now).unwrap();

        // Backdate one interruption past the 24 h window
        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE sessions SET status = 'interrupted', interrupted_at = ?1 WHERE id = ?2",
                    rusqlite::params![(now - Duration::hours(30)).to_rfc3339(), stale.id.as_str()],
                )?;
                conn.execute(
                    "UPDATE sessions SET status = 'interrupted', interrupted_at = ?1 WHERE id = ?2",
                    rusqlite::params![(now - Duration::hours(1)).to_rfc3339(), fresh.id.as_str()],
                )?;
                Ok(())
            })
            .unwrap();

        let n = repo.stop_stale_interrupted(now - Duration::hours(24), now).unwrap();
        assert_eq!(n, 1);

        let stale_row = repo.get(&stale.id).unwrap();
        assert_eq!(stale_row.status, SessionStatus::Stopped);
        assert!(stale_row.interrupted_at.is_none());
        assert_eq!(repo.get(&fresh.id).unwrap().status, SessionStatus::Interrupted);
    }

    #[test]
    fn find_expired_scans_live_sessions() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db);
        let mut new = default_new();
        new.duration_days = 0;
        let session = repo.create(&user, new).unwrap();
        repo.mark_started(&session.id, Utc::now() - Duration::minutes(5)).unwrap();

        let due = repo.find_expired(Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, session.id);

        // Not reported once stopped
        repo.mark_stopped(&session.id, SessionStatus::Expired, Utc::now()).unwrap();
        assert!(repo.find_expired(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn delete_fans_out_over_all_tables() {
        let (db, user) = setup();
        let repo = SessionRepo::new(db.clone());
        let session = repo.create(&user, default_new()).unwrap();
        let sid = session.id.as_str().to_string();

        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO car_events (session_id, car_id, event_type, timestamp) \
                 VALUES (?1, 'car-001', 'CREATED', 0)",
                [&sid],
            )?;
            conn.execute(
                "INSERT INTO stop_events (session_id, stop_id, location, reason, stop_type, \
                 category, severity, start_time) \
                 VALUES (?1, 'stop-1', 'st-1', 'jam', 'UNPLANNED', 'MECHANICAL', 'HIGH', 0)",
                [&sid],
            )?;
            conn.execute(
                "INSERT INTO buffer_states (session_id, buffer_id, capacity, current_count, \
                 car_ids, status, timestamp) VALUES (?1, 'buf-1', 10, 0, '[]', 'OK', 0)",
                [&sid],
            )?;
            conn.execute(
                "INSERT INTO plant_snapshots (session_id, timestamp, snapshot_data) \
                 VALUES (?1, 0, '{}')",
                [&sid],
            )?;
            conn.execute(
                "INSERT INTO oee (session_id, date, location, availability, performance, \
                 quality, oee) VALUES (?1, '2026-08-01', 'st-1', 0.9, 0.9, 0.9, 0.729)",
                [&sid],
            )?;
            conn.execute(
                "INSERT INTO mttr_mtbf (session_id, date, location, mttr_ms, mtbf_ms, \
                 failure_count) VALUES (?1, '2026-08-01', 'st-1', 1000.0, 90000.0, 2)",
                [&sid],
            )?;
            Ok(())
        })
        .unwrap();

        repo.delete(&session.id).unwrap();
        assert!(repo.get(&session.id).is_err());

        db.with_conn(|conn| {
            for table in super::SESSION_SCOPED_TABLES {
                let count: i64 = conn
                    .query_row(
                        &format!("SELECT COUNT(*) FROM {table} WHERE session_id = ?1"),
                        [&sid],
                        |row| row.get(0),
                    )
                    .map_err(StoreError::from)?;
                assert_eq!(count, 0, "rows left in {table}");
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn delete_missing_session_is_not_found() {
        let (db, _) = setup();
        let repo = SessionRepo::new(db);
        assert!(matches!(
            repo.delete(&SessionId::new()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn invalid_session_status_returns_error() {
        let (db, user) = setup();
        let session_id = SessionId::new();
        let now = Utc::now().to_rfc3339();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, status, created_at) \
                 VALUES (?1, ?2, 'INVALID_STATUS', ?3)",
                rusqlite::params![session_id.as_str(), user.as_str(), now],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = SessionRepo::new(db);
        let result = repo.get(&session_id);
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
