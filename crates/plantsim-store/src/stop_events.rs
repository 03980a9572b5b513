use serde::{Deserialize, Serialize};
use tracing::instrument;

use plantsim_core::ids::SessionId;
use plantsim_core::sim::{StopRestore, StopStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::{effective_limit, row_helpers, Page};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopEventRow {
    pub id: i64,
    pub session_id: SessionId,
    pub stop_id: String,
    pub location: String,
    pub reason: String,
    pub stop_type: String,
    pub category: String,
    pub severity: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_ms: Option<i64>,
    pub status: StopStatus,
}

impl StopEventRow {
    /// Restore view handed to an engine on recovery.
    pub fn to_restore(&self) -> StopRestore {
        StopRestore {
            stop_id: self.stop_id.clone(),
            location: self.location.clone(),
            reason: self.reason.clone(),
            stop_type: self.stop_type.clone(),
            category: self.category.clone(),
            severity: self.severity.clone(),
            start_time: self.start_time,
        }
    }
}

pub struct StopEventRepo {
    db: Database,
}

impl StopEventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record the opening of a stop. It stays IN_PROGRESS until ended.
    pub fn start(
        &self,
        session_id: &SessionId,
        stop_id: &str,
        location: &str,
        reason: &str,
        stop_type: &str,
        category: &str,
        severity: &str,
        start_time: i64,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                &self.db.sql(
                    "INSERT INTO stop_events (session_id, stop_id, location, reason, stop_type, \
                     category, severity, start_time, status) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'IN_PROGRESS')",
                ),
                rusqlite::params![
                    session_id.as_str(),
                    stop_id,
                    location,
                    reason,
                    stop_type,
                    category,
                    severity,
                    start_time,
                ],
            )?;
            Ok(())
        })
    }

    /// Close an open stop. The only in-place update on any event table.
    pub fn end(
        &self,
        session_id: &SessionId,
        stop_id: &str,
        end_time: i64,
        duration_ms: i64,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                &self.db.sql(
                    "UPDATE stop_events SET end_time = ?1, duration_ms = ?2, status = 'COMPLETED' \
                     WHERE session_id = ?3 AND stop_id = ?4 AND status = 'IN_PROGRESS'",
                ),
                rusqlite::params![end_time, duration_ms, session_id.as_str(), stop_id],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("open stop {stop_id}")));
            }
            Ok(())
        })
    }

    /// Most recent stops first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(
        &self,
        session_id: &SessionId,
        limit: Option<u32>,
    ) -> Result<Page<StopEventRow>, StoreError> {
        let limit = effective_limit(limit);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&self.db.sql(
                "SELECT id, session_id, stop_id, location, reason, stop_type, category, severity, \
                 start_time, end_time, duration_ms, status \
                 FROM stop_events WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
            ))?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit + 1])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_stop(row)?);
            }
            Ok(Page::from_overfetch(results, limit))
        })
    }

    /// Stops that never ended — the recovery set.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn in_progress(&self, session_id: &SessionId) -> Result<Vec<StopEventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&self.db.sql(
                "SELECT id, session_id, stop_id, location, reason, stop_type, category, severity, \
                 start_time, end_time, duration_ms, status \
                 FROM stop_events WHERE session_id = ?1 AND status = 'IN_PROGRESS' ORDER BY id",
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_stop(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_stop(row: &rusqlite::Row<'_>) -> Result<StopEventRow, StoreError> {
    let status: String = row_helpers::get(row, 11, "stop_events", "status")?;
    Ok(StopEventRow {
        id: row_helpers::get(row, 0, "stop_events", "id")?,
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "stop_events", "session_id")?),
        stop_id: row_helpers::get(row, 2, "stop_events", "stop_id")?,
        location: row_helpers::get(row, 3, "stop_events", "location")?,
        reason: row_helpers::get(row, 4, "stop_events", "reason")?,
        stop_type: row_helpers::get(row, 5, "stop_events", "stop_type")?,
        category: row_helpers::get(row, 6, "stop_events", "category")?,
        severity: row_helpers::get(row, 7, "stop_events", "severity")?,
        start_time: row_helpers::get(row, 8, "stop_events", "start_time")?,
        end_time: row_helpers::get_opt(row, 9, "stop_events", "end_time")?,
        duration_ms: row_helpers::get_opt(row, 10, "stop_events", "duration_ms")?,
        status: row_helpers::parse_enum(&status, "stop_events", "status")?,
    })
}
