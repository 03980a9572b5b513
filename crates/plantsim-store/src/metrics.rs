use serde::{Deserialize, Serialize};
use tracing::instrument;

use plantsim_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::{effective_limit, row_helpers, Page};

/// Periodic OEE aggregate, keyed by date and location.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OeeRow {
    pub id: i64,
    pub session_id: SessionId,
    pub date: String,
    pub location: String,
    pub availability: f64,
    pub performance: f64,
    pub quality: f64,
    pub oee: f64,
}

/// Periodic MTTR/MTBF aggregate, keyed by date and location.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MttrMtbfRow {
    pub id: i64,
    pub session_id: SessionId,
    pub date: String,
    pub location: String,
    pub mttr_ms: f64,
    pub mtbf_ms: f64,
    pub failure_count: u32,
}

pub struct MetricsRepo {
    db: Database,
}

impl MetricsRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn append_oee(
        &self,
        session_id: &SessionId,
        date: &str,
        location: &str,
        availability: f64,
        performance: f64,
        quality: f64,
        oee: f64,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                &self.db.sql(
                    "INSERT INTO oee (session_id, date, location, availability, performance, \
                     quality, oee) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                ),
                rusqlite::params![session_id.as_str(), date, location, availability, performance, quality, oee],
            )?;
            Ok(())
        })
    }

    pub fn append_mttr_mtbf(
        &self,
        session_id: &SessionId,
        date: &str,
        location: &str,
        mttr_ms: f64,
        mtbf_ms: f64,
        failure_count: u32,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                &self.db.sql(
                    "INSERT INTO mttr_mtbf (session_id, date, location, mttr_ms, mtbf_ms, \
                     failure_count) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                ),
                rusqlite::params![session_id.as_str(), date, location, mttr_ms, mtbf_ms, failure_count],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_oee(
        &self,
        session_id: &SessionId,
        limit: Option<u32>,
    ) -> Result<Page<OeeRow>, StoreError> {
        let limit = effective_limit(limit);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&self.db.sql(
                "SELECT id, session_id, date, location, availability, performance, quality, oee \
                 FROM oee WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
            ))?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit + 1])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(OeeRow {
                    id: row_helpers::get(row, 0, "oee", "id")?,
                    session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "oee", "session_id")?),
                    date: row_helpers::get(row, 2, "oee", "date")?,
                    location: row_helpers::get(row, 3, "oee", "location")?,
                    availability: row_helpers::get(row, 4, "oee", "availability")?,
                    performance: row_helpers::get(row, 5, "oee", "performance")?,
                    quality: row_helpers::get(row, 6, "oee", "quality")?,
                    oee: row_helpers::get(row, 7, "oee", "oee")?,
                });
            }
            Ok(Page::from_overfetch(results, limit))
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_mttr_mtbf(
        &self,
        session_id: &SessionId,
        limit: Option<u32>,
    ) -> Result<Page<MttrMtbfRow>, StoreError> {
        let limit = effective_limit(limit);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&self.db.sql(
                "SELECT id, session_id, date, location, mttr_ms, mtbf_ms, failure_count \
                 FROM mttr_mtbf WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
            ))?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit + 1])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(MttrMtbfRow {
                    id: row_helpers::get(row, 0, "mttr_mtbf", "id")?,
                    session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "mttr_mtbf", "session_id")?),
                    date: row_helpers::get(row, 2, "mttr_mtbf", "date")?,
                    location: row_helpers::get(row, 3, "mttr_mtbf", "location")?,
                    mttr_ms: row_helpers::get(row, 4, "mttr_mtbf", "mttr_ms")?,
                    mtbf_ms: row_helpers::get(row, 5, "mttr_mtbf", "mtbf_ms")?,
                    failure_count: row_helpers::get(row, 6, "mttr_mtbf", "failure_count")?,
                });
            }
            Ok(Page::from_overfetch(results, limit))
        })
    }
}
