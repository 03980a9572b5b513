use serde::{Deserialize, Serialize};
use tracing::instrument;

use plantsim_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::{effective_limit, row_helpers, Page};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlantSnapshotRow {
    pub id: i64,
    pub session_id: SessionId,
    /// Simulated time, milliseconds.
    pub timestamp: i64,
    pub total_cars_produced: u32,
    pub cars_in_progress: u32,
    pub active_stops: u32,
    /// Opaque engine state blob.
    pub snapshot_data: serde_json::Value,
}

pub struct PlantSnapshotRepo {
    db: Database,
}

impl PlantSnapshotRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn append(
        &self,
        session_id: &SessionId,
        timestamp: i64,
        total_cars_produced: u32,
        cars_in_progress: u32,
        active_stops: u32,
        snapshot_data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(snapshot_data)?;
        self.db.with_conn(|conn| {
            conn.execute(
                &self.db.sql(
                    "INSERT INTO plant_snapshots (session_id, timestamp, total_cars_produced, \
                     cars_in_progress, active_stops, snapshot_data) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                ),
                rusqlite::params![
                    session_id.as_str(),
                    timestamp,
                    total_cars_produced,
                    cars_in_progress,
                    active_stops,
                    data,
                ],
            )?;
            Ok(())
        })
    }

    /// Latest snapshot: max timestamp, ties broken by larger id.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn latest(&self, session_id: &SessionId) -> Result<Option<PlantSnapshotRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&self.db.sql(
                "SELECT id, session_id, timestamp, total_cars_produced, cars_in_progress, \
                 active_stops, snapshot_data FROM plant_snapshots \
                 WHERE session_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_snapshot(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Most recent snapshots first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(
        &self,
        session_id: &SessionId,
        limit: Option<u32>,
    ) -> Result<Page<PlantSnapshotRow>, StoreError> {
        let limit = effective_limit(limit);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&self.db.sql(
                "SELECT id, session_id, timestamp, total_cars_produced, cars_in_progress, \
                 active_stops, snapshot_data FROM plant_snapshots \
                 WHERE session_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            ))?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit + 1])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_snapshot(row)?);
            }
            Ok(Page::from_overfetch(results, limit))
        })
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> Result<PlantSnapshotRow, StoreError> {
    let data_raw: String = row_helpers::get(row, 6, "plant_snapshots", "snapshot_data")?;
    Ok(PlantSnapshotRow {
        id: row_helpers::get(row, 0, "plant_snapshots", "id")?,
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "plant_snapshots", "session_id")?),
        timestamp: row_helpers::get(row, 2, "plant_snapshots", "timestamp")?,
        total_cars_produced: row_helpers::get(row, 3, "plant_snapshots", "total_cars_produced")?,
        cars_in_progress: row_helpers::get(row, 4, "plant_snapshots", "cars_in_progress")?,
        active_stops: row_helpers::get(row, 5, "plant_snapshots", "active_stops")?,
        snapshot_data: row_helpers::parse_json(&data_raw, "plant_snapshots", "snapshot_data")?,
    })
}
