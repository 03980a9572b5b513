use serde::{Deserialize, Serialize};
use tracing::instrument;

use plantsim_core::ids::SessionId;
use plantsim_core::sim::BufferRestore;

use crate::database::Database;
use crate::error::StoreError;
use crate::{effective_limit, row_helpers, Page};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferStateRow {
    pub id: i64,
    pub session_id: SessionId,
    pub buffer_id: String,
    pub capacity: u32,
    pub current_count: u32,
    pub car_ids: Vec<String>,
    pub status: String,
    /// Simulated time, milliseconds.
    pub timestamp: i64,
}

impl BufferStateRow {
    pub fn to_restore(&self) -> BufferRestore {
        BufferRestore {
            buffer_id: self.buffer_id.clone(),
            capacity: self.capacity,
            current_count: self.current_count,
            car_ids: self.car_ids.clone(),
            status: self.status.clone(),
            timestamp: self.timestamp,
        }
    }
}

pub struct BufferStateRepo {
    db: Database,
}

impl BufferStateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one buffer occupancy sample. `car_ids` is stored as JSON text.
    pub fn append(
        &self,
        session_id: &SessionId,
        buffer_id: &str,
        capacity: u32,
        current_count: u32,
        car_ids: &[String],
        status: &str,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        let car_ids_json = serde_json::to_string(car_ids)?;
        self.db.with_conn(|conn| {
            conn.execute(
                &self.db.sql(
                    "INSERT INTO buffer_states (session_id, buffer_id, capacity, current_count, \
                     car_ids, status, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                ),
                rusqlite::params![
                    session_id.as_str(),
                    buffer_id,
                    capacity,
                    current_count,
                    car_ids_json,
                    status,
                    timestamp,
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent samples first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(
        &self,
        session_id: &SessionId,
        limit: Option<u32>,
    ) -> Result<Page<BufferStateRow>, StoreError> {
        let limit = effective_limit(limit);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&self.db.sql(
                "SELECT id, session_id, buffer_id, capacity, current_count, car_ids, status, timestamp \
                 FROM buffer_states WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
            ))?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit + 1])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_buffer(row)?);
            }
            Ok(Page::from_overfetch(results, limit))
        })
    }

    /// Latest sample per buffer: max timestamp, ties broken by larger id
    /// (last writer wins). The recovery view of buffer occupancy.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn latest_per_buffer(&self, session_id: &SessionId) -> Result<Vec<BufferStateRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&self.db.sql(
                "SELECT id, session_id, buffer_id, capacity, current_count, car_ids, status, timestamp \
                 FROM buffer_states b \
                 WHERE session_id = ?1 AND id = ( \
                     SELECT b2.id FROM buffer_states b2 \
                     WHERE b2.session_id = ?1 AND b2.buffer_id = b.buffer_id \
                     ORDER BY b2.timestamp DESC, b2.id DESC LIMIT 1) \
                 ORDER BY buffer_id",
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_buffer(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_buffer(row: &rusqlite::Row<'_>) -> Result<BufferStateRow, StoreError> {
    let car_ids_raw: String = row_helpers::get(row, 5, "buffer_states", "car_ids")?;
    Ok(BufferStateRow {
        id: row_helpers::get(row, 0, "buffer_states", "id")?,
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "buffer_states", "session_id")?),
        buffer_id: row_helpers::get(row, 2, "buffer_states", "buffer_id")?,
        capacity: row_helpers::get(row, 3, "buffer_states", "capacity")?,
        current_count: row_helpers::get(row, 4, "buffer_states", "current_count")?,
        car_ids: row_helpers::parse_string_array(&car_ids_raw, "buffer_states", "car_ids")?,
        status: row_helpers::get(row, 6, "buffer_states", "status")?,
        timestamp: row_helpers::get(row, 7, "buffer_states", "timestamp")?,
    })
}
