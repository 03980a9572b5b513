use serde::{Deserialize, Serialize};
use tracing::instrument;

use plantsim_core::ids::SessionId;
use plantsim_core::sim::CarEventKind;

use crate::database::Database;
use crate::error::StoreError;
use crate::{effective_limit, row_helpers, Page};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CarEventRow {
    pub id: i64,
    pub session_id: SessionId,
    pub car_id: String,
    pub event_type: CarEventKind,
    pub location: Option<String>,
    pub payload: Option<serde_json::Value>,
    /// Simulated time, milliseconds.
    pub timestamp: i64,
}

pub struct CarEventRepo {
    db: Database,
}

impl CarEventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one car movement event.
    pub fn append(
        &self,
        session_id: &SessionId,
        car_id: &str,
        kind: CarEventKind,
        location: Option<&str>,
        payload: Option<&serde_json::Value>,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        let payload_json = payload.map(serde_json::to_string).transpose()?;
        self.db.with_conn(|conn| {
            conn.execute(
                &self.db.sql(
                    "INSERT INTO car_events (session_id, car_id, event_type, location, payload, timestamp) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                ),
                rusqlite::params![
                    session_id.as_str(),
                    car_id,
                    kind.to_string(),
                    location,
                    payload_json,
                    timestamp,
                ],
            )?;
            Ok(())
        })
    }

    /// Most recent events first. The limit is clamped by the store.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(
        &self,
        session_id: &SessionId,
        limit: Option<u32>,
    ) -> Result<Page<CarEventRow>, StoreError> {
        let limit = effective_limit(limit);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&self.db.sql(
                "SELECT id, session_id, car_id, event_type, location, payload, timestamp \
                 FROM car_events WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
            ))?;
            // One row past the cap, so the flag reflects a real cut
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit + 1])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(Page::from_overfetch(results, limit))
        })
    }

    /// Distinct car ids that have a COMPLETED event — the recovery set.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn completed_car_ids(&self, session_id: &SessionId) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&self.db.sql(
                "SELECT DISTINCT car_id FROM car_events \
                 WHERE session_id = ?1 AND event_type = 'COMPLETED' ORDER BY car_id",
            ))?;
            let rows = stmt.query_map([session_id.as_str()], |row| row.get(0))?;
            rows.collect::<Result<_, _>>().map_err(StoreError::from)
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<CarEventRow, StoreError> {
    let event_type: String = row_helpers::get(row, 3, "car_events", "event_type")?;
    let payload: Option<String> = row_helpers::get_opt(row, 5, "car_events", "payload")?;
    Ok(CarEventRow {
        id: row_helpers::get(row, 0, "car_events", "id")?,
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "car_events", "session_id")?),
        car_id: row_helpers::get(row, 2, "car_events", "car_id")?,
        event_type: row_helpers::parse_enum(&event_type, "car_events", "event_type")?,
        location: row_helpers::get_opt(row, 4, "car_events", "location")?,
        payload: payload
            .map(|raw| row_helpers::parse_json(&raw, "car_events", "payload"))
            .transpose()?,
        timestamp: row_helpers::get(row, 6, "car_events", "timestamp")?,
    })
}
