use serde::{Deserialize, Serialize};

/// Car movement event kinds, as persisted in `car_events.event_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CarEventKind {
    Created,
    Moved,
    Completed,
    BufferIn,
    BufferOut,
    ReworkIn,
    ReworkOut,
}

impl std::fmt::Display for CarEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Moved => "MOVED",
            Self::Completed => "COMPLETED",
            Self::BufferIn => "BUFFER_IN",
            Self::BufferOut => "BUFFER_OUT",
            Self::ReworkIn => "REWORK_IN",
            Self::ReworkOut => "REWORK_OUT",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CarEventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "MOVED" => Ok(Self::Moved),
            "COMPLETED" => Ok(Self::Completed),
            "BUFFER_IN" => Ok(Self::BufferIn),
            "BUFFER_OUT" => Ok(Self::BufferOut),
            "REWORK_IN" => Ok(Self::ReworkIn),
            "REWORK_OUT" => Ok(Self::ReworkOut),
            other => Err(format!("unknown car event kind: {other}")),
        }
    }
}

/// Stop lifecycle status, as persisted in `stop_events.status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopStatus {
    InProgress,
    Completed,
}

impl std::fmt::Display for StopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => f.write_str("IN_PROGRESS"),
            Self::Completed => f.write_str("COMPLETED"),
        }
    }
}

impl std::str::FromStr for StopStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(format!("unknown stop status: {other}")),
        }
    }
}

/// Events emitted by a simulation engine while it runs. The worker's
/// persistence sidecar writes each of these to the store, stamped with the
/// owning session id; the engine's emission order is preserved.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimEvent {
    Car {
        car_id: String,
        kind: CarEventKind,
        location: Option<String>,
        payload: Option<serde_json::Value>,
        /// Simulated time, milliseconds.
        timestamp: i64,
    },

    StopStarted {
        stop_id: String,
        location: String,
        reason: String,
        stop_type: String,
        category: String,
        severity: String,
        start_time: i64,
    },

    StopEnded {
        stop_id: String,
        end_time: i64,
        duration_ms: i64,
    },

    Buffer {
        buffer_id: String,
        capacity: u32,
        current_count: u32,
        car_ids: Vec<String>,
        status: String,
        timestamp: i64,
    },

    Snapshot {
        timestamp: i64,
        total_cars_produced: u32,
        cars_in_progress: u32,
        active_stops: u32,
        snapshot_data: serde_json::Value,
    },

    Oee {
        date: String,
        location: String,
        availability: f64,
        performance: f64,
        quality: f64,
        oee: f64,
    },

    MttrMtbf {
        date: String,
        location: String,
        mttr_ms: f64,
        mtbf_ms: f64,
        failure_count: u32,
    },

    /// Periodic clock checkpoint; lands on the session row, not an event
    /// table, and is what makes an interrupted session recoverable.
    Clock {
        simulated_timestamp: i64,
        tick: u64,
    },
}

impl SimEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Car { .. } => "car",
            Self::StopStarted { .. } => "stop_started",
            Self::StopEnded { .. } => "stop_ended",
            Self::Buffer { .. } => "buffer",
            Self::Snapshot { .. } => "snapshot",
            Self::Oee { .. } => "oee",
            Self::MttrMtbf { .. } => "mttr_mtbf",
            Self::Clock { .. } => "clock",
        }
    }
}

/// Last-known buffer occupancy handed back to an engine on recovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferRestore {
    pub buffer_id: String,
    pub capacity: u32,
    pub current_count: u32,
    pub car_ids: Vec<String>,
    pub status: String,
    pub timestamp: i64,
}

/// A stop that was still open when the orchestrator went down.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopRestore {
    pub stop_id: String,
    pub location: String,
    pub reason: String,
    pub stop_type: String,
    pub category: String,
    pub severity: String,
    pub start_time: i64,
}

/// Reconstructed world state for one interrupted session, assembled from
/// persisted rows and handed to a fresh worker with the RECOVER command.
/// Missing sub-components are None/empty — the engine restores what it can.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryPayload {
    pub simulated_timestamp: i64,
    pub current_tick: u64,
    pub plant_snapshot: Option<serde_json::Value>,
    pub buffer_states: Vec<BufferRestore>,
    pub completed_car_ids: Vec<String>,
    pub active_stops: Vec<StopRestore>,
}
