use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::sim::{RecoveryPayload, SimEvent};

/// Commands routed from the supervisor into a worker's inbox. Routing is by
/// session id at the pool boundary; within the channel the pairing is fixed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Bring up the engine from the session's config snapshot. The session
    /// row's speed factor is authoritative and overrides the snapshot's.
    Init {
        config_snapshot: Option<String>,
        speed_factor: u32,
    },
    Start,
    Pause,
    Resume,
    Stop,
    /// Replay persisted world state into the engine. Must precede Start.
    Recover { payload: RecoveryPayload },
}

impl WorkerCommand {
    pub fn command_type(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Recover { .. } => "recover",
        }
    }
}

/// Run state a worker reports through STATE_CHANGE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRunState {
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for WorkerRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Why a crash report was raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashReason {
    /// The worker task exited (nonzero code or panic) without a graceful stop.
    Exit,
    /// The worker stopped heartbeating but never exited.
    HeartbeatTimeout,
}

/// Events flowing up from workers through the pool onto the process-wide bus.
/// Everything a worker says arrives here; WORKER_CRASHED is raised by the
/// pool itself, never by a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    #[serde(rename = "init_complete")]
    InitComplete {
        session_id: SessionId,
        wall_timestamp: DateTime<Utc>,
    },

    #[serde(rename = "heartbeat")]
    Heartbeat {
        session_id: SessionId,
        uptime_ms: u64,
        /// Pending entries in the persistence sidecar's queue.
        queue_depth: usize,
        wall_timestamp: DateTime<Utc>,
    },

    #[serde(rename = "event")]
    Event {
        session_id: SessionId,
        event: SimEvent,
        wall_timestamp: DateTime<Utc>,
    },

    #[serde(rename = "state_change")]
    StateChange {
        session_id: SessionId,
        state: WorkerRunState,
        wall_timestamp: DateTime<Utc>,
    },

    #[serde(rename = "error")]
    Error {
        session_id: SessionId,
        message: String,
        wall_timestamp: DateTime<Utc>,
    },

    #[serde(rename = "worker_crashed")]
    WorkerCrashed {
        session_id: SessionId,
        exit_code: Option<i32>,
        reason: CrashReason,
        wall_timestamp: DateTime<Utc>,
    },
}

impl PoolEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::InitComplete { session_id, .. }
            | Self::Heartbeat { session_id, .. }
            | Self::Event { session_id, .. }
            | Self::StateChange { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::WorkerCrashed { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InitComplete { .. } => "init_complete",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Event { .. } => "event",
            Self::StateChange { .. } => "state_change",
            Self::Error { .. } => "error",
            Self::WorkerCrashed { .. } => "worker_crashed",
        }
    }

    pub fn wall_timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::InitComplete { wall_timestamp, .. }
            | Self::Heartbeat { wall_timestamp, .. }
            | Self::Event { wall_timestamp, .. }
            | Self::StateChange { wall_timestamp, .. }
            | Self::Error { wall_timestamp, .. }
            | Self::WorkerCrashed { wall_timestamp, .. } => *wall_timestamp,
        }
    }
}
