use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-session simulation parameters, captured as a JSON snapshot when the
/// session is created. Later edits to the source config never reach a live
/// session — the snapshot is what the worker runs with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Simulated milliseconds per wall-clock millisecond.
    pub speed_factor: u32,
    /// Session lifetime in days; drives `expires_at`.
    pub duration_days: u32,
    /// Number of stations on the line.
    pub station_count: usize,
    /// Capacity of each inter-station buffer.
    pub buffer_capacity: u32,
    /// Base cycle time per station, in simulated milliseconds.
    pub cycle_time_ms: u64,
    /// Probability per station-cycle of a stop being injected.
    pub stop_probability: f64,
    /// Seed for the engine's stop/duration randomness.
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            speed_factor: 60,
            duration_days: 7,
            station_count: 4,
            buffer_capacity: 10,
            cycle_time_ms: 60_000,
            stop_probability: 0.02,
            seed: 0,
        }
    }
}

impl SimulationConfig {
    /// Parse a config snapshot. A malformed snapshot is logged and replaced
    /// with the defaults — a bad config must never kill a worker.
    pub fn from_snapshot(snapshot: Option<&str>) -> Self {
        match snapshot {
            None => Self::default(),
            Some(raw) => match serde_json::from_str(raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "invalid config snapshot, using defaults");
                    Self::default()
                }
            },
        }
    }

    /// Wall-clock duration of one simulation tick for this speed factor.
    /// One tick advances simulated time by `tick_sim_ms`.
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(u64::from(Self::TICK_SIM_MS) / u64::from(self.speed_factor.max(1)))
    }

    /// Simulated milliseconds covered by one tick.
    pub const TICK_SIM_MS: u32 = 60_000;
}
