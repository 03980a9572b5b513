pub mod error;
pub mod line;
pub mod mock;

use std::sync::Arc;

use plantsim_core::config::SimulationConfig;
use plantsim_core::sim::{BufferRestore, SimEvent, StopRestore};

pub use error::EngineError;
pub use line::LineEngine;

/// Which optional restore entry points an engine actually implements.
/// A cleared flag means the orchestrator skips that restore step silently;
/// it is never an error for a capability to be absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineCapabilities {
    pub restore_completed_cars: bool,
    pub restore_buffers: bool,
    pub restore_stops: bool,
    pub restore_snapshot: bool,
    pub set_clock: bool,
}

impl EngineCapabilities {
    /// Everything supported — what a full-featured engine reports.
    pub fn all() -> Self {
        Self {
            restore_completed_cars: true,
            restore_buffers: true,
            restore_stops: true,
            restore_snapshot: true,
            set_clock: true,
        }
    }
}

/// One simulation runtime, owned by exactly one worker for its lifetime.
///
/// The command surface mirrors the worker's command set; `tick` is how the
/// worker drives simulated time forward and drains the engine's events. The
/// restore methods have default no-op bodies — implementations opt in by
/// setting the matching capability flag, and the worker only calls entry
/// points whose flag is set.
pub trait SimEngine: Send {
    fn init(&mut self, config: &SimulationConfig) -> Result<(), EngineError>;
    fn start(&mut self) -> Result<(), EngineError>;
    fn pause(&mut self) -> Result<(), EngineError>;
    fn resume(&mut self) -> Result<(), EngineError>;
    fn stop(&mut self) -> Result<(), EngineError>;

    /// Advance one tick of simulated time and return the events it produced.
    /// `sim_now_ms` is the simulated clock after the advance.
    fn tick(&mut self, sim_now_ms: i64) -> Vec<SimEvent>;

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }

    fn restore_completed_cars(&mut self, _ids: &[String]) -> Result<(), EngineError> {
        Ok(())
    }

    fn restore_buffers(&mut self, _buffers: &[BufferRestore]) -> Result<(), EngineError> {
        Ok(())
    }

    fn restore_stops(&mut self, _stops: &[StopRestore]) -> Result<(), EngineError> {
        Ok(())
    }

    fn restore_snapshot(&mut self, _snapshot: &serde_json::Value) -> Result<(), EngineError> {
        Ok(())
    }

    fn set_clock(&mut self, _simulated_timestamp: i64, _tick: u64) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Builds a fresh engine for one session. The orchestrator holds one factory
/// and calls it once per spawned worker.
pub type EngineFactory = Arc<dyn Fn(&SimulationConfig) -> Box<dyn SimEngine> + Send + Sync>;

/// Factory for the built-in line engine.
pub fn line_engine_factory() -> EngineFactory {
    Arc::new(|config| Box::new(LineEngine::new(config.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capabilities_are_empty() {
        let caps = EngineCapabilities::default();
        assert!(!caps.restore_buffers);
        assert!(!caps.set_clock);
    }

    #[test]
    fn all_capabilities_set() {
        let caps = EngineCapabilities::all();
        assert!(caps.restore_completed_cars);
        assert!(caps.restore_buffers);
        assert!(caps.restore_stops);
        assert!(caps.restore_snapshot);
        assert!(caps.set_clock);
    }

    #[test]
    fn factory_builds_distinct_engines() {
        let factory = line_engine_factory();
        let config = SimulationConfig::default();
        let mut a = factory(&config);
        let mut b = factory(&config);
        a.init(&config).unwrap();
        b.init(&config).unwrap();
    }
}
