//! Scripted engine for deterministic worker and pool tests without a real
//! simulation.

use std::sync::Arc;

use parking_lot::Mutex;

use plantsim_core::config::SimulationConfig;
use plantsim_core::sim::{BufferRestore, SimEvent, StopRestore};

use crate::error::EngineError;
use crate::{EngineCapabilities, SimEngine};

#[derive(Default)]
struct ProbeState {
    commands: Vec<String>,
    config: Option<SimulationConfig>,
    restored_completed: Vec<String>,
    restored_buffers: Vec<BufferRestore>,
    restored_stops: Vec<StopRestore>,
    restored_snapshot: Option<serde_json::Value>,
    clock: Option<(i64, u64)>,
    ticks: u64,
}

/// Shared view into a scripted engine's recorded interactions. Clone it
/// before handing the engine to a worker; assertions read it afterwards.
#[derive(Clone, Default)]
pub struct EngineProbe(Arc<Mutex<ProbeState>>);

impl EngineProbe {
    pub fn commands(&self) -> Vec<String> {
        self.0.lock().commands.clone()
    }

    pub fn config(&self) -> Option<SimulationConfig> {
        self.0.lock().config.clone()
    }

    pub fn restored_completed(&self) -> Vec<String> {
        self.0.lock().restored_completed.clone()
    }

    pub fn restored_buffers(&self) -> Vec<BufferRestore> {
        self.0.lock().restored_buffers.clone()
    }

    pub fn restored_stops(&self) -> Vec<StopRestore> {
        self.0.lock().restored_stops.clone()
    }

    pub fn restored_snapshot(&self) -> Option<serde_json::Value> {
        self.0.lock().restored_snapshot.clone()
    }

    pub fn clock(&self) -> Option<(i64, u64)> {
        self.0.lock().clock
    }

    pub fn ticks(&self) -> u64 {
        self.0.lock().ticks
    }
}

/// Engine that replays a pre-programmed tape of events, one batch per tick,
/// and records every command it receives.
pub struct ScriptedEngine {
    script: Vec<Vec<SimEvent>>,
    cursor: usize,
    caps: EngineCapabilities,
    fail_init: Option<String>,
    fail_restore: Option<&'static str>,
    panic_on_tick: Option<u64>,
    probe: EngineProbe,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            script: Vec::new(),
            cursor: 0,
            caps: EngineCapabilities::all(),
            fail_init: None,
            fail_restore: None,
            panic_on_tick: None,
            probe: EngineProbe::default(),
        }
    }

    /// Events to yield per tick, in order. Ticks past the end yield nothing.
    pub fn with_script(mut self, script: Vec<Vec<SimEvent>>) -> Self {
        self.script = script;
        self
    }

    pub fn with_capabilities(mut self, caps: EngineCapabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Make `init` fail with the given message.
    pub fn with_init_failure(mut self, message: &str) -> Self {
        self.fail_init = Some(message.to_string());
        self
    }

    /// Make the named restore step ("completed_cars", "buffers", "stops",
    /// "snapshot", "clock") fail.
    pub fn with_restore_failure(mut self, step: &'static str) -> Self {
        self.fail_restore = Some(step);
        self
    }

    /// Panic on the n-th tick (1-based) — simulates an engine taking its
    /// worker down mid-run.
    pub fn with_panic_on_tick(mut self, n: u64) -> Self {
        self.panic_on_tick = Some(n);
        self
    }

    pub fn probe(&self) -> EngineProbe {
        self.probe.clone()
    }

    fn record(&self, command: &str) {
        self.probe.0.lock().commands.push(command.to_string());
    }

    fn restore_guard(&self, step: &'static str) -> Result<(), EngineError> {
        if self.fail_restore == Some(step) {
            return Err(EngineError::RestoreFailed {
                step,
                detail: "scripted failure".into(),
            });
        }
        Ok(())
    }
}

impl SimEngine for ScriptedEngine {
    fn init(&mut self, config: &SimulationConfig) -> Result<(), EngineError> {
        self.record("init");
        self.probe.0.lock().config = Some(config.clone());
        match &self.fail_init {
            Some(message) => Err(EngineError::InitFailed(message.clone())),
            None => Ok(()),
        }
    }

    fn start(&mut self) -> Result<(), EngineError> {
        self.record("start");
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        self.record("pause");
        Ok(())
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        self.record("resume");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.record("stop");
        Ok(())
    }

    fn tick(&mut self, _sim_now_ms: i64) -> Vec<SimEvent> {
        let ticks = {
            let mut state = self.probe.0.lock();
            state.ticks += 1;
            state.ticks
        };
        if self.panic_on_tick == Some(ticks) {
            panic!("scripted engine crash on tick {ticks}");
        }
        let batch = self.script.get(self.cursor).cloned().unwrap_or_default();
        self.cursor += 1;
        batch
    }

    fn capabilities(&self) -> EngineCapabilities {
        self.caps
    }

    fn restore_completed_cars(&mut self, ids: &[String]) -> Result<(), EngineError> {
        self.record("restore:completed_cars");
        self.restore_guard("completed_cars")?;
        self.probe.0.lock().restored_completed = ids.to_vec();
        Ok(())
    }

    fn restore_buffers(&mut self, buffers: &[BufferRestore]) -> Result<(), EngineError> {
        self.record("restore:buffers");
        self.restore_guard("buffers")?;
        self.probe.0.lock().restored_buffers = buffers.to_vec();
        Ok(())
    }

    fn restore_stops(&mut self, stops: &[StopRestore]) -> Result<(), EngineError> {
        self.record("restore:stops");
        self.restore_guard("stops")?;
        self.probe.0.lock().restored_stops = stops.to_vec();
        Ok(())
    }

    fn restore_snapshot(&mut self, snapshot: &serde_json::Value) -> Result<(), EngineError> {
        self.record("restore:snapshot");
        self.restore_guard("snapshot")?;
        self.probe.0.lock().restored_snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn set_clock(&mut self, simulated_timestamp: i64, tick: u64) -> Result<(), EngineError> {
        self.record("restore:clock");
        self.restore_guard("clock")?;
        self.probe.0.lock().clock = Some((simulated_timestamp, tick));
        Ok(())
    }
}
