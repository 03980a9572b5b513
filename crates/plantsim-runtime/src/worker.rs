//! Per-session worker: an isolated task owning one engine and one
//! persistence sidecar for its whole lifetime. Commands arrive on a typed
//! inbox; everything the worker says goes out as `PoolEvent`s. The task's
//! return value is its exit code — 0 is the cooperative-stop path the
//! supervisor's graceful flag pairs with.

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use plantsim_core::config::SimulationConfig;
use plantsim_core::ids::{SessionId, WorkerId};
use plantsim_core::messages::{PoolEvent, WorkerCommand, WorkerRunState};
use plantsim_core::sim::RecoveryPayload;
use plantsim_sim::{EngineFactory, SimEngine};
use plantsim_store::Database;

use crate::sidecar::SidecarHandle;

/// Timing knobs for one worker. Tests shrink these.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub heartbeat_interval: Duration,
    /// Pause between STATE_CHANGE(stopped) and exit, letting the outbound
    /// channel flush.
    pub flush_yield: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            flush_yield: Duration::from_millis(100),
        }
    }
}

pub(crate) struct Worker {
    session_id: SessionId,
    worker_id: WorkerId,
    db: Database,
    factory: EngineFactory,
    events: mpsc::Sender<PoolEvent>,
    settings: WorkerSettings,
}

impl Worker {
    pub(crate) fn new(
        session_id: SessionId,
        worker_id: WorkerId,
        db: Database,
        factory: EngineFactory,
        events: mpsc::Sender<PoolEvent>,
        settings: WorkerSettings,
    ) -> Self {
        Self { session_id, worker_id, db, factory, events, settings }
    }

    async fn emit(&self, event: PoolEvent) {
        if self.events.send(event).await.is_err() {
            warn!(session_id = %self.session_id, worker_id = %self.worker_id, "worker event channel closed");
        }
    }

    async fn emit_error(&self, message: String) {
        warn!(
            session_id = %self.session_id,
            worker_id = %self.worker_id,
            error = %message,
            "worker error"
        );
        self.emit(PoolEvent::Error {
            session_id: self.session_id.clone(),
            message,
            wall_timestamp: Utc::now(),
        })
        .await;
    }

    async fn emit_state(&self, state: WorkerRunState) {
        self.emit(PoolEvent::StateChange {
            session_id: self.session_id.clone(),
            state,
            wall_timestamp: Utc::now(),
        })
        .await;
    }

    /// Main loop. Runs until STOP (exit 0) or until the supervisor vanishes
    /// (exit 1, which the exit listener reports as a crash).
    pub(crate) async fn run(self, mut commands: mpsc::Receiver<WorkerCommand>) -> i32 {
        let started_at = Instant::now();
        let mut engine: Option<Box<dyn SimEngine>> = None;
        let mut sidecar: Option<SidecarHandle> = None;
        let mut running = false;
        let mut recovery_failed = false;
        let mut sim_now: i64 = 0;

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Replaced with the config-derived cadence once INIT lands
        let mut tick_timer = tokio::time::interval(Duration::from_secs(3600));
        tick_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None => {
                        // Command channel gone without a STOP: abnormal end.
                        warn!(
                            session_id = %self.session_id,
                            worker_id = %self.worker_id,
                            "command channel closed without stop"
                        );
                        if let Some(sc) = sidecar.take() {
                            sc.drain().await;
                        }
                        return 1;
                    }

                    Some(WorkerCommand::Init { config_snapshot, speed_factor }) => {
                        if engine.is_some() {
                            self.emit_error("worker already initialized".into()).await;
                            continue;
                        }
                        let mut config = SimulationConfig::from_snapshot(config_snapshot.as_deref());
                        config.speed_factor = speed_factor;
                        let mut fresh = (self.factory)(&config);
                        match fresh.init(&config) {
                            Ok(()) => {
                                sidecar = Some(SidecarHandle::spawn(self.session_id.clone(), self.db.clone()));
                                tick_timer = tokio::time::interval(config.tick_interval());
                                tick_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                                engine = Some(fresh);
                                info!(
                                    session_id = %self.session_id,
                                    worker_id = %self.worker_id,
                                    "worker initialized"
                                );
                                self.emit(PoolEvent::InitComplete {
                                    session_id: self.session_id.clone(),
                                    wall_timestamp: Utc::now(),
                                })
                                .await;
                            }
                            Err(e) => {
                                // Stay alive; the supervisor rolls back and
                                // terminates us through the graceful path.
                                self.emit_error(format!("init failed: {e}")).await;
                            }
                        }
                    }

                    Some(WorkerCommand::Recover { payload }) => match engine.as_mut() {
                        None => self.emit_error("recover before init".into()).await,
                        Some(engine) => match restore_world(engine.as_mut(), &payload) {
                            Ok(()) => {
                                recovery_failed = false;
                                sim_now = payload.simulated_timestamp;
                                info!(
                                    session_id = %self.session_id,
                                    worker_id = %self.worker_id,
                                    simulated_timestamp = payload.simulated_timestamp,
                                    tick = payload.current_tick,
                                    "world state restored"
                                );
                            }
                            Err(e) => {
                                recovery_failed = true;
                                self.emit_error(format!("recovery failed: {e}")).await;
                            }
                        },
                    },

                    Some(WorkerCommand::Start) => match engine.as_mut() {
                        None => self.emit_error("start before init".into()).await,
                        Some(_) if recovery_failed => {
                            self.emit_error("recovery failed; refusing to start".into()).await;
                        }
                        Some(engine) => match engine.start() {
                            Ok(()) => {
                                running = true;
                                self.emit_state(WorkerRunState::Running).await;
                            }
                            Err(e) => self.emit_error(format!("start failed: {e}")).await,
                        },
                    },

                    Some(WorkerCommand::Pause) => match engine.as_mut() {
                        None => self.emit_error("pause before init".into()).await,
                        Some(engine) => match engine.pause() {
                            Ok(()) => {
                                running = false;
                                self.emit_state(WorkerRunState::Paused).await;
                            }
                            Err(e) => self.emit_error(format!("pause failed: {e}")).await,
                        },
                    },

                    Some(WorkerCommand::Resume) => match engine.as_mut() {
                        None => self.emit_error("resume before init".into()).await,
                        Some(engine) => match engine.resume() {
                            Ok(()) => {
                                running = true;
                                self.emit_state(WorkerRunState::Running).await;
                            }
                            Err(e) => self.emit_error(format!("resume failed: {e}")).await,
                        },
                    },

                    Some(WorkerCommand::Stop) => {
                        running = false;
                        if let Some(engine) = engine.as_mut() {
                            if let Err(e) = engine.stop() {
                                warn!(
                                    session_id = %self.session_id,
                                    worker_id = %self.worker_id,
                                    error = %e,
                                    "engine stop failed"
                                );
                            }
                        }
                        // Drain pending persistence before the supervisor's
                        // grace window can force-terminate us.
                        if let Some(sc) = sidecar.take() {
                            sc.drain().await;
                        }
                        self.emit_state(WorkerRunState::Stopped).await;
                        tokio::time::sleep(self.settings.flush_yield).await;
                        debug!(
                            session_id = %self.session_id,
                            worker_id = %self.worker_id,
                            "worker exiting cleanly"
                        );
                        return 0;
                    }
                },

                _ = heartbeat.tick(), if engine.is_some() => {
                    self.emit(PoolEvent::Heartbeat {
                        session_id: self.session_id.clone(),
                        uptime_ms: started_at.elapsed().as_millis() as u64,
                        queue_depth: sidecar.as_ref().map_or(0, SidecarHandle::depth),
                        wall_timestamp: Utc::now(),
                    })
                    .await;
                }

                _ = tick_timer.tick(), if running => {
                    sim_now += i64::from(SimulationConfig::TICK_SIM_MS);
                    let batch = match engine.as_mut() {
                        Some(engine) => engine.tick(sim_now),
                        None => Vec::new(),
                    };
                    for event in batch {
                        if let Some(sc) = &sidecar {
                            sc.submit(event.clone());
                        }
                        self.emit(PoolEvent::Event {
                            session_id: self.session_id.clone(),
                            event,
                            wall_timestamp: Utc::now(),
                        })
                        .await;
                    }
                }
            }
        }
    }
}

/// Replay persisted world state into the engine, in dependency order:
/// completed units, then buffers, then open stops, then the plant snapshot,
/// then the clock cursor. Steps the engine has no capability for are skipped
/// silently; a failure of a supported step aborts the whole restore.
fn restore_world(
    engine: &mut dyn SimEngine,
    payload: &RecoveryPayload,
) -> Result<(), plantsim_sim::EngineError> {
    let caps = engine.capabilities();
    if caps.restore_completed_cars {
        engine.restore_completed_cars(&payload.completed_car_ids)?;
    }
    if caps.restore_buffers {
        engine.restore_buffers(&payload.buffer_states)?;
    }
    if caps.restore_stops {
        engine.restore_stops(&payload.active_stops)?;
    }
    if caps.restore_snapshot {
        if let Some(snapshot) = &payload.plant_snapshot {
            engine.restore_snapshot(snapshot)?;
        }
    }
    if caps.set_clock {
        engine.set_clock(payload.simulated_timestamp, payload.current_tick)?;
    }
    Ok(())
}
