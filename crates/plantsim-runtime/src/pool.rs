//! Worker supervision: one live handle per session, a process-wide event
//! bus, and the two crash-detection paths (exit listener, heartbeat
//! monitor).
//!
//! The graceful-termination handshake is order-sensitive: set the graceful
//! flag, then remove the handle from the live map, then send STOP. Any other
//! ordering lets the exit listener read a stale handle and either
//! double-report or miss a crash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

use plantsim_core::ids::{SessionId, WorkerId};
use plantsim_core::messages::{CrashReason, PoolEvent, WorkerCommand, WorkerRunState};
use plantsim_sim::EngineFactory;
use plantsim_store::Database;

use crate::error::LifecycleError;
use crate::worker::{Worker, WorkerSettings};

/// Supervisor-side view of a worker's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    Initializing,
    Ready,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    /// States the heartbeat monitor leaves alone: not yet beating, or
    /// already on the way out.
    fn exempt_from_heartbeat(&self) -> bool {
        matches!(self, Self::Initializing | Self::Stopping)
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Cadence of the heartbeat monitor scan.
    pub monitor_interval: Duration,
    /// A worker silent for longer than this is declared crashed.
    pub heartbeat_timeout: Duration,
    /// How long terminate waits for a voluntary exit before aborting.
    pub stop_grace: Duration,
    pub event_bus_capacity: usize,
    pub worker: WorkerSettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            stop_grace: Duration::from_secs(1),
            event_bus_capacity: 1024,
            worker: WorkerSettings::default(),
        }
    }
}

pub struct WorkerHandle {
    /// Incarnation id, distinct per spawn even for the same session.
    worker_id: WorkerId,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    spawned_at: Instant,
    last_heartbeat: Mutex<Instant>,
    status: Mutex<WorkerStatus>,
    last_error: Mutex<Option<String>>,
    graceful: AtomicBool,
    abort: AbortHandle,
    exited: watch::Receiver<bool>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }
}

pub struct WorkerPool {
    workers: Arc<DashMap<SessionId, Arc<WorkerHandle>>>,
    bus: broadcast::Sender<PoolEvent>,
    db: Database,
    factory: EngineFactory,
    config: PoolConfig,
    monitor: Mutex<Option<AbortHandle>>,
}

impl WorkerPool {
    /// Create the pool and start its heartbeat monitor.
    pub fn new(db: Database, factory: EngineFactory, config: PoolConfig) -> Arc<Self> {
        let (bus, _) = broadcast::channel(config.event_bus_capacity);
        let pool = Arc::new(Self {
            workers: Arc::new(DashMap::new()),
            bus,
            db,
            factory,
            config,
            monitor: Mutex::new(None),
        });

        let monitor = tokio::spawn(heartbeat_monitor(Arc::downgrade(&pool)));
        *pool.monitor.lock() = Some(monitor.abort_handle());
        pool
    }

    /// Subscribe to every event flowing through the pool.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.bus.subscribe()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_status(&self, session_id: &SessionId) -> Option<WorkerStatus> {
        self.handle(session_id).map(|h| h.status())
    }

    /// Incarnation id of the live worker for this session, if any.
    pub fn worker_id(&self, session_id: &SessionId) -> Option<WorkerId> {
        self.handle(session_id).map(|h| h.worker_id.clone())
    }

    fn handle(&self, session_id: &SessionId) -> Option<Arc<WorkerHandle>> {
        self.workers.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Create an isolated worker for the session and register its handle as
    /// initializing. Returns immediately; INIT has not happened yet.
    pub fn spawn(&self, session_id: &SessionId) -> Result<(), LifecycleError> {
        use dashmap::mapref::entry::Entry;

        match self.workers.entry(session_id.clone()) {
            Entry::Occupied(_) => Err(LifecycleError::WorkerExists),
            Entry::Vacant(slot) => {
                let worker_id = WorkerId::new();
                let (cmd_tx, cmd_rx) = mpsc::channel(64);
                let (evt_tx, evt_rx) = mpsc::channel(256);
                let (exited_tx, exited_rx) = watch::channel(false);

                let worker = Worker::new(
                    session_id.clone(),
                    worker_id.clone(),
                    self.db.clone(),
                    Arc::clone(&self.factory),
                    evt_tx,
                    self.config.worker.clone(),
                );
                // Everything logged inside the worker task inherits both
                // ids through this span
                let span = tracing::info_span!(
                    "worker",
                    session_id = %session_id,
                    worker_id = %worker_id,
                );
                let join: JoinHandle<i32> = tokio::spawn(worker.run(cmd_rx).instrument(span));

                let handle = Arc::new(WorkerHandle {
                    worker_id: worker_id.clone(),
                    cmd_tx,
                    spawned_at: Instant::now(),
                    last_heartbeat: Mutex::new(Instant::now()),
                    status: Mutex::new(WorkerStatus::Initializing),
                    last_error: Mutex::new(None),
                    graceful: AtomicBool::new(false),
                    abort: join.abort_handle(),
                    exited: exited_rx,
                });
                slot.insert(Arc::clone(&handle));

                tokio::spawn(forward_events(evt_rx, Arc::clone(&handle), self.bus.clone()));
                tokio::spawn(exit_listener(
                    join,
                    session_id.clone(),
                    Arc::clone(&self.workers),
                    self.bus.clone(),
                    exited_tx,
                ));

                info!(session_id = %session_id, worker_id = %worker_id, "worker spawned");
                Ok(())
            }
        }
    }

    /// Best-effort enqueue. Never waits on the worker making progress.
    pub fn send(&self, session_id: &SessionId, command: WorkerCommand) -> Result<(), LifecycleError> {
        let handle = self.handle(session_id).ok_or(LifecycleError::WorkerUnavailable)?;
        handle.cmd_tx.try_send(command).map_err(|e| {
            warn!(session_id = %session_id, error = %e, "command enqueue failed");
            LifecycleError::WorkerUnavailable
        })
    }

    /// Block until INIT_COMPLETE or ERROR for this session, or until the
    /// timeout fires.
    pub async fn wait_for_init(
        &self,
        session_id: &SessionId,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let handle = self.handle(session_id).ok_or(LifecycleError::WorkerUnavailable)?;
        let mut rx = self.bus.subscribe();

        // Status is updated before the broadcast, so checking after
        // subscribing closes the missed-event window.
        if init_done(handle.status()) {
            return Ok(());
        }
        if let Some(error) = handle.last_error.lock().clone() {
            return Err(LifecycleError::InitFailed(error));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .map_err(|_| LifecycleError::InitFailed("initialization timed out".into()))?;
            match event {
                Ok(PoolEvent::InitComplete { session_id: sid, .. }) if sid == *session_id => {
                    return Ok(());
                }
                Ok(PoolEvent::Error { session_id: sid, message, .. }) if sid == *session_id => {
                    return Err(LifecycleError::InitFailed(message));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event bus lagged while waiting for init");
                    if init_done(handle.status()) {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(LifecycleError::WorkerUnavailable);
                }
            }
        }
    }

    /// Block until the worker reports the given run state, or an ERROR, or
    /// the timeout. Used after START (and after RECOVER + START) to confirm
    /// the session actually came up.
    pub async fn wait_for_state(
        &self,
        session_id: &SessionId,
        state: WorkerRunState,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let handle = self.handle(session_id).ok_or(LifecycleError::WorkerUnavailable)?;
        let mut rx = self.bus.subscribe();

        let target = match state {
            WorkerRunState::Running => WorkerStatus::Running,
            WorkerRunState::Paused => WorkerStatus::Paused,
            WorkerRunState::Stopped => WorkerStatus::Stopped,
        };
        if handle.status() == target {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv()).await.map_err(|_| {
                LifecycleError::InitFailed(format!("timed out waiting for state {state}"))
            })?;
            match event {
                Ok(PoolEvent::StateChange { session_id: sid, state: seen, .. })
                    if sid == *session_id && seen == state =>
                {
                    return Ok(());
                }
                Ok(PoolEvent::Error { session_id: sid, message, .. }) if sid == *session_id => {
                    return Err(LifecycleError::RecoveryFailed(message));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event bus lagged while waiting for state");
                    if handle.status() == target {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(LifecycleError::WorkerUnavailable);
                }
            }
        }
    }

    /// Graceful shutdown handshake. Idempotent: terminating an absent
    /// session is a no-op returning false.
    pub async fn terminate(&self, session_id: &SessionId) -> bool {
        let Some(handle) = self.handle(session_id) else {
            return false;
        };

        // 1. Flag the shutdown as intentional before anything observable.
        handle.graceful.store(true, Ordering::SeqCst);
        *handle.status.lock() = WorkerStatus::Stopping;

        // 2. Remove the handle before the worker can possibly exit, so the
        //    exit listener never sees a stale entry.
        self.workers.remove(session_id);

        // 3. Ask politely, then force.
        let _ = handle.cmd_tx.try_send(WorkerCommand::Stop);

        let mut exited = handle.exited.clone();
        let voluntary = async {
            loop {
                if *exited.borrow_and_update() {
                    return;
                }
                if exited.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(self.config.stop_grace, voluntary).await.is_err() {
            warn!(
                session_id = %session_id,
                worker_id = %handle.worker_id,
                "worker missed the stop grace period, aborting"
            );
            handle.abort.abort();
        } else {
            debug!(session_id = %session_id, worker_id = %handle.worker_id, "worker exited voluntarily");
        }
        true
    }

    /// Terminate every worker concurrently and stop the heartbeat monitor.
    pub async fn terminate_all(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        let ids: Vec<SessionId> = self.workers.iter().map(|entry| entry.key().clone()).collect();
        let count = ids.len();
        futures::future::join_all(ids.iter().map(|id| self.terminate(id))).await;
        info!(terminated = count, "worker pool shut down");
    }
}

fn init_done(status: WorkerStatus) -> bool {
    matches!(status, WorkerStatus::Ready | WorkerStatus::Running | WorkerStatus::Paused)
}

/// One forwarder per worker: applies each event to the handle, then fans it
/// out on the bus. Handle updates happen first so bus subscribers can trust
/// the handle state they observe afterwards.
async fn forward_events(
    mut rx: mpsc::Receiver<PoolEvent>,
    handle: Arc<WorkerHandle>,
    bus: broadcast::Sender<PoolEvent>,
) {
    while let Some(event) = rx.recv().await {
        match &event {
            PoolEvent::Heartbeat { .. } => {
                *handle.last_heartbeat.lock() = Instant::now();
            }
            PoolEvent::InitComplete { .. } => {
                *handle.status.lock() = WorkerStatus::Ready;
            }
            PoolEvent::StateChange { state, .. } => {
                *handle.status.lock() = match state {
                    WorkerRunState::Running => WorkerStatus::Running,
                    WorkerRunState::Paused => WorkerStatus::Paused,
                    WorkerRunState::Stopped => WorkerStatus::Stopped,
                };
            }
            PoolEvent::Error { message, .. } => {
                *handle.last_error.lock() = Some(message.clone());
            }
            _ => {}
        }
        // No receivers just means nobody is listening right now
        let _ = bus.send(event);
    }
}

/// Watches one worker task for exit. Reports a crash exactly when the
/// handle is still present (terminate removes it first) and the graceful
/// flag was never set.
async fn exit_listener(
    join: JoinHandle<i32>,
    session_id: SessionId,
    workers: Arc<DashMap<SessionId, Arc<WorkerHandle>>>,
    bus: broadcast::Sender<PoolEvent>,
    exited_tx: watch::Sender<bool>,
) {
    let result = join.await;
    let _ = exited_tx.send(true);

    let exit_code = match &result {
        Ok(code) => Some(*code),
        // Aborted by terminate, or panicked; no code either way
        Err(_) => None,
    };

    let Some((_, handle)) = workers.remove(&session_id) else {
        debug!(session_id = %session_id, "worker exit after handle removal");
        return;
    };

    if handle.graceful.load(Ordering::SeqCst) {
        debug!(session_id = %session_id, worker_id = %handle.worker_id, "graceful worker exit");
        return;
    }

    warn!(
        session_id = %session_id,
        worker_id = %handle.worker_id,
        exit_code = ?exit_code,
        "worker crashed"
    );
    let _ = bus.send(PoolEvent::WorkerCrashed {
        session_id,
        exit_code,
        reason: CrashReason::Exit,
        wall_timestamp: Utc::now(),
    });
}

/// Liveness net for workers that hang without exiting. Exit detection is
/// preferred; this path only fires when heartbeats stall.
async fn heartbeat_monitor(pool: Weak<WorkerPool>) {
    let Some(interval_duration) = pool.upgrade().map(|p| p.config.monitor_interval) else {
        return;
    };
    let mut interval = tokio::time::interval(interval_duration);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let Some(pool) = pool.upgrade() else {
            return;
        };

        let stale: Vec<(SessionId, WorkerId)> = pool
            .workers
            .iter()
            .filter(|entry| {
                let handle = entry.value();
                !handle.status().exempt_from_heartbeat()
                    && handle.last_heartbeat.lock().elapsed() > pool.config.heartbeat_timeout
            })
            .map(|entry| (entry.key().clone(), entry.value().worker_id.clone()))
            .collect();

        for (session_id, worker_id) in stale {
            warn!(
                session_id = %session_id,
                worker_id = %worker_id,
                "heartbeat timeout, declaring worker crashed"
            );
            let _ = pool.bus.send(PoolEvent::WorkerCrashed {
                session_id: session_id.clone(),
                exit_code: None,
                reason: CrashReason::HeartbeatTimeout,
                wall_timestamp: Utc::now(),
            });
            // terminate sets the graceful flag, so the exit listener stays
            // quiet and this remains the single report
            pool.terminate(&session_id).await;
        }
    }
}
