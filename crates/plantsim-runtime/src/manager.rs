//! The session state machine: admission control, lifecycle transitions, the
//! expiration scheduler, and crash handling. The store is authoritative for
//! every decision; the pool's handle map is only a cache of what is live
//! right now.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use plantsim_core::ids::{SessionId, UserId};
use plantsim_core::messages::{PoolEvent, WorkerCommand, WorkerRunState};
use plantsim_core::sim::RecoveryPayload;
use plantsim_store::sessions::{NewSession, SessionRepo, SessionRow, SessionStatus};
use plantsim_store::Database;

use crate::error::{CapScope, LifecycleError};
use crate::pool::WorkerPool;
use crate::recovery::{RecoveryService, RecoverySummary};

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub max_global: u32,
    pub max_per_user: u32,
    pub default_duration_days: u32,
    pub default_speed_factor: u32,
    /// Bound on INIT and on the post-START state confirmation.
    pub init_timeout: Duration,
    pub expiration_scan_interval: Duration,
    pub stale_interrupted_age: chrono::Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_global: 20,
            max_per_user: 2,
            default_duration_days: 7,
            default_speed_factor: 60,
            init_timeout: Duration::from_secs(30),
            expiration_scan_interval: Duration::from_secs(60),
            stale_interrupted_age: chrono::Duration::hours(24),
        }
    }
}

/// Caller-supplied fields for a new session.
#[derive(Clone, Debug, Default)]
pub struct CreateSession {
    pub name: Option<String>,
    pub config_id: Option<plantsim_core::ids::ConfigId>,
    pub config_snapshot: Option<String>,
    pub duration_days: Option<u32>,
    pub speed_factor: Option<u32>,
}

/// The control surface the server talks to. One production implementation
/// (`SessionManager`); tests swap in mocks.
#[async_trait]
pub trait SessionOrchestrator: Send + Sync {
    fn create(&self, user_id: &UserId, params: CreateSession) -> Result<SessionRow, LifecycleError>;
    async fn start(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError>;
    async fn pause(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError>;
    async fn resume(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError>;
    async fn stop(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError>;
    async fn delete(&self, session_id: &SessionId, user_id: &UserId) -> Result<(), LifecycleError>;
    fn list(&self, user_id: &UserId) -> Result<Vec<SessionRow>, LifecycleError>;
    fn get(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError>;
    async fn recover(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError>;
    async fn discard(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError>;
    fn recovery_summary(&self) -> Option<RecoverySummary>;
    fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent>;
}

pub struct SessionManager {
    sessions: SessionRepo,
    pool: Arc<WorkerPool>,
    recovery: RecoveryService,
    config: ManagerConfig,
    last_summary: Mutex<Option<RecoverySummary>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(db: Database, pool: Arc<WorkerPool>, config: ManagerConfig) -> Arc<Self> {
        let recovery = RecoveryService::new(db.clone(), config.stale_interrupted_age);
        Arc::new(Self {
            sessions: SessionRepo::new(db),
            pool,
            recovery,
            config,
            last_summary: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Run startup reconciliation, then start the crash consumer and the
    /// expiration scheduler. Must complete before any request is admitted:
    /// admission counts must never observe rows a dead process left live.
    pub async fn initialize(self: &Arc<Self>) -> Result<RecoverySummary, LifecycleError> {
        let summary = self.recovery.reconcile_on_startup(Utc::now())?;
        *self.last_summary.lock() = Some(summary.clone());

        tokio::spawn(crash_consumer(
            Arc::downgrade(self),
            self.pool.subscribe(),
            self.shutdown.clone(),
        ));
        tokio::spawn(expiration_loop(Arc::downgrade(self), self.shutdown.clone()));

        info!(
            interrupted = summary.interrupted_count,
            "session manager initialized"
        );
        Ok(summary)
    }

    /// Stop background tasks and terminate all workers. Sessions stay
    /// {running, paused} in the store on purpose: the next startup turns
    /// them into interrupted.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.terminate_all().await;
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    fn check_admission(&self, user_id: &UserId) -> Result<(), LifecycleError> {
        // Both caps read the store, never the handle map: after a restart
        // the map is empty while the table still knows the truth.
        if self.sessions.count_active_for_user(user_id)? >= self.config.max_per_user {
            return Err(LifecycleError::CapExceeded { scope: CapScope::PerUser });
        }
        if self.sessions.count_active()? >= self.config.max_global {
            return Err(LifecycleError::CapExceeded { scope: CapScope::Global });
        }
        Ok(())
    }

    /// Spawn, INIT, optionally RECOVER, then START and confirm the worker
    /// reports running. Any failure tears the worker down and leaves the
    /// session row untouched.
    async fn bring_up(
        &self,
        session: &SessionRow,
        payload: Option<RecoveryPayload>,
    ) -> Result<(), LifecycleError> {
        self.pool.spawn(&session.id)?;

        let result = self.drive_startup(session, payload).await;
        if result.is_err() {
            self.pool.terminate(&session.id).await;
        }
        result
    }

    async fn drive_startup(
        &self,
        session: &SessionRow,
        payload: Option<RecoveryPayload>,
    ) -> Result<(), LifecycleError> {
        self.pool.send(
            &session.id,
            WorkerCommand::Init {
                config_snapshot: session.config_snapshot.clone(),
                speed_factor: session.speed_factor,
            },
        )?;
        self.pool.wait_for_init(&session.id, self.config.init_timeout).await?;

        if let Some(payload) = payload {
            self.pool.send(&session.id, WorkerCommand::Recover { payload })?;
        }
        self.pool.send(&session.id, WorkerCommand::Start)?;
        self.pool
            .wait_for_state(&session.id, WorkerRunState::Running, self.config.init_timeout)
            .await
    }
}

#[async_trait]
impl SessionOrchestrator for SessionManager {
    #[instrument(skip(self, params), fields(user_id = %user_id))]
    fn create(&self, user_id: &UserId, params: CreateSession) -> Result<SessionRow, LifecycleError> {
        self.check_admission(user_id)?;
        let row = self.sessions.create(
            user_id,
            NewSession {
                name: params.name,
                config_id: params.config_id,
                config_snapshot: params.config_snapshot,
                duration_days: params.duration_days.unwrap_or(self.config.default_duration_days),
                speed_factor: params.speed_factor.unwrap_or(self.config.default_speed_factor),
            },
        )?;
        info!(session_id = %row.id, "session created");
        Ok(row)
    }

    #[instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    async fn start(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError> {
        let session = self.sessions.get_owned(session_id, user_id)?;
        match session.status {
            SessionStatus::Idle | SessionStatus::Stopped => {}
            from => return Err(LifecycleError::InvalidTransition { from, action: "start" }),
        }
        self.check_admission(user_id)?;

        self.bring_up(&session, None).await?;
        let row = self.sessions.mark_started(session_id, Utc::now())?;
        info!(session_id = %session_id, "session started");
        Ok(row)
    }

    #[instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    async fn pause(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError> {
        let session = self.sessions.get_owned(session_id, user_id)?;
        if session.status != SessionStatus::Running {
            return Err(LifecycleError::InvalidTransition { from: session.status, action: "pause" });
        }
        self.pool.send(session_id, WorkerCommand::Pause)?;
        self.sessions.update_status(session_id, SessionStatus::Paused)?;
        Ok(self.sessions.get(session_id)?)
    }

    #[instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    async fn resume(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError> {
        let session = self.sessions.get_owned(session_id, user_id)?;
        if session.status != SessionStatus::Paused {
            return Err(LifecycleError::InvalidTransition { from: session.status, action: "resume" });
        }
        self.pool.send(session_id, WorkerCommand::Resume)?;
        self.sessions.update_status(session_id, SessionStatus::Running)?;
        Ok(self.sessions.get(session_id)?)
    }

    #[instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    async fn stop(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError> {
        let session = self.sessions.get_owned(session_id, user_id)?;
        if !session.status.is_active() {
            return Err(LifecycleError::InvalidTransition { from: session.status, action: "stop" });
        }
        self.pool.terminate(session_id).await;
        self.sessions.mark_stopped(session_id, SessionStatus::Stopped, Utc::now())?;
        info!(session_id = %session_id, "session stopped");
        Ok(self.sessions.get(session_id)?)
    }

    #[instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    async fn delete(&self, session_id: &SessionId, user_id: &UserId) -> Result<(), LifecycleError> {
        let session = self.sessions.get_owned(session_id, user_id)?;
        if session.status.is_active() {
            self.pool.terminate(session_id).await;
        }
        self.sessions.delete(session_id)?;
        info!(session_id = %session_id, "session deleted");
        Ok(())
    }

    fn list(&self, user_id: &UserId) -> Result<Vec<SessionRow>, LifecycleError> {
        Ok(self.sessions.list_for_user(user_id)?)
    }

    fn get(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError> {
        Ok(self.sessions.get_owned(session_id, user_id)?)
    }

    #[instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    async fn recover(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError> {
        let session = self.sessions.get_owned(session_id, user_id)?;
        // assemble_payload enforces interrupted status and a clock cursor
        let payload = self.recovery.assemble_payload(&session)?;
        self.check_admission(user_id)?;

        self.bring_up(&session, Some(payload)).await?;
        self.sessions.mark_recovered(session_id)?;
        info!(session_id = %session_id, "session recovered");
        Ok(self.sessions.get(session_id)?)
    }

    #[instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    async fn discard(&self, session_id: &SessionId, user_id: &UserId) -> Result<SessionRow, LifecycleError> {
        let session = self.sessions.get_owned(session_id, user_id)?;
        if session.status != SessionStatus::Interrupted {
            return Err(LifecycleError::InvalidTransition { from: session.status, action: "discard" });
        }
        self.sessions.mark_stopped(session_id, SessionStatus::Stopped, Utc::now())?;
        info!(session_id = %session_id, "interrupted session discarded");
        Ok(self.sessions.get(session_id)?)
    }

    fn recovery_summary(&self) -> Option<RecoverySummary> {
        self.last_summary.lock().clone()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool.subscribe()
    }
}

/// Applies WORKER_CRASHED events to the store: a crashed live session
/// becomes stopped, and the user sees it on their next poll.
async fn crash_consumer(
    manager: Weak<SessionManager>,
    mut rx: broadcast::Receiver<PoolEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = rx.recv() => event,
        };
        match event {
            Ok(PoolEvent::WorkerCrashed { session_id, exit_code, reason, .. }) => {
                let Some(manager) = manager.upgrade() else { return };
                error!(
                    session_id = %session_id,
                    exit_code = ?exit_code,
                    reason = ?reason,
                    "worker crashed; marking session stopped"
                );
                match manager.sessions.get(&session_id) {
                    Ok(row) if row.status.is_active() => {
                        if let Err(e) =
                            manager.sessions.mark_stopped(&session_id, SessionStatus::Stopped, Utc::now())
                        {
                            error!(session_id = %session_id, error = %e, "failed to stop crashed session");
                        }
                    }
                    Ok(row) => {
                        warn!(session_id = %session_id, status = %row.status, "crash for non-active session");
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "crash for unknown session");
                    }
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "crash consumer lagged on the event bus");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Recurring scan transitioning overdue live sessions to expired.
async fn expiration_loop(manager: Weak<SessionManager>, shutdown: CancellationToken) {
    let Some(scan_interval) = manager.upgrade().map(|m| m.config.expiration_scan_interval) else {
        return;
    };
    let mut interval = tokio::time::interval(scan_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        let Some(manager) = manager.upgrade() else { return };

        let due = match manager.sessions.find_expired(Utc::now()) {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "expiration scan failed");
                continue;
            }
        };
        for session in due {
            info!(session_id = %session.id, "session lifetime elapsed, expiring");
            manager.pool.terminate(&session.id).await;
            if let Err(e) =
                manager.sessions.mark_stopped(&session.id, SessionStatus::Expired, Utc::now())
            {
                error!(session_id = %session.id, error = %e, "failed to expire session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::worker::WorkerSettings;
    use plantsim_core::sim::CarEventKind;
    use plantsim_sim::mock::{EngineProbe, ScriptedEngine};
    use plantsim_sim::EngineFactory;
    use plantsim_store::buffers::BufferStateRepo;
    use plantsim_store::car_events::CarEventRepo;
    use plantsim_store::snapshots::PlantSnapshotRepo;
    use plantsim_store::stop_events::StopEventRepo;
    use std::sync::Mutex as StdMutex;

    fn fast_pool_config() -> PoolConfig {
        PoolConfig {
            monitor_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_secs(15),
            stop_grace: Duration::from_millis(200),
            event_bus_capacity: 1024,
            worker: WorkerSettings {
                heartbeat_interval: Duration::from_millis(50),
                flush_yield: Duration::from_millis(5),
            },
        }
    }

    fn fast_manager_config() -> ManagerConfig {
        ManagerConfig {
            init_timeout: Duration::from_secs(2),
            expiration_scan_interval: Duration::from_millis(50),
            ..ManagerConfig::default()
        }
    }

    struct Fixture {
        db: Database,
        manager: Arc<SessionManager>,
        user: UserId,
        probe_slot: Arc<StdMutex<Option<EngineProbe>>>,
    }

    impl Fixture {
        fn probe(&self) -> Option<EngineProbe> {
            self.probe_slot.lock().unwrap().clone()
        }
    }

    async fn fixture_with(
        db: Database,
        manager_config: ManagerConfig,
        build: impl Fn() -> ScriptedEngine + Send + Sync + 'static,
    ) -> Fixture {
        let probe_slot: Arc<StdMutex<Option<EngineProbe>>> = Arc::new(StdMutex::new(None));
        let slot = Arc::clone(&probe_slot);
        let factory: EngineFactory = Arc::new(move |_config| {
            let engine = build();
            *slot.lock().unwrap() = Some(engine.probe());
            Box::new(engine)
        });

        let pool = WorkerPool::new(db.clone(), factory, fast_pool_config());
        let manager = SessionManager::new(db.clone(), pool, manager_config);
        manager.initialize().await.unwrap();

        Fixture { db, manager, user: UserId::new(), probe_slot }
    }

    async fn fixture() -> Fixture {
        fixture_with(Database::in_memory().unwrap(), fast_manager_config(), ScriptedEngine::new).await
    }

    async fn crashes_on_bus(
        rx: &mut broadcast::Receiver<PoolEvent>,
        window: Duration,
    ) -> Vec<PoolEvent> {
        let mut crashes = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if matches!(event, PoolEvent::WorkerCrashed { .. }) {
                crashes.push(event);
            }
        }
        crashes
    }

    #[tokio::test]
    async fn happy_path_start_pause_resume_stop() {
        let fx = fixture().await;
        let mut bus = fx.manager.subscribe_events();

        let created = fx.manager.create(&fx.user, CreateSession::default()).unwrap();
        assert_eq!(created.status, SessionStatus::Idle);

        let started = fx.manager.start(&created.id, &fx.user).await.unwrap();
        assert_eq!(started.status, SessionStatus::Running);
        let started_at: chrono::DateTime<Utc> = started.started_at.clone().unwrap().parse().unwrap();
        let expires_at: chrono::DateTime<Utc> = started.expires_at.clone().unwrap().parse().unwrap();
        assert_eq!((expires_at - started_at).num_milliseconds(), 7 * 86_400_000);

        let paused = fx.manager.pause(&created.id, &fx.user).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);

        let resumed = fx.manager.resume(&created.id, &fx.user).await.unwrap();
        assert_eq!(resumed.status, SessionStatus::Running);

        let stopped = fx.manager.stop(&created.id, &fx.user).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        let stopped_at: chrono::DateTime<Utc> = stopped.stopped_at.clone().unwrap().parse().unwrap();
        assert!(stopped_at >= started_at);

        // Worker gone, and the whole run produced zero crash reports
        assert_eq!(fx.manager.pool().worker_count(), 0);
        let crashes = crashes_on_bus(&mut bus, Duration::from_millis(300)).await;
        assert!(crashes.is_empty(), "{crashes:?}");
    }

    #[tokio::test]
    async fn per_user_cap_blocks_third_session() {
        let fx = fixture().await;

        for _ in 0..2 {
            let session = fx.manager.create(&fx.user, CreateSession::default()).unwrap();
            fx.manager.start(&session.id, &fx.user).await.unwrap();
        }

        let result = fx.manager.create(&fx.user, CreateSession::default());
        assert!(matches!(
            result,
            Err(LifecycleError::CapExceeded { scope: CapScope::PerUser })
        ));

        // Store still shows exactly two active
        let repo = SessionRepo::new(fx.db.clone());
        assert_eq!(repo.count_active_for_user(&fx.user).unwrap(), 2);

        // Another user is unaffected by this user's cap
        let other = UserId::new();
        let session = fx.manager.create(&other, CreateSession::default()).unwrap();
        fx.manager.start(&session.id, &other).await.unwrap();
    }

    #[tokio::test]
    async fn global_cap_blocks_across_users() {
        let db = Database::in_memory().unwrap();
        let config = ManagerConfig { max_global: 2, ..fast_manager_config() };
        let fx = fixture_with(db, config, ScriptedEngine::new).await;

        for _ in 0..2 {
            let user = UserId::new();
            let session = fx.manager.create(&user, CreateSession::default()).unwrap();
            fx.manager.start(&session.id, &user).await.unwrap();
        }

        let third = UserId::new();
        assert!(matches!(
            fx.manager.create(&third, CreateSession::default()),
            Err(LifecycleError::CapExceeded { scope: CapScope::Global })
        ));
    }

    #[tokio::test]
    async fn illegal_transitions_are_typed_failures() {
        let fx = fixture().await;
        let session = fx.manager.create(&fx.user, CreateSession::default()).unwrap();

        // pause/resume/stop from idle
        for (result, action) in [
            (fx.manager.pause(&session.id, &fx.user).await, "pause"),
            (fx.manager.resume(&session.id, &fx.user).await, "resume"),
            (fx.manager.stop(&session.id, &fx.user).await, "stop"),
        ] {
            match result {
                Err(LifecycleError::InvalidTransition { from, action: a }) => {
                    assert_eq!(from, SessionStatus::Idle);
                    assert_eq!(a, action);
                }
                other => panic!("expected invalid transition for {action}, got {other:?}"),
            }
        }

        // double start
        fx.manager.start(&session.id, &fx.user).await.unwrap();
        assert!(matches!(
            fx.manager.start(&session.id, &fx.user).await,
            Err(LifecycleError::InvalidTransition { from: SessionStatus::Running, .. })
        ));
    }

    #[tokio::test]
    async fn ownership_mismatch_is_indistinguishable_from_absence() {
        let fx = fixture().await;
        let session = fx.manager.create(&fx.user, CreateSession::default()).unwrap();

        let stranger = UserId::new();
        let mismatch = fx.manager.start(&session.id, &stranger).await.unwrap_err();
        let missing = fx.manager.start(&SessionId::new(), &stranger).await.unwrap_err();
        assert!(matches!(mismatch, LifecycleError::NotFound));
        assert!(matches!(missing, LifecycleError::NotFound));
        assert_eq!(mismatch.to_string(), missing.to_string());
    }

    #[tokio::test]
    async fn init_failure_rolls_back_to_idle() {
        let db = Database::in_memory().unwrap();
        let fx = fixture_with(db, fast_manager_config(), || {
            ScriptedEngine::new().with_init_failure("bad topology")
        })
        .await;

        let session = fx.manager.create(&fx.user, CreateSession::default()).unwrap();
        let result = fx.manager.start(&session.id, &fx.user).await;
        assert!(matches!(result, Err(LifecycleError::InitFailed(_))));

        let row = fx.manager.get(&session.id, &fx.user).unwrap();
        assert_eq!(row.status, SessionStatus::Idle);
        assert!(row.started_at.is_none());
        assert_eq!(fx.manager.pool().worker_count(), 0);
    }

    #[tokio::test]
    async fn crash_stops_session_and_recover_is_rejected() {
        let db = Database::in_memory().unwrap();
        let fx = fixture_with(db, fast_manager_config(), || {
            // Crash ~20ms into the run, comfortably after start() returns
            ScriptedEngine::new().with_panic_on_tick(20)
        })
        .await;

        let session = fx
            .manager
            .create(
                &fx.user,
                CreateSession { speed_factor: Some(60_000), ..Default::default() },
            )
            .unwrap();
        fx.manager.start(&session.id, &fx.user).await.unwrap();

        // Give the crash consumer time to apply the transition
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let row = fx.manager.get(&session.id, &fx.user).unwrap();
            if row.status == SessionStatus::Stopped {
                assert!(row.stopped_at.is_some());
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session never transitioned to stopped after crash"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fx.manager.pool().worker_count(), 0);

        // A crashed session is stopped, not interrupted: recover is illegal
        assert!(matches!(
            fx.manager.recover(&session.id, &fx.user).await,
            Err(LifecycleError::InvalidTransition { from: SessionStatus::Stopped, action: "recover" })
        ));
    }

    /// Orchestrator restart: live sessions become interrupted, then a user
    /// recovers one and the worker receives the reconstructed world state.
    #[tokio::test]
    async fn restart_marks_interrupted_and_recover_restores_world() {
        let db = Database::in_memory().unwrap();
        let fx1 = fixture_with(db.clone(), fast_manager_config(), ScriptedEngine::new).await;

        let session = fx1.manager.create(&fx1.user, CreateSession::default()).unwrap();
        fx1.manager.start(&session.id, &fx1.user).await.unwrap();
        let user = fx1.user.clone();

        // Persisted world state as of the moment of the "crash"
        let repo = SessionRepo::new(db.clone());
        repo.update_checkpoint(&session.id, 7_200_000, 120).unwrap();
        CarEventRepo::new(db.clone())
            .append(&session.id, "car-00001", CarEventKind::Completed, None, None, 3_600_000)
            .unwrap();
        BufferStateRepo::new(db.clone())
            .append(&session.id, "buffer-1", 10, 1, &["car-00002".into()], "OK", 7_000_000)
            .unwrap();
        StopEventRepo::new(db.clone())
            .start(&session.id, "stop-00001", "station-2", "jam", "UNPLANNED", "MECHANICAL", "HIGH", 6_900_000)
            .unwrap();
        PlantSnapshotRepo::new(db.clone())
            .append(&session.id, 7_100_000, 1, 2, 1, &serde_json::json!({"v": "latest"}))
            .unwrap();

        // Abrupt restart: a second manager over the same store. The first
        // manager's workers are irrelevant — the store still says running.
        let fx2 = fixture_with(db.clone(), fast_manager_config(), ScriptedEngine::new).await;
        let summary = fx2.manager.recovery_summary().unwrap();
        assert_eq!(summary.interrupted_count, 1);
        assert_eq!(summary.interrupted_sessions, vec![session.id.clone()]);

        let row = repo.get(&session.id).unwrap();
        assert_eq!(row.status, SessionStatus::Interrupted);
        assert!(row.interrupted_at.is_some());

        // Recover: worker spawned, world restored, session running again
        let recovered = fx2.manager.recover(&session.id, &user).await.unwrap();
        assert_eq!(recovered.status, SessionStatus::Running);
        assert!(recovered.interrupted_at.is_none());

        let probe = fx2.probe().expect("engine never constructed");
        assert_eq!(probe.clock(), Some((7_200_000, 120)));
        assert_eq!(probe.restored_completed(), vec!["car-00001"]);
        assert_eq!(probe.restored_buffers()[0].car_ids, vec!["car-00002"]);
        assert_eq!(probe.restored_stops()[0].stop_id, "stop-00001");
        assert_eq!(probe.restored_snapshot().unwrap()["v"], "latest");

        fx2.manager.shutdown().await;
    }

    #[tokio::test]
    async fn recover_rejected_without_checkpoint() {
        let db = Database::in_memory().unwrap();
        let fx1 = fixture_with(db.clone(), fast_manager_config(), ScriptedEngine::new).await;
        let session = fx1.manager.create(&fx1.user, CreateSession::default()).unwrap();
        fx1.manager.start(&session.id, &fx1.user).await.unwrap();
        let user = fx1.user.clone();

        // Restart without any checkpoint ever written
        let fx2 = fixture_with(db, fast_manager_config(), ScriptedEngine::new).await;
        assert!(matches!(
            fx2.manager.recover(&session.id, &user).await,
            Err(LifecycleError::NotRecoverable)
        ));
    }

    #[tokio::test]
    async fn stale_interrupted_becomes_stopped_on_startup() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        let user = UserId::new();
        let session = repo
            .create(&user, NewSession { duration_days: 7, speed_factor: 60, ..Default::default() })
            .unwrap();
        let now = Utc::now();
        repo.mark_started(&session.id, now).unwrap();
        repo.update_checkpoint(&session.id, 60_000, 1).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET status = 'interrupted', interrupted_at = ?1 WHERE id = ?2",
                rusqlite::params![(now - chrono::Duration::hours(30)).to_rfc3339(), session.id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let fx = fixture_with(db, fast_manager_config(), ScriptedEngine::new).await;
        let summary = fx.manager.recovery_summary().unwrap();
        assert_eq!(summary.stale_count, 1);

        let row = fx.manager.get(&session.id, &user).unwrap();
        assert_eq!(row.status, SessionStatus::Stopped);

        assert!(matches!(
            fx.manager.recover(&session.id, &user).await,
            Err(LifecycleError::InvalidTransition { from: SessionStatus::Stopped, .. })
        ));
    }

    #[tokio::test]
    async fn discard_settles_interrupted_session() {
        let db = Database::in_memory().unwrap();
        let fx1 = fixture_with(db.clone(), fast_manager_config(), ScriptedEngine::new).await;
        let session = fx1.manager.create(&fx1.user, CreateSession::default()).unwrap();
        fx1.manager.start(&session.id, &fx1.user).await.unwrap();
        let user = fx1.user.clone();

        let fx2 = fixture_with(db, fast_manager_config(), ScriptedEngine::new).await;
        let discarded = fx2.manager.discard(&session.id, &user).await.unwrap();
        assert_eq!(discarded.status, SessionStatus::Stopped);
        assert!(discarded.interrupted_at.is_none());
        assert!(discarded.stopped_at.is_some());

        // Discard only applies to interrupted sessions
        assert!(matches!(
            fx2.manager.discard(&session.id, &user).await,
            Err(LifecycleError::InvalidTransition { from: SessionStatus::Stopped, action: "discard" })
        ));
    }

    #[tokio::test]
    async fn expiration_scan_expires_and_terminates() {
        let fx = fixture().await;
        let session = fx
            .manager
            .create(&fx.user, CreateSession { duration_days: Some(0), ..Default::default() })
            .unwrap();
        fx.manager.start(&session.id, &fx.user).await.unwrap();

        // duration 0 ⇒ expires_at == started_at ⇒ the next scan catches it
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let row = fx.manager.get(&session.id, &fx.user).unwrap();
            if row.status == SessionStatus::Expired {
                assert!(row.stopped_at.is_some());
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expiration scan never caught the session"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fx.manager.pool().worker_count(), 0);
    }

    #[tokio::test]
    async fn delete_terminates_worker_and_removes_rows() {
        let fx = fixture().await;
        let session = fx.manager.create(&fx.user, CreateSession::default()).unwrap();
        fx.manager.start(&session.id, &fx.user).await.unwrap();
        CarEventRepo::new(fx.db.clone())
            .append(&session.id, "car-00001", CarEventKind::Created, None, None, 0)
            .unwrap();

        fx.manager.delete(&session.id, &fx.user).await.unwrap();
        assert_eq!(fx.manager.pool().worker_count(), 0);
        assert!(matches!(
            fx.manager.get(&session.id, &fx.user),
            Err(LifecycleError::NotFound)
        ));
        assert!(CarEventRepo::new(fx.db.clone()).list(&session.id, None).unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn list_is_scoped_to_the_user() {
        let fx = fixture().await;
        fx.manager.create(&fx.user, CreateSession::default()).unwrap();
        fx.manager.create(&fx.user, CreateSession::default()).unwrap();
        fx.manager.create(&UserId::new(), CreateSession::default()).unwrap();

        assert_eq!(fx.manager.list(&fx.user).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn restart_clears_all_active_rows() {
        // After initialize, nothing may remain {running, paused}
        let db = Database::in_memory().unwrap();
        let fx1 = fixture_with(db.clone(), fast_manager_config(), ScriptedEngine::new).await;
        for _ in 0..2 {
            let user = UserId::new();
            let session = fx1.manager.create(&user, CreateSession::default()).unwrap();
            fx1.manager.start(&session.id, &user).await.unwrap();
        }

        let _fx2 = fixture_with(db.clone(), fast_manager_config(), ScriptedEngine::new).await;
        assert_eq!(SessionRepo::new(db).count_active().unwrap(), 0);
    }
}
