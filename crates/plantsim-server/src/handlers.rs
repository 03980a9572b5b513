//! RPC method handlers.
//!
//! Every session-scoped method funnels through `bind_session`, which
//! resolves the `(session_id, user_id)` pair against the store before any
//! data is touched. Unauthorized and nonexistent sessions produce the same
//! NOT_FOUND response, so the surface cannot be used to enumerate ids.

use std::sync::Arc;

use plantsim_core::ids::{ConfigId, SessionId, UserId};
use plantsim_runtime::manager::{CreateSession, SessionOrchestrator};
use plantsim_store::buffers::BufferStateRepo;
use plantsim_store::car_events::CarEventRepo;
use plantsim_store::metrics::MetricsRepo;
use plantsim_store::sessions::SessionRow;
use plantsim_store::snapshots::PlantSnapshotRepo;
use plantsim_store::stop_events::StopEventRepo;
use plantsim_store::Database;
use plantsim_telemetry::{LogQuery, TelemetryGuard};

use crate::rpc::{self, RpcResponse};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub orchestrator: Arc<dyn SessionOrchestrator>,
    pub db: Database,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl HandlerState {
    pub fn new(orchestrator: Arc<dyn SessionOrchestrator>, db: Database) -> Self {
        Self {
            orchestrator,
            db,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// Dispatch an RPC method to the appropriate handler.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match method {
        // Session control
        "session.create" => session_create(state, params, id),
        "session.list" => session_list(state, params, id),
        "session.get" => session_get(state, params, id),
        "session.start" => session_start(state, params, id).await,
        "session.pause" => session_pause(state, params, id).await,
        "session.resume" => session_resume(state, params, id).await,
        "session.stop" => session_stop(state, params, id).await,
        "session.delete" => session_delete(state, params, id).await,
        "session.recover" => session_recover(state, params, id).await,
        "session.discard" => session_discard(state, params, id).await,

        // Recovery
        "recovery.summary" => recovery_summary(state, id),

        // Session-scoped reads
        "events.cars" => events_cars(state, params, id),
        "events.stops" => events_stops(state, params, id),
        "events.buffers" => events_buffers(state, params, id),
        "events.snapshots" => events_snapshots(state, params, id),
        "events.oee" => events_oee(state, params, id),
        "events.mttr" => events_mttr(state, params, id),

        // Telemetry
        "telemetry.logs" => telemetry_logs(state, params, id),

        // System
        "system.ping" | "health" => health(id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn session_json(session: &SessionRow) -> serde_json::Value {
    serde_json::to_value(session).unwrap_or_default()
}

fn session_result(session: &SessionRow) -> serde_json::Value {
    serde_json::json!({ "session": session_json(session) })
}

/// Pull the `(session_id, user_id)` pair out of the params. Both are wire
/// input and must carry their brand prefix.
fn ids_from(params: &serde_json::Value) -> Result<(SessionId, UserId), String> {
    let session_id = rpc::require_str(params, "session_id")?;
    let user_id = rpc::require_str(params, "user_id")?;
    let session_id = SessionId::parse(session_id).map_err(|e| e.to_string())?;
    let user_id = UserId::parse(user_id).map_err(|e| e.to_string())?;
    Ok((session_id, user_id))
}

/// Validate a lone `user_id` param.
fn user_from(params: &serde_json::Value) -> Result<UserId, String> {
    let user_id = rpc::require_str(params, "user_id")?;
    UserId::parse(user_id).map_err(|e| e.to_string())
}

/// Resolve ownership before touching any session-scoped data.
fn bind_session(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: &Option<serde_json::Value>,
) -> Result<SessionRow, RpcResponse> {
    let (session_id, user_id) =
        ids_from(params).map_err(|e| RpcResponse::invalid_params(id.clone(), e))?;
    state
        .orchestrator
        .get(&session_id, &user_id)
        .map_err(|e| RpcResponse::from_lifecycle_error(id.clone(), &e))
}

// ── Session control ──

fn session_create(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match user_from(params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let create = CreateSession {
        name: rpc::optional_str(params, "name").map(str::to_string),
        config_id: rpc::optional_str(params, "config_id").map(ConfigId::from_raw),
        config_snapshot: rpc::optional_str(params, "config_snapshot").map(str::to_string),
        duration_days: rpc::optional_u32(params, "duration_days"),
        speed_factor: rpc::optional_u32(params, "speed_factor"),
    };

    match state.orchestrator.create(&user_id, create) {
        Ok(session) => RpcResponse::success(id, session_result(&session)),
        Err(e) => RpcResponse::from_lifecycle_error(id, &e),
    }
}

fn session_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match user_from(params) {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.orchestrator.list(&user_id) {
        Ok(sessions) => RpcResponse::success(
            id,
            serde_json::json!({
                "sessions": sessions.iter().map(session_json).collect::<Vec<_>>(),
            }),
        ),
        Err(e) => RpcResponse::from_lifecycle_error(id, &e),
    }
}

fn session_get(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match bind_session(state, params, &id) {
        Ok(session) => RpcResponse::success(id, session_result(&session)),
        Err(resp) => resp,
    }
}

macro_rules! lifecycle_handler {
    ($name:ident, $method:ident) => {
        async fn $name(
            state: &Arc<HandlerState>,
            params: &serde_json::Value,
            id: Option<serde_json::Value>,
        ) -> RpcResponse {
            let (session_id, user_id) = match ids_from(params) {
                Ok(pair) => pair,
                Err(e) => return RpcResponse::invalid_params(id, e),
            };
            match state.orchestrator.$method(&session_id, &user_id).await {
                Ok(session) => RpcResponse::success(id, session_result(&session)),
                Err(e) => RpcResponse::from_lifecycle_error(id, &e),
            }
        }
    };
}

lifecycle_handler!(session_start, start);
lifecycle_handler!(session_pause, pause);
lifecycle_handler!(session_resume, resume);
lifecycle_handler!(session_stop, stop);
lifecycle_handler!(session_recover, recover);
lifecycle_handler!(session_discard, discard);

async fn session_delete(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let (session_id, user_id) = match ids_from(params) {
        Ok(pair) => pair,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.orchestrator.delete(&session_id, &user_id).await {
        Ok(()) => RpcResponse::success(id, serde_json::json!({ "deleted": true })),
        Err(e) => RpcResponse::from_lifecycle_error(id, &e),
    }
}

fn recovery_summary(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    let summary = state
        .orchestrator
        .recovery_summary()
        .and_then(|s| serde_json::to_value(s).ok());
    RpcResponse::success(id, serde_json::json!({ "summary": summary }))
}

// ── Session-scoped reads ──

macro_rules! events_handler {
    ($name:ident, $repo:ident, $list:ident, $key:literal) => {
        fn $name(
            state: &Arc<HandlerState>,
            params: &serde_json::Value,
            id: Option<serde_json::Value>,
        ) -> RpcResponse {
            let session = match bind_session(state, params, &id) {
                Ok(session) => session,
                Err(resp) => return resp,
            };
            let limit = rpc::optional_u32(params, "limit");
            match $repo::new(state.db.clone()).$list(&session.id, limit) {
                Ok(page) => RpcResponse::success(
                    id,
                    serde_json::json!({ $key: page.rows, "truncated": page.truncated }),
                ),
                Err(e) => RpcResponse::internal_error(id, e.to_string()),
            }
        }
    };
}

events_handler!(events_cars, CarEventRepo, list, "car_events");
events_handler!(events_stops, StopEventRepo, list, "stop_events");
events_handler!(events_buffers, BufferStateRepo, list, "buffer_states");
events_handler!(events_snapshots, PlantSnapshotRepo, list, "plant_snapshots");
events_handler!(events_oee, MetricsRepo, list_oee, "oee");
events_handler!(events_mttr, MetricsRepo, list_mttr_mtbf, "mttr_mtbf");

// ── Telemetry ──

/// Operator surface. Session filtering is optional here: without a
/// session_id the query returns unfiltered logs.
fn telemetry_logs(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(telemetry) = state.telemetry.as_ref() else {
        return RpcResponse::success(
            id,
            serde_json::json!({ "logs": [], "totalCount": 0, "enabled": false }),
        );
    };
    let Some(sink) = telemetry.logs() else {
        return RpcResponse::success(
            id,
            serde_json::json!({ "logs": [], "totalCount": 0, "enabled": false }),
        );
    };

    let query = LogQuery {
        level: rpc::optional_str(params, "level").map(str::to_uppercase),
        target: rpc::optional_str(params, "target").map(str::to_string),
        session_id: rpc::optional_str(params, "session_id").map(str::to_string),
        worker_id: rpc::optional_str(params, "worker_id").map(str::to_string),
        since: rpc::optional_str(params, "since").map(str::to_string),
        limit: rpc::optional_u32(params, "limit"),
    };

    match sink.query(&query) {
        Ok(logs) => {
            let count = sink.count().unwrap_or(0);
            RpcResponse::success(
                id,
                serde_json::json!({ "logs": logs, "totalCount": count, "enabled": true }),
            )
        }
        Err(e) => RpcResponse::internal_error(id, format!("Failed to query logs: {e}")),
    }
}

// ── System ──

fn health(id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "name": "plantsim",
        }),
    )
}
