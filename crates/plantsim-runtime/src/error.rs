use plantsim_store::sessions::SessionStatus;
use plantsim_store::StoreError;

/// Which admission cap was hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapScope {
    PerUser,
    Global,
}

impl std::fmt::Display for CapScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PerUser => f.write_str("per-user"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// Failures surfaced by the session lifecycle core.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The requested transition is illegal from the session's current state.
    #[error("cannot {action} a session in state {from}")]
    InvalidTransition { from: SessionStatus, action: &'static str },

    #[error("{scope} active session limit reached")]
    CapExceeded { scope: CapScope },

    /// Covers both a missing row and an ownership mismatch; callers cannot
    /// tell the two apart.
    #[error("session not found or access denied")]
    NotFound,

    #[error("session already has a live worker")]
    WorkerExists,

    #[error("no live worker for session")]
    WorkerUnavailable,

    #[error("worker initialization failed: {0}")]
    InitFailed(String),

    #[error("session is not recoverable")]
    NotRecoverable,

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => Self::NotFound,
            other => Self::Store(other),
        }
    }
}

impl LifecycleError {
    /// Stable error category for the control surface.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_state",
            Self::CapExceeded { .. } => "cap_exceeded",
            Self::NotFound => "not_found",
            Self::WorkerExists => "worker_exists",
            Self::WorkerUnavailable => "worker_unavailable",
            Self::InitFailed(_) => "init_failed",
            Self::NotRecoverable => "not_recoverable",
            Self::RecoveryFailed(_) => "recovery_failed",
            Self::Store(_) => "store",
        }
    }
}
