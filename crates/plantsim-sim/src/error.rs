/// Faults raised by a simulation engine. Init and restore failures are the
/// ones the orchestrator branches on; anything else is a runtime fault that
/// surfaces as a worker ERROR event.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    #[error("initialization failed: {0}")]
    InitFailed(String),

    #[error("invalid command {command} in phase {phase}")]
    InvalidCommand { phase: String, command: String },

    #[error("restore failed in {step}: {detail}")]
    RestoreFailed { step: &'static str, detail: String },

    #[error("engine fault: {0}")]
    Fault(String),
}

impl EngineError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InitFailed(_) => "init_failed",
            Self::InvalidCommand { .. } => "invalid_command",
            Self::RestoreFailed { .. } => "restore_failed",
            Self::Fault(_) => "fault",
        }
    }
}
