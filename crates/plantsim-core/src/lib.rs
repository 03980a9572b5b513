pub mod config;
pub mod ids;
pub mod messages;
pub mod sim;

pub use config::SimulationConfig;
pub use ids::{ConfigId, IdParseError, SessionId, UserId, WorkerId};
pub use messages::{CrashReason, PoolEvent, WorkerCommand, WorkerRunState};
pub use sim::{RecoveryPayload, SimEvent};
