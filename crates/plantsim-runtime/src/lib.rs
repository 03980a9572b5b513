pub mod error;
pub mod manager;
pub mod pool;
pub mod recovery;
pub mod sidecar;
pub mod worker;

pub use error::{CapScope, LifecycleError};
pub use manager::{CreateSession, ManagerConfig, SessionManager, SessionOrchestrator};
pub use pool::{PoolConfig, WorkerPool, WorkerStatus};
pub use recovery::{RecoveryService, RecoverySummary};
