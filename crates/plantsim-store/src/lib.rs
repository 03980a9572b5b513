pub mod buffers;
pub mod car_events;
pub mod database;
pub mod dialect;
pub mod error;
pub mod metrics;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod snapshots;
pub mod stop_events;

pub use database::Database;
pub use dialect::SqlDialect;
pub use error::StoreError;

/// Hard cap on rows returned by any event read.
pub const MAX_READ_LIMIT: u32 = 10_000;

/// Default page size when the caller does not pass a limit.
pub const DEFAULT_READ_LIMIT: u32 = 1_000;

/// Clamp a caller-supplied limit into `[1, MAX_READ_LIMIT]`.
pub fn effective_limit(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_READ_LIMIT).clamp(1, MAX_READ_LIMIT)
}

/// One page of event rows. `truncated` is set only when the store actually
/// cut rows off at the cap — a result that merely equals the limit is not
/// truncated. Detected by fetching one row past the cap.
#[derive(Clone, Debug)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub truncated: bool,
}

impl<T> Page<T> {
    /// Trim an over-fetched row set down to `limit`, recording whether
    /// anything was dropped.
    pub(crate) fn from_overfetch(mut rows: Vec<T>, limit: u32) -> Self {
        let truncated = rows.len() > limit as usize;
        if truncated {
            rows.truncate(limit as usize);
        }
        Self { rows, truncated }
    }
}
