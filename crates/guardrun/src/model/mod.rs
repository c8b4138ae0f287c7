pub mod backup;
pub mod context;
pub mod execution;
pub mod fault;
pub mod ids;
pub mod recovery;
pub mod report;

pub use backup::BackupRecord;
pub use context::{ExecutionContext, ExecutionContextBuilder};
pub use execution::*;
pub use fault::*;
pub use ids::{BackupId, FaultId, RunId};
pub use recovery::{ActionKind, RecoveryOutcome};
pub use report::*;

/// Maximum length for configured regex patterns, bounding compile cost.
pub const MAX_REGEX_PATTERN_LEN: usize = 1000;

/// Milliseconds since the Unix epoch, zero if the clock is before it.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| execution::duration_to_ms(elapsed))
        .unwrap_or_default()
}
