pub mod coordinator;
pub mod diff;
pub mod executor;
pub mod history;
pub mod retry;
pub mod share;
pub mod snapshot;

pub use coordinator::{reconcile, CoordinatorSettings, CycleOutcome, RunCoordinator};
pub use diff::{diff, summarize_actions, ActionKind, ActionSummary, SyncAction, TargetPlacement};
pub use executor::{disambiguate, ConcurrencyStrategy, SyncExecutor, SyncResult, SyncStatus};
pub use history::{RunHistoryRecord, RunOutcome};
pub use retry::{Backoff, RetryPolicy};
pub use share::{DuplicatePolicy, ResolvedShare, ShareConfig, ShareId, ShareRef};
pub use snapshot::{FileEntry, Snapshot};
