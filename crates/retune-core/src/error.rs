use crate::snapshot::SnapshotId;
use crate::state::CellId;
use crate::tunation::TunationId;

/// Errors raised by the snapshot system.
///
/// All of these are reported synchronously at the call that caused them.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// A write was attempted through a snapshot that cannot accept it: the
    /// snapshot is read-only, closed, or not the current snapshot of the
    /// calling thread. Always a programming error.
    #[error("illegal write to {cell} in snapshot {snapshot}: {reason}")]
    IllegalWrite {
        cell: CellId,
        snapshot: SnapshotId,
        reason: &'static str,
    },

    /// Another snapshot applied a conflicting write to these cells after this
    /// snapshot was taken. The snapshot is left open; take a fresh one and
    /// redo the mutation to retry.
    #[error("snapshot {snapshot} conflicts with applied writes to {} cell(s)", cells.len())]
    ApplyConflict {
        snapshot: SnapshotId,
        cells: Vec<CellId>,
    },

    #[error("snapshot {snapshot} was already applied or disposed")]
    Closed { snapshot: SnapshotId },

    #[error("snapshot {snapshot} is read-only and cannot be applied")]
    ReadOnly { snapshot: SnapshotId },

    #[error("snapshot {snapshot} still has {count} open nested snapshot(s)")]
    PendingChildren { snapshot: SnapshotId, count: usize },

    #[error("snapshot {snapshot} must be exited before it is applied")]
    EnteredOnApply { snapshot: SnapshotId },
}

/// Errors raised by the tuner and the retuner.
#[derive(Debug, thiserror::Error)]
pub enum TuneError {
    /// An ambient accessor (`current_tunation`, `remember`, `emit_node`, ...)
    /// was used outside of a tuning pass.
    #[error("no active tuning pass on this thread")]
    NoActiveTuningContext,

    #[error("tunation {0:?} is disposed")]
    Disposed(TunationId),

    #[error("tunation {0:?} is already being tuned on this thread")]
    Reentrant(TunationId),

    /// `drain_pending` kept finding new invalidations after the configured
    /// number of rounds; usually a tunation writes state it also reads.
    #[error("invalidation did not settle after {iterations} drain rounds ({pending} still pending)")]
    DivergentInvalidation { iterations: usize, pending: usize },

    /// A nested pass failed and its error was swallowed by the enclosing
    /// content; the outermost pass is rolled back anyway.
    #[error("tuning pass aborted by failed nested pass of {0:?}")]
    Aborted(TunationId),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Failure returned by a content function, carried unchanged.
    #[error(transparent)]
    Content(anyhow::Error),
}

impl TuneError {
    /// The content function's own error, if this is one.
    pub fn content(&self) -> Option<&anyhow::Error> {
        match self {
            TuneError::Content(e) => Some(e),
            _ => None,
        }
    }
}

pub type TuneResult<T> = Result<T, TuneError>;
