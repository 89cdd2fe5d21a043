pub use crate::collections::{StateList, StateMap, StateSet, ToStateList};
pub use crate::diff::{DiffOp, NodePatch, diff};
pub use crate::effects::{
    Dispose, InlineSpawner, ProducerScope, RememberObserver, Task, TaskScope, TaskSpawner,
    ThreadSpawner, disposable_effect, launched_effect, on_dispose, produce_state,
    remember_task_scope, side_effect,
};
pub use crate::error::{SnapshotError, TuneError, TuneResult};
pub use crate::locals::{CapturedLocals, capture, local, local_or_default, provide};
pub use crate::manager::{ApplyObserver, ObserverHandle, SnapshotManager};
pub use crate::reactive::{WatchHandle, watch};
pub use crate::retuner::{Retuner, RetunerConfig, TuningPass};
pub use crate::snapshot::{
    ReadObserver, Snapshot, SnapshotFlags, SnapshotId, WriteObserver, observe,
    with_mutable_snapshot,
};
pub use crate::state::{
    CellId, MutationPolicy, NeverEqual, ReferentialEquality, StateCell, StructuralEquality,
};
pub use crate::tunation::{Content, Node, NodeKey, TunationId, TunationState};
pub use crate::tuner::{
    current_retuner, current_snapshot, current_tunation, emit_keyed_node, emit_node, end_group,
    group, is_tuning, remember, remember_keyed, remember_observed, remember_observed_keyed,
    remember_state, remember_updated_state, start_group, tune_child,
};
pub use tokio_util::sync::CancellationToken;
