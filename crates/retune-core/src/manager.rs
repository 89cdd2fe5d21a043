//! Process-wide snapshot bookkeeping: the id counter, the registry of open
//! snapshots, the global snapshot and observer lists, and the apply
//! algorithm.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};
use slotmap::{SlotMap, new_key_type};

use crate::error::SnapshotError;
use crate::snapshot::{
    self, ReadObserver, Snapshot, SnapshotFlags, SnapshotId, SnapshotInner, SnapshotState,
    Visibility, WriteObserver, chain_observers,
};
use crate::state::{ApplyCheck, CellId, StateObject};

new_key_type! {
    struct ObserverKey;
}

/// Receives the cells changed by an apply and the snapshot that applied them.
pub type ApplyObserver = Arc<dyn Fn(&[CellId], &Snapshot) + Send + Sync>;

static GLOBAL: OnceLock<SnapshotManager> = OnceLock::new();

struct ManagerState {
    /// Open snapshot id -> the base it pins.
    open: BTreeMap<SnapshotId, SnapshotId>,
    /// Write tags handed to open snapshots after their id.
    tags: BTreeSet<SnapshotId>,
    global_id: SnapshotId,
    global_writes: Vec<Arc<dyn StateObject>>,
    global_written: HashSet<CellId>,
}

impl ManagerState {
    /// Ids whose records nobody outside their snapshot may see.
    fn unpublished(&self) -> impl Iterator<Item = &SnapshotId> {
        self.open.keys().chain(self.tags.iter())
    }

    fn release(&mut self, view: &Visibility) {
        for tag in view.tags() {
            self.open.remove(tag);
            self.tags.remove(tag);
        }
    }
}

struct ManagerInner {
    next_id: AtomicU64,
    state: Mutex<ManagerState>,
    global_view: RwLock<Arc<Visibility>>,
    write_observers: RwLock<SlotMap<ObserverKey, WriteObserver>>,
    apply_observers: RwLock<SlotMap<ObserverKey, ApplyObserver>>,
}

/// Owner of a family of snapshots and the cells created against it.
///
/// `SnapshotManager::global()` is the process-wide instance used by
/// [`StateCell::new`](crate::state::StateCell::new); independent managers can
/// be created with [`SnapshotManager::new`] (each test does).
#[derive(Clone)]
pub struct SnapshotManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SnapshotManager")
            .field("global_id", &state.global_id)
            .field("open", &state.open.len())
            .field("pending_global", &state.global_writes.len())
            .finish()
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotManager {
    pub fn new() -> Self {
        // id 0 tags initial records, 1 is the first global snapshot.
        Self {
            inner: Arc::new(ManagerInner {
                next_id: AtomicU64::new(2),
                state: Mutex::new(ManagerState {
                    open: BTreeMap::new(),
                    tags: BTreeSet::new(),
                    global_id: 1,
                    global_writes: Vec::new(),
                    global_written: HashSet::new(),
                }),
                global_view: RwLock::new(Arc::new(Visibility::committed(std::iter::empty()))),
                write_observers: RwLock::new(SlotMap::with_key()),
                apply_observers: RwLock::new(SlotMap::with_key()),
            }),
        }
    }

    /// The process-wide manager, created on first use and never torn down.
    pub fn global() -> &'static SnapshotManager {
        GLOBAL.get_or_init(SnapshotManager::new)
    }

    pub(crate) fn same_as(&self, other: &SnapshotManager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn next_id(&self) -> SnapshotId {
        self.inner.next_id.fetch_add(1, Ordering::AcqRel)
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock()
    }

    pub(crate) fn global_id(&self) -> SnapshotId {
        self.lock().global_id
    }

    pub(crate) fn global_view(&self) -> Arc<Visibility> {
        self.inner.global_view.read().clone()
    }

    fn refresh_view(&self, state: &ManagerState) {
        *self.inner.global_view.write() = Arc::new(Visibility::committed(state.unpublished()));
    }

    /// Number of snapshots neither applied nor disposed.
    pub fn open_snapshots(&self) -> usize {
        self.lock().open.len()
    }

    /// Handle to the global snapshot: the view of everything applied.
    pub fn global_snapshot(&self) -> Snapshot {
        Snapshot::from_inner(SnapshotInner {
            id: 0,
            kind: SnapshotFlags::GLOBAL | SnapshotFlags::MUTABLE,
            manager: self.clone(),
            parent: None,
            visibility: RwLock::new(Arc::new(Visibility::committed(std::iter::empty()))),
            read_observer: None,
            write_observer: None,
            state: Mutex::new(SnapshotState::default()),
        })
    }

    /// Takes a read-only snapshot of the current global state.
    pub fn take_snapshot(&self, read_observer: Option<ReadObserver>) -> Snapshot {
        self.take_top_level(SnapshotFlags::empty(), read_observer, None)
    }

    /// Takes a snapshot that buffers writes until it is applied.
    pub fn take_mutable_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Snapshot {
        self.take_top_level(SnapshotFlags::MUTABLE, read_observer, write_observer)
    }

    fn take_top_level(
        &self,
        kind: SnapshotFlags,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Snapshot {
        let mut state = self.lock();
        let id = self.next_id();
        let open = Arc::new(state.unpublished().copied().collect());
        let visibility = Visibility::top_level(id, open);
        state.open.insert(id, visibility.base());
        // Global writes made from now on must stay invisible to this snapshot.
        state.global_id = self.next_id();
        self.refresh_view(&state);
        drop(state);

        log::debug!("snapshot {id} taken ({kind:?})");
        Snapshot::from_inner(SnapshotInner {
            id,
            kind,
            manager: self.clone(),
            parent: None,
            visibility: RwLock::new(Arc::new(visibility)),
            read_observer,
            write_observer,
            state: Mutex::new(SnapshotState::default()),
        })
    }

    pub(crate) fn take_nested(
        &self,
        parent: &Snapshot,
        mutable: bool,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        if parent.is_global() {
            return Ok(if mutable {
                self.take_mutable_snapshot(read_observer, write_observer)
            } else {
                self.take_snapshot(read_observer)
            });
        }
        if mutable && parent.is_read_only() {
            return Err(SnapshotError::ReadOnly {
                snapshot: parent.id(),
            });
        }

        let mut state = self.lock();
        let mut parent_state = parent.state();
        if parent_state.is_closed() {
            return Err(SnapshotError::Closed {
                snapshot: parent.id(),
            });
        }
        let id = self.next_id();
        let parent_view = parent.visibility();
        let visibility = parent_view.nested(id);
        state.open.insert(id, visibility.base());
        if !parent.is_read_only() {
            // Later parent writes go under a tag the child does not see.
            let tag = self.next_id();
            state.tags.insert(tag);
            parent.set_visibility(parent_view.with_tag(tag));
        }
        parent_state.open_children += 1;
        self.refresh_view(&state);
        drop(parent_state);
        drop(state);

        let mut kind = SnapshotFlags::NESTED;
        if mutable {
            kind |= SnapshotFlags::MUTABLE;
        }
        let inner = parent.inner();
        log::debug!("snapshot {id} nested in {}", inner.id);
        Ok(Snapshot::from_inner(SnapshotInner {
            id,
            kind,
            manager: self.clone(),
            parent: Some(parent.clone()),
            visibility: RwLock::new(Arc::new(visibility)),
            read_observer: chain_observers(read_observer, inner.read_observer.clone()),
            write_observer: chain_observers(write_observer, inner.write_observer.clone()),
            state: Mutex::new(SnapshotState::default()),
        }))
    }

    pub(crate) fn apply(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if snapshot.is_global() {
            self.send_apply_notifications();
            return Ok(());
        }
        let id = snapshot.id();
        if snapshot.is_read_only() {
            return Err(SnapshotError::ReadOnly { snapshot: id });
        }
        if snapshot::is_current(snapshot) {
            return Err(SnapshotError::EnteredOnApply { snapshot: id });
        }
        if snapshot.is_nested() {
            return self.apply_nested(snapshot);
        }

        let mut state = self.lock();
        // Held until the snapshot is closed so no write slips in meanwhile.
        let mut own = snapshot.state();
        if own.is_closed() {
            return Err(SnapshotError::Closed { snapshot: id });
        }
        if own.open_children > 0 {
            return Err(SnapshotError::PendingChildren {
                snapshot: id,
                count: own.open_children,
            });
        }
        let writes = own.writes.clone();
        let view = snapshot.visibility();

        let committed = Visibility::committed(state.unpublished());
        let baseline = view.baseline();
        let mut merges = Vec::new();
        let mut conflicts = Vec::new();
        for object in &writes {
            match object.clone().check_apply(view.tags(), &baseline, &committed) {
                ApplyCheck::Clean => {}
                ApplyCheck::Merged(merge) => merges.push(merge),
                ApplyCheck::Conflict => conflicts.push(object.id()),
            }
        }
        if !conflicts.is_empty() {
            log::warn!(
                "snapshot {id} failed to apply: {} conflicting cell(s)",
                conflicts.len()
            );
            return Err(SnapshotError::ApplyConflict {
                snapshot: id,
                cells: conflicts,
            });
        }
        for merge in merges {
            merge();
        }

        // Records move to a fresh id so the apply order is the id order.
        let commit = self.next_id();
        for object in &writes {
            object.retag(view.tags(), commit);
        }
        own.closed |= SnapshotFlags::APPLIED;
        drop(own);
        state.release(&view);

        let global_changes = std::mem::take(&mut state.global_writes);
        state.global_written.clear();
        state.global_id = self.next_id();
        self.refresh_view(&state);
        self.reclaim(&state, global_changes.iter().chain(writes.iter()));
        drop(state);

        log::debug!(
            "snapshot {id} applied as {commit} ({} cell(s))",
            writes.len()
        );
        if !global_changes.is_empty() {
            self.notify_apply(&ids(&global_changes), &self.global_snapshot());
        }
        if !writes.is_empty() {
            self.notify_apply(&ids(&writes), snapshot);
        }
        Ok(())
    }

    /// Merges a nested snapshot's writes into its parent. Nothing becomes
    /// globally visible until the outermost snapshot applies.
    fn apply_nested(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let id = snapshot.id();
        let Some(parent) = snapshot.parent() else {
            return Err(SnapshotError::Closed { snapshot: id });
        };
        let mut state = self.lock();
        let mut own = snapshot.state();
        if own.is_closed() {
            return Err(SnapshotError::Closed { snapshot: id });
        }
        if own.open_children > 0 {
            return Err(SnapshotError::PendingChildren {
                snapshot: id,
                count: own.open_children,
            });
        }
        let writes = own.writes.clone();
        let view = snapshot.visibility();

        let mut parent_state = parent.state();
        if parent_state.is_closed() {
            return Err(SnapshotError::Closed {
                snapshot: parent.id(),
            });
        }
        if !writes.is_empty() {
            // A fresh parent tag keeps the merged records out of sight of
            // the parent's other open children.
            let tag = self.next_id();
            for object in &writes {
                object.retag(view.tags(), tag);
                parent_state.record_write(object.clone());
            }
            state.tags.insert(tag);
            parent.set_visibility(parent.visibility().with_tag(tag));
        }
        parent_state.open_children = parent_state.open_children.saturating_sub(1);
        drop(parent_state);

        own.closed |= SnapshotFlags::APPLIED;
        drop(own);
        state.release(&view);
        self.refresh_view(&state);
        drop(state);

        log::debug!(
            "snapshot {id} applied into parent {} ({} cell(s))",
            parent.id(),
            writes.len()
        );
        Ok(())
    }

    pub(crate) fn dispose(&self, snapshot: &Snapshot) {
        if snapshot.is_global() {
            return;
        }
        let id = snapshot.id();
        let mut state = self.lock();
        let (writes, view) = {
            let mut own = snapshot.state();
            if own.is_closed() {
                return;
            }
            own.closed |= SnapshotFlags::DISPOSED;
            (own.take_writes(), snapshot.visibility())
        };
        for object in &writes {
            object.discard(view.tags());
        }
        if let Some(parent) = snapshot.parent() {
            let mut parent_state = parent.state();
            parent_state.open_children = parent_state.open_children.saturating_sub(1);
        }
        state.release(&view);
        self.refresh_view(&state);
        drop(state);
        log::debug!("snapshot {id} disposed ({} write(s) dropped)", writes.len());
    }

    /// Publishes writes made to the global snapshot since the last call,
    /// notifying apply observers with the changed cells.
    pub fn send_apply_notifications(&self) {
        let mut state = self.lock();
        if state.global_writes.is_empty() {
            return;
        }
        let changes = std::mem::take(&mut state.global_writes);
        state.global_written.clear();
        state.global_id = self.next_id();
        self.reclaim(&state, changes.iter());
        drop(state);
        self.notify_apply(&ids(&changes), &self.global_snapshot());
    }

    /// Whether writes to the global snapshot are waiting for
    /// [`send_apply_notifications`](Self::send_apply_notifications).
    pub fn has_pending_changes(&self) -> bool {
        !self.lock().global_writes.is_empty()
    }

    /// Runs a global write with the manager locked so the global id cannot
    /// advance underneath it. `write` returns whether it changed anything.
    pub(crate) fn with_global_write(
        &self,
        object: Arc<dyn StateObject>,
        write: impl FnOnce(SnapshotId) -> bool,
    ) -> bool {
        let mut state = self.lock();
        let changed = write(state.global_id);
        if changed && state.global_written.insert(object.id()) {
            state.global_writes.push(object);
        }
        changed
    }

    fn reclaim<'a>(
        &self,
        state: &ManagerState,
        objects: impl Iterator<Item = &'a Arc<dyn StateObject>>,
    ) {
        let mut pins: Vec<SnapshotId> = state.open.values().copied().collect();
        pins.push(SnapshotId::MAX);
        pins.sort_unstable();
        pins.dedup();
        let committed = Visibility::committed(state.unpublished());
        for object in objects {
            object.reclaim(&pins, &committed);
        }
    }

    pub fn register_global_write_observer(
        &self,
        observer: impl Fn(CellId) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let key = self.inner.write_observers.write().insert(Arc::new(observer));
        ObserverHandle {
            manager: Arc::downgrade(&self.inner),
            key,
            kind: ObserverKind::Write,
        }
    }

    pub fn register_apply_observer(
        &self,
        observer: impl Fn(&[CellId], &Snapshot) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let key = self.inner.apply_observers.write().insert(Arc::new(observer));
        ObserverHandle {
            manager: Arc::downgrade(&self.inner),
            key,
            kind: ObserverKind::Apply,
        }
    }

    pub(crate) fn notify_global_write(&self, cell: CellId) {
        let observers: Vec<WriteObserver> =
            self.inner.write_observers.read().values().cloned().collect();
        for observer in observers {
            observer(cell);
        }
    }

    fn notify_apply(&self, cells: &[CellId], snapshot: &Snapshot) {
        let observers: Vec<ApplyObserver> =
            self.inner.apply_observers.read().values().cloned().collect();
        for observer in observers {
            observer(cells, snapshot);
        }
    }
}

fn ids(objects: &[Arc<dyn StateObject>]) -> Vec<CellId> {
    objects.iter().map(|o| o.id()).collect()
}

#[derive(Clone, Copy, Debug)]
enum ObserverKind {
    Write,
    Apply,
}

/// Registration of a global observer. Observers stay registered until
/// [`dispose`](ObserverHandle::dispose) is called; dropping the handle does
/// not unregister.
#[derive(Debug)]
pub struct ObserverHandle {
    manager: Weak<ManagerInner>,
    key: ObserverKey,
    kind: ObserverKind,
}

impl ObserverHandle {
    /// Unregisters the observer. Idempotent.
    pub fn dispose(&self) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        match self.kind {
            ObserverKind::Write => {
                inner.write_observers.write().remove(self.key);
            }
            ObserverKind::Apply => {
                inner.apply_observers.write().remove(self.key);
            }
        }
    }
}
