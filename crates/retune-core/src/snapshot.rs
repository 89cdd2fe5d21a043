//! # Snapshots
//!
//! A snapshot is an isolated, read-stable view over every [`StateCell`].
//! Mutable snapshots buffer their writes until they are applied; nested
//! snapshots see their parent's view plus their own writes.
//!
//! Each thread has at most one *current* snapshot, set for the duration of
//! [`Snapshot::enter`]. Reads and writes made outside any entered snapshot go
//! to the global snapshot.
//!
//! [`StateCell`]: crate::state::StateCell

use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard, RwLock};
use smallvec::{SmallVec, smallvec};

use crate::error::SnapshotError;
use crate::manager::SnapshotManager;
use crate::state::{CellId, StateObject};

pub type SnapshotId = u64;

/// Id carried by the initial record of every cell; visible to everyone.
pub const ROOT_SNAPSHOT_ID: SnapshotId = 0;

pub type ReadObserver = Arc<dyn Fn(CellId) + Send + Sync>;
pub type WriteObserver = Arc<dyn Fn(CellId) + Send + Sync>;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SnapshotFlags: u8 {
        const MUTABLE = 1;
        const NESTED = 1 << 1;
        const GLOBAL = 1 << 2;
        const APPLIED = 1 << 3;
        const DISPOSED = 1 << 4;
    }
}

/// Which records a reader may see.
///
/// A record tagged `s` is visible when `s` is one of `own`, or when
/// `s <= base` and `s` was not open at the time the reader was taken.
///
/// `own` holds the ancestors' write tags as they were when the reader was
/// taken, followed by the reader's own tags. A mutable snapshot gets a new
/// tag whenever it nests a child or a child applies into it, so open
/// children never see what the parent gains afterwards.
#[derive(Clone, Debug)]
pub(crate) struct Visibility {
    base: SnapshotId,
    invalid: Arc<BTreeSet<SnapshotId>>,
    own: SmallVec<[SnapshotId; 4]>,
    /// Index in `own` of the reader's first tag.
    split: usize,
}

impl Visibility {
    pub(crate) fn top_level(id: SnapshotId, open: Arc<BTreeSet<SnapshotId>>) -> Self {
        Self {
            base: id.saturating_sub(1),
            invalid: open,
            own: smallvec![id],
            split: 0,
        }
    }

    /// Everything that has been applied, as seen by the global snapshot.
    pub(crate) fn committed<'a>(open: impl Iterator<Item = &'a SnapshotId>) -> Self {
        Self {
            base: SnapshotId::MAX,
            invalid: Arc::new(open.copied().collect()),
            own: SmallVec::new(),
            split: 0,
        }
    }

    pub(crate) fn nested(&self, id: SnapshotId) -> Self {
        let mut own = self.own.clone();
        own.push(id);
        Self {
            base: self.base,
            invalid: self.invalid.clone(),
            split: self.own.len(),
            own,
        }
    }

    /// The same view with `tag` as the new write tag.
    pub(crate) fn with_tag(&self, tag: SnapshotId) -> Self {
        let mut next = self.clone();
        next.own.push(tag);
        next
    }

    /// The view this snapshot started from, without its own records.
    pub(crate) fn baseline(&self) -> Self {
        let own: SmallVec<[SnapshotId; 4]> = self.own[..self.split].into();
        Self {
            base: self.base,
            invalid: self.invalid.clone(),
            split: own.len(),
            own,
        }
    }

    /// Every tag the reader has written under, oldest first.
    pub(crate) fn tags(&self) -> &[SnapshotId] {
        &self.own[self.split..]
    }

    /// The tag new writes are stored under.
    pub(crate) fn tag(&self) -> SnapshotId {
        self.own.last().copied().unwrap_or(self.base)
    }

    pub(crate) fn base(&self) -> SnapshotId {
        self.base
    }

    #[inline]
    pub(crate) fn is_visible(&self, id: SnapshotId) -> bool {
        self.own.contains(&id) || (id <= self.base && !self.invalid.contains(&id))
    }
}

#[derive(Default)]
pub(crate) struct SnapshotState {
    pub(crate) closed: SnapshotFlags,
    pub(crate) writes: Vec<Arc<dyn StateObject>>,
    written: HashSet<CellId>,
    pub(crate) open_children: usize,
}

impl SnapshotState {
    pub(crate) fn is_closed(&self) -> bool {
        !self.closed.is_empty()
    }

    pub(crate) fn record_write(&mut self, object: Arc<dyn StateObject>) {
        if self.written.insert(object.id()) {
            self.writes.push(object);
        }
    }

    pub(crate) fn take_writes(&mut self) -> Vec<Arc<dyn StateObject>> {
        self.written.clear();
        std::mem::take(&mut self.writes)
    }
}

pub(crate) struct SnapshotInner {
    pub(crate) id: SnapshotId,
    pub(crate) kind: SnapshotFlags,
    pub(crate) manager: SnapshotManager,
    pub(crate) parent: Option<Snapshot>,
    pub(crate) visibility: RwLock<Arc<Visibility>>,
    pub(crate) read_observer: Option<ReadObserver>,
    pub(crate) write_observer: Option<WriteObserver>,
    pub(crate) state: Mutex<SnapshotState>,
}

/// Handle to a snapshot. Clones share the same snapshot; dropping handles
/// never disposes it.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("closed", &self.inner.state.lock().closed)
            .finish()
    }
}

impl Snapshot {
    pub(crate) fn from_inner(inner: SnapshotInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The snapshot id. For the global snapshot this is the id global writes
    /// are currently tagged with.
    pub fn id(&self) -> SnapshotId {
        if self.is_global() {
            self.inner.manager.global_id()
        } else {
            self.inner.id
        }
    }

    pub fn flags(&self) -> SnapshotFlags {
        self.inner.kind | self.inner.state.lock().closed
    }

    pub fn is_read_only(&self) -> bool {
        !self.inner.kind.contains(SnapshotFlags::MUTABLE)
    }

    pub fn is_nested(&self) -> bool {
        self.inner.kind.contains(SnapshotFlags::NESTED)
    }

    pub fn is_global(&self) -> bool {
        self.inner.kind.contains(SnapshotFlags::GLOBAL)
    }

    pub fn is_open(&self) -> bool {
        !self.inner.state.lock().is_closed()
    }

    pub fn parent(&self) -> Option<&Snapshot> {
        self.inner.parent.as_ref()
    }

    pub fn manager(&self) -> &SnapshotManager {
        &self.inner.manager
    }

    /// Cells written in this snapshot so far.
    pub fn modified(&self) -> Vec<CellId> {
        self.inner
            .state
            .lock()
            .writes
            .iter()
            .map(|o| o.id())
            .collect()
    }

    /// Makes this snapshot current on the calling thread while `f` runs.
    /// The previous current snapshot is restored on every exit path,
    /// including unwinding.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> Result<R, SnapshotError> {
        let _guard = self.make_current()?;
        Ok(f())
    }

    /// Publishes this snapshot's writes: into the global timeline for a
    /// top-level snapshot, into the parent for a nested one.
    pub fn apply(&self) -> Result<(), SnapshotError> {
        self.inner.manager.apply(self)
    }

    /// Abandons the snapshot and its writes. Idempotent.
    pub fn dispose(&self) {
        self.inner.manager.dispose(self)
    }

    pub fn take_nested_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        self.inner
            .manager
            .take_nested(self, false, read_observer, None)
    }

    pub fn take_nested_mutable_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        self.inner
            .manager
            .take_nested(self, true, read_observer, write_observer)
    }

    pub(crate) fn inner(&self) -> &SnapshotInner {
        &self.inner
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SnapshotState> {
        self.inner.state.lock()
    }

    pub(crate) fn visibility(&self) -> Arc<Visibility> {
        self.inner.visibility.read().clone()
    }

    /// Replaces the view. Callers hold this snapshot's state lock.
    pub(crate) fn set_visibility(&self, visibility: Visibility) {
        *self.inner.visibility.write() = Arc::new(visibility);
    }

    pub(crate) fn same_as(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.is_global()
                && other.is_global()
                && self.inner.manager.same_as(&other.inner.manager))
    }

    pub(crate) fn write_rejection(&self) -> Option<&'static str> {
        if self.is_read_only() {
            Some("snapshot is read-only")
        } else if self.state().is_closed() {
            Some("snapshot is closed")
        } else {
            None
        }
    }

    pub(crate) fn record_write(&self, object: Arc<dyn StateObject>) {
        self.state().record_write(object);
    }

    pub(crate) fn notify_read(&self, cell: CellId) {
        if let Some(observer) = &self.inner.read_observer {
            observer(cell);
        }
        for observer in local_observers(|o| o.read.clone()) {
            observer(cell);
        }
    }

    pub(crate) fn notify_write(&self, cell: CellId) {
        if let Some(observer) = &self.inner.write_observer {
            observer(cell);
        }
        for observer in local_observers(|o| o.write.clone()) {
            observer(cell);
        }
    }

    pub(crate) fn make_current(&self) -> Result<CurrentGuard, SnapshotError> {
        if self.state().is_closed() {
            return Err(SnapshotError::Closed { snapshot: self.id() });
        }
        let next = if self.is_global() {
            None
        } else {
            Some(self.clone())
        };
        let prev = CURRENT.with(|c| c.replace(next));
        Ok(CurrentGuard {
            prev,
            _not_send: PhantomData,
        })
    }
}

/// Chains two observers so both run, `first` first.
pub(crate) fn chain_observers(
    first: Option<ReadObserver>,
    second: Option<ReadObserver>,
) -> Option<ReadObserver> {
    match (first, second) {
        (Some(a), Some(b)) => Some(Arc::new(move |cell| {
            a(cell);
            b(cell);
        })),
        (a, b) => a.or(b),
    }
}

struct LocalObservers {
    read: Option<Rc<dyn Fn(CellId)>>,
    write: Option<Rc<dyn Fn(CellId)>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Snapshot>> = const { RefCell::new(None) };
    static LOCAL_OBSERVERS: RefCell<Vec<LocalObservers>> = const { RefCell::new(Vec::new()) };
}

fn local_observers(
    pick: impl Fn(&LocalObservers) -> Option<Rc<dyn Fn(CellId)>>,
) -> SmallVec<[Rc<dyn Fn(CellId)>; 2]> {
    LOCAL_OBSERVERS.with(|o| o.borrow().iter().filter_map(&pick).collect())
}

/// Restores the previously current snapshot when dropped.
pub(crate) struct CurrentGuard {
    prev: Option<Snapshot>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| {
            *c.borrow_mut() = prev;
        });
    }
}

/// The snapshot entered on this thread, if any.
pub fn current_snapshot() -> Option<Snapshot> {
    CURRENT.with(|c| c.borrow().clone())
}

/// The snapshot reads and writes of `manager`'s cells go through on this
/// thread.
pub(crate) fn current_for(manager: &SnapshotManager) -> Snapshot {
    CURRENT
        .with(|c| {
            c.borrow()
                .as_ref()
                .filter(|s| s.manager().same_as(manager))
                .cloned()
        })
        .unwrap_or_else(|| manager.global_snapshot())
}

pub(crate) fn is_current(snapshot: &Snapshot) -> bool {
    CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.inner, &snapshot.inner))
    })
}

/// Runs `block` with thread-local observers that see every read and write
/// made on this thread, whichever snapshot is current. Nested calls stack:
/// all active observers are notified.
pub fn observe<R>(
    read_observer: Option<Rc<dyn Fn(CellId)>>,
    write_observer: Option<Rc<dyn Fn(CellId)>>,
    block: impl FnOnce() -> R,
) -> R {
    let _guard = push_observers(read_observer, write_observer);
    block()
}

pub(crate) struct ObserverGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        LOCAL_OBSERVERS.with(|o| {
            o.borrow_mut().pop();
        });
    }
}

pub(crate) fn push_observers(
    read: Option<Rc<dyn Fn(CellId)>>,
    write: Option<Rc<dyn Fn(CellId)>>,
) -> ObserverGuard {
    LOCAL_OBSERVERS.with(|o| o.borrow_mut().push(LocalObservers { read, write }));
    ObserverGuard {
        _not_send: PhantomData,
    }
}

/// Takes a mutable snapshot, runs `block` inside it and applies it. The
/// snapshot is disposed if applying fails.
pub fn with_mutable_snapshot<R>(
    manager: &SnapshotManager,
    block: impl FnOnce() -> R,
) -> Result<R, SnapshotError> {
    let snapshot = manager.take_mutable_snapshot(None, None);
    let out = match snapshot.enter(block) {
        Ok(out) => out,
        Err(e) => {
            snapshot.dispose();
            return Err(e);
        }
    };
    if let Err(e) = snapshot.apply() {
        snapshot.dispose();
        return Err(e);
    }
    Ok(out)
}
