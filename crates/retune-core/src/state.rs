//! # State cells
//!
//! A [`StateCell`] is a versioned memory location. Every write made inside a
//! snapshot appends a record tagged with that snapshot's id; reads pick the
//! newest record the reading snapshot is allowed to see.
//!
//! ```rust
//! use retune_core::*;
//!
//! let manager = SnapshotManager::new();
//! let x = StateCell::with_manager(&manager, "A");
//!
//! let s1 = manager.take_mutable_snapshot(None, None);
//! s1.enter(|| x.set("B")).unwrap().unwrap();
//!
//! assert_eq!(x.get(), "A");
//! s1.apply().unwrap();
//! assert_eq!(x.get(), "B");
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::error::SnapshotError;
use crate::manager::SnapshotManager;
use crate::snapshot::{self, ROOT_SNAPSHOT_ID, Snapshot, SnapshotId, Visibility};

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a state cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        CellId(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// Decides when two values of a cell are the same, and how concurrent
/// writes may be merged at apply time.
pub trait MutationPolicy<T>: Send + Sync + 'static {
    fn equivalent(&self, a: &T, b: &T) -> bool;

    /// Called when `current` was applied by someone else after the applying
    /// snapshot read `previous`. Returning `None` reports a conflict.
    fn merge(&self, previous: &T, current: &T, applied: &T) -> Option<T> {
        let _ = (previous, current, applied);
        None
    }
}

/// Values compare with `PartialEq`. The default policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralEquality;

impl<T: PartialEq> MutationPolicy<T> for StructuralEquality {
    fn equivalent(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

/// Every write is a change.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverEqual;

impl<T> MutationPolicy<T> for NeverEqual {
    fn equivalent(&self, _a: &T, _b: &T) -> bool {
        false
    }
}

/// `Arc` payloads compare by pointer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferentialEquality;

impl<U: ?Sized + Send + Sync + 'static> MutationPolicy<Arc<U>> for ReferentialEquality {
    fn equivalent(&self, a: &Arc<U>, b: &Arc<U>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

struct Record<T> {
    snapshot: SnapshotId,
    value: Arc<T>,
}

/// Outcome of checking one written cell while a snapshot applies.
pub(crate) enum ApplyCheck {
    Clean,
    /// The policy merged the concurrent writes; running the closure stores
    /// the merged value in the applying snapshot's record.
    Merged(Box<dyn FnOnce() + Send>),
    Conflict,
}

/// Type-erased view of a cell used by snapshots and the manager.
pub(crate) trait StateObject: Send + Sync {
    fn id(&self) -> CellId;

    /// `tags` are the write tags of the applying snapshot.
    fn check_apply(
        self: Arc<Self>,
        tags: &[SnapshotId],
        baseline: &Visibility,
        current: &Visibility,
    ) -> ApplyCheck;

    /// Moves the newest record created under `from` to `to` and drops the
    /// others, replacing any record `to` already had.
    fn retag(&self, from: &[SnapshotId], to: SnapshotId);

    /// Drops the records created by an abandoned snapshot.
    fn discard(&self, tags: &[SnapshotId]);

    /// Drops committed records shadowed for every reader. `pins` holds the
    /// base of each open snapshot plus `SnapshotId::MAX` for the global view.
    fn reclaim(&self, pins: &[SnapshotId], committed: &Visibility);

    fn record_count(&self) -> usize;
}

struct CellInner<T> {
    id: CellId,
    manager: SnapshotManager,
    policy: Box<dyn MutationPolicy<T>>,
    records: RwLock<SmallVec<[Record<T>; 2]>>,
}

impl<T> CellInner<T> {
    fn newest<'a>(
        records: &'a [Record<T>],
        visibility: &Visibility,
    ) -> Option<&'a Record<T>> {
        records
            .iter()
            .filter(|r| visibility.is_visible(r.snapshot))
            .max_by_key(|r| r.snapshot)
    }
}

impl<T: Send + Sync + 'static> StateObject for CellInner<T> {
    fn id(&self) -> CellId {
        self.id
    }

    fn check_apply(
        self: Arc<Self>,
        tags: &[SnapshotId],
        baseline: &Visibility,
        current: &Visibility,
    ) -> ApplyCheck {
        let (own, applied, previous, latest) = {
            let records = self.records.read();
            let Some(applied) = records
                .iter()
                .filter(|r| tags.contains(&r.snapshot))
                .max_by_key(|r| r.snapshot)
            else {
                return ApplyCheck::Clean;
            };
            match (
                Self::newest(&records, baseline),
                Self::newest(&records, current),
            ) {
                (Some(p), Some(l)) if p.snapshot != l.snapshot => (
                    applied.snapshot,
                    applied.value.clone(),
                    p.value.clone(),
                    l.value.clone(),
                ),
                _ => return ApplyCheck::Clean,
            }
        };
        if self.policy.equivalent(&latest, &applied) {
            return ApplyCheck::Clean;
        }
        match self.policy.merge(&previous, &latest, &applied) {
            Some(merged) => ApplyCheck::Merged(Box::new(move || {
                let mut records = self.records.write();
                if let Some(r) = records.iter_mut().find(|r| r.snapshot == own) {
                    r.value = Arc::new(merged);
                }
            })),
            None => ApplyCheck::Conflict,
        }
    }

    fn retag(&self, from: &[SnapshotId], to: SnapshotId) {
        let mut records = self.records.write();
        let Some(newest) = records
            .iter()
            .map(|r| r.snapshot)
            .filter(|s| from.contains(s))
            .max()
        else {
            return;
        };
        records.retain(|r| r.snapshot != to && (r.snapshot == newest || !from.contains(&r.snapshot)));
        for r in records.iter_mut() {
            if r.snapshot == newest {
                r.snapshot = to;
            }
        }
    }

    fn discard(&self, tags: &[SnapshotId]) {
        self.records.write().retain(|r| !tags.contains(&r.snapshot));
    }

    fn reclaim(&self, pins: &[SnapshotId], committed: &Visibility) {
        let mut records = self.records.write();
        let keep: SmallVec<[SnapshotId; 4]> = pins
            .iter()
            .filter_map(|&pin| {
                records
                    .iter()
                    .map(|r| r.snapshot)
                    .filter(|&s| s <= pin && committed.is_visible(s))
                    .max()
            })
            .collect();
        let before = records.len();
        records.retain(|r| !committed.is_visible(r.snapshot) || keep.contains(&r.snapshot));
        if records.len() != before {
            log::trace!(
                "{}: reclaimed {} record(s)",
                self.id,
                before - records.len()
            );
        }
    }

    fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

/// A snapshot-aware mutable value.
///
/// Cloning the handle shares the cell. Reads outside any entered snapshot see
/// the global snapshot; reads inside see that snapshot's isolated view.
pub struct StateCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug + Send + Sync + 'static> fmt::Debug for StateCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("StateCell");
        d.field("id", &self.inner.id);
        self.with(|v| {
            d.field("value", v);
        });
        d.finish()
    }
}

impl<T: PartialEq + Send + Sync + 'static> StateCell<T> {
    /// Creates a cell in the process-wide manager.
    pub fn new(value: T) -> Self {
        Self::with_policy(SnapshotManager::global(), value, StructuralEquality)
    }

    pub fn with_manager(manager: &SnapshotManager, value: T) -> Self {
        Self::with_policy(manager, value, StructuralEquality)
    }
}

impl<T: Send + Sync + 'static> StateCell<T> {
    pub fn with_policy(
        manager: &SnapshotManager,
        value: T,
        policy: impl MutationPolicy<T>,
    ) -> Self {
        let mut records = SmallVec::new();
        records.push(Record {
            snapshot: ROOT_SNAPSHOT_ID,
            value: Arc::new(value),
        });
        Self {
            inner: Arc::new(CellInner {
                id: CellId::next(),
                manager: manager.clone(),
                policy: Box::new(policy),
                records: RwLock::new(records),
            }),
        }
    }

    pub fn id(&self) -> CellId {
        self.inner.id
    }

    pub fn manager(&self) -> &SnapshotManager {
        &self.inner.manager
    }

    /// Reads the value visible to the current snapshot of this thread.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Borrows the visible value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let snapshot = snapshot::current_for(&self.inner.manager);
        self.read_with(&snapshot, f)
    }

    /// Reads the value visible to `snapshot`, whether or not it is entered.
    pub fn read_in(&self, snapshot: &Snapshot) -> T
    where
        T: Clone,
    {
        self.read_with(snapshot, T::clone)
    }

    fn view_of(&self, snapshot: &Snapshot) -> Arc<Visibility> {
        if snapshot.is_global() {
            self.inner.manager.global_view()
        } else {
            snapshot.visibility()
        }
    }

    /// The newest record `view` can see. Only the `Arc` is taken under the
    /// lock, so callers may write the cell while holding the value.
    fn visible(&self, view: &Visibility) -> Option<Arc<T>> {
        let records = self.inner.records.read();
        CellInner::newest(&records, view).map(|r| r.value.clone())
    }

    fn read_with<R>(&self, snapshot: &Snapshot, f: impl FnOnce(&T) -> R) -> R {
        let Some(value) = self.visible(&self.view_of(snapshot)) else {
            panic!(
                "{} has no record visible to snapshot {}",
                self.inner.id,
                snapshot.id()
            );
        };
        let out = f(&value);
        snapshot.notify_read(self.inner.id);
        out
    }

    /// Writes into the current snapshot of this thread, or the global
    /// snapshot when none is entered.
    pub fn set(&self, value: T) -> Result<(), SnapshotError> {
        let snapshot = snapshot::current_for(&self.inner.manager);
        self.write_unchecked(&snapshot, value)
    }

    /// Read-modify-write in the current snapshot.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<(), SnapshotError> {
        let next = self.with(f);
        self.set(next)
    }

    /// Writes through an explicit snapshot, which must be the one currently
    /// entered on this thread (or the global snapshot when none is).
    pub fn write_in(&self, snapshot: &Snapshot, value: T) -> Result<(), SnapshotError> {
        let current = snapshot::current_for(&self.inner.manager);
        if !current.same_as(snapshot) {
            return Err(SnapshotError::IllegalWrite {
                cell: self.inner.id,
                snapshot: snapshot.id(),
                reason: "snapshot is not current on this thread",
            });
        }
        self.write_unchecked(snapshot, value)
    }

    fn write_unchecked(&self, snapshot: &Snapshot, value: T) -> Result<(), SnapshotError> {
        let id = self.inner.id;
        let rejected = |reason: &'static str| SnapshotError::IllegalWrite {
            cell: id,
            snapshot: snapshot.id(),
            reason,
        };
        if let Some(reason) = snapshot.write_rejection() {
            return Err(rejected(reason));
        }

        if snapshot.is_global() {
            let manager = self.inner.manager.clone();
            let changed = manager.with_global_write(self.inner.clone(), |tag| {
                if self.shows(&manager.global_view(), &value) {
                    return false;
                }
                self.put(tag, value);
                true
            });
            if !changed {
                return Ok(());
            }
        } else {
            if self.shows(&snapshot.visibility(), &value) {
                return Ok(());
            }
            // Apply and dispose close the snapshot under this lock, so the
            // record and its write-set entry land together or not at all.
            let mut state = snapshot.state();
            if state.is_closed() {
                return Err(rejected("snapshot is closed"));
            }
            self.put(snapshot.visibility().tag(), value);
            state.record_write(self.inner.clone());
        }

        snapshot.notify_write(id);
        self.inner.manager.notify_global_write(id);
        Ok(())
    }

    /// Whether `view` already sees a value equivalent to `value`.
    fn shows(&self, view: &Visibility, value: &T) -> bool {
        self.visible(view)
            .is_some_and(|visible| self.inner.policy.equivalent(&visible, value))
    }

    /// Stores `value` under `tag`, replacing the record already there.
    fn put(&self, tag: SnapshotId, value: T) {
        let value = Arc::new(value);
        let mut records = self.inner.records.write();
        match records.iter_mut().find(|r| r.snapshot == tag) {
            Some(own) => own.value = value,
            None => records.push(Record {
                snapshot: tag,
                value,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        self.inner.record_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_write_is_a_no_op() {
        let manager = SnapshotManager::new();
        let cell = StateCell::with_manager(&manager, 3);
        let writes = Arc::new(AtomicU64::new(0));
        let w = writes.clone();
        let _h = manager.register_global_write_observer(move |_| {
            w.fetch_add(1, Ordering::SeqCst);
        });

        cell.set(3).unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 0);
        cell.set(4).unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_equal_policy_records_every_write() {
        let manager = SnapshotManager::new();
        let cell = StateCell::with_policy(&manager, 1, NeverEqual);
        let s = manager.take_mutable_snapshot(None, None);
        let observed = Arc::new(AtomicU64::new(0));
        let o = observed.clone();
        let _h = manager.register_global_write_observer(move |_| {
            o.fetch_add(1, Ordering::SeqCst);
        });
        s.enter(|| {
            cell.set(1).unwrap();
            cell.set(1).unwrap();
        })
        .unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 2);
        s.dispose();
    }

    #[test]
    fn referential_policy_compares_pointers() {
        let manager = SnapshotManager::new();
        let shared = Arc::new(String::from("x"));
        let cell = StateCell::with_policy(&manager, shared.clone(), ReferentialEquality);
        let before = cell.record_count();
        cell.set(shared.clone()).unwrap();
        assert_eq!(cell.record_count(), before);
        cell.set(Arc::new(String::from("x"))).unwrap();
        assert!(!Arc::ptr_eq(&cell.get(), &shared));
    }

    #[test]
    fn update_reads_then_writes() {
        let manager = SnapshotManager::new();
        let cell = StateCell::with_manager(&manager, 10);
        cell.update(|v| v + 5).unwrap();
        assert_eq!(cell.get(), 15);
    }

    #[test]
    fn value_can_be_written_while_borrowed() {
        let manager = SnapshotManager::new();
        let cell = StateCell::with_manager(&manager, 1);
        cell.with(|v| cell.set(*v + 1)).unwrap();
        assert_eq!(cell.get(), 2);

        let s = manager.take_mutable_snapshot(None, None);
        s.enter(|| cell.with(|v| cell.set(*v * 10)))
            .unwrap()
            .unwrap();
        assert_eq!(cell.read_in(&s), 20);
        s.dispose();
    }

    #[test]
    fn write_in_requires_current_snapshot() {
        let manager = SnapshotManager::new();
        let cell = StateCell::with_manager(&manager, 0);
        let s = manager.take_mutable_snapshot(None, None);

        let err = cell.write_in(&s, 1).unwrap_err();
        assert!(matches!(err, SnapshotError::IllegalWrite { .. }));

        s.enter(|| cell.write_in(&s, 1)).unwrap().unwrap();
        assert_eq!(cell.read_in(&s), 1);
        assert_eq!(cell.get(), 0);
        s.dispose();
    }

    #[test]
    fn reads_in_read_only_snapshot_reject_writes() {
        let manager = SnapshotManager::new();
        let cell = StateCell::with_manager(&manager, 0);
        let s = manager.take_snapshot(None);
        let err = s.enter(|| cell.set(1)).unwrap().unwrap_err();
        assert!(matches!(err, SnapshotError::IllegalWrite { .. }));
        s.dispose();
    }
}
