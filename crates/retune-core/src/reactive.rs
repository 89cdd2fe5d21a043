//! Snapshot flow: a value derived from state cells, recomputed whenever an
//! apply touches one of the cells it read.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::SnapshotError;
use crate::manager::{ObserverHandle, SnapshotManager};
use crate::snapshot::ReadObserver;
use crate::state::CellId;

struct WatchState<T> {
    value: T,
    deps: HashSet<CellId>,
}

struct Watch<T> {
    manager: SnapshotManager,
    block: Box<dyn Fn() -> T + Send + Sync>,
    on_change: Box<dyn Fn(&T) + Send + Sync>,
    /// Serializes evaluations so values are stored in apply order.
    eval: Mutex<()>,
    state: Mutex<WatchState<T>>,
}

impl<T: Clone + PartialEq> Watch<T> {
    /// Re-evaluates and returns the new value if it differs from the last.
    fn refresh(&self) -> Result<Option<T>, SnapshotError> {
        let _eval = self.eval.lock();
        let (value, deps) = evaluate(&self.manager, &*self.block)?;
        let mut st = self.state.lock();
        st.deps = deps;
        if st.value == value {
            return Ok(None);
        }
        st.value = value.clone();
        Ok(Some(value))
    }

    fn on_apply(&self, cells: &[CellId]) {
        let touched = {
            let st = self.state.lock();
            cells.iter().any(|c| st.deps.contains(c))
        };
        if !touched {
            return;
        }
        match self.refresh() {
            Ok(Some(value)) => (self.on_change)(&value),
            Ok(None) => {}
            Err(e) => log::warn!("watch: re-evaluation failed: {e}"),
        }
    }
}

/// Runs `block` in a fresh read-only snapshot, collecting the cells it read.
fn evaluate<T>(
    manager: &SnapshotManager,
    block: &(dyn Fn() -> T + Send + Sync),
) -> Result<(T, HashSet<CellId>), SnapshotError> {
    let reads: Arc<Mutex<HashSet<CellId>>> = Arc::default();
    let observer: ReadObserver = {
        let reads = reads.clone();
        Arc::new(move |cell| {
            reads.lock().insert(cell);
        })
    };
    let snapshot = manager.take_snapshot(Some(observer));
    let value = snapshot.enter(block);
    snapshot.dispose();
    let value = value?;
    let deps = std::mem::take(&mut *reads.lock());
    Ok((value, deps))
}

/// A live [`watch`]. Dropping it stops the watch.
pub struct WatchHandle<T> {
    watch: Arc<Watch<T>>,
    observer: ObserverHandle,
}

impl<T: fmt::Debug> fmt::Debug for WatchHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.watch.state.lock();
        f.debug_struct("WatchHandle")
            .field("value", &st.value)
            .field("deps", &st.deps.len())
            .finish()
    }
}

impl<T: Clone> WatchHandle<T> {
    /// The last value seen.
    pub fn current(&self) -> T {
        self.watch.state.lock().value.clone()
    }

    /// Cells the last evaluation read.
    pub fn dependencies(&self) -> Vec<CellId> {
        let mut deps: Vec<CellId> = self.watch.state.lock().deps.iter().copied().collect();
        deps.sort_unstable();
        deps
    }
}

impl<T> WatchHandle<T> {
    /// Stops the watch. Idempotent.
    pub fn dispose(&self) {
        self.observer.dispose();
    }
}

impl<T> Drop for WatchHandle<T> {
    fn drop(&mut self) {
        self.observer.dispose();
    }
}

/// Evaluates `block` now and again after every apply that changes a cell it
/// read, calling `on_change` with each new value that differs from the
/// previous one. `on_change` runs on the applying thread.
///
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use retune_core::*;
///
/// let manager = SnapshotManager::new();
/// let celsius = StateCell::with_manager(&manager, 20);
/// let seen = Arc::new(Mutex::new(Vec::new()));
///
/// let c = celsius.clone();
/// let s = seen.clone();
/// let fahrenheit = watch(
///     &manager,
///     move || c.get() * 9 / 5 + 32,
///     move |f| s.lock().unwrap().push(*f),
/// )?;
/// assert_eq!(fahrenheit.current(), 68);
///
/// with_mutable_snapshot(&manager, || celsius.set(100))??;
/// assert_eq!(*seen.lock().unwrap(), vec![212]);
/// # Ok::<(), SnapshotError>(())
/// ```
pub fn watch<T>(
    manager: &SnapshotManager,
    block: impl Fn() -> T + Send + Sync + 'static,
    on_change: impl Fn(&T) + Send + Sync + 'static,
) -> Result<WatchHandle<T>, SnapshotError>
where
    T: Clone + PartialEq + Send + 'static,
{
    let block: Box<dyn Fn() -> T + Send + Sync> = Box::new(block);
    let (value, deps) = evaluate(manager, &*block)?;
    let watch = Arc::new(Watch {
        manager: manager.clone(),
        block,
        on_change: Box::new(on_change),
        eval: Mutex::new(()),
        state: Mutex::new(WatchState { value, deps }),
    });
    let weak: Weak<Watch<T>> = Arc::downgrade(&watch);
    let observer = manager.register_apply_observer(move |cells, _| {
        if let Some(watch) = weak.upgrade() {
            watch.on_apply(cells);
        }
    });
    Ok(WatchHandle { watch, observer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::with_mutable_snapshot;
    use crate::state::StateCell;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen: Arc<Mutex<Vec<T>>> = Arc::default();
        let s = seen.clone();
        (seen, move |v: &T| s.lock().push(v.clone()))
    }

    #[test]
    fn emits_only_distinct_values() {
        let manager = SnapshotManager::new();
        let cell = StateCell::with_manager(&manager, 0);
        let (seen, on_change) = recorder::<i32>();
        let c = cell.clone();
        let handle = watch(&manager, move || c.get() / 10, on_change).unwrap();
        assert_eq!(handle.current(), 0);
        assert_eq!(handle.dependencies(), vec![cell.id()]);

        with_mutable_snapshot(&manager, || cell.set(5)).unwrap().unwrap();
        assert!(seen.lock().is_empty());

        with_mutable_snapshot(&manager, || cell.set(15)).unwrap().unwrap();
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(handle.current(), 1);
    }

    #[test]
    fn unrelated_applies_are_ignored() {
        let manager = SnapshotManager::new();
        let watched = StateCell::with_manager(&manager, "a");
        let other = StateCell::with_manager(&manager, 0);
        let (seen, on_change) = recorder::<&'static str>();
        let w = watched.clone();
        let _handle = watch(&manager, move || w.get(), on_change).unwrap();

        with_mutable_snapshot(&manager, || other.set(1)).unwrap().unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn global_writes_reach_the_watch_once_published() {
        let manager = SnapshotManager::new();
        let cell = StateCell::with_manager(&manager, 1);
        let (seen, on_change) = recorder::<i32>();
        let c = cell.clone();
        let _handle = watch(&manager, move || c.get(), on_change).unwrap();

        cell.set(2).unwrap();
        assert!(seen.lock().is_empty());
        manager.send_apply_notifications();
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn dependencies_follow_the_last_evaluation() {
        let manager = SnapshotManager::new();
        let use_a = StateCell::with_manager(&manager, true);
        let a = StateCell::with_manager(&manager, 1);
        let b = StateCell::with_manager(&manager, 2);
        let (seen, on_change) = recorder::<i32>();
        let (u, ra, rb) = (use_a.clone(), a.clone(), b.clone());
        let handle = watch(
            &manager,
            move || if u.get() { ra.get() } else { rb.get() },
            on_change,
        )
        .unwrap();
        assert_eq!(handle.dependencies(), vec![use_a.id(), a.id()]);

        with_mutable_snapshot(&manager, || use_a.set(false)).unwrap().unwrap();
        assert_eq!(*seen.lock(), vec![2]);
        assert_eq!(handle.dependencies(), vec![use_a.id(), b.id()]);

        with_mutable_snapshot(&manager, || a.set(10)).unwrap().unwrap();
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn disposed_watch_stops() {
        let manager = SnapshotManager::new();
        let cell = StateCell::with_manager(&manager, 0);
        let (seen, on_change) = recorder::<i32>();
        let c = cell.clone();
        let handle = watch(&manager, move || c.get(), on_change).unwrap();
        handle.dispose();
        handle.dispose();

        with_mutable_snapshot(&manager, || cell.set(3)).unwrap().unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(handle.current(), 0);
    }
}
