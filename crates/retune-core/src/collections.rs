//! Snapshot-aware collections.
//!
//! [`StateList`], [`StateMap`] and [`StateSet`] keep a whole collection in
//! one [`StateCell`]. Every mutation writes a new version of the collection
//! into the current snapshot, so reads inside a tuning pass are tracked and
//! concurrent edits are isolated the same way as for any other cell.
//!
//! ```rust
//! use retune_core::*;
//!
//! let manager = SnapshotManager::new();
//! let todo = StateList::with_manager(&manager, ["write", "test"]);
//!
//! with_mutable_snapshot(&manager, || todo.push("ship"))??;
//! assert_eq!(todo.to_vec(), vec!["write", "test", "ship"]);
//! # Ok::<(), SnapshotError>(())
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use crate::error::SnapshotError;
use crate::manager::SnapshotManager;
use crate::state::{CellId, StateCell};

/// Copies the visible collection, lets `f` edit the copy and writes it back.
/// Equal results are not written.
fn mutate<C, R>(cell: &StateCell<C>, f: impl FnOnce(&mut C) -> R) -> Result<R, SnapshotError>
where
    C: Clone + PartialEq + Send + Sync + 'static,
{
    let mut next = cell.get();
    let out = f(&mut next);
    cell.set(next)?;
    Ok(out)
}

/// An observable `Vec`.
pub struct StateList<T> {
    cell: StateCell<Vec<T>>,
}

impl<T> Clone for StateList<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: fmt::Debug + Send + Sync + 'static> fmt::Debug for StateList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.cell.with(|items| f.debug_list().entries(items).finish())
    }
}

impl<T> StateList<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates a list in the process-wide manager.
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self::with_manager(SnapshotManager::global(), items)
    }

    pub fn with_manager(manager: &SnapshotManager, items: impl IntoIterator<Item = T>) -> Self {
        Self {
            cell: StateCell::with_manager(manager, items.into_iter().collect()),
        }
    }

    pub fn id(&self) -> CellId {
        self.cell.id()
    }

    /// The cell holding the list.
    pub fn cell(&self) -> &StateCell<Vec<T>> {
        &self.cell
    }

    pub fn len(&self) -> usize {
        self.cell.with(Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.cell.with(Vec::is_empty)
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.cell.with(|items| items.get(index).cloned())
    }

    pub fn contains(&self, item: &T) -> bool {
        self.cell.with(|items| items.contains(item))
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.cell.get()
    }

    /// Borrows the visible list without copying it.
    pub fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        self.cell.with(|items| f(items))
    }

    pub fn push(&self, item: T) -> Result<(), SnapshotError> {
        mutate(&self.cell, |items| items.push(item))
    }

    /// Inserts at `index`, clamped to the end of the list.
    pub fn insert(&self, index: usize, item: T) -> Result<(), SnapshotError> {
        mutate(&self.cell, |items| {
            let index = index.min(items.len());
            items.insert(index, item);
        })
    }

    /// Replaces the item at `index`, returning the old one. Out of range
    /// indices change nothing.
    pub fn set(&self, index: usize, item: T) -> Result<Option<T>, SnapshotError> {
        mutate(&self.cell, |items| {
            items
                .get_mut(index)
                .map(|slot| std::mem::replace(slot, item))
        })
    }

    pub fn remove(&self, index: usize) -> Result<Option<T>, SnapshotError> {
        mutate(&self.cell, |items| {
            (index < items.len()).then(|| items.remove(index))
        })
    }

    pub fn extend(&self, more: impl IntoIterator<Item = T>) -> Result<(), SnapshotError> {
        mutate(&self.cell, |items| items.extend(more))
    }

    pub fn retain(&self, keep: impl FnMut(&T) -> bool) -> Result<(), SnapshotError> {
        mutate(&self.cell, |items| items.retain(keep))
    }

    pub fn clear(&self) -> Result<(), SnapshotError> {
        self.cell.set(Vec::new())
    }
}

/// Collects an iterator into a [`StateList`] in the process-wide manager.
pub trait ToStateList<T> {
    fn to_state_list(self) -> StateList<T>;
}

impl<I, T> ToStateList<T> for I
where
    I: IntoIterator<Item = T>,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn to_state_list(self) -> StateList<T> {
        StateList::new(self)
    }
}

/// An observable `HashMap`.
pub struct StateMap<K, V> {
    cell: StateCell<HashMap<K, V>>,
}

impl<K, V> Clone for StateMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<K, V> fmt::Debug for StateMap<K, V>
where
    K: fmt::Debug + Send + Sync + 'static,
    V: fmt::Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.cell.with(|map| f.debug_map().entries(map).finish())
    }
}

impl<K, V> StateMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates a map in the process-wide manager.
    pub fn new(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Self::with_manager(SnapshotManager::global(), entries)
    }

    pub fn with_manager(
        manager: &SnapshotManager,
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            cell: StateCell::with_manager(manager, entries.into_iter().collect()),
        }
    }

    pub fn id(&self) -> CellId {
        self.cell.id()
    }

    pub fn cell(&self) -> &StateCell<HashMap<K, V>> {
        &self.cell
    }

    pub fn len(&self) -> usize {
        self.cell.with(HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.cell.with(HashMap::is_empty)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.cell.with(|map| map.get(key).cloned())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.cell.with(|map| map.contains_key(key))
    }

    pub fn to_map(&self) -> HashMap<K, V> {
        self.cell.get()
    }

    pub fn with<R>(&self, f: impl FnOnce(&HashMap<K, V>) -> R) -> R {
        self.cell.with(f)
    }

    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, SnapshotError> {
        mutate(&self.cell, |map| map.insert(key, value))
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>, SnapshotError> {
        mutate(&self.cell, |map| map.remove(key))
    }

    pub fn extend(&self, more: impl IntoIterator<Item = (K, V)>) -> Result<(), SnapshotError> {
        mutate(&self.cell, |map| map.extend(more))
    }

    pub fn clear(&self) -> Result<(), SnapshotError> {
        self.cell.set(HashMap::new())
    }
}

/// An observable `HashSet`.
pub struct StateSet<T> {
    cell: StateCell<HashSet<T>>,
}

impl<T> Clone for StateSet<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: fmt::Debug + Send + Sync + 'static> fmt::Debug for StateSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.cell.with(|set| f.debug_set().entries(set).finish())
    }
}

impl<T> StateSet<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates a set in the process-wide manager.
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self::with_manager(SnapshotManager::global(), items)
    }

    pub fn with_manager(manager: &SnapshotManager, items: impl IntoIterator<Item = T>) -> Self {
        Self {
            cell: StateCell::with_manager(manager, items.into_iter().collect()),
        }
    }

    pub fn id(&self) -> CellId {
        self.cell.id()
    }

    pub fn cell(&self) -> &StateCell<HashSet<T>> {
        &self.cell
    }

    pub fn len(&self) -> usize {
        self.cell.with(HashSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.cell.with(HashSet::is_empty)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.cell.with(|set| set.contains(item))
    }

    pub fn to_set(&self) -> HashSet<T> {
        self.cell.get()
    }

    /// Returns whether the item was new.
    pub fn insert(&self, item: T) -> Result<bool, SnapshotError> {
        mutate(&self.cell, |set| set.insert(item))
    }

    /// Returns whether the item was present.
    pub fn remove(&self, item: &T) -> Result<bool, SnapshotError> {
        mutate(&self.cell, |set| set.remove(item))
    }

    pub fn clear(&self) -> Result<(), SnapshotError> {
        self.cell.set(HashSet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retuner::Retuner;
    use crate::snapshot::with_mutable_snapshot;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn list_edits_stay_in_their_snapshot() {
        let manager = SnapshotManager::new();
        let list = StateList::with_manager(&manager, [1, 2, 3]);

        let s = manager.take_mutable_snapshot(None, None);
        s.enter(|| -> Result<(), SnapshotError> {
            list.push(4)?;
            assert_eq!(list.remove(0)?, Some(1));
            list.insert(99, 5)?;
            assert_eq!(list.set(0, 20)?, Some(2));
            assert_eq!(list.remove(10)?, None);
            Ok(())
        })
        .unwrap()
        .unwrap();

        assert_eq!(list.to_vec(), vec![1, 2, 3]);
        s.apply().unwrap();
        assert_eq!(list.to_vec(), vec![20, 3, 4, 5]);
        assert_eq!(list.get(1), Some(3));
        assert!(list.contains(&5));
    }

    #[test]
    fn concurrent_list_edits_conflict() {
        let manager = SnapshotManager::new();
        let list = StateList::with_manager(&manager, Vec::<i32>::new());
        let s1 = manager.take_mutable_snapshot(None, None);
        let s2 = manager.take_mutable_snapshot(None, None);
        s1.enter(|| list.push(1)).unwrap().unwrap();
        s2.enter(|| list.push(2)).unwrap().unwrap();
        s1.apply().unwrap();
        assert!(matches!(
            s2.apply(),
            Err(SnapshotError::ApplyConflict { .. })
        ));
        s2.dispose();
        assert_eq!(list.to_vec(), vec![1]);
    }

    #[test]
    fn map_and_set_report_previous_contents() {
        let manager = SnapshotManager::new();
        let map = StateMap::with_manager(&manager, [("a", 1)]);
        let set = StateSet::with_manager(&manager, ["x"]);

        assert_eq!(map.insert("a", 2).unwrap(), Some(1));
        assert_eq!(map.insert("b", 3).unwrap(), None);
        assert_eq!(map.remove(&"a").unwrap(), Some(2));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"b"), Some(3));

        assert!(!set.insert("x").unwrap());
        assert!(set.insert("y").unwrap());
        assert!(set.remove(&"x").unwrap());
        assert!(!set.contains(&"x"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn unchanged_collection_is_not_written() {
        let manager = SnapshotManager::new();
        let set = StateSet::with_manager(&manager, [1]);
        set.insert(1).unwrap();
        assert!(!manager.has_pending_changes());
        set.insert(2).unwrap();
        assert!(manager.has_pending_changes());
    }

    #[test]
    fn reading_a_list_in_a_pass_tracks_it() {
        let manager = SnapshotManager::new();
        let retuner = Retuner::new(&manager);
        let list = StateList::with_manager(&manager, ["a"]);
        let lengths = Rc::new(Cell::new(0));

        let (l, n) = (list.clone(), lengths.clone());
        let root = retuner.create_root(move || {
            n.set(l.len());
            Ok(())
        });
        retuner.tune_now(root).unwrap();
        assert_eq!(retuner.dependencies(root), vec![list.id()]);

        with_mutable_snapshot(&manager, || list.push("b"))
            .unwrap()
            .unwrap();
        retuner.drain_pending().unwrap();
        assert_eq!(lengths.get(), 2);
    }

    #[test]
    fn iterators_collect_into_lists() {
        let list = (1..=3).to_state_list();
        assert_eq!(list.len(), 3);
        assert_eq!(list.to_vec(), vec![1, 2, 3]);
    }
}
