//! # Tuning passes
//!
//! While a [`Retuner`] runs a tunation's content, a frame for that tunation
//! sits on a thread-local stack. Everything in this module talks to the top
//! frame: [`remember`] and friends look up slots from the previous pass,
//! [`start_group`]/[`end_group`] scope slot identity, [`emit_node`] records
//! output and [`tune_child`] tunes a nested unit.
//!
//! ```rust
//! use retune_core::*;
//!
//! let manager = SnapshotManager::new();
//! let retuner = Retuner::new(&manager);
//! let root = retuner.create_root(|| {
//!     let clicks = remember(|| std::cell::Cell::new(0))?;
//!     clicks.set(clicks.get() + 1);
//!     emit_node(format!("clicked {}", clicks.get()), || Ok(()))?;
//!     Ok(())
//! });
//!
//! retuner.tune_now(root).unwrap();
//! retuner.tune_now(root).unwrap();
//! assert_eq!(retuner.nodes(root)[0].descriptor::<String>().unwrap(), "clicked 2");
//! ```
//!
//! Slot identity is the group path plus the ordinal among unkeyed slots, or
//! the caller key for keyed slots. Nothing a pass does to its slot table is
//! visible until the pass commits; a failing pass leaves the previous table
//! untouched.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::rc::Rc;
use std::sync::Arc;

use smallvec::{SmallVec, smallvec};
use tokio_util::sync::CancellationToken;

use crate::effects::{RememberObserver, TaskSpawner};
use crate::error::{TuneError, TuneResult};
use crate::locals::CapturedLocals;
use crate::manager::SnapshotManager;
use crate::retuner::Retuner;
use crate::snapshot::Snapshot;
use crate::state::{CellId, StateCell};
use crate::tunation::{
    Content, Node, NodeKey, Slot, SlotKey, SlotKind, TunationId, TunationState, hash_of,
};

thread_local! {
    static TUNER: RefCell<TunerStack> = RefCell::new(TunerStack::default());
}

#[derive(Default)]
struct TunerStack {
    frames: Vec<Frame>,
    pass: Option<PassState>,
}

/// Bookkeeping of the outermost pass on this thread. Frames of nested passes
/// wait here until the outermost pass commits or aborts them together.
pub(crate) struct PassState {
    pub(crate) snapshot: Snapshot,
    pub(crate) completed: Vec<Frame>,
    pub(crate) created: Vec<(Retuner, TunationId)>,
    pub(crate) poisoned: Option<TunationId>,
}

struct GroupFrame {
    hash: u64,
    slots: u32,
    nodes: u32,
    groups: HashMap<u64, u32>,
}

impl GroupFrame {
    fn new(hash: u64) -> Self {
        Self {
            hash,
            slots: 0,
            nodes: 0,
            groups: HashMap::new(),
        }
    }
}

pub(crate) struct Frame {
    pub(crate) retuner: Retuner,
    pub(crate) id: TunationId,
    pub(crate) prev_state: TunationState,
    /// Content and locals to bind when this pass commits.
    pub(crate) content: Option<Content>,
    pub(crate) locals: Option<CapturedLocals>,
    pub(crate) token: CancellationToken,
    pub(crate) old_slots: Vec<Slot>,
    index: HashMap<SlotKey, usize>,
    pub(crate) used: Vec<bool>,
    pub(crate) slots: Vec<Slot>,
    pub(crate) entering: Vec<Rc<dyn RememberObserver>>,
    groups: SmallVec<[GroupFrame; 8]>,
    pub(crate) deps: HashSet<CellId>,
    nodes: Vec<Vec<Node>>,
    pub(crate) children: Vec<(u64, TunationId)>,
    pub(crate) side_effects: Vec<Box<dyn FnOnce()>>,
}

impl Frame {
    pub(crate) fn new(
        retuner: Retuner,
        id: TunationId,
        prev_state: TunationState,
        content: Option<Content>,
        locals: Option<CapturedLocals>,
        token: CancellationToken,
        old_slots: Vec<Slot>,
    ) -> Self {
        let index = old_slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.key, i))
            .collect();
        let used = vec![false; old_slots.len()];
        Self {
            retuner,
            id,
            prev_state,
            content,
            locals,
            token,
            old_slots,
            index,
            used,
            slots: Vec::new(),
            entering: Vec::new(),
            groups: smallvec![GroupFrame::new(0)],
            deps: HashSet::new(),
            nodes: vec![Vec::new()],
            children: Vec::new(),
            side_effects: Vec::new(),
        }
    }

    fn group(&mut self) -> &mut GroupFrame {
        let last = self.groups.len() - 1;
        &mut self.groups[last]
    }

    fn push_group(&mut self, key: u64) {
        let parent = self.group();
        let seen = parent.groups.entry(key).or_insert(0);
        let occurrence = *seen;
        *seen += 1;
        let hash = hash_of((parent.hash, key, occurrence));
        self.groups.push(GroupFrame::new(hash));
    }

    fn pop_group(&mut self) {
        if self.groups.len() > 1 {
            self.groups.pop();
        } else {
            log::warn!("end_group: no open group in tunation {:?}", self.id);
        }
    }

    fn slot_key(&mut self, key: Option<u64>) -> SlotKey {
        let group = self.group();
        let kind = match key {
            Some(k) => SlotKind::Keyed(k),
            None => {
                let ordinal = group.slots;
                group.slots += 1;
                SlotKind::Position(ordinal)
            }
        };
        SlotKey {
            group: group.hash,
            kind,
        }
    }

    /// Reuses the old slot stored under `key` if it holds a `T`.
    fn reuse<T: 'static>(&mut self, key: SlotKey) -> Option<Rc<T>> {
        let index = *self.index.get(&key)?;
        if self.used[index] {
            log::warn!(
                "remember: slot {key:?} requested twice in one pass of {:?}; creating a new one",
                self.id
            );
            return None;
        }
        let slot = self.old_slots[index].clone();
        match slot.value.clone().downcast::<T>() {
            Ok(value) => {
                self.used[index] = true;
                self.slots.push(slot);
                Some(value)
            }
            Err(_) => {
                log::warn!(
                    "remember: slot {key:?} type changed; replacing. \
                     If this is due to conditional content, prefer remember_keyed or group."
                );
                None
            }
        }
    }

    fn node_key(&mut self, explicit: Option<u64>) -> NodeKey {
        let group = self.group();
        let raw = match explicit {
            Some(k) => k,
            None => {
                let ordinal = group.nodes;
                group.nodes += 1;
                hash_of((group.hash, ordinal))
            }
        };
        let siblings = self.nodes.last().map(Vec::as_slice).unwrap_or_default();
        if siblings.iter().any(|n| n.key.0 == raw) {
            log::warn!(
                "emit_node: duplicate key {:?} among siblings in {:?}",
                NodeKey(raw),
                self.id
            );
            return NodeKey(hash_of((raw, siblings.len())));
        }
        NodeKey(raw)
    }

    /// The top-level node list, closing any node scope left open.
    pub(crate) fn take_nodes(&mut self) -> Vec<Node> {
        self.nodes.truncate(1);
        self.nodes.pop().unwrap_or_default()
    }
}

fn with_frame<R>(f: impl FnOnce(&mut Frame) -> R) -> TuneResult<R> {
    TUNER.with(|t| {
        t.borrow_mut()
            .frames
            .last_mut()
            .map(f)
            .ok_or(TuneError::NoActiveTuningContext)
    })
}

pub(crate) fn push_frame(frame: Frame) {
    TUNER.with(|t| t.borrow_mut().frames.push(frame));
}

/// Pops the frame of `id`. Frames left above it by passes that were leaked
/// without ending are abandoned.
pub(crate) fn pop_frame(retuner: &Retuner, id: TunationId) -> Option<Frame> {
    let (frame, leaked) = TUNER.with(|t| {
        let mut t = t.borrow_mut();
        let at = t
            .frames
            .iter()
            .rposition(|f| f.id == id && f.retuner.same_as(retuner))?;
        let mut above = t.frames.split_off(at);
        let frame = above.remove(0);
        Some((frame, above))
    })?;
    for stale in leaked.into_iter().rev() {
        log::warn!("tuning pass for {:?} was never ended", stale.id);
        stale.retuner.clone().abandon(stale);
    }
    Some(frame)
}

/// Whether `retuner` has a frame on this thread's stack.
pub(crate) fn has_frames_of(retuner: &Retuner) -> bool {
    TUNER.with(|t| t.borrow().frames.iter().any(|f| f.retuner.same_as(retuner)))
}

pub(crate) fn in_pass() -> bool {
    TUNER.with(|t| t.borrow().pass.is_some())
}

pub(crate) fn begin_pass(snapshot: Snapshot) {
    TUNER.with(|t| {
        t.borrow_mut().pass = Some(PassState {
            snapshot,
            completed: Vec::new(),
            created: Vec::new(),
            poisoned: None,
        })
    });
}

pub(crate) fn end_pass() -> Option<PassState> {
    TUNER.with(|t| t.borrow_mut().pass.take())
}

pub(crate) fn complete(frame: Frame) {
    TUNER.with(|t| {
        if let Some(pass) = t.borrow_mut().pass.as_mut() {
            pass.completed.push(frame);
        }
    });
}

pub(crate) fn poison(id: TunationId) {
    TUNER.with(|t| {
        if let Some(pass) = t.borrow_mut().pass.as_mut() {
            pass.poisoned.get_or_insert(id);
        }
    });
}

pub(crate) fn note_created(retuner: Retuner, id: TunationId) {
    TUNER.with(|t| {
        if let Some(pass) = t.borrow_mut().pass.as_mut() {
            pass.created.push((retuner, id));
        }
    });
}

/// Read observer installed for the whole outermost pass.
pub(crate) fn record_read(cell: CellId) {
    TUNER.with(|t| {
        if let Ok(mut t) = t.try_borrow_mut()
            && let Some(frame) = t.frames.last_mut()
        {
            frame.deps.insert(cell);
        }
    });
}

pub(crate) fn into_tune_error(error: anyhow::Error) -> TuneError {
    match error.downcast::<TuneError>() {
        Ok(e) => e,
        Err(e) => TuneError::Content(e),
    }
}

pub(crate) struct TaskContext {
    pub(crate) token: CancellationToken,
    pub(crate) spawner: Arc<dyn TaskSpawner>,
    pub(crate) manager: SnapshotManager,
}

pub(crate) fn task_context() -> TuneResult<TaskContext> {
    with_frame(|f| TaskContext {
        token: f.token.clone(),
        spawner: f.retuner.spawner(),
        manager: f.retuner.manager().clone(),
    })
}

pub(crate) fn push_side_effect(effect: Box<dyn FnOnce()>) -> TuneResult<()> {
    with_frame(|f| f.side_effects.push(effect))
}

/// The tunation whose content is running on this thread.
pub fn current_tunation() -> TuneResult<TunationId> {
    with_frame(|f| f.id)
}

/// The snapshot the current tuning pass reads and writes through.
pub fn current_snapshot() -> TuneResult<Snapshot> {
    TUNER.with(|t| {
        t.borrow()
            .pass
            .as_ref()
            .map(|p| p.snapshot.clone())
            .ok_or(TuneError::NoActiveTuningContext)
    })
}

pub fn current_retuner() -> TuneResult<Retuner> {
    with_frame(|f| f.retuner.clone())
}

pub fn is_tuning() -> bool {
    TUNER.with(|t| !t.borrow().frames.is_empty())
}

fn remember_slot<T: 'static>(
    key: Option<u64>,
    init: impl FnOnce() -> T,
    observer: fn(&Rc<T>) -> Option<Rc<dyn RememberObserver>>,
) -> TuneResult<Rc<T>> {
    let (key, reused) = with_frame(|f| {
        let key = f.slot_key(key);
        (key, f.reuse::<T>(key))
    })?;
    if let Some(value) = reused {
        return Ok(value);
    }

    let value = Rc::new(init());
    let observer = observer(&value);
    let stored: Rc<dyn Any> = value.clone();
    with_frame(|f| {
        if let Some(o) = &observer {
            f.entering.push(o.clone());
        }
        f.slots.push(Slot {
            key,
            value: stored,
            observer,
        });
    })?;
    Ok(value)
}

/// Positional memoization: returns the value stored at this call position
/// by the previous pass, or stores `init()`.
pub fn remember<T: 'static>(init: impl FnOnce() -> T) -> TuneResult<Rc<T>> {
    remember_slot(None, init, |_| None)
}

/// Like [`remember`], identified by `key` within the current group instead
/// of by position.
pub fn remember_keyed<T: 'static>(key: impl Hash, init: impl FnOnce() -> T) -> TuneResult<Rc<T>> {
    remember_slot(Some(hash_of(key)), init, |_| None)
}

/// Remembers an object that is told when it enters and leaves the slot
/// table. Hooks run only once the pass commits.
pub fn remember_observed<T: RememberObserver + 'static>(
    init: impl FnOnce() -> T,
) -> TuneResult<Rc<T>> {
    remember_slot(None, init, |v| Some(v.clone() as Rc<dyn RememberObserver>))
}

pub fn remember_observed_keyed<T: RememberObserver + 'static>(
    key: impl Hash,
    init: impl FnOnce() -> T,
) -> TuneResult<Rc<T>> {
    remember_slot(Some(hash_of(key)), init, |v| {
        Some(v.clone() as Rc<dyn RememberObserver>)
    })
}

/// A remembered [`StateCell`] in the retuner's snapshot manager.
pub fn remember_state<T>(init: impl FnOnce() -> T) -> TuneResult<StateCell<T>>
where
    T: PartialEq + Send + Sync + 'static,
{
    let manager = with_frame(|f| f.retuner.manager().clone())?;
    let cell = remember(|| StateCell::with_manager(&manager, init()))?;
    Ok((*cell).clone())
}

/// A remembered cell holding the value passed by the latest pass. Work that
/// outlives a pass, such as a launched effect, reads it to see the newest
/// value without being restarted.
pub fn remember_updated_state<T>(value: T) -> TuneResult<StateCell<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let cell = remember_state(|| value.clone())?;
    cell.set(value)?;
    Ok(cell)
}

pub fn start_group(key: impl Hash) -> TuneResult<()> {
    let key = hash_of(key);
    with_frame(|f| f.push_group(key))
}

pub fn end_group() -> TuneResult<()> {
    with_frame(Frame::pop_group)
}

/// Runs `f` inside a group. Slots and nodes inside get identities scoped to
/// the group, so content that comes and goes does not shift its neighbours.
pub fn group<R>(key: impl Hash, f: impl FnOnce() -> R) -> TuneResult<R> {
    let key = hash_of(key);
    let depth = with_frame(|fr| {
        let depth = fr.groups.len();
        fr.push_group(key);
        depth
    })?;
    let out = f();
    with_frame(|fr| fr.groups.truncate(depth))?;
    Ok(out)
}

/// Records a node with a positional key and runs `content` to collect its
/// children.
pub fn emit_node<D: Any>(
    descriptor: D,
    content: impl FnOnce() -> anyhow::Result<()>,
) -> TuneResult<NodeKey> {
    emit(None, Rc::new(descriptor), content)
}

/// Records a node identified by `key` among its siblings.
pub fn emit_keyed_node<D: Any>(
    key: impl Hash,
    descriptor: D,
    content: impl FnOnce() -> anyhow::Result<()>,
) -> TuneResult<NodeKey> {
    emit(Some(hash_of(key)), Rc::new(descriptor), content)
}

fn emit(
    explicit: Option<u64>,
    descriptor: Rc<dyn Any>,
    content: impl FnOnce() -> anyhow::Result<()>,
) -> TuneResult<NodeKey> {
    let (key, depth, level) = with_frame(|f| {
        let key = f.node_key(explicit);
        let level = f.nodes.len();
        f.nodes.push(Vec::new());
        let depth = f.groups.len();
        f.push_group(key.0);
        (key, depth, level)
    })?;
    let result = content();
    with_frame(|f| {
        f.groups.truncate(depth);
        f.nodes.truncate(level + 1);
        let children = f.nodes.pop().unwrap_or_default();
        if let Some(siblings) = f.nodes.last_mut() {
            siblings.push(Node {
                key,
                descriptor,
                children,
            });
        }
    })?;
    result.map_err(into_tune_error)?;
    Ok(key)
}

/// Tunes the child tunation identified by `key` under the current one,
/// creating it on first use. The child is re-bound to `content` and to the
/// locals visible here. Children not tuned again by a later successful pass
/// of their parent are disposed.
pub fn tune_child(
    key: impl Hash,
    content: impl Fn() -> anyhow::Result<()> + 'static,
) -> TuneResult<TunationId> {
    let key = hash_of(key);
    let (retuner, parent, duplicate) = with_frame(|f| {
        let duplicate = f.children.iter().find_map(|&(k, c)| (k == key).then_some(c));
        (f.retuner.clone(), f.id, duplicate)
    })?;
    if let Some(child) = duplicate {
        log::warn!("tune_child: key already tuned in this pass of {parent:?}; skipping");
        return Ok(child);
    }

    let content: Content = Rc::new(content);
    let child = retuner.adopt_child(parent, key, &content)?;
    with_frame(|f| f.children.push((key, child)))?;
    retuner.run_pass(child, Some(content), Some(crate::locals::capture()))?;
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn setup() -> (SnapshotManager, Retuner) {
        let manager = SnapshotManager::new();
        let retuner = Retuner::new(&manager);
        (manager, retuner)
    }

    #[test]
    fn ambient_accessors_fail_outside_a_pass() {
        assert!(matches!(
            current_tunation(),
            Err(TuneError::NoActiveTuningContext)
        ));
        assert!(matches!(
            current_snapshot(),
            Err(TuneError::NoActiveTuningContext)
        ));
        assert!(matches!(
            remember(|| 1),
            Err(TuneError::NoActiveTuningContext)
        ));
        assert!(!is_tuning());
    }

    #[test]
    fn remember_returns_the_same_instance_across_passes() {
        let (_m, retuner) = setup();
        let seen: Rc<RefCell<Vec<Rc<String>>>> = Rc::default();
        let inits = Rc::new(Cell::new(0));
        let (s, i) = (seen.clone(), inits.clone());
        let root = retuner.create_root(move || {
            let value = remember(|| {
                i.set(i.get() + 1);
                String::from("memo")
            })?;
            s.borrow_mut().push(value);
            Ok(())
        });

        retuner.tune_now(root).unwrap();
        retuner.tune_now(root).unwrap();
        let seen = seen.borrow();
        assert_eq!(inits.get(), 1);
        assert!(Rc::ptr_eq(&seen[0], &seen[1]));
    }

    struct Tracked {
        log: Rc<RefCell<Vec<String>>>,
        name: String,
    }

    impl RememberObserver for Tracked {
        fn on_remembered(&self) {
            self.log.borrow_mut().push(format!("+{}", self.name));
        }

        fn on_forgotten(&self) {
            self.log.borrow_mut().push(format!("-{}", self.name));
        }

        fn on_abandoned(&self) {
            self.log.borrow_mut().push(format!("!{}", self.name));
        }
    }

    #[test]
    fn key_change_replaces_slot_and_fires_hooks_once() {
        let (_m, retuner) = setup();
        let log: Rc<RefCell<Vec<String>>> = Rc::default();
        let key = Rc::new(Cell::new(1));
        let (l, k) = (log.clone(), key.clone());
        let root = retuner.create_root(move || {
            let name = format!("k{}", k.get());
            remember_observed_keyed(k.get(), || Tracked {
                log: l.clone(),
                name,
            })?;
            Ok(())
        });

        retuner.tune_now(root).unwrap();
        retuner.tune_now(root).unwrap();
        assert_eq!(*log.borrow(), vec!["+k1"]);

        key.set(2);
        retuner.tune_now(root).unwrap();
        assert_eq!(*log.borrow(), vec!["+k1", "-k1", "+k2"]);
        assert_eq!(retuner.slot_count(root), 1);
    }

    #[test]
    fn updated_state_follows_the_latest_argument() {
        let (manager, retuner) = setup();
        let source = StateCell::with_manager(&manager, 1);
        let seen: Rc<RefCell<Vec<StateCell<i32>>>> = Rc::default();
        let (s, out) = (source.clone(), seen.clone());
        let root = retuner.create_root(move || {
            let latest = remember_updated_state(s.get())?;
            out.borrow_mut().push(latest);
            Ok(())
        });
        retuner.tune_now(root).unwrap();
        assert_eq!(seen.borrow()[0].get(), 1);

        source.set(2).unwrap();
        assert_eq!(retuner.drain_pending().unwrap(), 1);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].id(), seen[1].id());
        assert_eq!(seen[1].get(), 2);
    }

    #[test]
    fn groups_keep_slots_apart() {
        let (_m, retuner) = setup();
        let show = Rc::new(Cell::new(true));
        let values: Rc<RefCell<Vec<u32>>> = Rc::default();
        let (s, v) = (show.clone(), values.clone());
        let root = retuner.create_root(move || {
            if s.get() {
                group("banner", || remember(|| 7u32))??;
            }
            let counter = remember(|| Cell::new(0u32))?;
            counter.set(counter.get() + 1);
            v.borrow_mut().push(counter.get());
            Ok(())
        });

        retuner.tune_now(root).unwrap();
        show.set(false);
        retuner.tune_now(root).unwrap();
        assert_eq!(*values.borrow(), vec![1, 2]);
    }

    #[test]
    fn type_change_at_a_slot_replaces_it() {
        let (_m, retuner) = setup();
        let flip = Rc::new(Cell::new(false));
        let f = flip.clone();
        let root = retuner.create_root(move || {
            if f.get() {
                let s = remember(|| String::from("text"))?;
                assert_eq!(*s, "text");
            } else {
                remember(|| 1u8)?;
            }
            Ok(())
        });
        retuner.tune_now(root).unwrap();
        flip.set(true);
        retuner.tune_now(root).unwrap();
        assert_eq!(retuner.slot_count(root), 1);
    }

    #[test]
    fn failed_pass_keeps_previous_slots_and_abandons_new_ones() {
        let (_m, retuner) = setup();
        let log: Rc<RefCell<Vec<String>>> = Rc::default();
        let fail = Rc::new(Cell::new(false));
        let (l, f) = (log.clone(), fail.clone());
        let root = retuner.create_root(move || {
            remember_observed(|| Tracked {
                log: l.clone(),
                name: "a".into(),
            })?;
            if f.get() {
                remember_observed(|| Tracked {
                    log: l.clone(),
                    name: "b".into(),
                })?;
                anyhow::bail!("content failed");
            }
            Ok(())
        });

        retuner.tune_now(root).unwrap();
        fail.set(true);
        let err = retuner.tune_now(root).unwrap_err();
        assert_eq!(err.content().map(|e| e.to_string()).as_deref(), Some("content failed"));
        assert_eq!(*log.borrow(), vec!["+a", "!b"]);
        assert_eq!(retuner.slot_count(root), 1);
        assert_eq!(retuner.state(root), TunationState::Idle);
        assert_eq!(retuner.tune_count(root), 1);
    }

    #[test]
    fn nodes_are_recorded_and_diffed() {
        use crate::diff::DiffOp;
        let (_m, retuner) = setup();
        let items = Rc::new(RefCell::new(vec!["a", "b", "c"]));
        let it = items.clone();
        let root = retuner.create_root(move || {
            emit_node("list", || {
                for item in it.borrow().iter() {
                    emit_keyed_node(*item, *item, || Ok(()))?;
                }
                Ok(())
            })?;
            Ok(())
        });

        retuner.tune_now(root).unwrap();
        let first = retuner.take_patch(root);
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0].ops[0], DiffOp::Insert { index: 0, .. }));
        let nodes = retuner.nodes(root);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].children.len(), 3);

        *items.borrow_mut() = vec!["c", "a", "b"];
        retuner.tune_now(root).unwrap();
        let patch = retuner.take_patch(root);
        assert_eq!(patch.len(), 1);
        assert_eq!(patch[0].parent, Some(nodes[0].key));
        assert_eq!(patch[0].ops.len(), 1);
        assert!(matches!(patch[0].ops[0], DiffOp::Move { from: 2, to: 0, .. }));
        assert!(retuner.take_patch(root).is_empty());
    }

    #[test]
    fn children_are_created_reused_and_disposed() {
        let (_m, retuner) = setup();
        let keys = Rc::new(RefCell::new(vec![1, 2]));
        let k = keys.clone();
        let root = retuner.create_root(move || {
            for key in k.borrow().iter() {
                let key = *key;
                tune_child(key, move || {
                    emit_node(key, || Ok(()))?;
                    Ok(())
                })?;
            }
            Ok(())
        });

        retuner.tune_now(root).unwrap();
        let first = retuner.children(root);
        assert_eq!(first.len(), 2);
        assert_eq!(retuner.parent(first[0]), Some(root));

        *keys.borrow_mut() = vec![2, 3];
        retuner.tune_now(root).unwrap();
        let second = retuner.children(root);
        assert_eq!(second[0], first[1]);
        assert_eq!(retuner.state(first[0]), TunationState::Disposed);
        assert_eq!(retuner.tune_count(second[0]), 2);
        assert_eq!(retuner.tune_count(second[1]), 1);
    }

    #[test]
    fn failing_child_rolls_back_the_whole_pass() {
        let (_m, retuner) = setup();
        let fail = Rc::new(Cell::new(false));
        let f = fail.clone();
        let root = retuner.create_root(move || {
            tune_child("ok", || {
                remember(|| 1)?;
                Ok(())
            })?;
            let f = f.clone();
            tune_child("flaky", move || {
                if f.get() {
                    anyhow::bail!("child failed");
                }
                Ok(())
            })?;
            Ok(())
        });

        fail.set(true);
        assert!(retuner.tune_now(root).is_err());
        assert_eq!(retuner.state(root), TunationState::Uninitialized);
        assert!(retuner.children(root).is_empty());
        assert_eq!(retuner.len(), 1);

        fail.set(false);
        retuner.tune_now(root).unwrap();
        assert_eq!(retuner.children(root).len(), 2);
    }

    #[test]
    fn reentrant_tune_is_rejected() {
        let (_m, retuner) = setup();
        let r = retuner.clone();
        let root = retuner.create_root(move || {
            let me = current_tunation()?;
            assert!(matches!(r.tune_now(me), Err(TuneError::Reentrant(_))));
            Ok(())
        });
        retuner.tune_now(root).unwrap();
    }

    #[test]
    fn side_effects_run_after_commit() {
        let (_m, retuner) = setup();
        let ran = Rc::new(Cell::new(0));
        let r = ran.clone();
        let root = retuner.create_root(move || {
            let r = r.clone();
            crate::effects::side_effect(move || r.set(r.get() + 1))?;
            assert!(current_snapshot().is_ok());
            Ok(())
        });
        retuner.tune_now(root).unwrap();
        retuner.tune_now(root).unwrap();
        assert_eq!(ran.get(), 2);
    }
}
