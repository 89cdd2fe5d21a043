//! # Retuner
//!
//! Owns the arena of tunations and decides when they run again.
//!
//! Every cell read during a pass is indexed against the tunation that read
//! it. When a snapshot applies, the manager reports the changed cells; the
//! retuner queues the readers of those cells and [`Retuner::drain_pending`]
//! re-tunes them, oldest first, until nothing is left.
//!
//! ```rust
//! use retune_core::*;
//!
//! let manager = SnapshotManager::new();
//! let retuner = Retuner::new(&manager);
//! let count = StateCell::with_manager(&manager, 0);
//!
//! let c = count.clone();
//! let root = retuner.create_root(move || {
//!     emit_node(c.get(), || Ok(()))?;
//!     Ok(())
//! });
//! retuner.tune_now(root)?;
//!
//! with_mutable_snapshot(&manager, || count.set(1))??;
//! assert_eq!(retuner.drain_pending()?, 1);
//! assert_eq!(retuner.nodes(root)[0].descriptor::<i32>(), Some(&1));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::cell::{RefCell, RefMut};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use slotmap::SlotMap;
use tokio_util::sync::CancellationToken;

use crate::diff::{NodePatch, diff_nodes};
use crate::effects::{RememberObserver, TaskSpawner, ThreadSpawner};
use crate::error::{TuneError, TuneResult};
use crate::locals::{self, CapturedLocals, InstalledLocals};
use crate::manager::{ObserverHandle, SnapshotManager};
use crate::snapshot::{CurrentGuard, ObserverGuard, Snapshot, push_observers};
use crate::state::CellId;
use crate::tunation::{Content, Node, Teardown, TunationId, TunationNode, TunationState};
use crate::tuner::{self, Frame, PassState};

#[derive(Clone)]
pub struct RetunerConfig {
    /// Drain rounds before [`TuneError::DivergentInvalidation`] is reported.
    pub max_drain_iterations: usize,
    /// Runs background work started by effects.
    pub spawner: Arc<dyn TaskSpawner>,
}

impl Default for RetunerConfig {
    fn default() -> Self {
        Self {
            max_drain_iterations: 1000,
            spawner: Arc::new(ThreadSpawner),
        }
    }
}

impl fmt::Debug for RetunerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetunerConfig")
            .field("max_drain_iterations", &self.max_drain_iterations)
            .finish_non_exhaustive()
    }
}

impl RetunerConfig {
    pub fn with_max_drain_iterations(mut self, n: usize) -> Self {
        self.max_drain_iterations = n;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

#[derive(Default)]
struct RetunerState {
    tunations: SlotMap<TunationId, TunationNode>,
    /// Cell -> tunations whose last committed pass read it.
    readers: HashMap<CellId, BTreeSet<TunationId>>,
    pending: VecDeque<TunationId>,
    queued: HashSet<TunationId>,
    /// Disposals requested while one of our passes was running.
    deferred: Vec<TunationId>,
    roots: Vec<TunationId>,
    /// Tunations committed during the current drain round.
    round: HashSet<TunationId>,
}

impl RetunerState {
    fn enqueue(&mut self, id: TunationId) -> bool {
        if !self.tunations.contains_key(id) || !self.queued.insert(id) {
            return false;
        }
        self.pending.push_back(id);
        true
    }

    /// Number of ancestors of `id`.
    fn depth(&self, id: TunationId) -> usize {
        let mut depth = 0;
        let mut at = self.tunations.get(id).and_then(|n| n.parent);
        while let Some(parent) = at {
            depth += 1;
            at = self.tunations.get(parent).and_then(|n| n.parent);
        }
        depth
    }

    fn unindex(&mut self, id: TunationId, cells: impl IntoIterator<Item = CellId>) {
        for cell in cells {
            if let Some(readers) = self.readers.get_mut(&cell) {
                readers.remove(&id);
                if readers.is_empty() {
                    self.readers.remove(&cell);
                }
            }
        }
    }

    /// Removes `id` and its subtree, children first.
    fn teardown(&mut self, id: TunationId, out: &mut Vec<Teardown>) {
        let Some(node) = self.tunations.remove(id) else {
            return;
        };
        for &(_, child) in &node.children {
            self.teardown(child, out);
        }
        self.unindex(id, node.deps.iter().copied());
        if self.queued.remove(&id) {
            self.pending.retain(|p| *p != id);
        }
        self.roots.retain(|r| *r != id);
        out.push(Teardown {
            id,
            slots: node.slots,
            token: node.token,
        });
    }
}

struct RetunerInner {
    manager: SnapshotManager,
    config: RetunerConfig,
    state: RefCell<RetunerState>,
    /// Cells reported by apply notifications, not yet matched to readers.
    changed: Arc<Mutex<Vec<CellId>>>,
    /// Set by every write; cleared when a drain publishes global writes.
    dirty: Arc<AtomicBool>,
    observers: Vec<ObserverHandle>,
    root_token: CancellationToken,
}

impl Drop for RetunerInner {
    fn drop(&mut self) {
        for handle in &self.observers {
            handle.dispose();
        }
        self.root_token.cancel();
    }
}

/// Scheduler and arena of tunations. Cheap to clone; clones share the arena.
///
/// A retuner belongs to the thread that created it: content functions and
/// remembered objects are not `Send`. Writes may be applied from any thread;
/// the invalidations they cause are picked up by the next
/// [`drain_pending`](Self::drain_pending).
#[derive(Clone)]
pub struct Retuner {
    inner: Rc<RetunerInner>,
}

impl fmt::Debug for Retuner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("Retuner")
            .field("tunations", &st.tunations.len())
            .field("pending", &st.pending.len())
            .finish()
    }
}

impl Retuner {
    pub fn new(manager: &SnapshotManager) -> Self {
        Self::with_config(manager, RetunerConfig::default())
    }

    pub fn with_config(manager: &SnapshotManager, config: RetunerConfig) -> Self {
        let changed: Arc<Mutex<Vec<CellId>>> = Arc::default();
        let dirty = Arc::new(AtomicBool::new(false));
        let on_apply = {
            let changed = changed.clone();
            manager.register_apply_observer(move |cells, _| {
                changed.lock().extend_from_slice(cells);
            })
        };
        let on_write = {
            let dirty = dirty.clone();
            manager.register_global_write_observer(move |_| dirty.store(true, Ordering::Release))
        };
        Self {
            inner: Rc::new(RetunerInner {
                manager: manager.clone(),
                config,
                state: RefCell::new(RetunerState::default()),
                changed,
                dirty,
                observers: vec![on_apply, on_write],
                root_token: CancellationToken::new(),
            }),
        }
    }

    pub fn manager(&self) -> &SnapshotManager {
        &self.inner.manager
    }

    pub fn config(&self) -> &RetunerConfig {
        &self.inner.config
    }

    pub fn spawner(&self) -> Arc<dyn TaskSpawner> {
        self.inner.config.spawner.clone()
    }

    pub fn same_as(&self, other: &Retuner) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn state_mut(&self) -> RefMut<'_, RetunerState> {
        self.inner.state.borrow_mut()
    }

    /// Creates a root tunation bound to `content`. It is not tuned until
    /// [`tune_now`](Self::tune_now) or [`begin_tuning`](Self::begin_tuning).
    pub fn create_root(&self, content: impl Fn() -> anyhow::Result<()> + 'static) -> TunationId {
        let node = TunationNode::new(
            None,
            Rc::new(content),
            locals::capture(),
            self.inner.root_token.child_token(),
        );
        let mut st = self.state_mut();
        let id = st.tunations.insert(node);
        st.roots.push(id);
        log::debug!("created root tunation {id:?}");
        id
    }

    /// Rebinds `id` to new content and queues it.
    pub fn set_content(
        &self,
        id: TunationId,
        content: impl Fn() -> anyhow::Result<()> + 'static,
    ) -> TuneResult<()> {
        let mut st = self.state_mut();
        let node = st.tunations.get_mut(id).ok_or(TuneError::Disposed(id))?;
        node.content = Rc::new(content);
        st.enqueue(id);
        Ok(())
    }

    /// Queues `id` for the next drain regardless of what it read.
    pub fn invalidate(&self, id: TunationId) -> bool {
        self.state_mut().enqueue(id)
    }

    /// Queues every tunation that read one of `cells`. Never runs user code.
    pub fn schedule_invalidation(&self, cells: &[CellId]) -> usize {
        let mut st = self.state_mut();
        let mut readers = BTreeSet::new();
        for cell in cells {
            if let Some(ids) = st.readers.get(cell) {
                readers.extend(ids.iter().copied());
            }
        }
        let mut queued = 0;
        for id in readers {
            if st.enqueue(id) {
                log::trace!("{id:?} invalidated");
                queued += 1;
            }
        }
        queued
    }

    /// Matches cells reported by apply notifications to their readers.
    fn collect_changes(&self) {
        let cells = std::mem::take(&mut *self.inner.changed.lock());
        if !cells.is_empty() {
            self.schedule_invalidation(&cells);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.collect_changes();
        self.inner.state.borrow().pending.len()
    }

    /// Whether a drain would do anything: queued tunations, or global writes
    /// not yet published.
    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0 || self.inner.manager.has_pending_changes()
    }

    /// Runs one tuning pass of `id`. Inside another pass the work joins it
    /// and commits together with it.
    pub fn tune_now(&self, id: TunationId) -> TuneResult<()> {
        self.run_pass(id, None, None)
    }

    /// Opens a pass of `id` without running its content; the caller drives
    /// the tuner directly and commits with [`TuningPass::end`].
    pub fn begin_tuning(&self, id: TunationId) -> TuneResult<TuningPass> {
        let outer = if tuner::in_pass() {
            None
        } else {
            Some(OuterPass::begin(self)?)
        };
        let (_, locals) = self.start(id, None, None)?;
        Ok(TuningPass {
            retuner: self.clone(),
            id,
            outer,
            locals: Some(locals),
            done: false,
        })
    }

    /// Re-tunes queued tunations until the queue stays empty. Within a round
    /// parents run before their descendants, otherwise oldest first. Global
    /// writes are published first so their readers are included.
    ///
    /// Returns the number of passes run. A failing pass stops the drain; it
    /// and everything after it stay queued.
    pub fn drain_pending(&self) -> TuneResult<usize> {
        let mut tuned = 0;
        let mut rounds = 0;
        loop {
            if self.inner.dirty.swap(false, Ordering::AcqRel) {
                self.inner.manager.send_apply_notifications();
            }
            self.collect_changes();
            let batch: Vec<TunationId> = {
                let mut st = self.state_mut();
                st.queued.clear();
                st.round.clear();
                let mut batch: Vec<TunationId> = st.pending.drain(..).collect();
                // A parent re-tunes its children, which are then skipped.
                batch.sort_by_cached_key(|&id| st.depth(id));
                batch
            };
            if batch.is_empty() {
                return Ok(tuned);
            }
            if rounds == self.inner.config.max_drain_iterations {
                let pending = batch.len();
                self.requeue(&batch);
                log::warn!("drain stopped after {rounds} rounds with {pending} pending");
                return Err(TuneError::DivergentInvalidation {
                    iterations: rounds,
                    pending,
                });
            }
            rounds += 1;

            for (i, &id) in batch.iter().enumerate() {
                let skip = {
                    let st = self.inner.state.borrow();
                    st.round.contains(&id) || !st.tunations.contains_key(id)
                };
                if skip {
                    continue;
                }
                if let Err(e) = self.tune_now(id) {
                    self.requeue(&batch[i..]);
                    return Err(e);
                }
                tuned += 1;
            }
        }
    }

    fn requeue(&self, ids: &[TunationId]) {
        let mut st = self.state_mut();
        for &id in ids {
            st.enqueue(id);
        }
    }

    /// Removes `id` and its subtree, running exit hooks and cancelling their
    /// background work. Idempotent. While a pass of this retuner is running
    /// the disposal waits until the pass ends.
    pub fn dispose(&self, id: TunationId) {
        if tuner::has_frames_of(self) {
            let mut st = self.state_mut();
            if st.tunations.get(id).is_some_and(|n| n.state == TunationState::Tuning) {
                log::warn!("dispose of {id:?} while it is tuning; deferred until the pass ends");
            }
            st.deferred.push(id);
            return;
        }
        let mut teardowns = Vec::new();
        self.state_mut().teardown(id, &mut teardowns);
        for teardown in teardowns {
            teardown.run();
        }
    }

    fn flush_deferred(&self) {
        let deferred = std::mem::take(&mut self.state_mut().deferred);
        for id in deferred {
            self.dispose(id);
        }
    }

    pub fn state(&self, id: TunationId) -> TunationState {
        self.inner
            .state
            .borrow()
            .tunations
            .get(id)
            .map_or(TunationState::Disposed, |n| n.state)
    }

    /// Cells read by the last committed pass of `id`, in id order.
    pub fn dependencies(&self, id: TunationId) -> Vec<CellId> {
        let st = self.inner.state.borrow();
        let mut deps: Vec<CellId> = st
            .tunations
            .get(id)
            .map(|n| n.deps.iter().copied().collect())
            .unwrap_or_default();
        deps.sort_unstable();
        deps
    }

    pub fn children(&self, id: TunationId) -> Vec<TunationId> {
        self.inner
            .state
            .borrow()
            .tunations
            .get(id)
            .map(|n| n.children.iter().map(|&(_, c)| c).collect())
            .unwrap_or_default()
    }

    pub fn parent(&self, id: TunationId) -> Option<TunationId> {
        self.inner.state.borrow().tunations.get(id)?.parent
    }

    /// Output of the last committed pass of `id`.
    pub fn nodes(&self, id: TunationId) -> Vec<Node> {
        self.inner
            .state
            .borrow()
            .tunations
            .get(id)
            .map(|n| n.nodes.clone())
            .unwrap_or_default()
    }

    /// Patches accumulated by commits of `id` since the last call.
    pub fn take_patch(&self, id: TunationId) -> Vec<NodePatch> {
        self.state_mut()
            .tunations
            .get_mut(id)
            .map(|n| std::mem::take(&mut n.patch))
            .unwrap_or_default()
    }

    pub fn tune_count(&self, id: TunationId) -> u64 {
        self.inner
            .state
            .borrow()
            .tunations
            .get(id)
            .map_or(0, |n| n.tune_count)
    }

    pub fn slot_count(&self, id: TunationId) -> usize {
        self.inner
            .state
            .borrow()
            .tunations
            .get(id)
            .map_or(0, |n| n.slots.len())
    }

    pub fn roots(&self) -> Vec<TunationId> {
        self.inner.state.borrow().roots.clone()
    }

    /// Number of live tunations.
    pub fn len(&self) -> usize {
        self.inner.state.borrow().tunations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn run_pass(
        &self,
        id: TunationId,
        content: Option<Content>,
        locals: Option<CapturedLocals>,
    ) -> TuneResult<()> {
        if tuner::in_pass() {
            return self.pass(id, content, locals);
        }
        let outer = OuterPass::begin(self)?;
        let result = self.pass(id, content, locals);
        outer.finish(result)
    }

    fn pass(
        &self,
        id: TunationId,
        content: Option<Content>,
        locals: Option<CapturedLocals>,
    ) -> TuneResult<()> {
        let (run, _locals) = self.start(id, content, locals)?;
        let mut guard = FrameGuard {
            retuner: self,
            id,
            armed: true,
        };
        let result = run().map_err(tuner::into_tune_error);
        guard.armed = false;
        self.finish(id, result)
    }

    /// Pushes a frame for `id` and installs the locals it runs under.
    fn start(
        &self,
        id: TunationId,
        content: Option<Content>,
        locals: Option<CapturedLocals>,
    ) -> TuneResult<(Content, InstalledLocals)> {
        let mut st = self.state_mut();
        let node = st.tunations.get_mut(id).ok_or(TuneError::Disposed(id))?;
        if node.state == TunationState::Tuning {
            return Err(TuneError::Reentrant(id));
        }
        let run = content.clone().unwrap_or_else(|| node.content.clone());
        let installed = locals::install(locals.as_ref().unwrap_or(&node.locals));
        let prev_state = node.state;
        node.state = TunationState::Tuning;
        let old_slots = std::mem::take(&mut node.slots);
        let token = node.token.clone();
        drop(st);

        log::debug!("tuning {id:?}");
        tuner::push_frame(Frame::new(
            self.clone(),
            id,
            prev_state,
            content,
            locals,
            token,
            old_slots,
        ));
        Ok((run, installed))
    }

    /// Pops the frame of `id`: completed frames wait for the outermost pass,
    /// failed ones are abandoned and poison it.
    fn finish(&self, id: TunationId, result: TuneResult<()>) -> TuneResult<()> {
        let Some(frame) = tuner::pop_frame(self, id) else {
            result?;
            return Err(TuneError::NoActiveTuningContext);
        };
        match result {
            Ok(()) => {
                tuner::complete(frame);
                Ok(())
            }
            Err(e) => {
                tuner::poison(id);
                self.abandon(frame);
                Err(e)
            }
        }
    }

    /// Returns the existing child of `parent` under `key`, or creates one.
    pub(crate) fn adopt_child(
        &self,
        parent: TunationId,
        key: u64,
        content: &Content,
    ) -> TuneResult<TunationId> {
        let mut st = self.state_mut();
        let p = st.tunations.get(parent).ok_or(TuneError::Disposed(parent))?;
        if let Some(child) = p.child(key)
            && st.tunations.contains_key(child)
        {
            return Ok(child);
        }
        let node = TunationNode::new(
            Some(parent),
            content.clone(),
            locals::capture(),
            p.token.child_token(),
        );
        let id = st.tunations.insert(node);
        drop(st);
        log::debug!("created {id:?} under {parent:?}");
        tuner::note_created(self.clone(), id);
        Ok(id)
    }

    /// Publishes a completed frame into the arena. Returns the frame's side
    /// effects; remember hooks have already run.
    pub(crate) fn commit(&self, mut frame: Frame) -> Vec<Box<dyn FnOnce()>> {
        let nodes = frame.take_nodes();
        let id = frame.id;
        let mut teardowns = Vec::new();
        let leaving: Vec<Rc<dyn RememberObserver>> = {
            let mut guard = self.state_mut();
            let st = &mut *guard;
            let Some(node) = st.tunations.get_mut(id) else {
                log::warn!("{id:?} disappeared before its pass committed");
                drop(guard);
                for observer in frame.entering.iter().rev() {
                    observer.on_abandoned();
                }
                return Vec::new();
            };

            let leaving = frame
                .old_slots
                .iter()
                .zip(&frame.used)
                .filter(|(_, used)| !**used)
                .filter_map(|(slot, _)| slot.observer.clone())
                .collect();
            node.slots = std::mem::take(&mut frame.slots);
            if let Some(content) = frame.content.take() {
                node.content = content;
            }
            if let Some(locals) = frame.locals.take() {
                node.locals = locals;
            }
            node.state = TunationState::Idle;
            node.tune_count += 1;
            let patch = diff_nodes(&node.nodes, &nodes);
            node.patch.extend(patch);
            node.nodes = nodes;

            let new_deps = std::mem::take(&mut frame.deps);
            let old_deps = std::mem::replace(&mut node.deps, new_deps.clone());
            let new_children = std::mem::take(&mut frame.children);
            let old_children = std::mem::replace(&mut node.children, new_children.clone());

            st.unindex(id, old_deps.difference(&new_deps).copied());
            for cell in new_deps {
                st.readers.entry(cell).or_default().insert(id);
            }
            st.round.insert(id);
            for (_, child) in old_children {
                if !new_children.iter().any(|&(_, c)| c == child) {
                    st.teardown(child, &mut teardowns);
                }
            }
            leaving
        };

        for teardown in teardowns {
            teardown.run();
        }
        for observer in leaving.iter().rev() {
            observer.on_forgotten();
        }
        for observer in &frame.entering {
            observer.on_remembered();
        }
        std::mem::take(&mut frame.side_effects)
    }

    /// Drops everything a frame created and restores the tunation to how it
    /// was before the pass.
    pub(crate) fn abandon(&self, frame: Frame) {
        let Frame {
            id,
            prev_state,
            old_slots,
            entering,
            ..
        } = frame;
        if let Some(node) = self.state_mut().tunations.get_mut(id) {
            node.slots = old_slots;
            node.state = prev_state;
        }
        for observer in entering.iter().rev() {
            observer.on_abandoned();
        }
        log::debug!("pass of {id:?} abandoned");
    }

    /// Removes a tunation created by a pass that was rolled back.
    fn remove_created(&self, id: TunationId) {
        let mut teardowns = Vec::new();
        self.state_mut().teardown(id, &mut teardowns);
        for teardown in teardowns {
            teardown.run();
        }
    }
}

/// Abandons the frame of a pass whose content panicked.
struct FrameGuard<'a> {
    retuner: &'a Retuner,
    id: TunationId,
    armed: bool,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tuner::poison(self.id);
        if let Some(frame) = tuner::pop_frame(self.retuner, self.id) {
            self.retuner.abandon(frame);
        }
    }
}

/// The snapshot and thread-local hooks of the outermost pass on a thread.
struct OuterPass {
    retuner: Retuner,
    snapshot: Snapshot,
    current: Option<CurrentGuard>,
    reads: Option<ObserverGuard>,
    done: bool,
}

impl OuterPass {
    fn begin(retuner: &Retuner) -> TuneResult<Self> {
        let snapshot = retuner.inner.manager.take_mutable_snapshot(None, None);
        let current = snapshot.make_current()?;
        tuner::begin_pass(snapshot.clone());
        let reads = push_observers(Some(Rc::new(tuner::record_read) as Rc<dyn Fn(CellId)>), None);
        Ok(Self {
            retuner: retuner.clone(),
            snapshot,
            current: Some(current),
            reads: Some(reads),
            done: false,
        })
    }

    /// Applies the pass snapshot and commits every completed frame, or rolls
    /// all of them back.
    fn finish(mut self, result: TuneResult<()>) -> TuneResult<()> {
        self.done = true;
        self.reads = None;
        self.current = None;
        let Some(pass) = tuner::end_pass() else {
            return result;
        };
        let result = result
            .and_then(|()| match pass.poisoned {
                Some(id) => Err(TuneError::Aborted(id)),
                None => Ok(()),
            })
            .and_then(|()| self.snapshot.apply().map_err(TuneError::from));

        let participants = participants(&self.retuner, &pass.completed);
        match &result {
            Ok(()) => {
                let mut effects = Vec::new();
                for frame in pass.completed {
                    let retuner = frame.retuner.clone();
                    effects.extend(retuner.commit(frame));
                }
                for effect in effects {
                    effect();
                }
            }
            Err(e) => {
                log::debug!("pass in snapshot {} rolled back: {e}", self.snapshot.id());
                self.snapshot.dispose();
                roll_back(pass);
            }
        }
        for retuner in participants {
            retuner.flush_deferred();
        }
        result
    }
}

impl Drop for OuterPass {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.reads = None;
        self.current = None;
        if let Some(pass) = tuner::end_pass() {
            self.snapshot.dispose();
            roll_back(pass);
        }
    }
}

fn participants(first: &Retuner, frames: &[Frame]) -> Vec<Retuner> {
    let mut out = vec![first.clone()];
    for frame in frames {
        if !out.iter().any(|r| r.same_as(&frame.retuner)) {
            out.push(frame.retuner.clone());
        }
    }
    out
}

fn roll_back(pass: PassState) {
    for frame in pass.completed.into_iter().rev() {
        let retuner = frame.retuner.clone();
        retuner.abandon(frame);
    }
    for (retuner, id) in pass.created.into_iter().rev() {
        retuner.remove_created(id);
    }
}

/// A pass opened by [`Retuner::begin_tuning`]. Dropping it without
/// [`end`](Self::end) rolls the pass back.
pub struct TuningPass {
    retuner: Retuner,
    id: TunationId,
    outer: Option<OuterPass>,
    locals: Option<InstalledLocals>,
    done: bool,
}

impl fmt::Debug for TuningPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TuningPass")
            .field("id", &self.id)
            .field("outermost", &self.outer.is_some())
            .finish()
    }
}

impl TuningPass {
    pub fn id(&self) -> TunationId {
        self.id
    }

    /// Commits the pass (or, when nested, hands it to the enclosing pass).
    pub fn end(mut self) -> TuneResult<()> {
        self.close(Ok(()))
    }

    /// Rolls the pass back with `error`, which is returned.
    pub fn fail(mut self, error: anyhow::Error) -> TuneResult<()> {
        self.close(Err(tuner::into_tune_error(error)))
    }

    fn close(&mut self, result: TuneResult<()>) -> TuneResult<()> {
        self.done = true;
        self.locals = None;
        let result = self.retuner.finish(self.id, result);
        match self.outer.take() {
            Some(outer) => outer.finish(result),
            None => result,
        }
    }
}

impl Drop for TuningPass {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        log::warn!("tuning pass of {:?} dropped without end; rolling back", self.id);
        let _ = self.close(Err(TuneError::Content(anyhow::anyhow!(
            "tuning pass dropped without end"
        ))));
    }
}
