//! # Effects
//!
//! Objects stored in the slot table can implement [`RememberObserver`] to
//! learn when they enter it (the pass that created them committed) and when
//! they leave it (a later pass stopped asking for them, or the tunation was
//! disposed). Effects are built on that contract:
//!
//! - [`disposable_effect`] runs setup on enter and its [`Dispose`] on exit or
//!   key change.
//! - [`launched_effect`] starts background work on enter and cancels it on
//!   exit, key change or disposal of the owning tunation.
//! - [`remember_task_scope`] hands out a [`TaskScope`] for work started from
//!   callbacks.
//! - [`produce_state`] feeds a remembered [`StateCell`] from background work.
//! - [`side_effect`] runs after every successful pass.

use std::cell::RefCell;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{SnapshotError, TuneResult};
use crate::snapshot;
use crate::state::StateCell;
use crate::tuner::{self, group, remember, remember_observed, remember_observed_keyed};

/// Enter/exit notifications for remembered objects.
///
/// Hooks run on the thread driving the pass, after the pass commits (or
/// aborts, for `on_abandoned`), never while content is running.
pub trait RememberObserver {
    /// The object was stored by a pass that committed.
    fn on_remembered(&self) {}

    /// The object left the slot table of a committed pass, or its tunation
    /// was disposed.
    fn on_forgotten(&self) {}

    /// The pass that created the object failed; it was never remembered.
    fn on_abandoned(&self) {}
}

#[derive(Clone)]
pub struct Dispose(Rc<RefCell<Option<Box<dyn FnOnce()>>>>);

impl Dispose {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Rc::new(RefCell::new(Some(Box::new(f)))))
    }

    /// Runs at most once (safe to call multiple times).
    pub fn run(&self) {
        let f = self.0.borrow_mut().take();
        if let Some(f) = f {
            f()
        }
    }
}

/// Helper to register cleanup inside effect.
pub fn on_dispose(f: impl FnOnce() + 'static) -> Dispose {
    Dispose::new(f)
}

/// Work handed to a [`TaskSpawner`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Starts background work for effects.
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: Task);
}

/// Runs each task on its own named thread.
#[derive(Clone, Debug, Default)]
pub struct ThreadSpawner;

impl TaskSpawner for ThreadSpawner {
    fn spawn(&self, task: Task) {
        let spawned = std::thread::Builder::new()
            .name("retune-task".into())
            .spawn(task);
        if let Err(e) = spawned {
            log::error!("failed to spawn effect task: {e}");
        }
    }
}

/// Runs each task immediately on the calling thread.
#[derive(Clone, Debug, Default)]
pub struct InlineSpawner;

impl TaskSpawner for InlineSpawner {
    fn spawn(&self, task: Task) {
        task()
    }
}

struct DisposableEffect {
    effect: RefCell<Option<Box<dyn FnOnce() -> Dispose>>>,
    cleanup: RefCell<Option<Dispose>>,
}

impl RememberObserver for DisposableEffect {
    fn on_remembered(&self) {
        let effect = self.effect.borrow_mut().take();
        if let Some(effect) = effect {
            let d = effect();
            *self.cleanup.borrow_mut() = Some(d);
        }
    }

    fn on_forgotten(&self) {
        let cleanup = self.cleanup.borrow_mut().take();
        if let Some(d) = cleanup {
            d.run();
        }
    }
}

/// Runs `effect` when the key first appears and again whenever it changes.
/// The [`Dispose`] it returns runs before the next run and when the effect
/// leaves the tunation.
pub fn disposable_effect<K: Hash>(
    key: K,
    effect: impl FnOnce() -> Dispose + 'static,
) -> TuneResult<()> {
    group("disposable_effect", || {
        remember_observed_keyed(key, || DisposableEffect {
            effect: RefCell::new(Some(Box::new(effect))),
            cleanup: RefCell::new(None),
        })
    })??;
    Ok(())
}

struct LaunchedEffect {
    task: RefCell<Option<Box<dyn FnOnce(CancellationToken) + Send>>>,
    token: CancellationToken,
    spawner: Arc<dyn TaskSpawner>,
}

impl RememberObserver for LaunchedEffect {
    fn on_remembered(&self) {
        let task = self.task.borrow_mut().take();
        if let Some(task) = task {
            let token = self.token.clone();
            self.spawner.spawn(Box::new(move || task(token)));
        }
    }

    fn on_forgotten(&self) {
        self.token.cancel();
    }
}

/// Starts `task` once the pass commits, with a token that is cancelled when
/// `key` changes, the call leaves the content, or the tunation is disposed.
/// Tasks must watch the token; cancellation does not interrupt them.
pub fn launched_effect<K: Hash>(
    key: K,
    task: impl FnOnce(CancellationToken) + Send + 'static,
) -> TuneResult<()> {
    let ctx = tuner::task_context()?;
    group("launched_effect", || {
        remember_observed_keyed(key, || LaunchedEffect {
            task: RefCell::new(Some(Box::new(task))),
            token: ctx.token.child_token(),
            spawner: ctx.spawner,
        })
    })??;
    Ok(())
}

/// Spawns work tied to the lifetime of a remembered slot.
pub struct TaskScope {
    token: CancellationToken,
    spawner: Arc<dyn TaskSpawner>,
}

impl fmt::Debug for TaskScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScope")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl TaskScope {
    /// Spawns `task` with a child token of this scope. Does nothing once the
    /// scope is cancelled.
    pub fn spawn(&self, task: impl FnOnce(CancellationToken) + Send + 'static) {
        if self.token.is_cancelled() {
            log::debug!("task scope cancelled; dropping spawned task");
            return;
        }
        let token = self.token.child_token();
        self.spawner.spawn(Box::new(move || task(token)));
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl RememberObserver for TaskScope {
    fn on_forgotten(&self) {
        self.token.cancel();
    }

    fn on_abandoned(&self) {
        self.token.cancel();
    }
}

pub fn remember_task_scope() -> TuneResult<Rc<TaskScope>> {
    let ctx = tuner::task_context()?;
    remember_observed(|| TaskScope {
        token: ctx.token.child_token(),
        spawner: ctx.spawner,
    })
}

/// Handle given to a [`produce_state`] producer.
pub struct ProducerScope<T> {
    cell: StateCell<T>,
    token: CancellationToken,
}

impl<T: Send + Sync + 'static> ProducerScope<T> {
    /// Publishes `value` in its own snapshot. Ignored once cancelled.
    pub fn set(&self, value: T) -> Result<(), SnapshotError> {
        if self.token.is_cancelled() {
            return Ok(());
        }
        snapshot::with_mutable_snapshot(self.cell.manager(), || self.cell.set(value))?
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.cell.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// A remembered cell starting at `initial`, written by `producer` running in
/// the background. The producer restarts when `key` changes.
pub fn produce_state<T, K>(
    initial: T,
    key: K,
    producer: impl FnOnce(ProducerScope<T>) + Send + 'static,
) -> TuneResult<StateCell<T>>
where
    T: PartialEq + Send + Sync + 'static,
    K: Hash,
{
    let manager = tuner::task_context()?.manager;
    let cell = (*remember(|| StateCell::with_manager(&manager, initial))?).clone();
    let target = cell.clone();
    launched_effect(key, move |token| {
        producer(ProducerScope {
            cell: target,
            token,
        })
    })?;
    Ok(cell)
}

/// Queues `effect` to run once the current pass has committed. A pass that
/// fails drops it without running it.
pub fn side_effect(effect: impl FnOnce() + 'static) -> TuneResult<()> {
    tuner::push_side_effect(Box::new(effect))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::SnapshotManager;
    use crate::retuner::{Retuner, RetunerConfig};
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn inline_retuner(manager: &SnapshotManager) -> Retuner {
        Retuner::with_config(
            manager,
            RetunerConfig::default().with_spawner(Arc::new(InlineSpawner)),
        )
    }

    #[test]
    fn dispose_runs_once() {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let d = on_dispose(move || c.set(c.get() + 1));
        let d2 = d.clone();
        d.run();
        d2.run();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn disposable_effect_follows_key_and_disposal() {
        let manager = SnapshotManager::new();
        let retuner = Retuner::new(&manager);
        let log: Rc<RefCell<Vec<String>>> = Rc::default();
        let key = Rc::new(Cell::new(1));
        let (l, k) = (log.clone(), key.clone());
        let root = retuner.create_root(move || {
            let k = k.get();
            let l = l.clone();
            disposable_effect(k, move || {
                l.borrow_mut().push(format!("start {k}"));
                on_dispose(move || l.borrow_mut().push(format!("stop {k}")))
            })?;
            Ok(())
        });

        retuner.tune_now(root).unwrap();
        retuner.tune_now(root).unwrap();
        assert_eq!(*log.borrow(), vec!["start 1"]);

        key.set(2);
        retuner.tune_now(root).unwrap();
        assert_eq!(*log.borrow(), vec!["start 1", "stop 1", "start 2"]);

        retuner.dispose(root);
        retuner.dispose(root);
        assert_eq!(
            *log.borrow(),
            vec!["start 1", "stop 1", "start 2", "stop 2"]
        );
    }

    #[test]
    fn launched_effect_is_cancelled_with_its_tunation() {
        let manager = SnapshotManager::new();
        let retuner = inline_retuner(&manager);
        let (tx, rx) = mpsc::channel::<CancellationToken>();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let root = retuner.create_root(move || {
            let tx = tx.clone();
            let r = r.clone();
            launched_effect("once", move |token| {
                r.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(token);
            })?;
            Ok(())
        });

        retuner.tune_now(root).unwrap();
        retuner.tune_now(root).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let token = rx.try_recv().unwrap();
        assert!(!token.is_cancelled());

        retuner.dispose(root);
        assert!(token.is_cancelled());
    }

    #[test]
    fn launched_effect_does_not_start_for_a_failed_pass() {
        let manager = SnapshotManager::new();
        let retuner = inline_retuner(&manager);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let root = retuner.create_root(move || {
            let r = r.clone();
            launched_effect((), move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            })?;
            anyhow::bail!("not yet")
        });
        assert!(retuner.tune_now(root).is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn task_scope_is_cancelled_when_forgotten() {
        let manager = SnapshotManager::new();
        let retuner = inline_retuner(&manager);
        let keep = Rc::new(Cell::new(true));
        let scope: Rc<RefCell<Option<Rc<TaskScope>>>> = Rc::default();
        let (k, s) = (keep.clone(), scope.clone());
        let root = retuner.create_root(move || {
            if k.get() {
                *s.borrow_mut() = Some(remember_task_scope()?);
            }
            Ok(())
        });

        retuner.tune_now(root).unwrap();
        let handle = scope.borrow_mut().take().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        handle.spawn(move |token| {
            assert!(!token.is_cancelled());
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        keep.set(false);
        retuner.tune_now(root).unwrap();
        assert!(handle.is_cancelled());
        let r = ran.clone();
        handle.spawn(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn produce_state_publishes_from_the_producer() {
        let manager = SnapshotManager::new();
        let retuner = inline_retuner(&manager);
        let cell: Rc<RefCell<Option<StateCell<i32>>>> = Rc::default();
        let c = cell.clone();
        let root = retuner.create_root(move || {
            let state = produce_state(0, "load", |scope| {
                scope.set(42).unwrap();
            })?;
            *c.borrow_mut() = Some(state);
            Ok(())
        });

        retuner.tune_now(root).unwrap();
        let state = cell.borrow().clone().unwrap();
        assert_eq!(state.get(), 42);
    }
}
