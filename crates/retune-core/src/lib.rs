//! # State, Snapshots and Tuning
//!
//! Retune re-runs declarative functions when the state they read changes.
//! There are three main pieces:
//!
//! - [`StateCell<T>`] - a versioned value read and written through
//!   [`Snapshot`]s.
//! - [`Tunation`](TunationId)s - units of content with a positional slot
//!   table, tuned by the [`tuner`] functions (`remember`, `emit_node`, ...).
//! - [`Retuner`] - the scheduler that re-tunes whatever read a changed cell.
//!
//! ## Snapshots
//!
//! Every read and write goes through a snapshot. Writes made inside a mutable
//! snapshot are invisible to everyone else until it is applied:
//!
//! ```rust
//! use retune_core::*;
//!
//! let manager = SnapshotManager::new();
//! let name = StateCell::with_manager(&manager, "A");
//!
//! let edit = manager.take_mutable_snapshot(None, None);
//! edit.enter(|| name.set("B"))??;
//! assert_eq!(name.get(), "A");
//!
//! edit.apply()?;
//! assert_eq!(name.get(), "B");
//! # Ok::<(), SnapshotError>(())
//! ```
//!
//! Two snapshots that write different values to the same cell cannot both
//! apply; the second fails with [`SnapshotError::ApplyConflict`] and the
//! caller decides whether to retry. Cells written while no snapshot is
//! entered go to the global snapshot and are published by
//! [`SnapshotManager::send_apply_notifications`].
//!
//! ## Tuning
//!
//! A tunation's content runs inside a tuning pass. `remember` keeps values
//! across passes by call position; every cell read is recorded as a
//! dependency:
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
//!     let label = remember(|| String::from("count"))?;
//!     emit_node(format!("{label} = {}", c.get()), || Ok(()))?;
//!     Ok(())
//! });
//! retuner.tune_now(root)?;
//!
//! count.set(1)?;
//! retuner.drain_pending()?;
//! assert_eq!(retuner.nodes(root)[0].descriptor::<String>().unwrap(), "count = 1");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! A pass commits atomically: if content fails, the slot table, the
//! dependency set and the output of the previous pass stay as they were, and
//! objects created by the failed pass are told they were abandoned.
//!
//! [`StateList`], [`StateMap`] and [`StateSet`] are collections stored in a
//! single cell, tracked and isolated like any other state.
//!
//! ## Effects
//!
//! `disposable_effect`, `launched_effect` and `produce_state` tie setup,
//! cleanup and background work to the lifetime of a remembered slot. Work
//! started by a tunation is cancelled when the tunation is disposed.

pub mod collections;
pub mod diff;
pub mod effects;
pub mod error;
pub mod locals;
pub mod manager;
pub mod prelude;
pub mod reactive;
pub mod retuner;
pub mod snapshot;
pub mod state;
pub mod tunation;
pub mod tuner;


pub use prelude::*;
