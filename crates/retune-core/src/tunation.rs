//! Arena records for composition units.
//!
//! A [`Tunation`](TunationId) is addressed by a [`TunationId`] into the
//! [`Retuner`](crate::retuner::Retuner)'s arena. Parent and child links are
//! ids, never owning pointers.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::rc::Rc;

use slotmap::new_key_type;
use tokio_util::sync::CancellationToken;

use crate::diff::NodePatch;
use crate::effects::RememberObserver;
use crate::locals::CapturedLocals;
use crate::state::CellId;

new_key_type! {
    /// Stable id of a composition unit. Stays valid (reporting `Disposed`)
    /// after the unit is removed.
    pub struct TunationId;
}

/// The function bound to a tunation, re-run on every tuning pass.
pub type Content = Rc<dyn Fn() -> anyhow::Result<()>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunationState {
    Uninitialized,
    Tuning,
    Idle,
    Disposed,
}

/// Identity of an emitted node within its parent list.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub u64);

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:016x}", self.0)
    }
}

/// A node recorded by [`emit_node`](crate::tuner::emit_node). The descriptor
/// is opaque to the runtime; hosts downcast it.
#[derive(Clone)]
pub struct Node {
    pub key: NodeKey,
    pub descriptor: Rc<dyn Any>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn descriptor<T: 'static>(&self) -> Option<&T> {
        self.descriptor.downcast_ref()
    }

    /// Number of nodes in this subtree, including this one.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Node::count).sum::<usize>()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("children", &self.children)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum SlotKind {
    Position(u32),
    Keyed(u64),
}

/// Identity of a remembered slot: the group path it was created under plus
/// either its ordinal among unkeyed slots or its caller key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SlotKey {
    pub(crate) group: u64,
    pub(crate) kind: SlotKind,
}

#[derive(Clone)]
pub(crate) struct Slot {
    pub(crate) key: SlotKey,
    pub(crate) value: Rc<dyn Any>,
    pub(crate) observer: Option<Rc<dyn RememberObserver>>,
}

pub(crate) fn hash_of(value: impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

pub(crate) struct TunationNode {
    pub(crate) parent: Option<TunationId>,
    pub(crate) content: Content,
    pub(crate) state: TunationState,
    pub(crate) slots: Vec<Slot>,
    pub(crate) deps: HashSet<CellId>,
    /// Children in the order they were last tuned, with their caller keys.
    pub(crate) children: Vec<(u64, TunationId)>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) patch: Vec<NodePatch>,
    pub(crate) locals: CapturedLocals,
    pub(crate) token: CancellationToken,
    pub(crate) tune_count: u64,
}

impl TunationNode {
    pub(crate) fn new(
        parent: Option<TunationId>,
        content: Content,
        locals: CapturedLocals,
        token: CancellationToken,
    ) -> Self {
        Self {
            parent,
            content,
            state: TunationState::Uninitialized,
            slots: Vec::new(),
            deps: HashSet::new(),
            children: Vec::new(),
            nodes: Vec::new(),
            patch: Vec::new(),
            locals,
            token,
            tune_count: 0,
        }
    }

    pub(crate) fn child(&self, key: u64) -> Option<TunationId> {
        self.children
            .iter()
            .find_map(|&(k, id)| (k == key).then_some(id))
    }
}

/// What a removed tunation still owes the outside world: exit hooks for its
/// remembered objects and cancellation of its background work.
pub(crate) struct Teardown {
    pub(crate) id: TunationId,
    pub(crate) slots: Vec<Slot>,
    pub(crate) token: CancellationToken,
}

impl Teardown {
    pub(crate) fn run(self) {
        for slot in self.slots.iter().rev() {
            if let Some(observer) = &slot.observer {
                observer.on_forgotten();
            }
        }
        self.token.cancel();
        log::debug!("tunation {:?} disposed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_count_includes_subtree() {
        let leaf = |k| Node {
            key: NodeKey(k),
            descriptor: Rc::new(()),
            children: Vec::new(),
        };
        let root = Node {
            key: NodeKey(0),
            descriptor: Rc::new("root"),
            children: vec![leaf(1), leaf(2)],
        };
        assert_eq!(root.count(), 3);
        assert_eq!(root.descriptor::<&str>(), Some(&"root"));
        assert!(root.descriptor::<u32>().is_none());
    }
}
