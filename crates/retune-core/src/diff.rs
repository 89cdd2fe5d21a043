//! Keyed list diff.
//!
//! [`diff`] turns an old key sequence into a new one with the fewest
//! operations: unmatched old keys are removed, unmatched new keys are
//! inserted, and of the matched keys only those outside a longest increasing
//! subsequence are moved. Operations are meant to be applied in order, each
//! against the list as left by the previous one (see [`apply`]).

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::tunation::{Node, NodeKey};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiffOp<K> {
    Remove { index: usize, key: K },
    Insert { index: usize, key: K },
    /// Remove the item at `from`, then insert it at `to`.
    Move { from: usize, to: usize, key: K },
}

/// Changes to one node's children. `parent` is `None` for a tunation's
/// top-level node list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePatch {
    pub parent: Option<NodeKey>,
    pub ops: Vec<DiffOp<NodeKey>>,
}

/// Keys are expected to be unique within each list. If either list repeats
/// a key, the script removes every old item and inserts every new one.
pub fn diff<K: Clone + Eq + Hash>(old: &[K], new: &[K]) -> Vec<DiffOp<K>> {
    let new_index: HashMap<&K, usize> = new.iter().enumerate().map(|(i, k)| (k, i)).collect();
    let old_unique = old.iter().collect::<HashSet<_>>().len() == old.len();
    if !old_unique || new_index.len() != new.len() {
        log::warn!("diff: duplicate keys; replacing the whole list");
        return replace_all(old, new);
    }
    let mut ops = Vec::new();

    for (index, key) in old.iter().enumerate().rev() {
        if !new_index.contains_key(key) {
            ops.push(DiffOp::Remove {
                index,
                key: key.clone(),
            });
        }
    }
    let mut current: Vec<K> = old
        .iter()
        .filter(|k| new_index.contains_key(k))
        .cloned()
        .collect();

    let targets: Vec<usize> = current.iter().map(|k| new_index[k]).collect();
    let stable: HashSet<K> = longest_increasing(&targets)
        .into_iter()
        .map(|i| current[i].clone())
        .collect();
    let present: HashSet<&K> = old.iter().collect();

    // Right to left, each placed key lands just before the key after it.
    let mut anchor: Option<&K> = None;
    for key in new.iter().rev() {
        if !stable.contains(key) {
            let position = |list: &[K]| match anchor {
                Some(a) => list.iter().position(|k| k == a).unwrap_or(list.len()),
                None => list.len(),
            };
            if present.contains(key) {
                let from = current.iter().position(|k| k == key).unwrap_or(0);
                let item = current.remove(from);
                let to = position(&current);
                current.insert(to, item);
                if from != to {
                    ops.push(DiffOp::Move {
                        from,
                        to,
                        key: key.clone(),
                    });
                }
            } else {
                let index = position(&current);
                current.insert(index, key.clone());
                ops.push(DiffOp::Insert {
                    index,
                    key: key.clone(),
                });
            }
        }
        anchor = Some(key);
    }
    ops
}

/// Indices into `seq` of one longest strictly increasing subsequence.
fn longest_increasing(seq: &[usize]) -> Vec<usize> {
    let mut tails: Vec<usize> = Vec::new();
    let mut prev = vec![usize::MAX; seq.len()];
    for (i, &value) in seq.iter().enumerate() {
        let at = tails.partition_point(|&t| seq[t] < value);
        if at > 0 {
            prev[i] = tails[at - 1];
        }
        if at == tails.len() {
            tails.push(i);
        } else {
            tails[at] = i;
        }
    }
    let mut out = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        out.push(i);
        cursor = (prev[i] != usize::MAX).then_some(prev[i]);
    }
    out.reverse();
    out
}

/// Applies a script produced by [`diff`] to `list`.
pub fn apply<K: Clone>(list: &mut Vec<K>, ops: &[DiffOp<K>]) {
    for op in ops {
        match op {
            DiffOp::Remove { index, .. } => {
                list.remove(*index);
            }
            DiffOp::Insert { index, key } => list.insert(*index, key.clone()),
            DiffOp::Move { from, to, .. } => {
                let item = list.remove(*from);
                list.insert(*to, item);
            }
        }
    }
}

fn replace_all<K: Clone>(old: &[K], new: &[K]) -> Vec<DiffOp<K>> {
    let removals = old.iter().enumerate().rev().map(|(index, key)| DiffOp::Remove {
        index,
        key: key.clone(),
    });
    let inserts = new.iter().enumerate().map(|(index, key)| DiffOp::Insert {
        index,
        key: key.clone(),
    });
    removals.chain(inserts).collect()
}

/// Diffs two node lists by key, recursing into children of nodes present in
/// both. Only lists that changed produce a patch.
pub(crate) fn diff_nodes(old: &[Node], new: &[Node]) -> Vec<NodePatch> {
    let mut patches = Vec::new();
    diff_level(None, old, new, &mut patches);
    patches
}

fn diff_level(parent: Option<NodeKey>, old: &[Node], new: &[Node], out: &mut Vec<NodePatch>) {
    let old_keys: Vec<NodeKey> = old.iter().map(|n| n.key).collect();
    let new_keys: Vec<NodeKey> = new.iter().map(|n| n.key).collect();
    let ops = diff(&old_keys, &new_keys);
    if !ops.is_empty() {
        out.push(NodePatch { parent, ops });
    }
    let previous: HashMap<NodeKey, &Node> = old.iter().map(|n| (n.key, n)).collect();
    for node in new {
        if let Some(before) = previous.get(&node.key) {
            diff_level(Some(node.key), &before.children, &node.children, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(old: &str, new: &str) -> Vec<DiffOp<char>> {
        let old: Vec<char> = old.chars().collect();
        let new: Vec<char> = new.chars().collect();
        let ops = diff(&old, &new);
        let mut list = old.clone();
        apply(&mut list, &ops);
        assert_eq!(list, new, "script {ops:?}");
        ops
    }

    fn moves(ops: &[DiffOp<char>]) -> usize {
        ops.iter()
            .filter(|op| matches!(op, DiffOp::Move { .. }))
            .count()
    }

    #[test]
    fn identical_lists_need_nothing() {
        assert!(check("abcd", "abcd").is_empty());
        assert!(check("", "").is_empty());
    }

    #[test]
    fn removals_come_first_in_descending_order() {
        let ops = check("abcde", "bd");
        assert_eq!(
            ops,
            vec![
                DiffOp::Remove { index: 4, key: 'e' },
                DiffOp::Remove { index: 2, key: 'c' },
                DiffOp::Remove { index: 0, key: 'a' },
            ]
        );
    }

    #[test]
    fn insertions() {
        let ops = check("ac", "abcd");
        assert_eq!(
            ops,
            vec![
                DiffOp::Insert { index: 2, key: 'd' },
                DiffOp::Insert { index: 1, key: 'b' },
            ]
        );
    }

    #[test]
    fn rotation_is_a_single_move() {
        assert_eq!(moves(&check("abcd", "bcda")), 1);
        assert_eq!(moves(&check("abcd", "dabc")), 1);
    }

    #[test]
    fn reversal_moves_all_but_one() {
        assert_eq!(moves(&check("abcde", "edcba")), 4);
    }

    #[test]
    fn mixed_edit() {
        let ops = check("abcdef", "fxbzdc");
        assert_eq!(
            ops.iter()
                .filter(|op| matches!(op, DiffOp::Remove { .. }))
                .count(),
            2
        );
        assert_eq!(
            ops.iter()
                .filter(|op| matches!(op, DiffOp::Insert { .. }))
                .count(),
            2
        );
        assert_eq!(moves(&ops), 2);
    }

    #[test]
    fn repeated_keys_replace_the_list() {
        let ops = check("a", "aa");
        assert_eq!(
            ops,
            vec![
                DiffOp::Remove { index: 0, key: 'a' },
                DiffOp::Insert { index: 0, key: 'a' },
                DiffOp::Insert { index: 1, key: 'a' },
            ]
        );
        check("abb", "ba");
    }

    #[test]
    fn lis_picks_increasing_indices() {
        let lis = longest_increasing(&[3, 0, 1, 4, 2, 5]);
        assert_eq!(lis.len(), 4);
        assert!(lis.windows(2).all(|w| w[0] < w[1]));
        assert!(longest_increasing(&[]).is_empty());
    }

    fn node(key: u64, children: Vec<Node>) -> Node {
        Node {
            key: NodeKey(key),
            descriptor: std::rc::Rc::new(()),
            children,
        }
    }

    #[test]
    fn node_diff_recurses_into_matched_nodes() {
        let old = vec![node(1, vec![node(10, vec![]), node(11, vec![])]), node(2, vec![])];
        let new = vec![node(2, vec![]), node(1, vec![node(11, vec![])])];
        let patches = diff_nodes(&old, &new);
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].parent, None);
        assert_eq!(patches[1].parent, Some(NodeKey(1)));
        assert_eq!(
            patches[1].ops,
            vec![DiffOp::Remove {
                index: 0,
                key: NodeKey(10)
            }]
        );
    }
}
