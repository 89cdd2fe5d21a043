use std::fmt::Write;

use retune_core::{Retuner, TunationId};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metrics {
    pub tunations: usize,
    /// Sum of every live tunation's dependency count.
    pub dependencies: usize,
    pub pending: usize,
    pub nodes: usize,
    pub last_drain_passes: usize,
}

impl Metrics {
    pub fn collect(retuner: &Retuner) -> Self {
        let mut metrics = Metrics {
            pending: retuner.pending_count(),
            ..Metrics::default()
        };
        let mut stack = retuner.roots();
        while let Some(id) = stack.pop() {
            metrics.tunations += 1;
            metrics.dependencies += retuner.dependencies(id).len();
            metrics.nodes += retuner.nodes(id).iter().map(|n| n.count()).sum::<usize>();
            stack.extend(retuner.children(id));
        }
        metrics
    }
}

/// Text view of a retuner's tunation trees.
pub struct Inspector {
    pub enabled: bool,
    drain_count: u64,
    pub metrics: Option<Metrics>,
}

impl Default for Inspector {
    fn default() -> Self {
        Self::new()
    }
}

impl Inspector {
    pub fn new() -> Self {
        Self {
            enabled: false,
            drain_count: 0,
            metrics: None,
        }
    }

    pub fn toggle(&mut self) {
        self.enabled = !self.enabled;
    }

    pub fn drain_count(&self) -> u64 {
        self.drain_count
    }

    /// Call after each `drain_pending` with the number of passes it ran.
    pub fn after_drain(&mut self, retuner: &Retuner, passes: usize) {
        self.drain_count += 1;
        if !self.enabled {
            return;
        }
        let mut metrics = Metrics::collect(retuner);
        metrics.last_drain_passes = passes;
        log::debug!(
            "drain #{}: {} pass(es)  |  tunations: {}  |  deps: {}  |  nodes: {}",
            self.drain_count,
            passes,
            metrics.tunations,
            metrics.dependencies,
            metrics.nodes
        );
        for root in retuner.roots() {
            log::debug!("\n{}", self.dump(retuner, root));
        }
        self.metrics = Some(metrics);
    }

    /// One line per tunation under `root`, children indented.
    pub fn dump(&self, retuner: &Retuner, root: TunationId) -> String {
        let mut out = String::new();
        dump_into(&mut out, retuner, root, 0);
        out
    }
}

fn dump_into(out: &mut String, retuner: &Retuner, id: TunationId, depth: usize) {
    let nodes: usize = retuner.nodes(id).iter().map(|n| n.count()).sum();
    let _ = writeln!(
        out,
        "{:indent$}{:?} {:?} tuned={} deps={} nodes={}",
        "",
        id,
        retuner.state(id),
        retuner.tune_count(id),
        retuner.dependencies(id).len(),
        nodes,
        indent = depth * 2
    );
    for child in retuner.children(id) {
        dump_into(out, retuner, child, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retune_core::{SnapshotManager, StateCell, emit_node, tune_child};

    fn tree() -> (SnapshotManager, Retuner, TunationId) {
        let manager = SnapshotManager::new();
        let retuner = Retuner::new(&manager);
        let cell = StateCell::with_manager(&manager, 1);
        let root = retuner.create_root(move || {
            let c = cell.clone();
            tune_child("leaf", move || {
                emit_node(c.get(), || {
                    emit_node("inner", || Ok(()))?;
                    Ok(())
                })?;
                Ok(())
            })?;
            Ok(())
        });
        retuner.tune_now(root).unwrap();
        (manager, retuner, root)
    }

    #[test]
    fn metrics_cover_the_whole_tree() {
        let (_m, retuner, _root) = tree();
        let metrics = Metrics::collect(&retuner);
        assert_eq!(metrics.tunations, 2);
        assert_eq!(metrics.dependencies, 1);
        assert_eq!(metrics.nodes, 2);
        assert_eq!(metrics.pending, 0);
    }

    #[test]
    fn dump_indents_children() {
        let (_m, retuner, root) = tree();
        let text = Inspector::new().dump(&retuner, root);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Idle tuned=1 deps=0 nodes=0"));
        assert!(lines[1].starts_with("  "));
        assert!(lines[1].ends_with("deps=1 nodes=2"));
    }

    #[test]
    fn after_drain_records_metrics_only_when_enabled() {
        let (_m, retuner, _root) = tree();
        let mut inspector = Inspector::default();
        inspector.after_drain(&retuner, 0);
        assert!(inspector.metrics.is_none());

        inspector.toggle();
        inspector.after_drain(&retuner, 3);
        assert_eq!(inspector.drain_count(), 2);
        assert_eq!(inspector.metrics.as_ref().map(|m| m.last_drain_passes), Some(3));
    }
}
