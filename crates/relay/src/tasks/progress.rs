//! Node-level progress bookkeeping for one running job.

use std::collections::{HashMap, HashSet};

use comfyrelay_shared::{NodeProgress, NodeState};

/// Completion estimate built from node and step frames.
///
/// The percent never reaches 100 on its own: only a completion frame does that.
#[derive(Debug, Clone, Default)]
pub struct ExecutionProgress {
    total_nodes: usize,
    completed: HashSet<String>,
    current_node: Option<String>,
    /// Step fraction of the running node (`value / max`).
    step: Option<(u32, u32)>,
    best_percent: u8,
}

impl ExecutionProgress {
    /// `total_nodes` is the node count of the submitted workflow (0 if unknown).
    pub fn new(total_nodes: usize) -> Self {
        Self {
            total_nodes,
            ..Self::default()
        }
    }

    pub fn mark_cached(&mut self, nodes: &[String]) {
        self.completed.extend(nodes.iter().cloned());
    }

    /// A node started running; the previous one is done.
    pub fn start_node(&mut self, node: &str) {
        if let Some(previous) = self.current_node.take() {
            if previous != node {
                self.completed.insert(previous);
            }
        }
        self.current_node = Some(node.to_string());
        self.step = None;
    }

    pub fn set_step(&mut self, node: Option<&str>, value: u32, max: u32) {
        if let Some(node) = node {
            if self.current_node.as_deref() != Some(node) {
                self.start_node(node);
            }
        }
        self.step = (max > 0).then_some((value.min(max), max));
    }

    /// Apply a full per-node state report.
    pub fn apply_states(&mut self, nodes: &HashMap<String, NodeProgress>) {
        if nodes.len() > self.total_nodes {
            self.total_nodes = nodes.len();
        }
        for (id, progress) in nodes {
            match progress.state {
                NodeState::Finished => {
                    self.completed.insert(id.clone());
                }
                NodeState::Running => {
                    self.current_node = Some(id.clone());
                    self.step = (progress.max > 0).then_some((progress.value.min(progress.max), progress.max));
                }
                NodeState::Pending | NodeState::Unknown => {}
            }
        }
    }

    /// Current estimate in percent, monotonic, capped at 99.
    pub fn percent(&mut self) -> u8 {
        let step_fraction = self
            .step
            .map(|(value, max)| f64::from(value) / f64::from(max))
            .unwrap_or(0.0);

        let estimate = if self.total_nodes > 0 {
            let done = (self.completed.len().min(self.total_nodes)) as f64;
            (done + step_fraction) / self.total_nodes as f64 * 100.0
        } else {
            step_fraction * 100.0
        };

        let percent = (estimate.floor() as u8).min(99);
        self.best_percent = self.best_percent.max(percent);
        self.best_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(state: NodeState) -> NodeProgress {
        NodeProgress {
            state,
            value: 0,
            max: 0,
        }
    }

    #[test]
    fn test_percent_from_completed_nodes_and_step() {
        let mut progress = ExecutionProgress::new(4);
        progress.mark_cached(&["1".to_string(), "2".to_string()]);
        progress.start_node("3");
        progress.set_step(Some("3"), 10, 20);
        // (2 + 0.5) / 4
        assert_eq!(progress.percent(), 62);

        progress.start_node("4");
        progress.set_step(Some("4"), 19, 20);
        assert_eq!(progress.percent(), 98);
    }

    #[test]
    fn test_percent_never_reaches_100_or_goes_back() {
        let mut progress = ExecutionProgress::new(1);
        progress.set_step(Some("1"), 20, 20);
        assert_eq!(progress.percent(), 99);

        progress.set_step(Some("1"), 1, 20);
        assert_eq!(progress.percent(), 99);
    }

    #[test]
    fn test_node_states_override_unknown_total() {
        let mut progress = ExecutionProgress::new(0);
        let nodes: HashMap<String, NodeProgress> = [
            ("1".to_string(), state(NodeState::Finished)),
            ("2".to_string(), state(NodeState::Finished)),
            ("3".to_string(), state(NodeState::Finished)),
            ("4".to_string(), state(NodeState::Finished)),
            ("5".to_string(), state(NodeState::Finished)),
            ("6".to_string(), state(NodeState::Finished)),
            ("7".to_string(), state(NodeState::Finished)),
            ("8".to_string(), state(NodeState::Finished)),
            ("9".to_string(), state(NodeState::Finished)),
            ("10".to_string(), state(NodeState::Pending)),
        ]
        .into_iter()
        .collect();
        progress.apply_states(&nodes);
        assert_eq!(progress.percent(), 90);
    }

    #[test]
    fn test_step_only_progress_without_node_count() {
        let mut progress = ExecutionProgress::new(0);
        progress.set_step(None, 3, 4);
        assert_eq!(progress.percent(), 75);
    }
}
