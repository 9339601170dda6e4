//! Per-run outcome of a convergence graph.

use serde::{Deserialize, Serialize};

use crate::domain::error::{RailyardError, Result};
use crate::graph::bus::Timing;
use crate::graph::node::{NodeKind, NodeStatus};

/// Outcome of a single node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeReport {
    pub name: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    /// Times the node's action was invoked (0 or 1).
    pub executions: u32,
    pub duration_ms: u64,
}

/// The first failure of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeFailure {
    pub node: String,
    pub cause: String,
}

/// A notification that reached its target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub target: String,
    pub timing: Timing,
}

/// Result of [`super::ConvergenceGraph::run`].
///
/// Nodes are listed in declaration order. A report produced without running
/// anything (for example after a configuration error) is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub graph: String,
    pub nodes: Vec<NodeReport>,
    pub deliveries: Vec<Delivery>,
    pub duration_ms: u64,
    pub failure: Option<NodeFailure>,
    /// Set when the cancellation signal stopped the run; names the node
    /// boundary that was not crossed.
    pub cancelled_at: Option<String>,
}

impl RunReport {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.cancelled_at.is_none()
    }

    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<NodeStatus> {
        self.node(name).map(|n| n.status)
    }

    pub fn executions_of(&self, name: &str) -> u32 {
        self.node(name).map(|n| n.executions).unwrap_or(0)
    }

    /// Names of nodes whose action changed the system.
    pub fn changed(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Succeeded)
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Run-if-divergent nodes whose action was invoked, including those
    /// whose action then reported nothing to change.
    pub fn divergent_executions(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::RunIfDivergent && n.executions > 0)
            .count()
    }

    /// Convert into an error when the run failed or was cancelled.
    pub fn into_result(self) -> Result<RunReport> {
        if let Some(failure) = &self.failure {
            return Err(RailyardError::Convergence {
                node: failure.node.clone(),
                cause: failure.cause.clone(),
            });
        }
        if let Some(boundary) = &self.cancelled_at {
            return Err(RailyardError::Cancelled {
                boundary: boundary.clone(),
            });
        }
        Ok(self)
    }
}
