//! Declaration-ordered execution of action nodes with notification delivery.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::time::Instant;

use tracing::Instrument;
use uuid::Uuid;

use crate::domain::error::{RailyardError, Result};
use crate::graph::bus::{NotificationBus, NotificationEdge, Timing};
use crate::graph::node::{ActionNode, Convergence, NodeKind, NodeStatus};
use crate::graph::report::{Delivery, NodeFailure, NodeReport, RunReport};
use crate::obs;
use crate::runtime::{with_deadline, CancelSignal};

/// What happened when a node was visited.
enum Visit {
    /// Probe found actual == intended; the action was not invoked.
    InSync,
    Converged(Convergence),
}

/// A set of action nodes plus the notification edges between them.
///
/// Nodes run strictly in the order they were added; this is not a
/// topological sort, later nodes may rely on side effects of earlier ones.
/// One graph instance is one run: [`ConvergenceGraph::run`] consumes it.
#[derive(Debug)]
pub struct ConvergenceGraph {
    name: String,
    nodes: Vec<ActionNode>,
    index: HashMap<String, usize>,
    bus: NotificationBus,
}

impl ConvergenceGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
            bus: NotificationBus::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[ActionNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[NotificationEdge] {
        self.bus.edges()
    }

    /// Append a node. Names must be unique within the graph.
    pub fn add_node(&mut self, node: ActionNode) -> Result<()> {
        if self.index.contains_key(node.name()) {
            return Err(RailyardError::Configuration(format!(
                "graph '{}' already has a node named '{}'",
                self.name,
                node.name()
            )));
        }
        self.index.insert(node.name().to_string(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Declare that `source`, on converging with a change, notifies `target`.
    ///
    /// Both nodes must already exist and the target must be reactive-only.
    pub fn add_edge(&mut self, source: &str, target: &str, timing: Timing) -> Result<()> {
        if !self.index.contains_key(source) {
            return Err(RailyardError::Configuration(format!(
                "notification source '{}' is not a node of graph '{}'",
                source, self.name
            )));
        }
        let target_idx = self.index.get(target).copied().ok_or_else(|| {
            RailyardError::Configuration(format!(
                "notification target '{}' is not a node of graph '{}'",
                target, self.name
            ))
        })?;
        if source == target {
            return Err(RailyardError::Configuration(format!(
                "node '{}' cannot notify itself",
                source
            )));
        }
        if self.nodes[target_idx].kind() != NodeKind::ReactiveOnly {
            return Err(RailyardError::Configuration(format!(
                "notification target '{}' must be reactive-only",
                target
            )));
        }
        self.bus.declare(source, target, timing);
        Ok(())
    }

    /// Execute the graph once.
    ///
    /// Run-if-divergent nodes are probed in declaration order and converged
    /// only when divergent. A change queues the node's outgoing edges;
    /// immediate edges are delivered before the next declared node, deferred
    /// ones after the whole sequence. The first failure stops the run and
    /// suppresses all undelivered notifications. Cancellation is honoured at
    /// every node boundary.
    pub async fn run(mut self, cancel: &CancelSignal) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport {
            run_id: Uuid::new_v4().to_string(),
            graph: self.name.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeReport {
                    name: n.name().to_string(),
                    kind: n.kind(),
                    status: NodeStatus::NotRun,
                    executions: 0,
                    duration_ms: 0,
                })
                .collect(),
            ..Default::default()
        };

        let span = obs::run_span(&report.run_id, &self.name);
        obs::emit_graph_started(&report.run_id, &self.name, self.nodes.len());

        let _ = self.drive(cancel, &mut report).instrument(span).await;

        report.duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_graph_finished(
            &report.run_id,
            &self.name,
            report.duration_ms,
            report.succeeded(),
        );
        report
    }

    async fn drive(&mut self, cancel: &CancelSignal, report: &mut RunReport) -> ControlFlow<()> {
        for idx in 0..self.nodes.len() {
            if self.nodes[idx].kind() != NodeKind::RunIfDivergent {
                continue;
            }
            self.check_cancel(idx, cancel, report)?;
            self.execute(idx, true, report).await?;
            self.deliver_immediate(cancel, report).await?;
        }

        loop {
            let targets = self.bus.flush(Timing::Deferred);
            if targets.is_empty() {
                return ControlFlow::Continue(());
            }
            for target in targets {
                self.deliver(&target, Timing::Deferred, cancel, report)
                    .await?;
                self.deliver_immediate(cancel, report).await?;
            }
        }
    }

    async fn deliver_immediate(
        &mut self,
        cancel: &CancelSignal,
        report: &mut RunReport,
    ) -> ControlFlow<()> {
        while self.bus.pending(Timing::Immediate) > 0 {
            for target in self.bus.flush(Timing::Immediate) {
                self.deliver(&target, Timing::Immediate, cancel, report)
                    .await?;
            }
        }
        ControlFlow::Continue(())
    }

    async fn deliver(
        &mut self,
        target: &str,
        timing: Timing,
        cancel: &CancelSignal,
        report: &mut RunReport,
    ) -> ControlFlow<()> {
        // add_edge guarantees every target exists
        let Some(&idx) = self.index.get(target) else {
            return ControlFlow::Continue(());
        };
        self.check_cancel(idx, cancel, report)?;
        obs::emit_notification_delivered(&report.run_id, target, timing);
        report.deliveries.push(Delivery {
            target: target.to_string(),
            timing,
        });
        self.execute(idx, false, report).await
    }

    fn check_cancel(
        &self,
        idx: usize,
        cancel: &CancelSignal,
        report: &mut RunReport,
    ) -> ControlFlow<()> {
        if cancel.is_cancelled() {
            let boundary = self.nodes[idx].name().to_string();
            obs::emit_run_cancelled(&report.run_id, &boundary);
            report.cancelled_at = Some(boundary);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Visit one node, record its outcome and queue its edges on change.
    async fn execute(&mut self, idx: usize, probe: bool, report: &mut RunReport) -> ControlFlow<()> {
        let node = self.nodes[idx].clone();
        let started = Instant::now();
        let result = visit(&node, probe).await;
        let entry = &mut report.nodes[idx];
        entry.duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Visit::InSync) => {
                entry.status = NodeStatus::SkippedNoOp;
                obs::emit_node_skipped(&report.run_id, node.name(), "in sync");
                ControlFlow::Continue(())
            }
            Ok(Visit::Converged(Convergence::Unchanged)) => {
                entry.executions += 1;
                entry.status = NodeStatus::SkippedNoOp;
                obs::emit_node_skipped(&report.run_id, node.name(), "unchanged");
                ControlFlow::Continue(())
            }
            Ok(Visit::Converged(Convergence::Changed)) => {
                entry.executions += 1;
                entry.status = NodeStatus::Succeeded;
                obs::emit_node_converged(
                    &report.run_id,
                    node.name(),
                    node.kind(),
                    entry.duration_ms,
                );
                let queued = self.bus.enqueue_from(node.name());
                if queued > 0 {
                    obs::emit_notification_queued(&report.run_id, node.name(), queued);
                }
                ControlFlow::Continue(())
            }
            Err((invoked, cause)) => {
                if invoked {
                    entry.executions += 1;
                }
                entry.status = NodeStatus::Failed;
                obs::emit_node_failed(&report.run_id, node.name(), &cause);
                report.failure = Some(NodeFailure {
                    node: node.name().to_string(),
                    cause,
                });
                ControlFlow::Break(())
            }
        }
    }
}

/// Probe (when asked) and converge one node under its deadline.
///
/// The error carries whether the action itself was invoked.
async fn visit(node: &ActionNode, probe: bool) -> std::result::Result<Visit, (bool, String)> {
    if probe {
        let operation = format!("{} probe", node.name());
        let in_sync = with_deadline(
            &operation,
            node.timeout(),
            node.action().in_sync(node.intended()),
        )
        .await
        .map_err(|e| (false, e.to_string()))?;
        if in_sync {
            return Ok(Visit::InSync);
        }
    }

    with_deadline(
        node.name(),
        node.timeout(),
        node.action().converge(node.intended()),
    )
    .await
    .map(Visit::Converged)
    .map_err(|e| (true, e.to_string()))
}
