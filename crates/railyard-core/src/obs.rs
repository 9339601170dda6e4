//! Structured observability hooks for graph runs and releases.
//!
//! This module provides:
//! - Run-scoped tracing spans via the `DeploySpan` RAII guard
//! - Emission functions for graph, notification and release lifecycle events
//!
//! Every event carries a stable `event` field so log pipelines can filter on
//! it. Verbosity follows `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

use crate::domain::release::{ReleaseOutcome, ReleaseState};
use crate::graph::{NodeKind, Timing};

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// # Example
///
/// ```ignore
/// let _span = DeploySpan::enter("3f2c...", "bootstrap");
/// // every event emitted below carries run_id and scope
/// ```
pub struct DeploySpan {
    _span: tracing::span::EnteredSpan,
}

impl DeploySpan {
    /// Create and enter a span tagged with the run id and the graph or
    /// workflow it belongs to.
    pub fn enter(run_id: &str, scope: &str) -> Self {
        Self {
            _span: run_span(run_id, scope).entered(),
        }
    }
}

/// The span behind [`DeploySpan`], for instrumenting futures that cross
/// await points.
pub fn run_span(run_id: &str, scope: &str) -> tracing::Span {
    tracing::info_span!("railyard.run", run_id = %run_id, scope = %scope)
}

// ---------------------------------------------------------------------------
// Graph events
// ---------------------------------------------------------------------------

/// Emit event: a convergence graph run started.
pub fn emit_graph_started(run_id: &str, graph: &str, nodes: usize) {
    info!(event = "graph.started", run_id = %run_id, graph = %graph, nodes = nodes);
}

/// Emit event: a node's action ran and changed the system.
pub fn emit_node_converged(run_id: &str, node: &str, kind: NodeKind, duration_ms: u64) {
    info!(
        event = "node.converged",
        run_id = %run_id,
        node = %node,
        kind = %kind,
        duration_ms = duration_ms,
    );
}

/// Emit event: a node was already in its intended state.
pub fn emit_node_skipped(run_id: &str, node: &str, reason: &str) {
    info!(event = "node.skipped", run_id = %run_id, node = %node, reason = %reason);
}

/// Emit event: a node failed (warning level).
pub fn emit_node_failed(run_id: &str, node: &str, cause: &str) {
    warn!(event = "node.failed", run_id = %run_id, node = %node, cause = %cause);
}

/// Emit event: notifications queued by a converged node.
pub fn emit_notification_queued(run_id: &str, source: &str, edges: usize) {
    info!(
        event = "notification.queued",
        run_id = %run_id,
        source = %source,
        edges = edges,
    );
}

/// Emit event: a reactive node is about to run because it was notified.
pub fn emit_notification_delivered(run_id: &str, target: &str, timing: Timing) {
    info!(
        event = "notification.delivered",
        run_id = %run_id,
        target = %target,
        timing = ?timing,
    );
}

/// Emit event: the cancellation signal stopped a run at a node boundary.
pub fn emit_run_cancelled(run_id: &str, boundary: &str) {
    warn!(event = "run.cancelled", run_id = %run_id, boundary = %boundary);
}

/// Emit event: a convergence graph run finished.
pub fn emit_graph_finished(run_id: &str, graph: &str, duration_ms: u64, success: bool) {
    info!(
        event = "graph.finished",
        run_id = %run_id,
        graph = %graph,
        duration_ms = duration_ms,
        success = success,
    );
}

// ---------------------------------------------------------------------------
// Release events
// ---------------------------------------------------------------------------

/// Emit event: the release state machine moved between states.
pub fn emit_release_transition(release_id: &str, from: ReleaseState, to: ReleaseState) {
    info!(
        event = "release.transition",
        release_id = %release_id,
        from = %from,
        to = %to,
    );
}

/// Emit event: a release stage failed (warning level).
pub fn emit_release_failed(release_id: &str, stage: ReleaseState, cause: &str) {
    warn!(
        event = "release.failed",
        release_id = %release_id,
        stage = %stage,
        cause = %cause,
    );
}

/// Emit event: `current` was restored to a known-good release.
pub fn emit_release_rolled_back(release_id: &str, target: &str) {
    info!(event = "release.rolled_back", release_id = %release_id, target = %target);
}

/// Emit event: a release attempt finished.
pub fn emit_release_completed(release_id: &str, outcome: ReleaseOutcome, duration_ms: u64) {
    info!(
        event = "release.completed",
        release_id = %release_id,
        outcome = ?outcome,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_span_create() {
        let _span = DeploySpan::enter("test-run-id", "bootstrap");
    }
}
