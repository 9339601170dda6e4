//! Execution-order, notification and failure behaviour of `ConvergenceGraph`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use railyard_core::collaborators::{ExternalError, ExternalResult};
use railyard_core::graph::{
    ActionNode, Convergence, ConvergenceGraph, IntendedState, NodeAction, NodeStatus, Timing,
};
use railyard_core::CancelSignal;

type Log = Arc<Mutex<Vec<String>>>;

/// A node whose actual state is a shared flag. Converging sets the flag.
struct Flag {
    name: String,
    log: Log,
    converged: Arc<AtomicBool>,
    fail: bool,
}

impl Flag {
    fn new(name: &str, log: &Log) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            converged: Arc::new(AtomicBool::new(false)),
            fail: false,
        })
    }

    fn in_sync(name: &str, log: &Log) -> Arc<Self> {
        let flag = Self::new(name, log);
        flag.converged.store(true, Ordering::SeqCst);
        flag
    }

    fn failing(name: &str, log: &Log) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            converged: Arc::new(AtomicBool::new(false)),
            fail: true,
        })
    }
}

#[async_trait]
impl NodeAction for Flag {
    async fn in_sync(&self, _intended: &IntendedState) -> ExternalResult<bool> {
        Ok(self.converged.load(Ordering::SeqCst))
    }

    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        self.log.lock().unwrap().push(self.name.clone());
        if self.fail {
            return Err(ExternalError::Other(format!("{} broke", self.name)));
        }
        self.converged.store(true, Ordering::SeqCst);
        Ok(Convergence::Changed)
    }
}

/// Reactive action that just logs.
struct Reaction {
    name: String,
    log: Log,
}

impl Reaction {
    fn new(name: &str, log: &Log) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
        })
    }
}

#[async_trait]
impl NodeAction for Reaction {
    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        self.log.lock().unwrap().push(self.name.clone());
        Ok(Convergence::Changed)
    }
}

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn in_sync_node_never_runs_and_never_notifies() {
    let log = log();
    let mut g = ConvergenceGraph::new("g");
    g.add_node(ActionNode::run_if_divergent("tpl", Flag::in_sync("tpl", &log)))
        .unwrap();
    g.add_node(ActionNode::reactive("reload", Reaction::new("reload", &log)))
        .unwrap();
    g.add_edge("tpl", "reload", Timing::Immediate).unwrap();

    let report = g.run(&CancelSignal::new()).await;

    assert!(report.succeeded());
    assert!(entries(&log).is_empty());
    assert_eq!(report.status_of("tpl"), Some(NodeStatus::SkippedNoOp));
    assert_eq!(report.executions_of("tpl"), 0);
    assert_eq!(report.executions_of("reload"), 0);
}

#[tokio::test]
async fn deferred_target_runs_once_after_whole_sequence() {
    let log = log();
    let mut g = ConvergenceGraph::new("g");
    for name in ["a", "b", "c"] {
        g.add_node(ActionNode::run_if_divergent(name, Flag::new(name, &log)))
            .unwrap();
    }
    g.add_node(ActionNode::reactive("reload", Reaction::new("reload", &log)))
        .unwrap();
    for name in ["a", "b", "c"] {
        g.add_edge(name, "reload", Timing::Deferred).unwrap();
    }

    let report = g.run(&CancelSignal::new()).await;

    assert!(report.succeeded());
    assert_eq!(entries(&log), vec!["a", "b", "c", "reload"]);
    assert_eq!(report.executions_of("reload"), 1);
    assert_eq!(report.deliveries.len(), 1);
    assert_eq!(report.deliveries[0].timing, Timing::Deferred);
}

#[tokio::test]
async fn reactive_node_with_no_fired_source_stays_idle() {
    let log = log();
    let mut g = ConvergenceGraph::new("g");
    g.add_node(ActionNode::run_if_divergent("a", Flag::in_sync("a", &log)))
        .unwrap();
    g.add_node(ActionNode::run_if_divergent("b", Flag::in_sync("b", &log)))
        .unwrap();
    g.add_node(ActionNode::reactive("reload", Reaction::new("reload", &log)))
        .unwrap();
    g.add_edge("a", "reload", Timing::Deferred).unwrap();
    g.add_edge("b", "reload", Timing::Immediate).unwrap();

    let report = g.run(&CancelSignal::new()).await;

    assert_eq!(report.status_of("reload"), Some(NodeStatus::NotRun));
    assert!(entries(&log).is_empty());
}

#[tokio::test]
async fn immediate_target_runs_before_next_declared_node() {
    let log = log();
    let mut g = ConvergenceGraph::new("g");
    g.add_node(ActionNode::run_if_divergent("service", Flag::new("service", &log)))
        .unwrap();
    g.add_node(ActionNode::run_if_divergent("config", Flag::new("config", &log)))
        .unwrap();
    g.add_node(ActionNode::reactive("reload", Reaction::new("reload", &log)))
        .unwrap();
    g.add_edge("service", "reload", Timing::Immediate).unwrap();

    let report = g.run(&CancelSignal::new()).await;

    assert_eq!(entries(&log), vec!["service", "reload", "config"]);
    assert_eq!(report.deliveries[0].timing, Timing::Immediate);
}

#[tokio::test]
async fn immediate_delivery_claims_target_for_the_run() {
    let log = log();
    let mut g = ConvergenceGraph::new("g");
    g.add_node(ActionNode::run_if_divergent("a", Flag::new("a", &log)))
        .unwrap();
    g.add_node(ActionNode::run_if_divergent("b", Flag::new("b", &log)))
        .unwrap();
    g.add_node(ActionNode::reactive("reload", Reaction::new("reload", &log)))
        .unwrap();
    g.add_edge("a", "reload", Timing::Immediate).unwrap();
    g.add_edge("b", "reload", Timing::Deferred).unwrap();

    let report = g.run(&CancelSignal::new()).await;

    assert_eq!(entries(&log), vec!["a", "reload", "b"]);
    assert_eq!(report.executions_of("reload"), 1);
}

#[tokio::test]
async fn deferred_chain_cascades_through_reactive_nodes() {
    let log = log();
    let mut g = ConvergenceGraph::new("g");
    g.add_node(ActionNode::run_if_divergent("account", Flag::new("account", &log)))
        .unwrap();
    g.add_node(ActionNode::reactive("keygen", Reaction::new("keygen", &log)))
        .unwrap();
    g.add_node(ActionNode::reactive("known-hosts", Reaction::new("known-hosts", &log)))
        .unwrap();
    g.add_node(ActionNode::reactive("publish", Reaction::new("publish", &log)))
        .unwrap();
    g.add_edge("account", "keygen", Timing::Deferred).unwrap();
    g.add_edge("keygen", "known-hosts", Timing::Deferred).unwrap();
    g.add_edge("keygen", "publish", Timing::Deferred).unwrap();

    let report = g.run(&CancelSignal::new()).await;

    assert!(report.succeeded());
    assert_eq!(
        entries(&log),
        vec!["account", "keygen", "known-hosts", "publish"]
    );
}

#[tokio::test]
async fn failure_is_fail_fast_and_suppresses_pending_notifications() {
    let log = log();
    let mut g = ConvergenceGraph::new("g");
    g.add_node(ActionNode::run_if_divergent("a", Flag::new("a", &log)))
        .unwrap();
    g.add_node(ActionNode::run_if_divergent("broken", Flag::failing("broken", &log)))
        .unwrap();
    g.add_node(ActionNode::run_if_divergent("c", Flag::new("c", &log)))
        .unwrap();
    g.add_node(ActionNode::reactive("from-a", Reaction::new("from-a", &log)))
        .unwrap();
    g.add_node(ActionNode::reactive("from-broken", Reaction::new("from-broken", &log)))
        .unwrap();
    g.add_edge("a", "from-a", Timing::Deferred).unwrap();
    g.add_edge("broken", "from-broken", Timing::Immediate).unwrap();

    let report = g.run(&CancelSignal::new()).await;

    assert_eq!(entries(&log), vec!["a", "broken"]);
    let failure = report.failure.clone().expect("failure");
    assert_eq!(failure.node, "broken");
    assert!(failure.cause.contains("broken broke"));
    assert_eq!(report.status_of("a"), Some(NodeStatus::Succeeded));
    assert_eq!(report.status_of("c"), Some(NodeStatus::NotRun));
    assert_eq!(report.status_of("from-a"), Some(NodeStatus::NotRun));
    assert_eq!(report.status_of("from-broken"), Some(NodeStatus::NotRun));
    assert!(report.into_result().is_err());
}

#[tokio::test]
async fn second_run_over_same_state_is_all_no_op() {
    let log = log();
    let a = Flag::new("a", &log);
    let b = Flag::new("b", &log);
    let build = || {
        let mut g = ConvergenceGraph::new("g");
        g.add_node(ActionNode::run_if_divergent("a", a.clone()))
            .unwrap();
        g.add_node(ActionNode::run_if_divergent("b", b.clone()))
            .unwrap();
        g.add_node(ActionNode::reactive("r", Reaction::new("r", &log)))
            .unwrap();
        g.add_edge("a", "r", Timing::Deferred).unwrap();
        g
    };

    let first = build().run(&CancelSignal::new()).await;
    assert_eq!(first.divergent_executions(), 2);

    let second = build().run(&CancelSignal::new()).await;
    assert_eq!(second.divergent_executions(), 0);
    assert!(second.changed().is_empty());
    assert_eq!(second.executions_of("r"), 0);
}

struct Slow;

#[async_trait]
impl NodeAction for Slow {
    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Convergence::Changed)
    }
}

#[tokio::test(start_paused = true)]
async fn timeout_counts_as_node_failure() {
    let mut g = ConvergenceGraph::new("g");
    g.add_node(
        ActionNode::run_if_divergent("fetch", Arc::new(Slow))
            .with_timeout(Some(Duration::from_secs(5))),
    )
    .unwrap();

    let report = g.run(&CancelSignal::new()).await;

    let failure = report.failure.expect("timeout failure");
    assert_eq!(failure.node, "fetch");
    assert!(failure.cause.contains("timed out"));
}

/// Cancels the shared signal while it runs.
struct CancelsRun(CancelSignal);

#[async_trait]
impl NodeAction for CancelsRun {
    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        self.0.cancel();
        Ok(Convergence::Changed)
    }
}

#[tokio::test]
async fn cancellation_stops_at_next_boundary() {
    let log = log();
    let cancel = CancelSignal::new();
    let mut g = ConvergenceGraph::new("g");
    g.add_node(ActionNode::run_if_divergent(
        "first",
        Arc::new(CancelsRun(cancel.clone())),
    ))
    .unwrap();
    g.add_node(ActionNode::run_if_divergent("second", Flag::new("second", &log)))
        .unwrap();
    g.add_node(ActionNode::reactive("r", Reaction::new("r", &log)))
        .unwrap();
    g.add_edge("first", "r", Timing::Deferred).unwrap();

    let report = g.run(&cancel).await;

    assert_eq!(report.status_of("first"), Some(NodeStatus::Succeeded));
    assert_eq!(report.cancelled_at.as_deref(), Some("second"));
    assert!(entries(&log).is_empty());
    assert!(!report.succeeded());
}
