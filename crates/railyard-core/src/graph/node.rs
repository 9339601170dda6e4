//! Action nodes: idempotent units of work with a declared intended state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::collaborators::ExternalResult;

/// How a node is scheduled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// Runs in declaration order, only when the probe reports divergence.
    RunIfDivergent,
    /// Never runs on its own; runs once when a notification targets it.
    ReactiveOnly,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::RunIfDivergent => f.write_str("run-if-divergent"),
            NodeKind::ReactiveOnly => f.write_str("reactive-only"),
        }
    }
}

/// Result of a node within one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not reached, not triggered, or cut off by a failure or cancellation.
    #[default]
    NotRun,
    /// The action ran and changed the system.
    Succeeded,
    /// Actual state already matched intended state.
    SkippedNoOp,
    Failed,
}

/// What a converge call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    Changed,
    Unchanged,
}

/// Opaque key→value description of the state a node converges to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntendedState(BTreeMap<String, String>);

impl IntendedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// The work behind a node.
#[async_trait]
pub trait NodeAction: Send + Sync {
    /// Whether actual state already equals `intended`. Reactive-only nodes
    /// are never probed.
    async fn in_sync(&self, intended: &IntendedState) -> ExternalResult<bool> {
        let _ = intended;
        Ok(false)
    }

    /// Move actual state to `intended`.
    async fn converge(&self, intended: &IntendedState) -> ExternalResult<Convergence>;
}

/// A named node in a [`super::ConvergenceGraph`].
#[derive(Clone)]
pub struct ActionNode {
    name: String,
    kind: NodeKind,
    intended: IntendedState,
    action: Arc<dyn NodeAction>,
    timeout: Option<Duration>,
}

impl ActionNode {
    pub fn run_if_divergent(name: impl Into<String>, action: Arc<dyn NodeAction>) -> Self {
        Self::new(name, NodeKind::RunIfDivergent, action)
    }

    pub fn reactive(name: impl Into<String>, action: Arc<dyn NodeAction>) -> Self {
        Self::new(name, NodeKind::ReactiveOnly, action)
    }

    fn new(name: impl Into<String>, kind: NodeKind, action: Arc<dyn NodeAction>) -> Self {
        Self {
            name: name.into(),
            kind,
            intended: IntendedState::new(),
            action,
            timeout: None,
        }
    }

    pub fn with_intended(mut self, intended: IntendedState) -> Self {
        self.intended = intended;
        self
    }

    /// Deadline applied to each probe and converge call.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn intended(&self) -> &IntendedState {
        &self.intended
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn action(&self) -> &Arc<dyn NodeAction> {
        &self.action
    }
}

impl fmt::Debug for ActionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionNode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("intended", &self.intended)
            .field("timeout", &self.timeout)
            .finish()
    }
}
