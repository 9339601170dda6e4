//! One-shot notifications between nodes.
//!
//! An edge `source → target` is queued when `source` converges with a
//! change. Immediate edges are delivered before the next declared node
//! runs; deferred edges accumulate and are delivered once, in edge
//! declaration order, after the declared sequence completes. Each target
//! is triggered at most once per run no matter how many edges reach it.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// When a queued notification is delivered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Timing {
    Immediate,
    Deferred,
}

/// A declared notification edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationEdge {
    /// Declaration order within the graph.
    pub seq: usize,
    pub source: String,
    pub target: String,
    pub timing: Timing,
}

/// Queues and de-duplicates notifications for one run.
#[derive(Debug, Default)]
pub struct NotificationBus {
    edges: Vec<NotificationEdge>,
    immediate: VecDeque<NotificationEdge>,
    deferred: Vec<NotificationEdge>,
    triggered: HashSet<String>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an edge; returns its sequence number.
    pub fn declare(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        timing: Timing,
    ) -> usize {
        let seq = self.edges.len();
        self.edges.push(NotificationEdge {
            seq,
            source: source.into(),
            target: target.into(),
            timing,
        });
        seq
    }

    pub fn edges(&self) -> &[NotificationEdge] {
        &self.edges
    }

    /// Declared edges leaving `source`, in declaration order.
    pub fn edges_from(&self, source: &str) -> Vec<NotificationEdge> {
        self.edges
            .iter()
            .filter(|e| e.source == source)
            .cloned()
            .collect()
    }

    /// Queue a single edge for delivery.
    pub fn enqueue(&mut self, edge: NotificationEdge) {
        match edge.timing {
            Timing::Immediate => self.immediate.push_back(edge),
            Timing::Deferred => self.deferred.push(edge),
        }
    }

    /// Queue every edge leaving `source`; returns how many were queued.
    pub fn enqueue_from(&mut self, source: &str) -> usize {
        let edges = self.edges_from(source);
        let count = edges.len();
        for edge in edges {
            self.enqueue(edge);
        }
        count
    }

    /// Drain queued edges of `timing` and return the targets to run now.
    ///
    /// Targets that were already triggered this run are dropped, and a
    /// target reached by several queued edges appears once. Deferred
    /// targets come back in edge declaration order.
    pub fn flush(&mut self, timing: Timing) -> Vec<String> {
        let drained: Vec<NotificationEdge> = match timing {
            Timing::Immediate => self.immediate.drain(..).collect(),
            Timing::Deferred => {
                let mut pending = std::mem::take(&mut self.deferred);
                pending.sort_by_key(|e| e.seq);
                pending
            }
        };

        let mut targets = Vec::new();
        for edge in drained {
            if self.triggered.insert(edge.target.clone()) {
                targets.push(edge.target);
            }
        }
        targets
    }

    /// Number of queued, undelivered edges of `timing`.
    pub fn pending(&self, timing: Timing) -> usize {
        match timing {
            Timing::Immediate => self.immediate.len(),
            Timing::Deferred => self.deferred.len(),
        }
    }

    pub fn was_triggered(&self, target: &str) -> bool {
        self.triggered.contains(target)
    }
}
