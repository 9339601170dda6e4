//! Notification-propagating action graph.

pub mod bus;
pub mod engine;
pub mod node;
pub mod report;

pub use bus::{NotificationBus, NotificationEdge, Timing};
pub use engine::ConvergenceGraph;
pub use node::{ActionNode, Convergence, IntendedState, NodeAction, NodeKind, NodeStatus};
pub use report::{Delivery, NodeFailure, NodeReport, RunReport};
