//! Railyard Core Library
//!
//! Convergent deployment of a web application: a notification-propagating
//! action graph for host provisioning and a release state machine for
//! fetch, stage, cutover and rollback. Host access goes through the traits
//! in [`collaborators`].

pub mod bootstrap;
pub mod collaborators;
pub mod deploy;
pub mod domain;
pub mod fakes;
pub mod graph;
pub mod obs;
pub mod prepare;
pub mod runtime;
pub mod supervisor;
pub mod telemetry;
pub mod workflow;

pub use bootstrap::{build_bootstrap_graph, host_identifier, repository_host};
pub use collaborators::{
    AccountManager, BundlerOptions, Collaborators, CommandOutput, CommandRunner, CommandSpec,
    DependencyInstaller, DeployKey, ExternalError, ExternalResult, FetchRequest, InstallRequest,
    KeyRegistry, KeyStore, ProcessSupervisor, ReleaseFilesystem, RepositoryFetcher,
    TemplateRenderer, TemplateRequest,
};
pub use deploy::{release_result, DeployReport, Deployer};
pub use domain::{
    DeployAction, DeployConfig, RailyardError, Release, ReleaseOutcome, ReleaseState,
    RestartCommand, Result, StageOutcome, StageRecord, SupervisorProvider,
};
pub use graph::{
    ActionNode, Convergence, ConvergenceGraph, IntendedState, NodeAction, NodeKind, NodeStatus,
    NotificationBus, RunReport, Timing,
};
pub use prepare::{build_prepare_graph, RestartLatch};
pub use runtime::{with_deadline, CancelSignal};
pub use supervisor::{ServiceBinding, SupervisorBinding};
pub use workflow::{ReleaseEntry, ReleaseWorkflow};

pub use obs::{emit_graph_finished, emit_graph_started, DeploySpan};
pub use telemetry::init_tracing;

/// Railyard version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
