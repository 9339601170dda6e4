//! End-to-end deployment of one application: bootstrap, prepare, release.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bootstrap::build_bootstrap_graph;
use crate::collaborators::Collaborators;
use crate::domain::config::{DeployAction, DeployConfig};
use crate::domain::error::{RailyardError, Result};
use crate::domain::release::Release;
use crate::graph::RunReport;
use crate::prepare::{build_prepare_graph, RestartLatch};
use crate::runtime::CancelSignal;
use crate::supervisor::SupervisorBinding;
use crate::workflow::ReleaseWorkflow;

/// Everything one deployment did.
///
/// A configuration error leaves every section empty; a failing phase leaves
/// the later ones empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployReport {
    pub bootstrap: RunReport,
    pub prepare: RunReport,
    pub release: Option<Release>,
    /// The application was restarted after the release because a
    /// configuration file changed.
    pub deferred_restart: bool,
    pub error: Option<String>,
}

impl DeployReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs the bootstrap graph, the prepare graph and the release workflow in
/// that order.
pub struct Deployer {
    config: DeployConfig,
    collaborators: Collaborators,
}

impl Deployer {
    pub fn new(config: DeployConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Override the configured `deploy.action`.
    pub fn with_action(mut self, action: DeployAction) -> Self {
        self.config.deploy.action = action;
        self
    }

    /// Override the configured revision.
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.config.deploy.revision = revision.into();
        self
    }

    pub fn workflow(&self) -> ReleaseWorkflow {
        ReleaseWorkflow::new(self.config.clone(), self.collaborators.clone())
    }

    /// Provision the deploy account only.
    pub async fn bootstrap(&self, cancel: &CancelSignal) -> Result<RunReport> {
        self.config.validate()?;
        let graph = build_bootstrap_graph(&self.config, &self.collaborators)?;
        graph.run(cancel).await.into_result()
    }

    /// Run a full deployment.
    pub async fn run(&self, cancel: &CancelSignal) -> DeployReport {
        let mut report = DeployReport::default();
        if let Err(e) = self.drive(&mut report, cancel).await {
            warn!(error = %e, "deploy failed");
            report.error = Some(e.to_string());
        }
        report
    }

    async fn drive(&self, report: &mut DeployReport, cancel: &CancelSignal) -> Result<()> {
        self.config.validate()?;
        info!(
            app = %self.config.app.name,
            action = ?self.config.deploy.action,
            revision = %self.config.deploy.revision,
            "starting deploy"
        );

        let bootstrap = build_bootstrap_graph(&self.config, &self.collaborators)?;
        report.bootstrap = bootstrap.run(cancel).await;
        report.bootstrap.clone().into_result()?;

        let supervisor = SupervisorBinding::from_config(&self.config, &self.collaborators);
        let latch = RestartLatch::new();
        let prepare = build_prepare_graph(
            &self.config,
            self.collaborators.templates.clone(),
            &supervisor,
            &latch,
        )?;
        report.prepare = prepare.run(cancel).await;
        report.prepare.clone().into_result()?;

        let release = self.workflow().run(cancel).await;
        let restarted = release.restarted();
        let outcome = release_result(&release);
        report.release = Some(release);
        outcome?;

        if latch.is_requested() && !restarted {
            info!("configuration changed; restarting application");
            supervisor
                .restart_application(&self.config.current_link())
                .await
                .map_err(|e| RailyardError::ExternalService {
                    service: supervisor.application().process_name.clone(),
                    cause: e.to_string(),
                })?;
            report.deferred_restart = true;
        }
        Ok(())
    }
}

/// Turn a finished release record into the error it represents, if any.
pub fn release_result(release: &Release) -> Result<()> {
    let Some(cause) = &release.error else {
        return Ok(());
    };
    if let Some(boundary) = release.cancelled_at {
        return Err(RailyardError::Cancelled {
            boundary: boundary.to_string(),
        });
    }
    Err(RailyardError::Release {
        stage: release.failed_stage.unwrap_or(release.state),
        cause: cause.clone(),
    })
}
