//! Binding between the release workflow and the service supervisors.
//!
//! Bindings are stateless and re-resolved from configuration on every run.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::collaborators::{
    Collaborators, CommandRunner, CommandSpec, ExternalResult, ProcessSupervisor,
};
use crate::domain::config::{DeployConfig, RestartCommand, SupervisorProvider, TimeoutConfig};
use crate::runtime::with_deadline;

/// The process a supervisor manages and which supervisor manages it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceBinding {
    pub process_name: String,
    pub provider: SupervisorProvider,
}

/// Reload and restart requests for the application and the reverse proxy.
#[derive(Clone)]
pub struct SupervisorBinding {
    application: ServiceBinding,
    proxy: ServiceBinding,
    restart: RestartCommand,
    owner: String,
    environment: String,
    app_supervisor: Arc<dyn ProcessSupervisor>,
    proxy_supervisor: Arc<dyn ProcessSupervisor>,
    commands: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
}

impl SupervisorBinding {
    pub fn from_config(config: &DeployConfig, collaborators: &Collaborators) -> Self {
        Self {
            application: ServiceBinding {
                process_name: config.service_name(),
                provider: config.supervisor.provider,
            },
            proxy: ServiceBinding {
                process_name: config.nginx.service.clone(),
                provider: config.nginx.provider,
            },
            restart: config.restart_command(),
            owner: config.owner.clone(),
            environment: config.app.environment.clone(),
            app_supervisor: collaborators.app_supervisor.clone(),
            proxy_supervisor: collaborators.proxy_supervisor.clone(),
            commands: collaborators.commands.clone(),
            timeout: TimeoutConfig::deadline(config.timeouts.restart),
        }
    }

    pub fn application(&self) -> &ServiceBinding {
        &self.application
    }

    pub fn proxy(&self) -> &ServiceBinding {
        &self.proxy
    }

    /// Make the application supervisor re-read its service definitions.
    pub async fn reload_configuration(&self) -> ExternalResult<()> {
        info!(
            supervisor = ?self.application.provider,
            "reloading supervisor configuration"
        );
        with_deadline(
            "supervisor reload",
            self.timeout,
            self.app_supervisor.reload_configuration(),
        )
        .await
    }

    /// Restart the application against the code in `release_path`.
    ///
    /// A supervisor-managed restart goes through the application supervisor;
    /// a shell restart runs inside the release as the deploy owner.
    pub async fn restart_application(&self, release_path: &Path) -> ExternalResult<()> {
        match &self.restart {
            RestartCommand::Service { service } => {
                info!(service = %service, "restarting application");
                let operation = format!("restart {}", service);
                with_deadline(&operation, self.timeout, self.app_supervisor.restart(service))
                    .await
            }
            RestartCommand::Shell(line) => {
                info!(command = %line, release = %release_path.display(), "restarting application");
                let spec = CommandSpec::shell("restart", line.as_str())
                    .in_dir(release_path)
                    .with_env("RAILS_ENV", self.environment.as_str())
                    .as_user(self.owner.as_str())
                    .with_timeout(self.timeout);
                with_deadline("restart command", self.timeout, self.commands.run_checked(&spec))
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Restart the reverse proxy.
    pub async fn restart_proxy(&self) -> ExternalResult<()> {
        info!(service = %self.proxy.process_name, "restarting proxy");
        let operation = format!("restart {}", self.proxy.process_name);
        with_deadline(
            &operation,
            self.timeout,
            self.proxy_supervisor.restart(&self.proxy.process_name),
        )
        .await
    }
}

impl std::fmt::Debug for SupervisorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorBinding")
            .field("application", &self.application)
            .field("proxy", &self.proxy)
            .field("restart", &self.restart)
            .finish()
    }
}
