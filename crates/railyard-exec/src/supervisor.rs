//! upstart, runit and sysv init front ends.

use std::sync::Arc;

use async_trait::async_trait;
use railyard_core::collaborators::{
    CommandRunner, CommandSpec, ExternalResult, ProcessSupervisor,
};
use railyard_core::SupervisorProvider;
use tracing::debug;

pub struct SystemSupervisor {
    provider: SupervisorProvider,
    runner: Arc<dyn CommandRunner>,
}

impl SystemSupervisor {
    pub fn new(provider: SupervisorProvider, runner: Arc<dyn CommandRunner>) -> Self {
        Self { provider, runner }
    }

    pub fn provider(&self) -> SupervisorProvider {
        self.provider
    }
}

/// Commands used to restart `service`, tried in order until one succeeds.
pub fn restart_commands(provider: SupervisorProvider, service: &str) -> Vec<CommandSpec> {
    match provider {
        SupervisorProvider::Upstart => vec![
            CommandSpec::new("initctl restart", ["initctl", "restart", service]),
            // A stopped job cannot be restarted.
            CommandSpec::new("initctl start", ["initctl", "start", service]),
        ],
        SupervisorProvider::Runit => vec![CommandSpec::new("sv restart", ["sv", "restart", service])],
        SupervisorProvider::Sysv => vec![CommandSpec::new(
            "service restart",
            ["service", service, "restart"],
        )],
    }
}

#[async_trait]
impl ProcessSupervisor for SystemSupervisor {
    async fn reload_configuration(&self) -> ExternalResult<()> {
        match self.provider {
            SupervisorProvider::Upstart => {
                self.runner
                    .run_checked(&CommandSpec::new(
                        "initctl reload-configuration",
                        ["initctl", "reload-configuration"],
                    ))
                    .await?;
            }
            SupervisorProvider::Runit | SupervisorProvider::Sysv => {
                debug!(provider = ?self.provider, "supervisor reads definitions on start");
            }
        }
        Ok(())
    }

    async fn restart(&self, service: &str) -> ExternalResult<()> {
        let mut attempts = restart_commands(self.provider, service).into_iter().peekable();
        while let Some(spec) = attempts.next() {
            match self.runner.run_checked(&spec).await {
                Ok(_) => return Ok(()),
                Err(e) if attempts.peek().is_some() => {
                    debug!(command = %spec.label, error = %e, "restart attempt failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
