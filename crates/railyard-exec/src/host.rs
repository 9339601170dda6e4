//! Wiring of the host-backed collaborators for one configuration.

use std::sync::Arc;

use railyard_core::collaborators::{CommandRunner, Collaborators, DeployKey};
use railyard_core::DeployConfig;

use crate::account::SystemAccounts;
use crate::command::ShellRunner;
use crate::fs::LocalReleaseFs;
use crate::git::GitFetcher;
use crate::installer::BundlerInstaller;
use crate::keys::{RemoteKeyRegistry, SshKeyStore};
use crate::supervisor::SystemSupervisor;
use crate::template::FileTemplateRenderer;

/// Collaborators acting on the local host for `config`.
pub fn host_collaborators(config: &DeployConfig) -> Collaborators {
    collaborators_with(config, Arc::new(ShellRunner::new()))
}

/// Same as [`host_collaborators`] with every process going through `runner`.
pub fn collaborators_with(config: &DeployConfig, runner: Arc<dyn CommandRunner>) -> Collaborators {
    let fetcher = GitFetcher::new(runner.clone())
        .with_deploy_key(config.deploy.deploy_key.as_deref().map(DeployKey::new))
        .as_user(Some(config.owner.clone()));
    Collaborators {
        commands: runner.clone(),
        fetcher: Arc::new(fetcher),
        installer: Arc::new(BundlerInstaller::new(runner.clone())),
        templates: Arc::new(FileTemplateRenderer::new(
            config.templates.directory.clone(),
            runner.clone(),
        )),
        filesystem: Arc::new(LocalReleaseFs::new(config.app.path.clone())),
        app_supervisor: Arc::new(SystemSupervisor::new(
            config.supervisor.provider,
            runner.clone(),
        )),
        proxy_supervisor: Arc::new(SystemSupervisor::new(config.nginx.provider, runner.clone())),
        accounts: Arc::new(SystemAccounts::new(runner.clone())),
        keys: Arc::new(SshKeyStore::new(runner.clone())),
        key_registry: Arc::new(RemoteKeyRegistry::new(
            runner,
            config.owner.clone(),
            config.key_registry.clone(),
        )),
    }
}
