//! OS packages, gems and the bundle step.

use std::sync::Arc;

use async_trait::async_trait;
use railyard_core::collaborators::{
    CommandRunner, CommandSpec, DependencyInstaller, ExternalResult, InstallRequest,
};
use tracing::info;

pub struct BundlerInstaller {
    runner: Arc<dyn CommandRunner>,
}

impl BundlerInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

/// The commands `request` needs, in the order they run.
pub fn install_commands(request: &InstallRequest) -> Vec<CommandSpec> {
    let mut commands = Vec::new();
    if !request.packages.is_empty() {
        let mut argv = vec![
            "apt-get".to_string(),
            "install".to_string(),
            "-y".to_string(),
            "-q".to_string(),
        ];
        argv.extend(request.packages.iter().cloned());
        commands.push(
            CommandSpec::new("apt-get install", argv)
                .with_env("DEBIAN_FRONTEND", "noninteractive"),
        );
    }
    for gem in &request.gems {
        commands.push(CommandSpec::new(
            format!("gem install {}", gem),
            [
                "gem".to_string(),
                "install".to_string(),
                gem.clone(),
                "--conservative".to_string(),
                "--no-document".to_string(),
            ],
        ));
    }
    if let Some(bundler) = &request.bundler {
        let mut argv = vec![bundler.command.clone(), "install".to_string()];
        if bundler.deployment {
            argv.push("--deployment".to_string());
        }
        if !bundler.without_groups.is_empty() {
            argv.push("--without".to_string());
            argv.extend(bundler.without_groups.iter().cloned());
        }
        let mut bundle = CommandSpec::new("bundle install", argv)
            .in_dir(&request.release_path)
            .with_env("RAILS_ENV", request.environment.as_str());
        if let Some(user) = &request.run_as {
            bundle = bundle.as_user(user.as_str());
        }
        commands.push(bundle);
    }
    commands
}

#[async_trait]
impl DependencyInstaller for BundlerInstaller {
    async fn install(&self, request: &InstallRequest) -> ExternalResult<()> {
        for command in install_commands(request) {
            info!(step = %command.label, release = %request.release_path.display(), "installing");
            self.runner.run_checked(&command).await?;
        }
        Ok(())
    }
}
