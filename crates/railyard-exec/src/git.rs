//! Repository checkout with the `git` command line.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use railyard_core::collaborators::{
    CommandRunner, CommandSpec, DeployKey, ExternalError, ExternalResult, FetchRequest,
    RepositoryFetcher,
};
use tempfile::NamedTempFile;
use tracing::info;

/// Fetches releases by shelling out to `git`.
///
/// Private key material is written to a 0600 temporary file that lives only
/// for the duration of one call and is handed to ssh through
/// `GIT_SSH_COMMAND`.
pub struct GitFetcher {
    runner: Arc<dyn CommandRunner>,
    /// Key used for `resolve`, which carries no request of its own.
    deploy_key: Option<DeployKey>,
    run_as: Option<String>,
}

impl GitFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            deploy_key: None,
            run_as: None,
        }
    }

    pub fn with_deploy_key(mut self, key: Option<DeployKey>) -> Self {
        self.deploy_key = key;
        self
    }

    pub fn as_user(mut self, user: Option<String>) -> Self {
        self.run_as = user;
        self
    }

    /// Write key material where ssh (running as `owner`) can read it.
    async fn key_file(
        &self,
        key: &DeployKey,
        owner: Option<&str>,
    ) -> ExternalResult<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("railyard-deploy-key-")
            .tempfile()?;
        file.write_all(key.material().as_bytes())?;
        if !key.material().ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()?;
        if let Some(owner) = owner {
            let chown = CommandSpec::new(
                "chown deploy key",
                ["chown".to_string(), owner.to_string(), path_arg(file.path())],
            );
            self.runner.run_checked(&chown).await?;
        }
        Ok(file)
    }

    async fn git(
        &self,
        label: &str,
        args: Vec<String>,
        key: Option<&Path>,
        run_as: Option<&str>,
    ) -> ExternalResult<String> {
        let mut argv = vec!["git".to_string()];
        argv.extend(args);
        let mut spec = CommandSpec::new(label, argv);
        if let Some(key) = key {
            spec = spec.with_env("GIT_SSH_COMMAND", ssh_command(key));
        }
        if let Some(user) = run_as {
            spec = spec.as_user(user);
        }
        Ok(self.runner.run_checked(&spec).await?.stdout)
    }
}

#[async_trait]
impl RepositoryFetcher for GitFetcher {
    async fn resolve(&self, repository: &str, revision: &str) -> ExternalResult<String> {
        if is_commit_id(revision) {
            return Ok(revision.to_string());
        }
        let run_as = self.run_as.as_deref();
        let key = match &self.deploy_key {
            Some(key) => Some(self.key_file(key, run_as).await?),
            None => None,
        };
        let listing = self
            .git(
                "git ls-remote",
                vec![
                    "ls-remote".to_string(),
                    repository.to_string(),
                    revision.to_string(),
                    format!("{}^{{}}", revision),
                ],
                key.as_ref().map(|k| k.path()),
                run_as,
            )
            .await?;
        pick_ref(&listing, revision).ok_or_else(|| {
            ExternalError::Other(format!(
                "revision '{}' not found in {}",
                revision, repository
            ))
        })
    }

    async fn fetch(&self, request: &FetchRequest) -> ExternalResult<()> {
        let run_as = request.run_as.as_deref();
        let key_material = request.deploy_key.as_ref().or(self.deploy_key.as_ref());
        let key = match key_material {
            Some(key) => Some(self.key_file(key, run_as).await?),
            None => None,
        };
        let key_path = key.as_ref().map(|k| k.path());
        let dest = path_arg(&request.destination);

        info!(
            repository = %request.repository,
            revision = %request.revision,
            destination = %dest,
            "checking out release"
        );

        let mut clone = vec!["clone".to_string(), "--quiet".to_string()];
        if request.shallow {
            clone.extend(["--depth".to_string(), "1".to_string(), "--no-checkout".to_string()]);
        }
        clone.extend([request.repository.clone(), dest.clone()]);
        self.git("git clone", clone, key_path, run_as).await?;

        if request.shallow {
            self.git(
                "git fetch",
                vec![
                    "-C".to_string(),
                    dest.clone(),
                    "fetch".to_string(),
                    "--quiet".to_string(),
                    "--depth".to_string(),
                    "1".to_string(),
                    "origin".to_string(),
                    request.revision.clone(),
                ],
                key_path,
                run_as,
            )
            .await?;
        }

        self.git(
            "git checkout",
            vec![
                "-C".to_string(),
                dest.clone(),
                "checkout".to_string(),
                "--quiet".to_string(),
                "--detach".to_string(),
                request.revision.clone(),
            ],
            key_path,
            run_as,
        )
        .await?;

        if request.submodules {
            self.git(
                "git submodule update",
                vec![
                    "-C".to_string(),
                    dest,
                    "submodule".to_string(),
                    "update".to_string(),
                    "--init".to_string(),
                    "--recursive".to_string(),
                ],
                key_path,
                run_as,
            )
            .await?;
        }
        Ok(())
    }
}

fn ssh_command(key: &Path) -> String {
    format!(
        "ssh -i {} -o IdentitiesOnly=yes -o BatchMode=yes",
        crate::command::shell_quote(&path_arg(key))
    )
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn is_commit_id(revision: &str) -> bool {
    revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit())
}

/// Commit id for `revision` in `git ls-remote` output. A peeled annotated tag
/// wins over the tag object; branches are preferred over other refs.
fn pick_ref(listing: &str, revision: &str) -> Option<String> {
    let refs: Vec<(&str, &str)> = listing
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(sha, name)| (sha.trim(), name.trim()))
        .collect();
    let peeled = format!("refs/tags/{}^{{}}", revision);
    let branch = format!("refs/heads/{}", revision);
    refs.iter()
        .find(|(_, name)| *name == peeled)
        .or_else(|| refs.iter().find(|(_, name)| *name == branch))
        .or_else(|| refs.first())
        .map(|(sha, _)| sha.to_string())
}
