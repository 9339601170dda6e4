//! Release lifecycle state machine.
//!
//! One [`ReleaseWorkflow::deploy`] call walks a single release through
//! `Fetching → Staged → SymlinkPending → Migrating → SymlinkFinal →
//! Restarting → Complete`. Entering a state performs that state's work; the
//! first failure moves the release to `Failed` and recovery points `current`
//! back at the last known-good release.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};

use crate::collaborators::{
    BundlerOptions, Collaborators, CommandSpec, DeployKey, ExternalError, FetchRequest,
    InstallRequest,
};
use crate::domain::config::{DeployAction, DeployConfig, TimeoutConfig};
use crate::domain::error::{RailyardError, Result};
use crate::domain::release::{Release, ReleaseOutcome, ReleaseState, StageOutcome};
use crate::obs;
use crate::runtime::{with_deadline, CancelSignal};
use crate::supervisor::SupervisorBinding;

/// Directories pre-created under `<path>/shared`.
pub const SHARED_DIRS: [&str; 4] = ["config", "log", "pids", "system"];

/// A release directory on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseEntry {
    pub path: PathBuf,
    pub revision: Option<String>,
    pub current: bool,
}

/// What a stage did when it did not fail.
enum Step {
    Done,
    Skipped(String),
}

/// Progress of one attempt that recovery depends on.
#[derive(Debug, Default)]
struct Attempt {
    resolved: String,
    release_path: Option<PathBuf>,
    cut_over: bool,
}

/// Drives releases of one application on one host.
pub struct ReleaseWorkflow {
    config: DeployConfig,
    collaborators: Collaborators,
    supervisor: SupervisorBinding,
}

impl ReleaseWorkflow {
    pub fn new(config: DeployConfig, collaborators: Collaborators) -> Self {
        let supervisor = SupervisorBinding::from_config(&config, &collaborators);
        Self {
            config,
            collaborators,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &SupervisorBinding {
        &self.supervisor
    }

    /// Carry out the configured `deploy.action`.
    pub async fn run(&self, cancel: &CancelSignal) -> Release {
        match self.config.deploy.action {
            DeployAction::Deploy => self.deploy(false, cancel).await,
            DeployAction::ForceDeploy => self.deploy(true, cancel).await,
            DeployAction::Rollback => self.rollback(cancel).await,
        }
    }

    /// Deploy the configured revision.
    ///
    /// Without `force`, a revision that is already current is not deployed
    /// again. The returned record always names the failing stage, if any.
    pub async fn deploy(&self, force: bool, cancel: &CancelSignal) -> Release {
        let mut release = Release::new(
            self.config.app.name.as_str(),
            self.config.app.path.as_path(),
            self.config.deploy.revision.as_str(),
            self.config.deploy.migrate,
        );
        let span = obs::run_span(&release.release_id.to_string(), "release");
        self.drive_deploy(&mut release, force, cancel)
            .instrument(span)
            .await;
        release
    }

    /// Return `current` to the release before it, restart, and discard the
    /// abandoned release.
    pub async fn rollback(&self, cancel: &CancelSignal) -> Release {
        let mut release = Release::new(
            self.config.app.name.as_str(),
            self.config.app.path.as_path(),
            "previous",
            false,
        );
        let span = obs::run_span(&release.release_id.to_string(), "rollback");
        self.drive_rollback(&mut release, cancel)
            .instrument(span)
            .await;
        release
    }

    /// Release directories, oldest first.
    pub fn releases(&self) -> Result<Vec<ReleaseEntry>> {
        let fs = &self.collaborators.filesystem;
        let current = fs.current_target().map_err(filesystem_error)?;
        fs.list_releases()
            .map_err(filesystem_error)?
            .into_iter()
            .map(|path| {
                let revision = fs.read_revision(&path).map_err(filesystem_error)?;
                Ok(ReleaseEntry {
                    current: current.as_deref() == Some(path.as_path()),
                    path,
                    revision,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Deploy
    // -----------------------------------------------------------------------

    async fn drive_deploy(&self, release: &mut Release, force: bool, cancel: &CancelSignal) {
        let mut attempt = Attempt::default();

        if let Err(cause) = self.survey(release, &mut attempt).await {
            self.fail(release, Some(ReleaseState::Idle), cause);
            self.recover(release, &attempt).await;
            return;
        }

        if !force && self.already_current(release, &attempt) {
            let reason = format!("revision {} is already current", attempt.resolved);
            info!(revision = %attempt.resolved, "release already current");
            let mut stage = ReleaseState::Idle;
            while let Some(next) = stage.successor() {
                if next != ReleaseState::Complete {
                    release.record(
                        next,
                        StageOutcome::Skipped {
                            reason: reason.clone(),
                        },
                        0,
                    );
                }
                stage = next;
            }
            self.finish(release, ReleaseOutcome::AlreadyCurrent);
            return;
        }

        let mut next = ReleaseState::Fetching;
        loop {
            if next == ReleaseState::Complete {
                self.transition(release, next);
                break;
            }
            if cancel.is_cancelled() {
                release.cancelled_at = Some(next);
                self.fail(release, None, format!("cancelled before {}", next));
                self.recover(release, &attempt).await;
                return;
            }

            self.transition(release, next);
            let started = Instant::now();
            let result = self.enter(next, release, &mut attempt).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(Step::Done) => release.record(next, StageOutcome::Succeeded, duration_ms),
                Ok(Step::Skipped(reason)) => {
                    release.record(next, StageOutcome::Skipped { reason }, duration_ms)
                }
                Err(cause) => {
                    release.record(
                        next,
                        StageOutcome::Failed {
                            cause: cause.clone(),
                        },
                        duration_ms,
                    );
                    self.fail(release, Some(next), cause);
                    self.recover(release, &attempt).await;
                    return;
                }
            }

            next = match next.successor() {
                Some(state) => state,
                None => break,
            };
        }

        if let Some(path) = &attempt.release_path {
            match self.prune(path, release.previous_target.as_deref()) {
                Ok(removed) if !removed.is_empty() => {
                    info!(removed = removed.len(), "pruned old releases")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to prune old releases"),
            }
        }
        self.finish(release, ReleaseOutcome::Deployed);
    }

    /// Lay out the deploy root, note where `current` points and resolve the
    /// requested revision.
    async fn survey(&self, release: &mut Release, attempt: &mut Attempt) -> std::result::Result<(), String> {
        let fs = &self.collaborators.filesystem;
        fs.ensure_layout(&SHARED_DIRS).map_err(|e| e.to_string())?;
        let previous = fs.current_target().map_err(|e| e.to_string())?;
        release.previous_target = previous.clone();
        release.current_target = previous;

        let deadline = TimeoutConfig::deadline(self.config.timeouts.fetch);
        let resolved = with_deadline(
            "resolve revision",
            deadline,
            self.collaborators
                .fetcher
                .resolve(&self.config.deploy.repository, &self.config.deploy.revision),
        )
        .await
        .map_err(|e| e.to_string())?;
        release.resolved_revision = Some(resolved.clone());
        attempt.resolved = resolved;
        Ok(())
    }

    fn already_current(&self, release: &Release, attempt: &Attempt) -> bool {
        let Some(current) = &release.previous_target else {
            return false;
        };
        match self.collaborators.filesystem.read_revision(current) {
            Ok(Some(revision)) => revision == attempt.resolved,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "could not read current revision");
                false
            }
        }
    }

    async fn enter(
        &self,
        stage: ReleaseState,
        release: &mut Release,
        attempt: &mut Attempt,
    ) -> std::result::Result<Step, String> {
        match stage {
            ReleaseState::Fetching => self.fetch(release, attempt).await,
            ReleaseState::Staged => self.stage(attempt).await,
            ReleaseState::SymlinkPending => self.link(release, attempt),
            ReleaseState::Migrating => self.migrate(release, attempt).await,
            ReleaseState::SymlinkFinal => {
                if attempt.cut_over {
                    return Ok(Step::Skipped(
                        "current already points at this release".to_string(),
                    ));
                }
                self.cut_over(release, attempt)?;
                Ok(Step::Done)
            }
            ReleaseState::Restarting => {
                let path = release_path(attempt)?;
                self.supervisor
                    .restart_application(path)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Step::Done)
            }
            _ => Ok(Step::Done),
        }
    }

    async fn fetch(&self, release: &mut Release, attempt: &mut Attempt) -> std::result::Result<Step, String> {
        let fs = &self.collaborators.filesystem;
        let destination = self.allocate_release_path();
        release.release_path = Some(destination.clone());
        attempt.release_path = Some(destination.clone());

        let request = FetchRequest {
            repository: self.config.deploy.repository.clone(),
            revision: attempt.resolved.clone(),
            destination: destination.clone(),
            shallow: self.config.deploy.shallow_clone,
            submodules: self.config.deploy.enable_submodules,
            deploy_key: self.config.deploy.deploy_key.as_deref().map(DeployKey::new),
            run_as: Some(self.config.owner.clone()),
        };
        let deadline = TimeoutConfig::deadline(self.config.timeouts.fetch);
        let fetched = with_deadline("fetch", deadline, self.collaborators.fetcher.fetch(&request))
            .await
            .and_then(|_| fs.write_revision(&destination, &attempt.resolved));
        if let Err(e) = fetched {
            if let Err(cleanup) = fs.remove_release(&destination) {
                warn!(release = %destination.display(), error = %cleanup, "failed to remove partial release");
            }
            attempt.release_path = None;
            return Err(e.to_string());
        }
        Ok(Step::Done)
    }

    async fn stage(&self, attempt: &Attempt) -> std::result::Result<Step, String> {
        let path = release_path(attempt)?;
        let cfg = &self.config;
        let request = InstallRequest {
            release_path: path.to_path_buf(),
            packages: cfg.packages.clone(),
            gems: cfg.gems_with_bundler(),
            bundler: cfg.deploy.bundler.then(|| BundlerOptions {
                command: cfg.deploy.bundle_command.clone(),
                deployment: cfg.deploy.bundler_deployment,
                without_groups: cfg.deploy.bundler_without_groups.clone(),
            }),
            environment: cfg.app.environment.clone(),
            run_as: Some(cfg.owner.clone()),
        };
        let deadline = TimeoutConfig::deadline(cfg.timeouts.install);
        with_deadline(
            "install dependencies",
            deadline,
            self.collaborators.installer.install(&request),
        )
        .await
        .map_err(|e| e.to_string())?;

        if cfg.deploy.precompile_assets {
            let spec = CommandSpec::new(
                "assets:precompile",
                [
                    cfg.deploy.bundle_command.as_str(),
                    "exec",
                    "rake",
                    "assets:precompile",
                ],
            )
            .in_dir(path)
            .with_env("RAILS_ENV", cfg.app.environment.as_str())
            .as_user(cfg.owner.as_str())
            .with_timeout(deadline);
            with_deadline(
                "assets:precompile",
                deadline,
                self.collaborators.commands.run_checked(&spec),
            )
            .await
            .map_err(|e| e.to_string())?;
        }
        Ok(Step::Done)
    }

    fn link(&self, release: &mut Release, attempt: &mut Attempt) -> std::result::Result<Step, String> {
        let path = release_path(attempt)?.to_path_buf();
        let fs = &self.collaborators.filesystem;
        let deploy = &self.config.deploy;
        fs.purge(&path, &deploy.purge_before_symlink)
            .and_then(|_| fs.create_dirs(&path, &deploy.create_dirs_before_symlink))
            .and_then(|_| fs.link_shared(&path, &deploy.symlinks))
            .map_err(|e| e.to_string())?;
        if deploy.symlink_before_migrate {
            self.cut_over(release, attempt)?;
        }
        Ok(Step::Done)
    }

    async fn migrate(&self, release: &Release, attempt: &Attempt) -> std::result::Result<Step, String> {
        if !release.migration_required {
            return Ok(Step::Skipped("migrate is disabled".to_string()));
        }
        let path = release_path(attempt)?;
        let cfg = &self.config;
        let deadline = TimeoutConfig::deadline(cfg.timeouts.migrate);
        let spec = CommandSpec::shell("migrate", cfg.deploy.migration_command.as_str())
            .in_dir(path)
            .with_env("RAILS_ENV", cfg.app.environment.as_str())
            .as_user(cfg.owner.as_str())
            .with_timeout(deadline);
        with_deadline(
            "migrate",
            deadline,
            self.collaborators.commands.run_checked(&spec),
        )
        .await
        .map_err(|e| e.to_string())?;
        Ok(Step::Done)
    }

    fn cut_over(&self, release: &mut Release, attempt: &mut Attempt) -> std::result::Result<(), String> {
        let path = release_path(attempt)?.to_path_buf();
        self.collaborators
            .filesystem
            .point_current(&path)
            .map_err(|e| e.to_string())?;
        info!(release = %path.display(), "current now points at new release");
        attempt.cut_over = true;
        release.current_target = Some(path);
        Ok(())
    }

    /// `releases/<UTC timestamp>`, suffixed `-n` while the name is taken.
    fn allocate_release_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let releases = self.config.releases_dir();
        let fs = &self.collaborators.filesystem;
        let mut candidate = releases.join(&stamp);
        let mut n = 1;
        while fs.exists(&candidate) {
            candidate = releases.join(format!("{}-{}", stamp, n));
            n += 1;
        }
        candidate
    }

    /// Delete the oldest releases beyond `keep_releases`, never touching the
    /// live release or its rollback candidate.
    fn prune(&self, live: &Path, previous: Option<&Path>) -> std::result::Result<Vec<PathBuf>, ExternalError> {
        let fs = &self.collaborators.filesystem;
        let releases = fs.list_releases()?;
        let excess = releases.len().saturating_sub(self.config.deploy.keep_releases);
        let mut removed = Vec::new();
        for old in releases.into_iter().take(excess) {
            if old == live || Some(old.as_path()) == previous {
                continue;
            }
            fs.remove_release(&old)?;
            removed.push(old);
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Failure and recovery
    // -----------------------------------------------------------------------

    fn fail(&self, release: &mut Release, stage: Option<ReleaseState>, cause: String) {
        let at = stage.unwrap_or(release.state);
        obs::emit_release_failed(&release.release_id.to_string(), at, &cause);
        release.failed_stage = stage;
        release.error = Some(cause);
        self.transition(release, ReleaseState::Failed);
    }

    /// Point `current` back at the last known-good release.
    ///
    /// The application is restarted only if `current` had been moved. With
    /// no known-good release the release stays `Failed`.
    async fn recover(&self, release: &mut Release, attempt: &Attempt) {
        let fs = &self.collaborators.filesystem;
        let known_good = release
            .previous_target
            .clone()
            .filter(|p| Some(p) != attempt.release_path.as_ref() && fs.exists(p));

        let Some(previous) = known_good else {
            if !attempt.cut_over {
                self.discard(attempt.release_path.as_deref());
            }
            warn!("no known-good release to roll back to");
            self.finish(release, ReleaseOutcome::Failed);
            return;
        };

        let started = Instant::now();
        if attempt.cut_over {
            if let Err(e) = fs.point_current(&previous) {
                self.recovery_failed(release, started, format!("restoring current: {}", e));
                return;
            }
            release.current_target = Some(previous.clone());
            if let Err(e) = self.supervisor.restart_application(&previous).await {
                self.recovery_failed(release, started, format!("restart after rollback: {}", e));
                return;
            }
            release.record(
                ReleaseState::RolledBack,
                StageOutcome::Succeeded,
                started.elapsed().as_millis() as u64,
            );
        } else {
            release.current_target = Some(previous.clone());
            release.record(
                ReleaseState::RolledBack,
                StageOutcome::Skipped {
                    reason: "current still points at the previous release".to_string(),
                },
                0,
            );
        }

        self.discard(attempt.release_path.as_deref());
        self.transition(release, ReleaseState::RolledBack);
        obs::emit_release_rolled_back(
            &release.release_id.to_string(),
            &previous.display().to_string(),
        );
        self.finish(release, ReleaseOutcome::RolledBack);
    }

    fn recovery_failed(&self, release: &mut Release, started: Instant, cause: String) {
        release.record(
            ReleaseState::RolledBack,
            StageOutcome::Failed {
                cause: cause.clone(),
            },
            started.elapsed().as_millis() as u64,
        );
        let error = match release.error.take() {
            Some(original) => format!("{}; rollback failed: {}", original, cause),
            None => format!("rollback failed: {}", cause),
        };
        release.error = Some(error);
        self.finish(release, ReleaseOutcome::Failed);
    }

    /// Remove an abandoned release directory.
    fn discard(&self, path: Option<&Path>) {
        if let Some(path) = path {
            if let Err(e) = self.collaborators.filesystem.remove_release(path) {
                warn!(release = %path.display(), error = %e, "failed to remove abandoned release");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Operator rollback
    // -----------------------------------------------------------------------

    async fn drive_rollback(&self, release: &mut Release, cancel: &CancelSignal) {
        if cancel.is_cancelled() {
            release.cancelled_at = Some(ReleaseState::RolledBack);
            self.fail(release, None, "cancelled before rollback".to_string());
            self.finish(release, ReleaseOutcome::Failed);
            return;
        }

        let started = Instant::now();
        match self.return_to_previous(release).await {
            Ok(abandoned) => {
                release.record(
                    ReleaseState::RolledBack,
                    StageOutcome::Succeeded,
                    started.elapsed().as_millis() as u64,
                );
                self.discard(Some(&abandoned));
                self.transition(release, ReleaseState::RolledBack);
                if let Some(target) = &release.current_target {
                    obs::emit_release_rolled_back(
                        &release.release_id.to_string(),
                        &target.display().to_string(),
                    );
                }
                self.finish(release, ReleaseOutcome::RolledBack);
            }
            Err(cause) => {
                release.record(
                    ReleaseState::RolledBack,
                    StageOutcome::Failed {
                        cause: cause.clone(),
                    },
                    started.elapsed().as_millis() as u64,
                );
                self.fail(release, Some(ReleaseState::RolledBack), cause);
                self.finish(release, ReleaseOutcome::Failed);
            }
        }
    }

    /// Repoint `current` at the release before it and restart; returns the
    /// release that was abandoned.
    async fn return_to_previous(&self, release: &mut Release) -> std::result::Result<PathBuf, String> {
        let fs = &self.collaborators.filesystem;
        let current = fs
            .current_target()
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "no current release to roll back from".to_string())?;
        release.previous_target = Some(current.clone());
        release.current_target = Some(current.clone());

        let releases = fs.list_releases().map_err(|e| e.to_string())?;
        let position = releases
            .iter()
            .position(|r| *r == current)
            .ok_or_else(|| format!("{} is not a known release", current.display()))?;
        let target = match position.checked_sub(1) {
            Some(i) => releases[i].clone(),
            None => return Err(format!("no release precedes {}", current.display())),
        };

        if let Ok(Some(revision)) = fs.read_revision(&target) {
            release.revision = revision.clone();
            release.resolved_revision = Some(revision);
        }
        release.release_path = Some(target.clone());

        fs.point_current(&target).map_err(|e| e.to_string())?;
        release.current_target = Some(target.clone());
        self.supervisor
            .restart_application(&target)
            .await
            .map_err(|e| e.to_string())?;
        Ok(current)
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    fn transition(&self, release: &mut Release, to: ReleaseState) {
        let from = release.state;
        debug_assert!(
            from.can_transition_to(to),
            "illegal release transition {} -> {}",
            from,
            to
        );
        release.state = to;
        obs::emit_release_transition(&release.release_id.to_string(), from, to);
    }

    fn finish(&self, release: &mut Release, outcome: ReleaseOutcome) {
        release.finish(outcome);
        let duration_ms = (Utc::now() - release.started_at).num_milliseconds().max(0) as u64;
        obs::emit_release_completed(&release.release_id.to_string(), outcome, duration_ms);
    }
}

fn release_path(attempt: &Attempt) -> std::result::Result<&Path, String> {
    attempt
        .release_path
        .as_deref()
        .ok_or_else(|| "no release directory allocated".to_string())
}

fn filesystem_error(e: ExternalError) -> RailyardError {
    RailyardError::ExternalService {
        service: "release filesystem".to_string(),
        cause: e.to_string(),
    }
}
