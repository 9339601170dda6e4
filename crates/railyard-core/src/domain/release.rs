//! Release lifecycle states and the per-release record.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// States of the release lifecycle state machine.
///
/// Happy path: `Idle → Fetching → Staged → SymlinkPending → Migrating →
/// SymlinkFinal → Restarting → Complete`. `Failed` is reachable from every
/// non-terminal state; `RolledBack` from `Failed`, or straight from `Idle`
/// when an operator asks to return to the previous release.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseState {
    Idle,
    Fetching,
    Staged,
    SymlinkPending,
    Migrating,
    SymlinkFinal,
    Restarting,
    Complete,
    Failed,
    RolledBack,
}

impl ReleaseState {
    /// Stable lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            ReleaseState::Idle => "idle",
            ReleaseState::Fetching => "fetching",
            ReleaseState::Staged => "staged",
            ReleaseState::SymlinkPending => "symlink_pending",
            ReleaseState::Migrating => "migrating",
            ReleaseState::SymlinkFinal => "symlink_final",
            ReleaseState::Restarting => "restarting",
            ReleaseState::Complete => "complete",
            ReleaseState::Failed => "failed",
            ReleaseState::RolledBack => "rolled_back",
        }
    }

    /// The next state on the happy path, if any.
    pub fn successor(&self) -> Option<ReleaseState> {
        match self {
            ReleaseState::Idle => Some(ReleaseState::Fetching),
            ReleaseState::Fetching => Some(ReleaseState::Staged),
            ReleaseState::Staged => Some(ReleaseState::SymlinkPending),
            ReleaseState::SymlinkPending => Some(ReleaseState::Migrating),
            ReleaseState::Migrating => Some(ReleaseState::SymlinkFinal),
            ReleaseState::SymlinkFinal => Some(ReleaseState::Restarting),
            ReleaseState::Restarting => Some(ReleaseState::Complete),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReleaseState::Complete | ReleaseState::RolledBack)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: ReleaseState) -> bool {
        if self.successor() == Some(next) {
            return true;
        }
        match next {
            ReleaseState::Failed => !self.is_terminal() && *self != ReleaseState::Failed,
            ReleaseState::RolledBack => {
                matches!(self, ReleaseState::Failed | ReleaseState::Idle)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one lifecycle stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    /// The stage had nothing to do under the current configuration.
    Skipped { reason: String },
    Failed { cause: String },
}

/// Result record for a single stage of a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: ReleaseState,
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub duration_ms: u64,
}

/// How a release attempt ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Still running.
    InProgress,
    /// A new release is live.
    Deployed,
    /// The requested revision was already current; nothing changed.
    AlreadyCurrent,
    /// The release failed and `current` was restored to the last good release.
    RolledBack,
    /// The release failed and there was nothing safe to roll back to.
    Failed,
}

/// One attempt at deploying an application revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Release {
    pub release_id: Uuid,
    pub app_name: String,
    pub deploy_path: PathBuf,
    /// Revision as configured (branch, tag or commit).
    pub revision: String,
    /// Commit id the revision resolved to, once known.
    pub resolved_revision: Option<String>,
    /// Directory this release was checked out into, once allocated.
    pub release_path: Option<PathBuf>,
    pub state: ReleaseState,
    pub stages: Vec<StageRecord>,
    /// Where `current` points after this attempt.
    pub current_target: Option<PathBuf>,
    /// Where `current` pointed before this attempt; the rollback target.
    pub previous_target: Option<PathBuf>,
    pub migration_required: bool,
    pub failed_stage: Option<ReleaseState>,
    pub error: Option<String>,
    /// Set when the cancellation signal stopped the workflow before it
    /// entered this stage.
    #[serde(default)]
    pub cancelled_at: Option<ReleaseState>,
    pub outcome: ReleaseOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Release {
    pub fn new(
        app_name: impl Into<String>,
        deploy_path: impl Into<PathBuf>,
        revision: impl Into<String>,
        migration_required: bool,
    ) -> Self {
        Self {
            release_id: Uuid::new_v4(),
            app_name: app_name.into(),
            deploy_path: deploy_path.into(),
            revision: revision.into(),
            resolved_revision: None,
            release_path: None,
            state: ReleaseState::Idle,
            stages: Vec::new(),
            current_target: None,
            previous_target: None,
            migration_required,
            failed_stage: None,
            error: None,
            cancelled_at: None,
            outcome: ReleaseOutcome::InProgress,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record a stage result.
    pub fn record(&mut self, stage: ReleaseState, outcome: StageOutcome, duration_ms: u64) {
        self.stages.push(StageRecord {
            stage,
            outcome,
            duration_ms,
        });
    }

    /// Look up the recorded outcome of a stage.
    pub fn stage(&self, stage: ReleaseState) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn succeeded(&self) -> bool {
        matches!(
            self.outcome,
            ReleaseOutcome::Deployed | ReleaseOutcome::AlreadyCurrent
        )
    }

    /// Whether the application was restarted by this attempt, either onto
    /// the new release or back onto the previous one.
    pub fn restarted(&self) -> bool {
        self.stages.iter().any(|s| {
            matches!(s.stage, ReleaseState::Restarting | ReleaseState::RolledBack)
                && s.outcome == StageOutcome::Succeeded
        })
    }

    /// Mark the attempt finished with the given outcome.
    pub fn finish(&mut self, outcome: ReleaseOutcome) {
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
    }
}

/// Chronological sort key of a release directory.
///
/// Names are `<timestamp>` or `<timestamp>-<n>` for later releases cut in
/// the same second, so the suffix is compared as a number.
pub fn release_sort_key(path: &Path) -> (String, u32) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some((stamp, suffix)) = name.split_once('-') {
        if let Ok(n) = suffix.parse() {
            return (stamp.to_string(), n);
        }
    }
    (name, 0)
}
