//! The release tree on local disk.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use railyard_core::collaborators::{ExternalError, ExternalResult, ReleaseFilesystem};
use railyard_core::domain::release_sort_key;
use tracing::debug;

const REVISION_FILE: &str = "REVISION";

/// `releases/`, `shared/` and the `current` symlink under one deploy root.
#[derive(Debug, Clone)]
pub struct LocalReleaseFs {
    root: PathBuf,
}

impl LocalReleaseFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }

    fn shared_dir(&self) -> PathBuf {
        self.root.join("shared")
    }

    fn current_link(&self) -> PathBuf {
        self.root.join("current")
    }

    fn check_release(&self, release: &Path) -> ExternalResult<()> {
        if release.parent() == Some(self.releases_dir().as_path()) {
            Ok(())
        } else {
            Err(ExternalError::Other(format!(
                "{} is not a release directory under {}",
                release.display(),
                self.releases_dir().display()
            )))
        }
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Remove whatever is at `path` without following a symlink.
fn remove_entry(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl ReleaseFilesystem for LocalReleaseFs {
    fn ensure_layout(&self, shared_dirs: &[&str]) -> ExternalResult<()> {
        std::fs::create_dir_all(self.releases_dir())?;
        for dir in shared_dirs {
            std::fs::create_dir_all(self.shared_dir().join(dir))?;
        }
        Ok(())
    }

    fn current_target(&self) -> ExternalResult<Option<PathBuf>> {
        match std::fs::read_link(self.current_link()) {
            Ok(target) if target.is_relative() => Ok(Some(self.root.join(target))),
            Ok(target) => Ok(Some(target)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Build the new link beside `current` and rename it over the old one,
    /// so readers see either the old or the new target.
    fn point_current(&self, target: &Path) -> ExternalResult<()> {
        let staging = self
            .root
            .join(format!(".current.{}.tmp", std::process::id()));
        remove_entry(&staging)?;
        symlink(target, &staging)?;
        if let Err(e) = std::fs::rename(&staging, self.current_link()) {
            let _ = std::fs::remove_file(&staging);
            return Err(e.into());
        }
        debug!(target = %target.display(), "current repointed");
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_releases(&self) -> ExternalResult<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(self.releases_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut releases = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                releases.push(entry.path());
            }
        }
        releases.sort_by_key(|p| release_sort_key(p));
        Ok(releases)
    }

    fn remove_release(&self, release: &Path) -> ExternalResult<()> {
        self.check_release(release)?;
        ignore_missing(std::fs::remove_dir_all(release))?;
        Ok(())
    }

    fn purge(&self, release: &Path, paths: &[PathBuf]) -> ExternalResult<()> {
        for path in paths {
            remove_entry(&release.join(path))?;
        }
        Ok(())
    }

    fn create_dirs(&self, release: &Path, paths: &[PathBuf]) -> ExternalResult<()> {
        for path in paths {
            std::fs::create_dir_all(release.join(path))?;
        }
        Ok(())
    }

    fn link_shared(
        &self,
        release: &Path,
        links: &BTreeMap<String, PathBuf>,
    ) -> ExternalResult<()> {
        for (shared, inside) in links {
            let link = release.join(inside);
            if let Some(parent) = link.parent() {
                std::fs::create_dir_all(parent)?;
            }
            remove_entry(&link)?;
            symlink(self.shared_dir().join(shared), &link)?;
        }
        Ok(())
    }

    fn write_revision(&self, release: &Path, revision: &str) -> ExternalResult<()> {
        std::fs::create_dir_all(release)?;
        std::fs::write(release.join(REVISION_FILE), format!("{}\n", revision))?;
        Ok(())
    }

    fn read_revision(&self, release: &Path) -> ExternalResult<Option<String>> {
        match std::fs::read_to_string(release.join(REVISION_FILE)) {
            Ok(raw) => Ok(Some(raw.trim().to_string()).filter(|r| !r.is_empty())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
