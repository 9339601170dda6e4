//! Configuration files rendered from `{{ variable }}` templates.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::{Captures, Regex};
use railyard_core::collaborators::{
    CommandRunner, CommandSpec, ExternalError, ExternalResult, TemplateRenderer, TemplateRequest,
};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

/// Renders templates from a directory and writes them atomically.
///
/// A file is rewritten when its content digest, mode or ownership differs
/// from the request. Ownership is set on the staged copy before it replaces
/// the target, so a failed chown leaves the old file in place.
pub struct FileTemplateRenderer {
    directory: PathBuf,
    /// Used to inspect and chown written files; `None` leaves ownership alone.
    runner: Option<Arc<dyn CommandRunner>>,
}

impl FileTemplateRenderer {
    pub fn new(directory: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            directory: directory.into(),
            runner: Some(runner),
        }
    }

    /// Write files as the current user without changing their ownership.
    pub fn without_ownership(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            runner: None,
        }
    }

    async fn rendered(&self, request: &TemplateRequest) -> ExternalResult<String> {
        let path = self.directory.join(&request.template);
        let source = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ExternalError::Other(format!("template {}: {}", path.display(), e))
        })?;
        substitute(&source, &request.variables)
            .map_err(|missing| {
                ExternalError::Other(format!(
                    "template {} references unknown variable '{}'",
                    request.template, missing
                ))
            })
    }

    /// Whether the target already holds `wanted` with the requested mode
    /// and ownership.
    async fn in_place(&self, request: &TemplateRequest, wanted: &str) -> ExternalResult<bool> {
        let target = &request.target;
        let bytes = match tokio::fs::read(target).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if digest(&bytes) != digest(wanted.as_bytes()) {
            return Ok(false);
        }
        let mode = tokio::fs::metadata(target).await?.permissions().mode();
        if mode & 0o7777 != request.mode & 0o7777 {
            debug!(
                target_path = %target.display(),
                mode = %format!("{:o}", mode & 0o7777),
                "template mode drifted"
            );
            return Ok(false);
        }
        let Some(runner) = &self.runner else {
            return Ok(true);
        };
        let path = target.display().to_string();
        let output = runner
            .run(&CommandSpec::new("stat", ["stat", "-c", "%U:%G", path.as_str()]))
            .await?;
        Ok(output.success() && output.stdout.trim() == owner_spec(request))
    }

    /// Stage `content` next to `target` with its final mode.
    fn stage(target: &Path, content: &str, mode: u32) -> ExternalResult<NamedTempFile> {
        let parent = target.parent().ok_or_else(|| {
            ExternalError::Other(format!("{} has no parent directory", target.display()))
        })?;
        std::fs::create_dir_all(parent)?;
        let mut staged = NamedTempFile::new_in(parent)?;
        staged.write_all(content.as_bytes())?;
        staged.flush()?;
        std::fs::set_permissions(staged.path(), std::fs::Permissions::from_mode(mode))?;
        Ok(staged)
    }
}

fn owner_spec(request: &TemplateRequest) -> String {
    format!("{}:{}", request.owner, request.group)
}

fn digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Replace every `{{ name }}` in `source`. Returns the first unknown name.
pub fn substitute(source: &str, variables: &BTreeMap<String, String>) -> Result<String, String> {
    let pattern = Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").map_err(|e| e.to_string())?;
    let mut missing = None;
    let out = pattern.replace_all(source, |caps: &Captures| {
        let name = &caps[1];
        match variables.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(name),
        None => Ok(out.into_owned()),
    }
}

#[async_trait]
impl TemplateRenderer for FileTemplateRenderer {
    async fn would_change(&self, request: &TemplateRequest) -> ExternalResult<bool> {
        let wanted = self.rendered(request).await?;
        Ok(!self.in_place(request, &wanted).await?)
    }

    async fn render(&self, request: &TemplateRequest) -> ExternalResult<bool> {
        let wanted = self.rendered(request).await?;
        if self.in_place(request, &wanted).await? {
            return Ok(false);
        }
        let staged = Self::stage(&request.target, &wanted, request.mode)?;
        if let Some(runner) = &self.runner {
            let chown = CommandSpec::new(
                "chown",
                [
                    "chown".to_string(),
                    owner_spec(request),
                    staged.path().display().to_string(),
                ],
            );
            runner.run_checked(&chown).await?;
        }
        staged
            .persist(&request.target)
            .map_err(|e| ExternalError::Io(e.error))?;
        debug!(target_path = %request.target.display(), "template written");
        Ok(true)
    }
}
