//! OS users, groups and home directories via the shadow-utils commands.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use railyard_core::collaborators::{AccountManager, CommandRunner, CommandSpec, ExternalResult};

pub struct SystemAccounts {
    runner: Arc<dyn CommandRunner>,
}

impl SystemAccounts {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn succeeds<I, S>(&self, label: &str, argv: I) -> ExternalResult<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self
            .runner
            .run(&CommandSpec::new(label, argv))
            .await?
            .success())
    }

    async fn checked<I, S>(&self, label: &str, argv: I) -> ExternalResult<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self
            .runner
            .run_checked(&CommandSpec::new(label, argv))
            .await?
            .stdout)
    }
}

#[async_trait]
impl AccountManager for SystemAccounts {
    async fn user_exists(&self, user: &str) -> ExternalResult<bool> {
        self.succeeds("id", ["id", "-u", user]).await
    }

    async fn create_user(&self, user: &str, home: &Path) -> ExternalResult<()> {
        let home = home.display().to_string();
        self.checked(
            "useradd",
            [
                "useradd",
                "--create-home",
                "--home-dir",
                home.as_str(),
                "--shell",
                "/bin/bash",
                "--user-group",
                user,
            ],
        )
        .await?;
        Ok(())
    }

    async fn home_matches(&self, path: &Path, owner: &str, group: &str) -> ExternalResult<bool> {
        let path = path.display().to_string();
        let output = self
            .runner
            .run(&CommandSpec::new(
                "stat",
                ["stat", "-c", "%F %U:%G", path.as_str()],
            ))
            .await?;
        Ok(output.success() && ownership_matches(&output.stdout, owner, group))
    }

    async fn ensure_home(&self, path: &Path, owner: &str, group: &str) -> ExternalResult<()> {
        let path = path.display().to_string();
        self.checked(
            "install home",
            [
                "install", "-d", "-o", owner, "-g", group, "-m", "0755",
                path.as_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn group_has_member(&self, group: &str, member: &str) -> ExternalResult<bool> {
        let output = self
            .runner
            .run(&CommandSpec::new("id", ["id", "-nG", member]))
            .await?;
        Ok(output.success() && output.stdout.split_whitespace().any(|g| g == group))
    }

    async fn ensure_group(&self, group: &str, member: &str) -> ExternalResult<()> {
        if !self.succeeds("getent", ["getent", "group", group]).await? {
            self.checked("groupadd", ["groupadd", group]).await?;
        }
        self.checked("usermod", ["usermod", "-a", "-G", group, member])
            .await?;
        Ok(())
    }
}

/// Parse `stat -c '%F %U:%G'` output.
fn ownership_matches(stat: &str, owner: &str, group: &str) -> bool {
    let line = stat.trim();
    line.starts_with("directory ") && line.ends_with(&format!(" {}:{}", owner, group))
}
