//! SSH key material of the deploy account and the remote key registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use railyard_core::collaborators::{
    CommandRunner, CommandSpec, ExternalError, ExternalResult, KeyRegistry, KeyStore,
};
use railyard_core::domain::config::KeyRegistryConfig;
use tracing::info;

use crate::command::shell_quote;

/// Keys under `<home_root>/<account>/.ssh`, managed with `ssh-keygen` and
/// `ssh-keyscan` running as the account.
pub struct SshKeyStore {
    runner: Arc<dyn CommandRunner>,
    home_root: PathBuf,
}

impl SshKeyStore {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            home_root: PathBuf::from("/home"),
        }
    }

    pub fn with_home_root(mut self, home_root: impl Into<PathBuf>) -> Self {
        self.home_root = home_root.into();
        self
    }

    fn ssh_dir(&self, account: &str) -> PathBuf {
        self.home_root.join(account).join(".ssh")
    }

    fn private_key(&self, account: &str) -> PathBuf {
        self.ssh_dir(account).join("id_rsa")
    }

    fn public_key_path(&self, account: &str) -> PathBuf {
        self.ssh_dir(account).join("id_rsa.pub")
    }
}

fn arg(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl KeyStore for SshKeyStore {
    async fn has_keypair(&self, account: &str) -> ExternalResult<bool> {
        Ok(tokio::fs::try_exists(self.private_key(account)).await?)
    }

    async fn generate_keypair(&self, account: &str) -> ExternalResult<String> {
        let mkdir = CommandSpec::new(
            "mkdir .ssh",
            ["mkdir".to_string(), "-p".to_string(), "-m".to_string(), "0700".to_string(), arg(&self.ssh_dir(account))],
        )
        .as_user(account);
        self.runner.run_checked(&mkdir).await?;

        let keygen = CommandSpec::new(
            "ssh-keygen",
            [
                "ssh-keygen".to_string(),
                "-q".to_string(),
                "-t".to_string(),
                "rsa".to_string(),
                "-b".to_string(),
                "4096".to_string(),
                "-N".to_string(),
                String::new(),
                "-C".to_string(),
                account.to_string(),
                "-f".to_string(),
                arg(&self.private_key(account)),
            ],
        )
        .as_user(account);
        self.runner.run_checked(&keygen).await?;

        self.public_key(account).await?.ok_or_else(|| {
            ExternalError::Other(format!("ssh-keygen left no public key for {}", account))
        })
    }

    async fn public_key(&self, account: &str) -> ExternalResult<Option<String>> {
        match tokio::fs::read_to_string(self.public_key_path(account)).await {
            Ok(raw) => Ok(Some(raw.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Append the host's hashed keys to the account's `known_hosts`.
    async fn add_known_host(&self, account: &str, host: &str) -> ExternalResult<()> {
        let known_hosts = self.ssh_dir(account).join("known_hosts");
        let line = format!(
            "ssh-keyscan -H {} >> {}",
            shell_quote(host),
            shell_quote(&arg(&known_hosts))
        );
        self.runner
            .run_checked(&CommandSpec::shell("ssh-keyscan", line).as_user(account))
            .await?;
        Ok(())
    }
}

/// A git repository of public keys on a remote host, written over ssh as
/// the deploy account and committed and pushed after each copy.
pub struct RemoteKeyRegistry {
    runner: Arc<dyn CommandRunner>,
    account: String,
    config: Option<KeyRegistryConfig>,
}

impl RemoteKeyRegistry {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        account: impl Into<String>,
        config: Option<KeyRegistryConfig>,
    ) -> Self {
        Self {
            runner,
            account: account.into(),
            config,
        }
    }
}

/// Remote shell script storing `public_key` as `<keydir>/<identifier>.pub`
/// and publishing it. Committing is skipped when the key is unchanged.
fn publish_script(keydir: &str, identifier: &str, public_key: &str) -> String {
    let file = format!("{}.pub", identifier);
    format!(
        "cd {dir} && printf '%s\\n' {key} > {file} && git add {file} && \
         (git diff --cached --quiet || git commit -q -m {message}) && git push -q",
        dir = shell_quote(keydir),
        key = shell_quote(public_key.trim()),
        file = shell_quote(&file),
        message = shell_quote(&format!("Add deploy key {}", identifier)),
    )
}

#[async_trait]
impl KeyRegistry for RemoteKeyRegistry {
    async fn publish_key(&self, host_identifier: &str, public_key: &str) -> ExternalResult<()> {
        let config = self.config.as_ref().ok_or_else(|| ExternalError::Unavailable {
            service: "key registry".to_string(),
            reason: "no key_registry configured".to_string(),
        })?;
        let script = publish_script(&config.keydir, host_identifier, public_key);
        let spec = CommandSpec::new(
            "publish deploy key",
            [
                "ssh".to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                config.remote.clone(),
                script,
            ],
        )
        .as_user(self.account.as_str());
        self.runner.run_checked(&spec).await?;
        info!(remote = %config.remote, identifier = %host_identifier, "deploy key pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_script_quotes_key() {
        let script = publish_script("keydir", "deploy@web1-example.com", "ssh-rsa AAAA deploy\n");
        assert!(script.starts_with("cd keydir && "));
        assert!(script.contains("'ssh-rsa AAAA deploy' > deploy@web1-example.com.pub"));
        assert!(script.contains("git push"));
    }

    #[test]
    fn test_key_paths() {
        let store = SshKeyStore {
            runner: Arc::new(crate::command::ShellRunner::new()),
            home_root: PathBuf::from("/home"),
        };
        assert_eq!(
            store.private_key("deploy"),
            PathBuf::from("/home/deploy/.ssh/id_rsa")
        );
        assert_eq!(
            store.public_key_path("deploy"),
            PathBuf::from("/home/deploy/.ssh/id_rsa.pub")
        );
    }
}
