//! Process execution on the local host.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use railyard_core::collaborators::{
    CommandOutput, CommandRunner, CommandSpec, ExternalError, ExternalResult,
};
use tokio::process::Command;
use tracing::debug;

/// Runs commands through `tokio::process`.
///
/// A command with `run_as` set is executed through `sudo -n -u <user>`, with
/// its environment passed on the `env` command line since sudo resets it.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    switch_user: bool,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self { switch_user: true }
    }

    /// Run everything as the current user and ignore `run_as`. For hosts
    /// where the orchestrator already runs as the deploy account.
    pub fn without_user_switch() -> Self {
        Self { switch_user: false }
    }

    /// The argv actually executed for `spec`.
    pub fn argv(&self, spec: &CommandSpec) -> Vec<String> {
        match (&spec.run_as, self.switch_user) {
            (Some(user), true) => {
                let mut argv = vec![
                    "sudo".to_string(),
                    "-n".to_string(),
                    "-H".to_string(),
                    "-u".to_string(),
                    user.clone(),
                    "--".to_string(),
                ];
                if !spec.env.is_empty() {
                    argv.push("env".to_string());
                    argv.extend(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)));
                }
                argv.extend(spec.argv.iter().cloned());
                argv
            }
            _ => spec.argv.clone(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, spec: &CommandSpec) -> ExternalResult<CommandOutput> {
        let start = Instant::now();
        let argv = self.argv(spec);
        let Some((exe, args)) = argv.split_first() else {
            return Err(ExternalError::Other(format!(
                "command '{}' is empty",
                spec.label
            )));
        };

        debug!(label = %spec.label, command = %argv.join(" "), "running command");
        let mut command = Command::new(exe);
        command
            .args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        let child = command.spawn()?;

        let output = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ExternalError::Timeout {
                    operation: spec.label.clone(),
                    limit_ms: limit.as_millis() as u64,
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
