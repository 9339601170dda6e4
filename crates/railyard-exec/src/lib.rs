//! Railyard Exec - host-backed collaborators
//!
//! Implements the `railyard-core` collaborator traits against the local
//! machine:
//! - processes through `tokio::process`, optionally as another user via sudo
//! - release checkouts with `git`
//! - the release tree with an atomic `current` symlink swap
//! - accounts, SSH keys and the remote key registry
//! - upstart, runit and sysv supervisors
//! - template rendering and dependency installation

pub mod account;
pub mod command;
pub mod fs;
pub mod git;
pub mod host;
pub mod installer;
pub mod keys;
pub mod supervisor;
pub mod template;

// Re-export key types
pub use account::SystemAccounts;
pub use command::{shell_quote, ShellRunner};
pub use fs::LocalReleaseFs;
pub use git::GitFetcher;
pub use host::{collaborators_with, host_collaborators};
pub use installer::BundlerInstaller;
pub use keys::{RemoteKeyRegistry, SshKeyStore};
pub use supervisor::SystemSupervisor;
pub use template::FileTemplateRenderer;
