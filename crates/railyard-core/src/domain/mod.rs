//! Domain models for Railyard.
//!
//! Canonical definitions for the core entities:
//! - `DeployConfig`: the single explicit configuration for a host
//! - `Release`: one attempt at deploying a revision, with its stage history
//! - `RailyardError`: the error taxonomy shared by every layer

pub mod config;
pub mod error;
pub mod release;

pub use config::{
    AppConfig, DatabaseConfig, DeployAction, DeployConfig, DeploySettings, KeyRegistryConfig,
    NginxConfig, RestartCommand, SupervisorConfig, SupervisorProvider, TemplateConfig,
    TimeoutConfig, UnicornConfig,
};
pub use error::{RailyardError, Result};
pub use release::{
    release_sort_key, Release, ReleaseOutcome, ReleaseState, StageOutcome, StageRecord,
};
