//! Deployment configuration.
//!
//! A single explicit [`DeployConfig`] is loaded once (JSON on disk) and passed
//! into graph and workflow construction. Every optional field documents its
//! default; nothing is read from ambient global state.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::{RailyardError, Result};

/// What the release workflow should do this run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeployAction {
    /// Cut a release unless the revision is already current.
    #[default]
    Deploy,
    /// Always cut a new release.
    ForceDeploy,
    /// Return `current` to the release before it.
    Rollback,
}

/// How the application is restarted after cutover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RestartCommand {
    /// Supervisor-managed restart of the named service.
    Service { service: String },
    /// Raw shell command, run as the deploy owner inside the release.
    Shell(String),
}

/// Service supervisor flavour.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorProvider {
    #[default]
    Upstart,
    Runit,
    Sysv,
}

/// Application identity. `name` must be a single token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub name: String,
    /// Deploy root; releases, shared and current live beneath it.
    pub path: PathBuf,
    /// Default: `production`.
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Release workflow options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploySettings {
    /// Default: `deploy`.
    #[serde(default)]
    pub action: DeployAction,
    pub repository: String,
    /// Branch, tag or commit. Default: `HEAD`.
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Private key material used only for the checkout. Default: none.
    #[serde(default)]
    pub deploy_key: Option<String>,
    /// Default: false.
    #[serde(default)]
    pub enable_submodules: bool,
    /// Default: false.
    #[serde(default)]
    pub shallow_clone: bool,
    /// Default: false.
    #[serde(default)]
    pub migrate: bool,
    /// Default: `rake db:migrate`.
    #[serde(default = "default_migration_command")]
    pub migration_command: String,
    /// Default: supervisor restart of `unicorn_<app>`.
    #[serde(default)]
    pub restart_command: Option<RestartCommand>,
    /// Default: false.
    #[serde(default)]
    pub symlink_before_migrate: bool,
    /// Release-relative paths removed before linking. Default: `log`,
    /// `tmp/pids`, `public/system`.
    #[serde(default = "default_purge_before_symlink")]
    pub purge_before_symlink: Vec<PathBuf>,
    /// Release-relative directories created before linking. Default: `tmp`,
    /// `public`, `config`.
    #[serde(default = "default_create_dirs_before_symlink")]
    pub create_dirs_before_symlink: Vec<PathBuf>,
    /// `shared/<key>` is linked to `release/<value>`. Default: `system` →
    /// `public/system`, `pids` → `tmp/pids`, `log` → `log`.
    #[serde(default = "default_symlinks")]
    pub symlinks: BTreeMap<String, PathBuf>,
    /// Release directories kept on disk, current included. Default: 2.
    #[serde(default = "default_keep_releases")]
    pub keep_releases: usize,
    /// Run the bundle step while staging. Default: true.
    #[serde(default = "default_true")]
    pub bundler: bool,
    /// Default: `bundle`.
    #[serde(default = "default_bundle_command")]
    pub bundle_command: String,
    /// Pass `--deployment` to the bundle step. Default: true.
    #[serde(default = "default_true")]
    pub bundler_deployment: bool,
    /// Default: `development`, `test`.
    #[serde(default = "default_without_groups")]
    pub bundler_without_groups: Vec<String>,
    /// Default: false.
    #[serde(default)]
    pub precompile_assets: bool,
}

/// Database connection rendered into `database.yml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Default: `postgresql`.
    #[serde(default = "default_db_adapter")]
    pub adapter: String,
    /// Default: `localhost`.
    #[serde(default = "default_db_host")]
    pub host: String,
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Application server options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnicornConfig {
    /// Default: 2.
    #[serde(default = "default_workers")]
    pub worker_processes: u32,
    /// Seconds. Default: 60.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout: u32,
    /// Default: true.
    #[serde(default = "default_true")]
    pub preload_app: bool,
    /// Default: 8080.
    #[serde(default = "default_app_port")]
    pub port: u16,
    /// Default: true.
    #[serde(default = "default_true")]
    pub bundler: bool,
    /// Default: `bundle`.
    #[serde(default = "default_bundle_command")]
    pub bundle_command: String,
    /// Default: `unicorn`.
    #[serde(default = "default_unicorn_bin")]
    pub unicorn_bin: String,
    /// Default: `<path>/shared/config/unicorn.rb`.
    #[serde(default)]
    pub unicorn_config: Option<PathBuf>,
}

impl Default for UnicornConfig {
    fn default() -> Self {
        Self {
            worker_processes: default_workers(),
            worker_timeout: default_worker_timeout(),
            preload_app: true,
            port: default_app_port(),
            bundler: true,
            bundle_command: default_bundle_command(),
            unicorn_bin: default_unicorn_bin(),
            unicorn_config: None,
        }
    }
}

/// Reverse proxy options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NginxConfig {
    /// Default: `www-data`.
    #[serde(default = "default_nginx_user")]
    pub user: String,
    /// Default: `www-data`.
    #[serde(default = "default_nginx_user")]
    pub group: String,
    /// Default: `_`.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Default: 80.
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    /// Upstream port. Default: the unicorn port.
    #[serde(default)]
    pub application_port: Option<u16>,
    /// URL prefix → directory under `public/`, e.g. `/img` → `images`.
    #[serde(default)]
    pub static_files: BTreeMap<String, String>,
    /// Default: false.
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub ssl_certificate: Option<PathBuf>,
    #[serde(default)]
    pub ssl_certificate_key: Option<PathBuf>,
    /// Template id. Default: `nginx.conf`.
    #[serde(default = "default_nginx_template")]
    pub template: String,
    /// Default: `/etc/nginx/sites-available/<app>.conf`.
    #[serde(default)]
    pub site_path: Option<PathBuf>,
    /// Default: `nginx`.
    #[serde(default = "default_nginx_service")]
    pub service: String,
    /// Default: `sysv`.
    #[serde(default = "default_proxy_provider")]
    pub provider: SupervisorProvider,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            user: default_nginx_user(),
            group: default_nginx_user(),
            server_name: default_server_name(),
            port: default_proxy_port(),
            application_port: None,
            static_files: BTreeMap::new(),
            ssl: false,
            ssl_certificate: None,
            ssl_certificate_key: None,
            template: default_nginx_template(),
            site_path: None,
            service: default_nginx_service(),
            provider: default_proxy_provider(),
        }
    }
}

/// Application process supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SupervisorConfig {
    /// Default: `upstart`.
    #[serde(default)]
    pub provider: SupervisorProvider,
    /// Default: `unicorn_<app>`.
    #[serde(default)]
    pub service_name: Option<String>,
}

/// Remote registry that accepts deploy keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRegistryConfig {
    /// `user@host` reachable over ssh.
    pub remote: String,
    /// Directory on the remote holding `<identifier>.pub` files.
    pub keydir: String,
}

/// Where templates are loaded from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateConfig {
    /// Default: `/etc/railyard/templates`.
    #[serde(default = "default_template_dir")]
    pub directory: PathBuf,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            directory: default_template_dir(),
        }
    }
}

/// Deadlines for external calls, in seconds. Zero disables a deadline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Default: 600.
    #[serde(default = "default_fetch_secs")]
    pub fetch: u64,
    /// Default: 1800.
    #[serde(default = "default_install_secs")]
    pub install: u64,
    /// Local commands (account, template, fs helpers). Default: 120.
    #[serde(default = "default_command_secs")]
    pub command: u64,
    /// Default: 1800.
    #[serde(default = "default_install_secs")]
    pub migrate: u64,
    /// Default: 120.
    #[serde(default = "default_command_secs")]
    pub restart: u64,
    /// Remote key registry and key scans. Default: 60.
    #[serde(default = "default_remote_secs")]
    pub remote: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch: default_fetch_secs(),
            install: default_install_secs(),
            command: default_command_secs(),
            migrate: default_install_secs(),
            restart: default_command_secs(),
            remote: default_remote_secs(),
        }
    }
}

impl TimeoutConfig {
    /// Convert a seconds value into an optional deadline.
    pub fn deadline(secs: u64) -> Option<Duration> {
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

/// Complete deployment configuration for one application on one host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployConfig {
    pub app: AppConfig,
    /// Deploy account. Default: `deploy`.
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Deploy group. Default: `deploy`.
    #[serde(default = "default_owner")]
    pub group: String,
    /// Fully-qualified host name, used to name the published deploy key.
    pub host_fqdn: String,
    pub deploy: DeploySettings,
    /// OS packages installed while staging. Default: none.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Gems installed while staging; `bundler` is always added.
    #[serde(default)]
    pub gems: Vec<String>,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub unicorn: UnicornConfig,
    #[serde(default)]
    pub nginx: NginxConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Required; the deploy key is published here on first bootstrap.
    #[serde(default)]
    pub key_registry: Option<KeyRegistryConfig>,
    #[serde(default)]
    pub templates: TemplateConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl DeployConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Load and parse a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Reject invalid configuration before any node executes.
    pub fn validate(&self) -> Result<()> {
        let name = self.app.name.trim();
        if name.is_empty() {
            return Err(config_err("application name must not be empty"));
        }
        if self.app.name.split_whitespace().count() > 1 || name != self.app.name {
            return Err(config_err(format!(
                "application name must be one word long, got '{}'",
                self.app.name
            )));
        }
        if !self.app.path.is_absolute() {
            return Err(config_err(format!(
                "app.path must be absolute, got '{}'",
                self.app.path.display()
            )));
        }
        if self.owner.trim().is_empty() || self.group.trim().is_empty() {
            return Err(config_err("owner and group must not be empty"));
        }
        if self.deploy.repository.trim().is_empty() {
            return Err(config_err("deploy.repository must not be empty"));
        }
        if self.deploy.revision.trim().is_empty() {
            return Err(config_err("deploy.revision must not be empty"));
        }
        if self.deploy.migrate && self.deploy.migration_command.trim().is_empty() {
            return Err(config_err(
                "deploy.migration_command is required when migrate is enabled",
            ));
        }
        if self.deploy.keep_releases < 2 {
            return Err(config_err(format!(
                "deploy.keep_releases must be at least 2, got {}",
                self.deploy.keep_releases
            )));
        }
        if let Some(RestartCommand::Shell(cmd)) = &self.deploy.restart_command {
            if cmd.trim().is_empty() {
                return Err(config_err("deploy.restart_command must not be empty"));
            }
        }
        for path in self
            .deploy
            .purge_before_symlink
            .iter()
            .chain(self.deploy.create_dirs_before_symlink.iter())
            .chain(self.deploy.symlinks.values())
        {
            check_release_relative(path)?;
        }
        for key in self.deploy.symlinks.keys() {
            check_release_relative(Path::new(key))?;
        }
        let registry = self
            .key_registry
            .as_ref()
            .ok_or_else(|| config_err("key_registry is required"))?;
        if registry.remote.trim().is_empty() || registry.keydir.trim().is_empty() {
            return Err(config_err(
                "key_registry.remote and key_registry.keydir must not be empty",
            ));
        }
        if self.unicorn.worker_processes == 0 {
            return Err(config_err("unicorn.worker_processes must be positive"));
        }
        if self.nginx.ssl
            && (self.nginx.ssl_certificate.is_none() || self.nginx.ssl_certificate_key.is_none())
        {
            return Err(config_err(
                "nginx.ssl requires ssl_certificate and ssl_certificate_key",
            ));
        }
        Ok(())
    }

    /// Supervisor service name for the application process.
    pub fn service_name(&self) -> String {
        self.supervisor
            .service_name
            .clone()
            .unwrap_or_else(|| format!("unicorn_{}", self.app.name))
    }

    /// Effective restart command.
    pub fn restart_command(&self) -> RestartCommand {
        self.deploy
            .restart_command
            .clone()
            .unwrap_or_else(|| RestartCommand::Service {
                service: self.service_name(),
            })
    }

    /// Configured gems plus `bundler`, without duplicates.
    pub fn gems_with_bundler(&self) -> Vec<String> {
        let mut gems = self.gems.clone();
        if !gems.iter().any(|g| g == "bundler") {
            gems.push("bundler".to_string());
        }
        gems
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.app.path.join("releases")
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.app.path.join("shared")
    }

    pub fn current_link(&self) -> PathBuf {
        self.app.path.join("current")
    }

    pub fn home_dir(&self) -> PathBuf {
        Path::new("/home").join(&self.owner)
    }

    pub fn unicorn_config_path(&self) -> PathBuf {
        self.unicorn
            .unicorn_config
            .clone()
            .unwrap_or_else(|| self.shared_dir().join("config").join("unicorn.rb"))
    }

    pub fn nginx_site_path(&self) -> PathBuf {
        self.nginx.site_path.clone().unwrap_or_else(|| {
            PathBuf::from("/etc/nginx/sites-available").join(format!("{}.conf", self.app.name))
        })
    }

    pub fn application_port(&self) -> u16 {
        self.nginx.application_port.unwrap_or(self.unicorn.port)
    }
}

fn config_err(msg: impl Into<String>) -> RailyardError {
    RailyardError::Configuration(msg.into())
}

fn check_release_relative(path: &Path) -> Result<()> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.as_os_str().is_empty() || escapes {
        return Err(config_err(format!(
            "release paths must be relative and stay inside the release, got '{}'",
            path.display()
        )));
    }
    Ok(())
}

fn default_environment() -> String {
    "production".to_string()
}
fn default_revision() -> String {
    "HEAD".to_string()
}
fn default_migration_command() -> String {
    "rake db:migrate".to_string()
}
fn default_purge_before_symlink() -> Vec<PathBuf> {
    ["log", "tmp/pids", "public/system"]
        .iter()
        .map(PathBuf::from)
        .collect()
}
fn default_create_dirs_before_symlink() -> Vec<PathBuf> {
    ["tmp", "public", "config"].iter().map(PathBuf::from).collect()
}
fn default_symlinks() -> BTreeMap<String, PathBuf> {
    [
        ("system", "public/system"),
        ("pids", "tmp/pids"),
        ("log", "log"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), PathBuf::from(v)))
    .collect()
}
fn default_keep_releases() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_bundle_command() -> String {
    "bundle".to_string()
}
fn default_without_groups() -> Vec<String> {
    vec!["development".to_string(), "test".to_string()]
}
fn default_db_adapter() -> String {
    "postgresql".to_string()
}
fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_workers() -> u32 {
    2
}
fn default_worker_timeout() -> u32 {
    60
}
fn default_app_port() -> u16 {
    8080
}
fn default_unicorn_bin() -> String {
    "unicorn".to_string()
}
fn default_nginx_user() -> String {
    "www-data".to_string()
}
fn default_server_name() -> String {
    "_".to_string()
}
fn default_proxy_port() -> u16 {
    80
}
fn default_nginx_template() -> String {
    "nginx.conf".to_string()
}
fn default_nginx_service() -> String {
    "nginx".to_string()
}
fn default_proxy_provider() -> SupervisorProvider {
    SupervisorProvider::Sysv
}
fn default_template_dir() -> PathBuf {
    PathBuf::from("/etc/railyard/templates")
}
fn default_owner() -> String {
    "deploy".to_string()
}
fn default_fetch_secs() -> u64 {
    600
}
fn default_install_secs() -> u64 {
    1800
}
fn default_command_secs() -> u64 {
    120
}
fn default_remote_secs() -> u64 {
    60
}
