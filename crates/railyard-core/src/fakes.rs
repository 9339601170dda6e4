//! In-memory fakes for the collaborator traits (testing only)
//!
//! Every fake records the calls it receives and can be told to fail a named
//! operation, so graph and workflow behaviour can be asserted without
//! touching the host. [`FakeHost`] bundles one of each.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::collaborators::*;
use crate::domain::release_sort_key;

/// Set of operation names that should fail.
#[derive(Debug, Default)]
struct FailSwitch(Mutex<HashSet<String>>);

impl FailSwitch {
    fn arm(&self, op: &str) {
        self.0.lock().unwrap().insert(op.to_string());
    }

    fn check(&self, op: &str) -> ExternalResult<()> {
        if self.0.lock().unwrap().contains(op) {
            return Err(ExternalError::Other(format!("injected failure: {}", op)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeCommandRunner
// ---------------------------------------------------------------------------

/// Records every command; labels marked with [`FakeCommandRunner::fail`]
/// exit with status 1.
#[derive(Debug, Default)]
pub struct FakeCommandRunner {
    commands: Mutex<Vec<CommandSpec>>,
    stdout: Mutex<HashMap<String, String>>,
    failing: FailSwitch,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, label: &str) {
        self.failing.arm(label);
    }

    /// Successful runs of `label` print `stdout`.
    pub fn respond(&self, label: &str, stdout: &str) {
        self.stdout
            .lock()
            .unwrap()
            .insert(label.to_string(), stdout.to_string());
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        self.commands.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.label.clone())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, command: &CommandSpec) -> ExternalResult<CommandOutput> {
        self.commands.lock().unwrap().push(command.clone());
        let exit_code = if self.failing.check(&command.label).is_err() {
            1
        } else {
            0
        };
        let stdout = if exit_code == 0 {
            self.stdout
                .lock()
                .unwrap()
                .get(&command.label)
                .cloned()
                .unwrap_or_default()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("{} failed", command.label)
            },
            duration_ms: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// FakeFetcher
// ---------------------------------------------------------------------------

/// Resolves revisions from a table (`commit-<rev>` when unmapped) and
/// records checkouts.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    revisions: Mutex<HashMap<String, String>>,
    fetches: Mutex<Vec<FetchRequest>>,
    delay: Mutex<Option<Duration>>,
    failing: FailSwitch,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_revision(&self, revision: &str, commit: &str) {
        self.revisions
            .lock()
            .unwrap()
            .insert(revision.to_string(), commit.to_string());
    }

    /// Make every checkout take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Fail `resolve` or `fetch`.
    pub fn fail(&self, op: &str) {
        self.failing.arm(op);
    }

    pub fn fetches(&self) -> Vec<FetchRequest> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl RepositoryFetcher for FakeFetcher {
    async fn resolve(&self, _repository: &str, revision: &str) -> ExternalResult<String> {
        self.failing.check("resolve")?;
        Ok(self
            .revisions
            .lock()
            .unwrap()
            .get(revision)
            .cloned()
            .unwrap_or_else(|| format!("commit-{}", revision)))
    }

    async fn fetch(&self, request: &FetchRequest) -> ExternalResult<()> {
        self.fetches.lock().unwrap().push(request.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.failing.check("fetch")
    }
}

// ---------------------------------------------------------------------------
// FakeInstaller
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeInstaller {
    requests: Mutex<Vec<InstallRequest>>,
    failing: FailSwitch,
}

impl FakeInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.failing.arm("install");
    }

    pub fn requests(&self) -> Vec<InstallRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DependencyInstaller for FakeInstaller {
    async fn install(&self, request: &InstallRequest) -> ExternalResult<()> {
        self.requests.lock().unwrap().push(request.clone());
        self.failing.check("install")
    }
}

// ---------------------------------------------------------------------------
// FakeTemplates
// ---------------------------------------------------------------------------

/// Keeps rendered files in memory. Content is the template id followed by
/// the sorted variables, so any variable change changes the file.
#[derive(Debug, Default)]
pub struct FakeTemplates {
    files: Mutex<HashMap<PathBuf, String>>,
    renders: Mutex<Vec<PathBuf>>,
    failing: FailSwitch,
}

impl FakeTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail renders of `target`.
    pub fn fail(&self, target: &Path) {
        self.failing.arm(&target.display().to_string());
    }

    /// Overwrite a file as if someone edited it by hand.
    pub fn tamper(&self, target: &Path) {
        self.files
            .lock()
            .unwrap()
            .insert(target.to_path_buf(), "edited by hand".to_string());
    }

    pub fn content(&self, target: &Path) -> Option<String> {
        self.files.lock().unwrap().get(target).cloned()
    }

    /// Targets written so far, in order.
    pub fn renders(&self) -> Vec<PathBuf> {
        self.renders.lock().unwrap().clone()
    }

    fn rendered(request: &TemplateRequest) -> String {
        let mut out = format!("# {}\n", request.template);
        for (key, value) in &request.variables {
            out.push_str(&format!("{}={}\n", key, value));
        }
        out
    }
}

#[async_trait]
impl TemplateRenderer for FakeTemplates {
    async fn would_change(&self, request: &TemplateRequest) -> ExternalResult<bool> {
        let wanted = Self::rendered(request);
        let files = self.files.lock().unwrap();
        Ok(files.get(&request.target) != Some(&wanted))
    }

    async fn render(&self, request: &TemplateRequest) -> ExternalResult<bool> {
        self.failing.check(&request.target.display().to_string())?;
        let wanted = Self::rendered(request);
        let mut files = self.files.lock().unwrap();
        let changed = files.get(&request.target) != Some(&wanted);
        files.insert(request.target.clone(), wanted);
        self.renders.lock().unwrap().push(request.target.clone());
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// FakeFilesystem
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FsState {
    layout: Vec<String>,
    current: Option<PathBuf>,
    /// Release directory → recorded revision.
    releases: BTreeMap<PathBuf, Option<String>>,
    cutovers: Vec<PathBuf>,
    removed: Vec<PathBuf>,
    purged: Vec<PathBuf>,
    created: Vec<PathBuf>,
    links: Vec<(PathBuf, PathBuf)>,
}

/// In-memory release tree. A release directory exists once its revision has
/// been written or it was seeded with [`FakeFilesystem::with_release`].
#[derive(Debug, Default)]
pub struct FakeFilesystem {
    state: Mutex<FsState>,
    failing: FailSwitch,
}

impl FakeFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_release(&self, path: impl Into<PathBuf>, revision: &str) {
        self.state
            .lock()
            .unwrap()
            .releases
            .insert(path.into(), Some(revision.to_string()));
    }

    pub fn with_current(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().current = Some(path.into());
    }

    /// Fail a trait method by name, e.g. `point_current`.
    pub fn fail(&self, op: &str) {
        self.failing.arm(op);
    }

    pub fn current(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().current.clone()
    }

    /// Release directories, oldest first.
    pub fn releases(&self) -> Vec<PathBuf> {
        let mut releases: Vec<PathBuf> =
            self.state.lock().unwrap().releases.keys().cloned().collect();
        releases.sort_by_key(|p| release_sort_key(p));
        releases
    }

    /// Every target `current` was pointed at, in order.
    pub fn cutovers(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().cutovers.clone()
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn purged(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().purged.clone()
    }

    pub fn created(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().created.clone()
    }

    /// `(shared source, release destination)` pairs.
    pub fn links(&self) -> Vec<(PathBuf, PathBuf)> {
        self.state.lock().unwrap().links.clone()
    }

    pub fn layout(&self) -> Vec<String> {
        self.state.lock().unwrap().layout.clone()
    }
}

impl ReleaseFilesystem for FakeFilesystem {
    fn ensure_layout(&self, shared_dirs: &[&str]) -> ExternalResult<()> {
        self.failing.check("ensure_layout")?;
        let mut state = self.state.lock().unwrap();
        for dir in shared_dirs {
            if !state.layout.iter().any(|d| d == dir) {
                state.layout.push(dir.to_string());
            }
        }
        Ok(())
    }

    fn current_target(&self) -> ExternalResult<Option<PathBuf>> {
        self.failing.check("current_target")?;
        Ok(self.state.lock().unwrap().current.clone())
    }

    fn point_current(&self, target: &Path) -> ExternalResult<()> {
        self.failing.check("point_current")?;
        let mut state = self.state.lock().unwrap();
        state.current = Some(target.to_path_buf());
        state.cutovers.push(target.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.state.lock().unwrap().releases.contains_key(path)
    }

    fn list_releases(&self) -> ExternalResult<Vec<PathBuf>> {
        self.failing.check("list_releases")?;
        Ok(self.releases())
    }

    fn remove_release(&self, release: &Path) -> ExternalResult<()> {
        self.failing.check("remove_release")?;
        let mut state = self.state.lock().unwrap();
        if state.releases.remove(release).is_some() {
            state.removed.push(release.to_path_buf());
        }
        Ok(())
    }

    fn purge(&self, release: &Path, paths: &[PathBuf]) -> ExternalResult<()> {
        self.failing.check("purge")?;
        let mut state = self.state.lock().unwrap();
        state.purged.extend(paths.iter().map(|p| release.join(p)));
        Ok(())
    }

    fn create_dirs(&self, release: &Path, paths: &[PathBuf]) -> ExternalResult<()> {
        self.failing.check("create_dirs")?;
        let mut state = self.state.lock().unwrap();
        state.created.extend(paths.iter().map(|p| release.join(p)));
        Ok(())
    }

    fn link_shared(
        &self,
        release: &Path,
        links: &BTreeMap<String, PathBuf>,
    ) -> ExternalResult<()> {
        self.failing.check("link_shared")?;
        let mut state = self.state.lock().unwrap();
        for (shared, dest) in links {
            state
                .links
                .push((PathBuf::from("shared").join(shared), release.join(dest)));
        }
        Ok(())
    }

    fn write_revision(&self, release: &Path, revision: &str) -> ExternalResult<()> {
        self.failing.check("write_revision")?;
        self.state
            .lock()
            .unwrap()
            .releases
            .insert(release.to_path_buf(), Some(revision.to_string()));
        Ok(())
    }

    fn read_revision(&self, release: &Path) -> ExternalResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .releases
            .get(release)
            .cloned()
            .flatten())
    }
}

// ---------------------------------------------------------------------------
// FakeSupervisor
// ---------------------------------------------------------------------------

/// Records reloads and restarts. Fail `reload` or `restart`.
#[derive(Debug, Default)]
pub struct FakeSupervisor {
    reloads: Mutex<u32>,
    restarts: Mutex<Vec<String>>,
    failing: FailSwitch,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, op: &str) {
        self.failing.arm(op);
    }

    pub fn reloads(&self) -> u32 {
        *self.reloads.lock().unwrap()
    }

    pub fn restarts(&self) -> Vec<String> {
        self.restarts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn reload_configuration(&self) -> ExternalResult<()> {
        self.failing.check("reload")?;
        *self.reloads.lock().unwrap() += 1;
        Ok(())
    }

    async fn restart(&self, service: &str) -> ExternalResult<()> {
        self.failing.check("restart")?;
        self.restarts.lock().unwrap().push(service.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeAccounts
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AccountState {
    users: HashSet<String>,
    homes: HashMap<PathBuf, (String, String)>,
    groups: HashMap<String, BTreeSet<String>>,
    calls: Vec<String>,
}

/// In-memory users, home directories and groups. A created user's home is
/// owned by `user:user`.
#[derive(Debug, Default)]
pub struct FakeAccounts {
    state: Mutex<AccountState>,
    failing: FailSwitch,
}

impl FakeAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `create_user`, `ensure_home` or `ensure_group`.
    pub fn fail(&self, op: &str) {
        self.failing.arm(op);
    }

    /// Mutating calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl AccountManager for FakeAccounts {
    async fn user_exists(&self, user: &str) -> ExternalResult<bool> {
        Ok(self.state.lock().unwrap().users.contains(user))
    }

    async fn create_user(&self, user: &str, home: &Path) -> ExternalResult<()> {
        self.failing.check("create_user")?;
        let mut state = self.state.lock().unwrap();
        state.users.insert(user.to_string());
        state
            .homes
            .insert(home.to_path_buf(), (user.to_string(), user.to_string()));
        state.calls.push(format!("create_user {}", user));
        Ok(())
    }

    async fn home_matches(&self, path: &Path, owner: &str, group: &str) -> ExternalResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .homes
            .get(path)
            .map(|(o, g)| o == owner && g == group)
            .unwrap_or(false))
    }

    async fn ensure_home(&self, path: &Path, owner: &str, group: &str) -> ExternalResult<()> {
        self.failing.check("ensure_home")?;
        let mut state = self.state.lock().unwrap();
        state
            .homes
            .insert(path.to_path_buf(), (owner.to_string(), group.to_string()));
        state.calls.push(format!("ensure_home {}", path.display()));
        Ok(())
    }

    async fn group_has_member(&self, group: &str, member: &str) -> ExternalResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .groups
            .get(group)
            .map(|members| members.contains(member))
            .unwrap_or(false))
    }

    async fn ensure_group(&self, group: &str, member: &str) -> ExternalResult<()> {
        self.failing.check("ensure_group")?;
        let mut state = self.state.lock().unwrap();
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(member.to_string());
        state.calls.push(format!("ensure_group {} {}", group, member));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeKeyStore / FakeKeyRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeKeyStore {
    keys: Mutex<HashMap<String, String>>,
    generated: Mutex<u32>,
    known_hosts: Mutex<Vec<(String, String)>>,
    failing: FailSwitch,
}

impl FakeKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `generate_keypair` or `add_known_host`.
    pub fn fail(&self, op: &str) {
        self.failing.arm(op);
    }

    pub fn generated(&self) -> u32 {
        *self.generated.lock().unwrap()
    }

    /// `(account, host)` pairs added to known hosts.
    pub fn known_hosts(&self) -> Vec<(String, String)> {
        self.known_hosts.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyStore for FakeKeyStore {
    async fn has_keypair(&self, account: &str) -> ExternalResult<bool> {
        Ok(self.keys.lock().unwrap().contains_key(account))
    }

    async fn generate_keypair(&self, account: &str) -> ExternalResult<String> {
        self.failing.check("generate_keypair")?;
        let public = format!("ssh-rsa AAAAfake {}", account);
        self.keys
            .lock()
            .unwrap()
            .insert(account.to_string(), public.clone());
        *self.generated.lock().unwrap() += 1;
        Ok(public)
    }

    async fn public_key(&self, account: &str) -> ExternalResult<Option<String>> {
        Ok(self.keys.lock().unwrap().get(account).cloned())
    }

    async fn add_known_host(&self, account: &str, host: &str) -> ExternalResult<()> {
        self.failing.check("add_known_host")?;
        self.known_hosts
            .lock()
            .unwrap()
            .push((account.to_string(), host.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeKeyRegistry {
    published: Mutex<Vec<(String, String)>>,
    failing: FailSwitch,
}

impl FakeKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.failing.arm("publish");
    }

    /// `(host identifier, public key)` pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyRegistry for FakeKeyRegistry {
    async fn publish_key(&self, host_identifier: &str, public_key: &str) -> ExternalResult<()> {
        self.failing.check("publish")?;
        self.published
            .lock()
            .unwrap()
            .push((host_identifier.to_string(), public_key.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeHost
// ---------------------------------------------------------------------------

/// One fake of each collaborator, shared with the code under test.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    pub commands: Arc<FakeCommandRunner>,
    pub fetcher: Arc<FakeFetcher>,
    pub installer: Arc<FakeInstaller>,
    pub templates: Arc<FakeTemplates>,
    pub filesystem: Arc<FakeFilesystem>,
    pub app_supervisor: Arc<FakeSupervisor>,
    pub proxy_supervisor: Arc<FakeSupervisor>,
    pub accounts: Arc<FakeAccounts>,
    pub keys: Arc<FakeKeyStore>,
    pub key_registry: Arc<FakeKeyRegistry>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            commands: self.commands.clone(),
            fetcher: self.fetcher.clone(),
            installer: self.installer.clone(),
            templates: self.templates.clone(),
            filesystem: self.filesystem.clone(),
            app_supervisor: self.app_supervisor.clone(),
            proxy_supervisor: self.proxy_supervisor.clone(),
            accounts: self.accounts.clone(),
            keys: self.keys.clone(),
            key_registry: self.key_registry.clone(),
        }
    }
}
