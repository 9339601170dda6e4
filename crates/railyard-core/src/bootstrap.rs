//! One-time provisioning of the deploy account and its SSH key.
//!
//! The graph is re-run on every deploy. On a fresh host `create-account`
//! converges and notifies `generate-keypair`, which in turn notifies
//! `register-host-key` and `publish-public-key`. Once the account exists the
//! whole graph is a no-op and the key registry is never contacted.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use crate::collaborators::{
    AccountManager, Collaborators, ExternalError, ExternalResult, KeyRegistry, KeyStore,
};
use crate::domain::config::{DeployConfig, TimeoutConfig};
use crate::domain::error::{RailyardError, Result};
use crate::graph::{ActionNode, Convergence, ConvergenceGraph, IntendedState, NodeAction, Timing};

pub const CREATE_ACCOUNT: &str = "create-account";
pub const CREATE_HOME_DIRECTORY: &str = "create-home-directory";
pub const CREATE_GROUP: &str = "create-group";
pub const GENERATE_KEYPAIR: &str = "generate-keypair";
pub const REGISTER_HOST_KEY: &str = "register-host-key";
pub const PUBLISH_PUBLIC_KEY: &str = "publish-public-key";

/// Name under which this host's deploy key is published:
/// `deploy@<fqdn with its first '.' replaced by '-'>`.
pub fn host_identifier(fqdn: &str) -> String {
    format!("deploy@{}", fqdn.replacen('.', "-", 1))
}

/// Host part of a git remote.
///
/// Understands scp-like remotes (`git@github.com:acme/shop.git`) and URLs
/// with a scheme (`ssh://git@host:2222/acme/shop.git`,
/// `https://host/acme/shop.git`). Local paths have no host.
pub fn repository_host(repository: &str) -> Option<String> {
    let url = Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://(?:[^@/]+@)?([^:/]+)").ok()?;
    if let Some(caps) = url.captures(repository) {
        return caps.get(1).map(|m| m.as_str().to_string());
    }
    let scp = Regex::new(r"^(?:[^@/:]+@)?([^:/]+):").ok()?;
    scp.captures(repository)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Build the bootstrap graph for `config`.
///
/// Fails before any node exists when no key registry is configured, since
/// the publish step only ever fires on the run that creates the account.
pub fn build_bootstrap_graph(
    config: &DeployConfig,
    collaborators: &Collaborators,
) -> Result<ConvergenceGraph> {
    if config.key_registry.is_none() {
        return Err(RailyardError::Configuration(
            "key_registry is required".to_string(),
        ));
    }
    let owner = config.owner.clone();
    let group = config.group.clone();
    let home = config.home_dir();
    let local = TimeoutConfig::deadline(config.timeouts.command);
    let remote = TimeoutConfig::deadline(config.timeouts.remote);
    let accounts = collaborators.accounts.clone();
    let keys = collaborators.keys.clone();

    let account = IntendedState::new()
        .with("user", owner.as_str())
        .with("home", home.display().to_string());

    let mut graph = ConvergenceGraph::new("bootstrap");
    graph.add_node(
        ActionNode::run_if_divergent(
            CREATE_ACCOUNT,
            Arc::new(CreateAccount {
                accounts: accounts.clone(),
                user: owner.clone(),
                home: home.clone(),
            }),
        )
        .with_intended(account.clone())
        .with_timeout(local),
    )?;
    graph.add_node(
        ActionNode::run_if_divergent(
            CREATE_HOME_DIRECTORY,
            Arc::new(HomeDirectory {
                accounts: accounts.clone(),
                path: home.clone(),
                owner: owner.clone(),
                group: group.clone(),
            }),
        )
        .with_intended(account.with("group", group.as_str()))
        .with_timeout(local),
    )?;
    graph.add_node(
        ActionNode::run_if_divergent(
            CREATE_GROUP,
            Arc::new(GroupMembership {
                accounts,
                group: group.clone(),
                member: owner.clone(),
            }),
        )
        .with_intended(
            IntendedState::new()
                .with("group", group.as_str())
                .with("member", owner.as_str()),
        )
        .with_timeout(local),
    )?;
    graph.add_node(
        ActionNode::reactive(
            GENERATE_KEYPAIR,
            Arc::new(GenerateKeypair {
                keys: keys.clone(),
                account: owner.clone(),
            }),
        )
        .with_timeout(local),
    )?;
    graph.add_node(
        ActionNode::reactive(
            REGISTER_HOST_KEY,
            Arc::new(RegisterHostKey {
                keys: keys.clone(),
                account: owner.clone(),
                host: repository_host(&config.deploy.repository),
            }),
        )
        .with_timeout(remote),
    )?;
    graph.add_node(
        ActionNode::reactive(
            PUBLISH_PUBLIC_KEY,
            Arc::new(PublishPublicKey {
                keys,
                registry: collaborators.key_registry.clone(),
                account: owner,
                identifier: host_identifier(&config.host_fqdn),
            }),
        )
        .with_timeout(remote),
    )?;

    graph.add_edge(CREATE_ACCOUNT, GENERATE_KEYPAIR, Timing::Deferred)?;
    graph.add_edge(GENERATE_KEYPAIR, REGISTER_HOST_KEY, Timing::Deferred)?;
    graph.add_edge(GENERATE_KEYPAIR, PUBLISH_PUBLIC_KEY, Timing::Deferred)?;
    Ok(graph)
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

struct CreateAccount {
    accounts: Arc<dyn AccountManager>,
    user: String,
    home: PathBuf,
}

#[async_trait]
impl NodeAction for CreateAccount {
    async fn in_sync(&self, _intended: &IntendedState) -> ExternalResult<bool> {
        self.accounts.user_exists(&self.user).await
    }

    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        info!(user = %self.user, "creating deploy account");
        self.accounts.create_user(&self.user, &self.home).await?;
        Ok(Convergence::Changed)
    }
}

struct HomeDirectory {
    accounts: Arc<dyn AccountManager>,
    path: PathBuf,
    owner: String,
    group: String,
}

#[async_trait]
impl NodeAction for HomeDirectory {
    async fn in_sync(&self, _intended: &IntendedState) -> ExternalResult<bool> {
        self.accounts
            .home_matches(&self.path, &self.owner, &self.group)
            .await
    }

    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        self.accounts
            .ensure_home(&self.path, &self.owner, &self.group)
            .await?;
        Ok(Convergence::Changed)
    }
}

struct GroupMembership {
    accounts: Arc<dyn AccountManager>,
    group: String,
    member: String,
}

#[async_trait]
impl NodeAction for GroupMembership {
    async fn in_sync(&self, _intended: &IntendedState) -> ExternalResult<bool> {
        self.accounts
            .group_has_member(&self.group, &self.member)
            .await
    }

    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        self.accounts
            .ensure_group(&self.group, &self.member)
            .await?;
        Ok(Convergence::Changed)
    }
}

/// Existing key material is never replaced.
struct GenerateKeypair {
    keys: Arc<dyn KeyStore>,
    account: String,
}

#[async_trait]
impl NodeAction for GenerateKeypair {
    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        if self.keys.has_keypair(&self.account).await? {
            debug!(account = %self.account, "keypair already present");
            return Ok(Convergence::Unchanged);
        }
        self.keys.generate_keypair(&self.account).await?;
        info!(account = %self.account, "generated deploy keypair");
        Ok(Convergence::Changed)
    }
}

struct RegisterHostKey {
    keys: Arc<dyn KeyStore>,
    account: String,
    host: Option<String>,
}

#[async_trait]
impl NodeAction for RegisterHostKey {
    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        let Some(host) = &self.host else {
            debug!("repository has no remote host; nothing to register");
            return Ok(Convergence::Unchanged);
        };
        self.keys.add_known_host(&self.account, host).await?;
        Ok(Convergence::Changed)
    }
}

struct PublishPublicKey {
    keys: Arc<dyn KeyStore>,
    registry: Arc<dyn KeyRegistry>,
    account: String,
    identifier: String,
}

#[async_trait]
impl NodeAction for PublishPublicKey {
    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        let public = self
            .keys
            .public_key(&self.account)
            .await?
            .ok_or_else(|| {
                ExternalError::Other(format!("account {} has no public key", self.account))
            })?;
        self.registry.publish_key(&self.identifier, &public).await?;
        info!(identifier = %self.identifier, "published deploy key");
        Ok(Convergence::Changed)
    }
}
