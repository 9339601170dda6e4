//! Configuration files rendered before each deploy.
//!
//! The supervisor's service definition reloads the supervisor immediately,
//! so the new definition is in force before anything uses it. Database and
//! application-server configs only latch a restart, which the deployer
//! performs once at the end. A changed proxy site restarts the proxy once.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::collaborators::{ExternalResult, TemplateRenderer, TemplateRequest};
use crate::domain::config::{DeployConfig, SupervisorProvider, TimeoutConfig};
use crate::domain::error::Result;
use crate::graph::{ActionNode, Convergence, ConvergenceGraph, IntendedState, NodeAction, Timing};
use crate::supervisor::SupervisorBinding;

pub const RENDER_UNICORN_SERVICE: &str = "render-unicorn-service";
pub const RENDER_DATABASE_CONFIG: &str = "render-database-config";
pub const RENDER_UNICORN_CONFIG: &str = "render-unicorn-config";
pub const RENDER_PROXY_SITE: &str = "render-proxy-site";
pub const RELOAD_SUPERVISOR: &str = "reload-supervisor";
pub const SCHEDULE_APP_RESTART: &str = "schedule-app-restart";
pub const RELOAD_PROXY: &str = "reload-proxy";

/// Records that the application needs a restart once the deploy is over.
#[derive(Debug, Clone, Default)]
pub struct RestartLatch(Arc<AtomicBool>);

impl RestartLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Build the prepare graph for `config`.
pub fn build_prepare_graph(
    config: &DeployConfig,
    templates: Arc<dyn TemplateRenderer>,
    supervisor: &SupervisorBinding,
    latch: &RestartLatch,
) -> Result<ConvergenceGraph> {
    let local = TimeoutConfig::deadline(config.timeouts.command);
    let restart = TimeoutConfig::deadline(config.timeouts.restart);

    let mut graph = ConvergenceGraph::new("prepare");
    for (name, request) in [
        (RENDER_UNICORN_SERVICE, unicorn_service(config)),
        (RENDER_DATABASE_CONFIG, database_config(config)),
        (RENDER_UNICORN_CONFIG, unicorn_config(config)),
        (RENDER_PROXY_SITE, proxy_site(config)),
    ] {
        let intended = IntendedState::new()
            .with("target", request.target.display().to_string())
            .with("template", request.template.as_str());
        graph.add_node(
            ActionNode::run_if_divergent(
                name,
                Arc::new(RenderTemplate {
                    templates: templates.clone(),
                    request,
                }),
            )
            .with_intended(intended)
            .with_timeout(local),
        )?;
    }

    graph.add_node(
        ActionNode::reactive(
            RELOAD_SUPERVISOR,
            Arc::new(ReloadSupervisor(supervisor.clone())),
        )
        .with_timeout(restart),
    )?;
    graph.add_node(ActionNode::reactive(
        SCHEDULE_APP_RESTART,
        Arc::new(ScheduleRestart(latch.clone())),
    ))?;
    graph.add_node(
        ActionNode::reactive(RELOAD_PROXY, Arc::new(RestartProxy(supervisor.clone())))
            .with_timeout(restart),
    )?;

    graph.add_edge(RENDER_UNICORN_SERVICE, RELOAD_SUPERVISOR, Timing::Immediate)?;
    graph.add_edge(RENDER_DATABASE_CONFIG, SCHEDULE_APP_RESTART, Timing::Deferred)?;
    graph.add_edge(RENDER_UNICORN_CONFIG, SCHEDULE_APP_RESTART, Timing::Deferred)?;
    graph.add_edge(RENDER_PROXY_SITE, RELOAD_PROXY, Timing::Deferred)?;
    Ok(graph)
}

// ---------------------------------------------------------------------------
// Template requests
// ---------------------------------------------------------------------------

fn vars<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn unicorn_service(config: &DeployConfig) -> TemplateRequest {
    let service = config.service_name();
    let (template, target, mode) = match config.supervisor.provider {
        SupervisorProvider::Upstart => (
            "unicorn.conf",
            PathBuf::from("/etc/init").join(format!("{}.conf", service)),
            0o644,
        ),
        SupervisorProvider::Runit => (
            "unicorn.run",
            PathBuf::from("/etc/sv").join(&service).join("run"),
            0o755,
        ),
        SupervisorProvider::Sysv => (
            "unicorn.init",
            PathBuf::from("/etc/init.d").join(&service),
            0o755,
        ),
    };
    TemplateRequest {
        target,
        template: template.to_string(),
        variables: vars([
            ("app", config.app.name.clone()),
            ("service", service),
            ("user", config.owner.clone()),
            ("group", config.group.clone()),
            ("environment", config.app.environment.clone()),
            ("current_path", config.current_link().display().to_string()),
            ("unicorn_bin", config.unicorn.unicorn_bin.clone()),
            (
                "unicorn_config",
                config.unicorn_config_path().display().to_string(),
            ),
            ("bundler", config.unicorn.bundler.to_string()),
            ("bundle_command", config.unicorn.bundle_command.clone()),
        ]),
        owner: "root".to_string(),
        group: "root".to_string(),
        mode,
    }
}

fn database_config(config: &DeployConfig) -> TemplateRequest {
    let db = &config.database;
    TemplateRequest {
        target: config.shared_dir().join("config").join("database.yml"),
        template: "database.yml".to_string(),
        variables: vars([
            ("environment", config.app.environment.clone()),
            ("adapter", db.adapter.clone()),
            ("host", db.host.clone()),
            ("database", db.name.clone()),
            ("username", db.username.clone()),
            ("password", db.password.clone()),
        ]),
        owner: config.owner.clone(),
        group: config.group.clone(),
        mode: 0o640,
    }
}

fn unicorn_config(config: &DeployConfig) -> TemplateRequest {
    let unicorn = &config.unicorn;
    let shared = config.shared_dir();
    TemplateRequest {
        target: config.unicorn_config_path(),
        template: "unicorn.rb".to_string(),
        variables: vars([
            ("worker_processes", unicorn.worker_processes.to_string()),
            ("worker_timeout", unicorn.worker_timeout.to_string()),
            ("preload_app", unicorn.preload_app.to_string()),
            ("port", unicorn.port.to_string()),
            ("current_path", config.current_link().display().to_string()),
            (
                "pid",
                shared.join("pids").join("unicorn.pid").display().to_string(),
            ),
            (
                "stderr_path",
                shared.join("log").join("unicorn.stderr.log").display().to_string(),
            ),
            (
                "stdout_path",
                shared.join("log").join("unicorn.stdout.log").display().to_string(),
            ),
        ]),
        owner: config.owner.clone(),
        group: config.group.clone(),
        mode: 0o644,
    }
}

fn proxy_site(config: &DeployConfig) -> TemplateRequest {
    let nginx = &config.nginx;
    let static_files = nginx
        .static_files
        .iter()
        .map(|(prefix, dir)| format!("{}={}", prefix, dir))
        .collect::<Vec<_>>()
        .join(",");
    let path_var = |p: &Option<PathBuf>| {
        p.as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    };
    TemplateRequest {
        target: config.nginx_site_path(),
        template: nginx.template.clone(),
        variables: vars([
            ("app", config.app.name.clone()),
            ("server_name", nginx.server_name.clone()),
            ("port", nginx.port.to_string()),
            ("application_port", config.application_port().to_string()),
            (
                "public_path",
                config.current_link().join("public").display().to_string(),
            ),
            ("static_files", static_files),
            ("ssl", nginx.ssl.to_string()),
            ("ssl_certificate", path_var(&nginx.ssl_certificate)),
            ("ssl_certificate_key", path_var(&nginx.ssl_certificate_key)),
        ]),
        owner: "root".to_string(),
        group: "root".to_string(),
        mode: 0o644,
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

struct RenderTemplate {
    templates: Arc<dyn TemplateRenderer>,
    request: TemplateRequest,
}

#[async_trait]
impl NodeAction for RenderTemplate {
    async fn in_sync(&self, _intended: &IntendedState) -> ExternalResult<bool> {
        Ok(!self.templates.would_change(&self.request).await?)
    }

    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        if self.templates.render(&self.request).await? {
            info!(target_path = %self.request.target.display(), "rendered configuration");
            Ok(Convergence::Changed)
        } else {
            Ok(Convergence::Unchanged)
        }
    }
}

struct ReloadSupervisor(SupervisorBinding);

#[async_trait]
impl NodeAction for ReloadSupervisor {
    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        self.0.reload_configuration().await?;
        Ok(Convergence::Changed)
    }
}

struct ScheduleRestart(RestartLatch);

#[async_trait]
impl NodeAction for ScheduleRestart {
    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        self.0.request();
        Ok(Convergence::Changed)
    }
}

struct RestartProxy(SupervisorBinding);

#[async_trait]
impl NodeAction for RestartProxy {
    async fn converge(&self, _intended: &IntendedState) -> ExternalResult<Convergence> {
        self.0.restart_proxy().await?;
        Ok(Convergence::Changed)
    }
}
