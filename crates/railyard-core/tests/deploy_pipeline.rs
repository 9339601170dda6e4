//! Bootstrap, prepare and release run together by `Deployer`.

use std::path::PathBuf;

use railyard_core::fakes::FakeHost;
use railyard_core::prepare::{RELOAD_PROXY, RELOAD_SUPERVISOR, SCHEDULE_APP_RESTART};
use railyard_core::{CancelSignal, DeployAction, DeployConfig, Deployer, NodeStatus, ReleaseOutcome};

fn config() -> DeployConfig {
    DeployConfig::from_json(
        r#"{
            "app": { "name": "shop", "path": "/srv/shop" },
            "host_fqdn": "web1.example.com",
            "deploy": { "repository": "git@github.com:acme/shop.git", "revision": "main" },
            "database": { "name": "shop_production", "username": "shop", "password": "one" },
            "key_registry": { "remote": "git@keys.example.com", "keydir": "keydir" }
        }"#,
    )
    .expect("parse")
}

async fn deploy(host: &FakeHost, config: DeployConfig) -> railyard_core::DeployReport {
    Deployer::new(config, host.collaborators())
        .run(&CancelSignal::new())
        .await
}

#[tokio::test]
async fn multi_word_app_name_is_rejected_before_anything_runs() {
    let host = FakeHost::new();
    let mut cfg = config();
    cfg.app.name = "my shop".to_string();

    let report = deploy(&host, cfg).await;

    let error = report.error.expect("configuration error");
    assert!(error.contains("one word"), "{error}");
    assert!(report.bootstrap.is_empty());
    assert!(report.prepare.is_empty());
    assert!(report.release.is_none());
    assert!(host.accounts.calls().is_empty());
    assert!(host.templates.renders().is_empty());
}

#[tokio::test]
async fn first_deploy_restarts_application_exactly_once() {
    let host = FakeHost::new();
    host.fetcher.set_revision("main", "abc123");

    let report = deploy(&host, config()).await;

    assert!(report.succeeded(), "{:?}", report.error);
    assert!(report.bootstrap.succeeded());
    assert_eq!(report.prepare.changed().len(), 7);
    assert_eq!(
        report.prepare.status_of(SCHEDULE_APP_RESTART),
        Some(NodeStatus::Succeeded)
    );
    let release = report.release.expect("release");
    assert_eq!(release.outcome, ReleaseOutcome::Deployed);

    // The release already restarted the application, so the latched
    // configuration restart is not repeated.
    assert!(!report.deferred_restart);
    assert_eq!(host.app_supervisor.restarts(), vec!["unicorn_shop".to_string()]);
    assert_eq!(host.app_supervisor.reloads(), 1);
    assert_eq!(host.proxy_supervisor.restarts(), vec!["nginx".to_string()]);
}

#[tokio::test]
async fn unchanged_redeploy_touches_nothing() {
    let host = FakeHost::new();
    host.fetcher.set_revision("main", "abc123");
    deploy(&host, config()).await;

    let report = deploy(&host, config()).await;

    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(report.bootstrap.divergent_executions(), 0);
    assert_eq!(report.prepare.divergent_executions(), 0);
    assert_eq!(
        report.release.expect("release").outcome,
        ReleaseOutcome::AlreadyCurrent
    );
    assert!(!report.deferred_restart);
    assert_eq!(host.app_supervisor.restarts().len(), 1);
    assert_eq!(host.proxy_supervisor.restarts().len(), 1);
    assert_eq!(host.fetcher.fetches().len(), 1);
}

#[tokio::test]
async fn config_change_on_current_revision_restarts_after_release() {
    let host = FakeHost::new();
    host.fetcher.set_revision("main", "abc123");
    deploy(&host, config()).await;

    let mut cfg = config();
    cfg.database.password = "two".to_string();
    let report = deploy(&host, cfg).await;

    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(
        report.release.expect("release").outcome,
        ReleaseOutcome::AlreadyCurrent
    );
    assert!(report.deferred_restart);
    assert_eq!(host.app_supervisor.restarts().len(), 2);
    assert_eq!(host.app_supervisor.reloads(), 1);
    assert_eq!(host.proxy_supervisor.restarts().len(), 1);
}

#[tokio::test]
async fn service_definition_change_reloads_supervisor() {
    let host = FakeHost::new();
    host.fetcher.set_revision("main", "abc123");
    deploy(&host, config()).await;

    let mut cfg = config();
    cfg.unicorn.unicorn_bin = "unicorn_rails".to_string();
    let report = deploy(&host, cfg).await;

    assert_eq!(
        report.prepare.status_of(RELOAD_SUPERVISOR),
        Some(NodeStatus::Succeeded)
    );
    assert_eq!(report.prepare.status_of(RELOAD_PROXY), Some(NodeStatus::NotRun));
    assert_eq!(host.app_supervisor.reloads(), 2);
    assert!(!report.deferred_restart);
}

#[tokio::test]
async fn hand_edited_proxy_site_is_restored_and_proxy_restarted() {
    let host = FakeHost::new();
    host.fetcher.set_revision("main", "abc123");
    let cfg = config();
    deploy(&host, cfg.clone()).await;

    host.templates.tamper(&cfg.nginx_site_path());
    let report = deploy(&host, cfg.clone()).await;

    assert_eq!(report.prepare.changed(), vec!["render-proxy-site", RELOAD_PROXY]);
    assert_eq!(host.proxy_supervisor.restarts().len(), 2);
    assert_eq!(host.app_supervisor.restarts().len(), 1);
    assert_ne!(
        host.templates.content(&cfg.nginx_site_path()).as_deref(),
        Some("edited by hand")
    );
}

#[tokio::test]
async fn failed_template_stops_before_release() {
    let host = FakeHost::new();
    let cfg = config();
    host.templates
        .fail(&PathBuf::from("/srv/shop/shared/config/database.yml"));

    let report = deploy(&host, cfg).await;

    let error = report.error.expect("error");
    assert!(error.contains("render-database-config"), "{error}");
    assert!(report.release.is_none());
    assert!(host.fetcher.fetches().is_empty());
    assert!(host.proxy_supervisor.restarts().is_empty());
}

#[tokio::test]
async fn failed_release_is_reported_with_its_record() {
    let host = FakeHost::new();
    host.fetcher.fail("fetch");

    let report = deploy(&host, config()).await;

    assert!(!report.succeeded());
    let release = report.release.expect("release record");
    assert_eq!(release.outcome, ReleaseOutcome::Failed);
    assert!(report.error.expect("error").contains("fetching"));
    assert!(!report.deferred_restart);
}

#[tokio::test]
async fn rollback_action_returns_to_previous_release() {
    let host = FakeHost::new();
    host.filesystem
        .with_release("/srv/shop/releases/20200101000000", "old-sha");
    host.filesystem
        .with_release("/srv/shop/releases/20210101000000", "new-sha");
    host.filesystem
        .with_current("/srv/shop/releases/20210101000000");

    let report = Deployer::new(config(), host.collaborators())
        .with_action(DeployAction::Rollback)
        .run(&CancelSignal::new())
        .await;

    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(
        report.release.expect("release").outcome,
        ReleaseOutcome::RolledBack
    );
    assert_eq!(
        host.filesystem.current(),
        Some(PathBuf::from("/srv/shop/releases/20200101000000"))
    );
    assert!(host.fetcher.fetches().is_empty());
}
