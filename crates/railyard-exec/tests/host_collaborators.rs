//! Host collaborators against a temporary directory.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use railyard_core::collaborators::{ReleaseFilesystem, TemplateRenderer, TemplateRequest};
use railyard_core::fakes::{FakeCommandRunner, FakeHost};
use railyard_core::{CancelSignal, DeployConfig, ReleaseOutcome, ReleaseWorkflow};
use railyard_exec::{FileTemplateRenderer, LocalReleaseFs};

#[test]
fn test_release_tree_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let fs = LocalReleaseFs::new(dir.path());
    fs.ensure_layout(&["config", "log"]).unwrap();
    assert!(dir.path().join("shared/config").is_dir());
    assert_eq!(fs.current_target().unwrap(), None);

    let first = dir.path().join("releases/20240101000000");
    let second = dir.path().join("releases/20240102000000");
    fs.write_revision(&second, "bbb").unwrap();
    fs.write_revision(&first, "aaa").unwrap();
    assert_eq!(fs.list_releases().unwrap(), vec![first.clone(), second.clone()]);
    assert_eq!(fs.read_revision(&first).unwrap().as_deref(), Some("aaa"));

    fs.point_current(&first).unwrap();
    fs.point_current(&second).unwrap();
    assert_eq!(fs.current_target().unwrap(), Some(second.clone()));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("current/REVISION")).unwrap(),
        "bbb\n"
    );

    fs.remove_release(&first).unwrap();
    fs.remove_release(&first).unwrap();
    assert_eq!(fs.list_releases().unwrap(), vec![second]);
}

#[test]
fn test_same_second_releases_list_in_cut_order() {
    let dir = tempfile::tempdir().unwrap();
    let fs = LocalReleaseFs::new(dir.path());
    let releases = dir.path().join("releases");
    let names = [
        "20240101000000",
        "20240101000000-1",
        "20240101000000-2",
        "20240101000000-10",
    ];
    for name in names.iter().rev() {
        fs.write_revision(&releases.join(name), name).unwrap();
    }

    let listed = fs.list_releases().unwrap();
    let expected: Vec<PathBuf> = names.iter().map(|n| releases.join(n)).collect();
    assert_eq!(listed, expected);
}

#[test]
fn test_purge_and_link_shared() {
    let dir = tempfile::tempdir().unwrap();
    let fs = LocalReleaseFs::new(dir.path());
    fs.ensure_layout(&["log", "pids"]).unwrap();
    let release = dir.path().join("releases/20240101000000");
    std::fs::create_dir_all(release.join("log")).unwrap();
    std::fs::write(release.join("log/development.log"), "old").unwrap();

    fs.purge(&release, &[PathBuf::from("log"), PathBuf::from("missing")])
        .unwrap();
    assert!(!release.join("log").exists());

    let mut links = BTreeMap::new();
    links.insert("log".to_string(), PathBuf::from("log"));
    links.insert("pids".to_string(), PathBuf::from("tmp/pids"));
    fs.link_shared(&release, &links).unwrap();

    assert_eq!(
        std::fs::read_link(release.join("tmp/pids")).unwrap(),
        dir.path().join("shared/pids")
    );
    assert!(release.join("log").is_dir());
}

#[tokio::test]
async fn test_template_written_only_when_content_changes() {
    let templates = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::write(
        templates.path().join("database.yml"),
        "{{ environment }}:\n  database: {{ database }}\n",
    )
    .unwrap();
    let renderer = FileTemplateRenderer::without_ownership(templates.path());
    let mut request = TemplateRequest {
        target: out.path().join("shared/config/database.yml"),
        template: "database.yml".to_string(),
        variables: BTreeMap::from([
            ("environment".to_string(), "production".to_string()),
            ("database".to_string(), "shop_production".to_string()),
        ]),
        owner: "deploy".to_string(),
        group: "deploy".to_string(),
        mode: 0o640,
    };

    assert!(renderer.would_change(&request).await.unwrap());
    assert!(renderer.render(&request).await.unwrap());
    assert!(!renderer.would_change(&request).await.unwrap());
    assert!(!renderer.render(&request).await.unwrap());

    let written = std::fs::read_to_string(&request.target).unwrap();
    assert_eq!(written, "production:\n  database: shop_production\n");
    let mode = std::fs::metadata(&request.target).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o640);

    request
        .variables
        .insert("database".to_string(), "shop_staging".to_string());
    assert!(renderer.render(&request).await.unwrap());
}

#[tokio::test]
async fn test_missing_template_variable_fails_render() {
    let templates = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::write(templates.path().join("unicorn.rb"), "listen {{ port }}\n").unwrap();
    let renderer = FileTemplateRenderer::without_ownership(templates.path());
    let request = TemplateRequest {
        target: out.path().join("unicorn.rb"),
        template: "unicorn.rb".to_string(),
        variables: BTreeMap::new(),
        owner: "deploy".to_string(),
        group: "deploy".to_string(),
        mode: 0o644,
    };

    let err = renderer.render(&request).await.expect_err("unknown variable");
    assert!(err.to_string().contains("port"));
    assert!(!request.target.exists());
}

fn owned_request(out: &std::path::Path, database: &str) -> TemplateRequest {
    TemplateRequest {
        target: out.join("database.yml"),
        template: "database.yml".to_string(),
        variables: BTreeMap::from([("database".to_string(), database.to_string())]),
        owner: "deploy".to_string(),
        group: "www".to_string(),
        mode: 0o640,
    }
}

fn owned_renderer(
    templates: &std::path::Path,
    owner: &str,
) -> (FileTemplateRenderer, Arc<FakeCommandRunner>) {
    let runner = Arc::new(FakeCommandRunner::new());
    runner.respond("stat", owner);
    (FileTemplateRenderer::new(templates, runner.clone()), runner)
}

#[tokio::test]
async fn test_failed_chown_keeps_template_divergent() {
    let templates = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::write(templates.path().join("database.yml"), "database: {{ database }}\n").unwrap();

    let (renderer, _) = owned_renderer(templates.path(), "deploy:www\n");
    assert!(renderer.render(&owned_request(out.path(), "shop_v1")).await.unwrap());
    assert!(!renderer.would_change(&owned_request(out.path(), "shop_v1")).await.unwrap());

    let (broken, runner) = owned_renderer(templates.path(), "deploy:www\n");
    runner.fail("chown");
    let request = owned_request(out.path(), "shop_v2");
    let err = broken.render(&request).await.expect_err("chown fails");
    assert!(err.to_string().contains("chown"));
    assert_eq!(
        std::fs::read_to_string(&request.target).unwrap(),
        "database: shop_v1\n"
    );
    assert!(broken.would_change(&request).await.unwrap());

    let (renderer, _) = owned_renderer(templates.path(), "deploy:www\n");
    assert!(renderer.render(&request).await.unwrap());
    assert_eq!(
        std::fs::read_to_string(&request.target).unwrap(),
        "database: shop_v2\n"
    );
}

#[tokio::test]
async fn test_mode_and_ownership_drift_is_repaired() {
    let templates = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::write(templates.path().join("database.yml"), "database: {{ database }}\n").unwrap();
    let request = owned_request(out.path(), "shop");

    let (renderer, runner) = owned_renderer(templates.path(), "deploy:www\n");
    assert!(renderer.render(&request).await.unwrap());
    let chowned = runner
        .commands()
        .into_iter()
        .find(|c| c.label == "chown")
        .expect("chown issued");
    assert_eq!(chowned.argv[1], "deploy:www");
    assert_ne!(chowned.argv[2], request.target.display().to_string());

    std::fs::set_permissions(&request.target, std::fs::Permissions::from_mode(0o666)).unwrap();
    assert!(renderer.would_change(&request).await.unwrap());
    assert!(renderer.render(&request).await.unwrap());
    let mode = std::fs::metadata(&request.target).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o640);
    assert!(!renderer.would_change(&request).await.unwrap());

    let (foreign, _) = owned_renderer(templates.path(), "root:root\n");
    assert!(foreign.would_change(&request).await.unwrap());
}

fn config(root: &std::path::Path) -> DeployConfig {
    let raw = serde_json::json!({
        "app": { "name": "shop", "path": root },
        "host_fqdn": "web1.example.com",
        "deploy": {
            "repository": "git@github.com:acme/shop.git",
            "revision": "main",
            "migrate": true
        },
        "database": { "name": "shop_production", "username": "shop" }
    });
    DeployConfig::from_json(&raw.to_string()).unwrap()
}

#[tokio::test]
async fn test_workflow_on_disk_keeps_previous_release_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new();
    let mut collaborators = host.collaborators();
    collaborators.filesystem = Arc::new(LocalReleaseFs::new(dir.path()));
    let workflow = ReleaseWorkflow::new(config(dir.path()), collaborators);

    host.fetcher.set_revision("main", "aaa");
    let first = workflow.deploy(false, &CancelSignal::new()).await;
    assert_eq!(first.outcome, ReleaseOutcome::Deployed, "{:?}", first.error);
    let live = first.release_path.clone().unwrap();
    assert!(live.join("tmp/pids").is_symlink());

    host.fetcher.set_revision("main", "bbb");
    host.commands.fail("migrate");
    let second = workflow.deploy(false, &CancelSignal::new()).await;

    assert_eq!(second.outcome, ReleaseOutcome::RolledBack);
    assert_eq!(
        std::fs::read_link(dir.path().join("current")).unwrap(),
        live
    );
    let remaining: Vec<_> = std::fs::read_dir(dir.path().join("releases"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(remaining, vec![live]);
}
