use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};
use tracing_subscriber::prelude::*; // needed for .with()
use tracing_subscriber::{layer::Context, Layer, Registry};

/// A component checkout plus a config file pointing at it.
fn project(version: Option<&str>) -> (TempDir, std::path::PathBuf) {
    let dir = tempdir().expect("temp dir");
    fs::write(
        dir.path().join("px-demo.html"),
        r#"<link rel="import" href="../px-button/px-button.html">"#,
    )
    .unwrap();
    let installed = dir.path().join("bower_components/px-button");
    fs::create_dir_all(&installed).unwrap();
    fs::write(installed.join("bower.json"), r#"{"version": "2.3.1"}"#).unwrap();

    let mut yaml = format!(
        "publish:\n  name: px-demo\n  root: {root}\n  staging_dir: {root}/cdn\n  files: [px-demo.html]\n  siblings: [px-button]\n",
        root = dir.path().display()
    );
    if let Some(version) = version {
        yaml.push_str(&format!("  version: {version}\n"));
    }
    let config = dir.path().join("cdnify.yaml");
    fs::write(&config, yaml).unwrap();
    (dir, config)
}

fn cdnify_cmd(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cdnify").expect("Binary exists");
    cmd.arg("publish")
        .arg("--config")
        .arg(config)
        .env_remove("AWS_ACCESS_KEY")
        .env_remove("AWS_ACCESS_KEY_ID")
        .env_remove("AWS_SECRET_ACCESS_KEY")
        .env_remove("HTTP_PROXY");
    cmd
}

#[test]
fn publish_without_version_fails_before_staging() {
    let (dir, config) = project(None);

    cdnify_cmd(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no version specified"));

    assert!(!dir.path().join("cdn").exists());
}

#[test]
fn dry_run_with_version_flag_stages_rewritten_files() {
    let (dir, config) = project(None);

    cdnify_cmd(&config)
        .arg("--version")
        .arg("1.0.0")
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run completed"));

    let staged = fs::read_to_string(dir.path().join("cdn/px-demo.html")).unwrap();
    assert_eq!(
        staged,
        r#"<link rel="import" href="//dzlpbrbc7yvq0.cloudfront.net/px-button/2.3.1/px-button.html">"#
    );
}

#[test]
fn missing_credentials_skip_upload_and_keep_staging() {
    let (dir, config) = project(Some("1.0.0"));

    cdnify_cmd(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("skipping upload"));

    assert!(dir.path().join("cdn/px-demo.html").exists());
}

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.events.lock().unwrap().push(format!("{event:?}"));
    }
}

#[tokio::test]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use cdnify::cli::{run, Cli, Commands};

    let cli = Cli {
        command: Commands::Publish {
            config: std::path::PathBuf::from("dummy.yaml"),
            version: None,
            dry_run: true,
        },
    };

    let result = run(cli).await;
    assert!(result.is_err(), "a missing config file must fail");

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
