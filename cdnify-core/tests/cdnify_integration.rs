use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cdnify_core::cdnify::{BundleOptions, DiscoveryMode, Stage};
use cdnify_core::contract::{BundleError, MockBundler, MockObjectStore, PutObject, StoreError};
use cdnify_core::s3::Credentials;
use cdnify_core::{cdnify, CdnConfig, CdnifyError, CdnifyOptions, Collaborators, PublishOutcome};
use serial_test::serial;
use tempfile::{tempdir, TempDir};

const ENDPOINT: &str = "dzlpbrbc7yvq0.cloudfront.net";

const ENTRY: &str = r#"<link rel="import" href="../polymer/polymer.html">
<link rel="import" href="../px-button/px-button.html">
<dom-module id="px-demo"></dom-module>
"#;

fn write(root: &Path, relative: &str, contents: &[u8]) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// A component checkout with two installed dependencies.
fn project() -> TempDir {
    let dir = tempdir().unwrap();
    write(dir.path(), "px-demo.html", ENTRY.as_bytes());
    write(
        dir.path(),
        "bower_components/px-button/.bower.json",
        br#"{"name": "px-button", "version": "2.3.1"}"#,
    );
    write(
        dir.path(),
        "bower_components/px-button/px-button.html",
        b"<dom-module id=\"px-button\"></dom-module>",
    );
    write(
        dir.path(),
        "bower_components/polymer/bower.json",
        br#"{"name": "polymer", "version": "1.9.3"}"#,
    );
    dir
}

fn options(root: &Path) -> CdnifyOptions {
    CdnifyOptions {
        name: "px-demo".into(),
        version: Some("1.0.0".into()),
        root: root.to_path_buf(),
        files: vec!["px-demo.html".into()],
        siblings: vec!["px-button".into()],
        staging_dir: root.join("cdn"),
        ..Default::default()
    }
}

/// Nothing listens on the store endpoint, so a client built from ambient
/// credentials never reaches a real bucket.
fn config() -> CdnConfig {
    let mut config = CdnConfig::default();
    config.store_endpoint = "http://127.0.0.1:1".into();
    config.publish.retry_count = 0;
    config.publish.retry_delay = Duration::from_millis(1);
    config
}

fn clear_credentials_env() {
    for key in ["AWS_ACCESS_KEY", "AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"] {
        std::env::remove_var(key);
    }
}

fn staged_text(options: &CdnifyOptions, relative: &str) -> String {
    fs::read_to_string(options.staging_dir.join(relative)).unwrap()
}

#[tokio::test]
async fn missing_version_aborts_before_any_io() {
    let dir = project();
    let mut options = options(dir.path());
    options.version = None;
    options.credentials = Some(Credentials::new("AKID", "secret"));
    // No expectations: any store call fails the test.
    let store = MockObjectStore::new();

    let err = cdnify(
        &config(),
        &options,
        Collaborators {
            store: Some(&store),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, CdnifyError::MissingVersion));
    assert!(!options.staging_dir.exists());
}

#[tokio::test]
async fn blank_version_counts_as_missing() {
    let dir = project();
    let mut options = options(dir.path());
    options.version = Some("  ".into());

    let err = cdnify(&config(), &options, Collaborators::default())
        .await
        .unwrap_err();

    assert!(matches!(err, CdnifyError::MissingVersion));
}

#[tokio::test]
async fn dry_run_stages_rewritten_files_without_touching_the_store() {
    let dir = project();
    let mut options = options(dir.path());
    options.dry_run = true;
    options.credentials = Some(Credentials::new("AKID", "secret"));
    let store = MockObjectStore::new();

    let report = cdnify(
        &config(),
        &options,
        Collaborators {
            store: Some(&store),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(matches!(report.publish, PublishOutcome::DryRun));
    assert!(report.is_success());
    assert_eq!(report.staged, vec![PathBuf::from("px-demo.html")]);
    assert!(!report.stages.contains(&Stage::Publishing));
    assert_eq!(report.stages.last(), Some(&Stage::Done));

    let staged = staged_text(&options, "px-demo.html");
    assert!(staged.contains(&format!(
        r#"href="//{ENDPOINT}/px-button/2.3.1/px-button.html""#
    )));
    assert!(staged.contains(r#"href="//polygit.org/polymer+:1.9.3/components/polymer/polymer.html""#));
    // Sources are untouched unless asked.
    assert_eq!(fs::read_to_string(dir.path().join("px-demo.html")).unwrap(), ENTRY);
}

#[tokio::test]
#[serial]
async fn missing_inputs_are_skipped_and_reported() {
    clear_credentials_env();
    let dir = project();
    let mut options = options(dir.path());
    options.files = vec!["px-demo.html".into(), "missing.html".into()];

    let report = cdnify(&config(), &options, Collaborators::default())
        .await
        .unwrap();

    assert_eq!(report.staged, vec![PathBuf::from("px-demo.html")]);
    assert_eq!(report.missing.len(), 1);
    assert_eq!(report.missing[0].relative_path, PathBuf::from("missing.html"));
    assert!(!options.staging_dir.join("missing.html").exists());
    assert!(matches!(report.publish, PublishOutcome::NoCredentials));
    assert!(options.staging_dir.join("px-demo.html").exists());
}

#[tokio::test]
async fn publishes_to_the_namespaced_version_prefix() {
    let dir = project();
    let mut options = options(dir.path());
    options.namespace = Some("predixdev".into());

    let mut store = MockObjectStore::new();
    store
        .expect_list_keys()
        .withf(|bucket, prefix| bucket == "apmcdn" && prefix == "predixdev/px-demo/1.0.0/")
        .times(1)
        .returning(|_, _| Ok(Vec::new()));
    store
        .expect_put_object()
        .withf(|req: &PutObject| {
            req.location.key == "predixdev/px-demo/1.0.0/px-demo.html"
                && String::from_utf8_lossy(&req.body).contains("//polygit.org/polymer+:1.9.3/")
        })
        .times(1)
        .returning(|_| Ok(()));

    let report = cdnify(
        &config(),
        &options,
        Collaborators {
            store: Some(&store),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(report.key_prefix, "predixdev/px-demo/1.0.0/");
    assert!(report.is_success());
    match &report.publish {
        PublishOutcome::Published(result) => {
            assert_eq!(result.uploaded, 1);
            assert!(result.staging_removed);
        }
        other => panic!("expected a publish, got {other:?}"),
    }
    assert!(report.stages.contains(&Stage::Publishing));
    assert!(!options.staging_dir.exists());
}

#[tokio::test]
async fn failed_publish_keeps_staging_for_retry() {
    let dir = project();
    let options = options(dir.path());

    let mut store = MockObjectStore::new();
    store.expect_list_keys().returning(|_, _| Ok(Vec::new()));
    store.expect_put_object().returning(|_| {
        Err(StoreError::Status {
            status: 403,
            body: "AccessDenied".into(),
        })
    });

    let report = cdnify(
        &config(),
        &options,
        Collaborators {
            store: Some(&store),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(!report.is_success());
    assert!(options.staging_dir.join("px-demo.html").exists());
}

#[tokio::test]
async fn bundled_output_is_rewritten_again() {
    let dir = project();
    let mut options = options(dir.path());
    options.bundle = Some(BundleOptions::default());

    let staging = options.staging_dir.clone();
    let mut bundler = MockBundler::new();
    bundler
        .expect_bundle()
        .withf(move |entry: &Path| entry == staging.join("px-demo.html"))
        .times(1)
        .returning(|_| {
            // The bundler inlines sources whose references were never resolved.
            Ok(r#"<link rel="import" href="../px-button/px-button.html"><dom-module id="px-demo"></dom-module>"#.to_string())
        });

    let report = cdnify(
        &config(),
        &options,
        Collaborators {
            bundler: Some(Box::new(bundler)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let output = options.staging_dir.join("px-demo.vulcanized.html");
    assert_eq!(report.bundled.as_deref(), Some(output.as_path()));
    assert!(report.stages.contains(&Stage::Bundling));
    let bundled = fs::read_to_string(output).unwrap();
    assert_eq!(
        bundled,
        format!(
            r#"<link rel="import" href="//{ENDPOINT}/px-button/2.3.1/px-button.html"><dom-module id="px-demo"></dom-module>"#
        )
    );
}

#[tokio::test]
async fn bundler_failure_aborts_without_output() {
    let dir = project();
    let mut options = options(dir.path());
    options.bundle = Some(BundleOptions {
        entry: None,
        output: Some(PathBuf::from("bundle.html")),
    });

    let mut bundler = MockBundler::new();
    bundler.expect_bundle().times(1).returning(|_| {
        Err(BundleError::Failed {
            status: "exit status: 1".into(),
            stderr: "could not resolve import".into(),
        })
    });
    let store = MockObjectStore::new();

    let err = cdnify(
        &config(),
        &options,
        Collaborators {
            store: Some(&store),
            bundler: Some(Box::new(bundler)),
            cancel: None,
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, CdnifyError::Bundle(BundleError::Failed { .. })));
    assert!(!options.staging_dir.join("bundle.html").exists());
    assert!(options.staging_dir.join("px-demo.html").exists());
}

#[tokio::test]
async fn update_in_place_rewrites_the_source_file() {
    let dir = project();
    let mut options = options(dir.path());
    options.update_in_place = true;

    cdnify(&config(), &options, Collaborators::default())
        .await
        .unwrap();

    let source = fs::read_to_string(dir.path().join("px-demo.html")).unwrap();
    assert_eq!(source, staged_text(&options, "px-demo.html"));
    assert!(source.contains(&format!("//{ENDPOINT}/px-button/2.3.1/px-button.html")));
}

#[tokio::test]
async fn scan_mode_walks_the_root_and_skips_dependency_trees() {
    let dir = project();
    write(dir.path(), "demo/index.html", br#"<link rel="import" href="../px-demo.html">"#);
    let png = [0x89u8, b'P', b'N', b'G', 0xff, 0xfe, 0x00];
    write(dir.path(), "img/logo.png", &png);

    let mut options = options(dir.path());
    options.discovery = DiscoveryMode::Scan;
    options.files = Vec::new();

    let report = cdnify(&config(), &options, Collaborators::default())
        .await
        .unwrap();

    let staged: BTreeSet<PathBuf> = report.staged.iter().cloned().collect();
    assert_eq!(
        staged,
        BTreeSet::from([
            PathBuf::from("demo/index.html"),
            PathBuf::from("img/logo.png"),
            PathBuf::from("px-demo.html"),
        ])
    );
    assert_eq!(fs::read(options.staging_dir.join("img/logo.png")).unwrap(), png);

    options.files = vec!["*.html".into()];
    let report = cdnify(&config(), &options, Collaborators::default())
        .await
        .unwrap();
    assert!(!report.staged.contains(&PathBuf::from("img/logo.png")));
    assert!(!options.staging_dir.join("img/logo.png").exists());
}

#[tokio::test]
async fn staging_dir_holding_the_sources_is_refused() {
    let dir = project();
    let mut options = options(dir.path());
    options.staging_dir = dir.path().to_path_buf();

    let err = cdnify(&config(), &options, Collaborators::default())
        .await
        .unwrap_err();

    assert!(matches!(err, CdnifyError::UnsafeStagingDir { .. }));
    assert!(dir.path().join("px-demo.html").exists());
}

#[tokio::test]
async fn key_segments_that_escape_the_version_prefix_abort_before_any_io() {
    let cases: [(&str, &str, Option<&str>, &str); 8] = [
        ("px-demo", "1.0/x", None, "version"),
        ("px-demo", "..", None, "version"),
        ("px-demo", "1.0\\..", None, "version"),
        ("px-a/1.0", "1.0.0", None, "name"),
        ("..", "1.0.0", None, "name"),
        (".", "1.0.0", None, "name"),
        ("px-demo", "1.0.0", Some("a//b"), "namespace"),
        ("px-demo", "1.0.0", Some("predixdev/../other"), "namespace"),
    ];
    for (name, version, namespace, expected_field) in cases {
        let dir = project();
        let mut options = options(dir.path());
        options.name = name.into();
        options.version = Some(version.into());
        options.namespace = namespace.map(String::from);
        // No expectations: any store call fails the test.
        let store = MockObjectStore::new();

        let err = cdnify(
            &config(),
            &options,
            Collaborators {
                store: Some(&store),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

        match err {
            CdnifyError::InvalidKeySegment { field, .. } => {
                assert_eq!(field, expected_field, "{name:?} {version:?} {namespace:?}")
            }
            other => panic!("expected an invalid key segment, got {other:?}"),
        }
        assert!(!options.staging_dir.exists());
    }
}

#[tokio::test]
async fn surrounding_slashes_in_the_namespace_are_accepted() {
    let dir = project();
    let mut options = options(dir.path());
    options.namespace = Some("/predixdev/".into());
    options.dry_run = true;

    let report = cdnify(&config(), &options, Collaborators::default())
        .await
        .unwrap();

    assert_eq!(report.key_prefix, "predixdev/px-demo/1.0.0/");
}

#[tokio::test]
async fn staging_dir_resolving_to_the_source_root_is_refused() {
    let dir = project();
    fs::create_dir_all(dir.path().join("sub")).unwrap();
    let mut candidates = vec![
        dir.path().join("sub/.."),
        dir.path().join("missing/.."),
        dir.path().join("sub/../.."),
    ];
    #[cfg(unix)]
    {
        let link = dir.path().join("sub/link");
        std::os::unix::fs::symlink(dir.path(), &link).unwrap();
        candidates.push(link);
    }

    for staging_dir in candidates {
        let mut options = options(dir.path());
        options.staging_dir = staging_dir.clone();
        options.dry_run = true;

        let err = cdnify(&config(), &options, Collaborators::default())
            .await
            .unwrap_err();

        assert!(
            matches!(err, CdnifyError::UnsafeStagingDir { .. }),
            "{staging_dir:?} gave {err:?}"
        );
        assert!(dir.path().join("px-demo.html").exists());
        assert!(dir.path().join("bower_components/px-button/px-button.html").exists());
    }
}

#[tokio::test]
#[serial]
async fn relative_root_inside_an_absolute_staging_dir_is_refused() {
    let dir = project();
    let previous = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();

    let mut options = options(Path::new("./"));
    options.staging_dir = dir.path().to_path_buf();
    options.dry_run = true;
    let result = cdnify(&config(), &options, Collaborators::default()).await;

    std::env::set_current_dir(previous).unwrap();
    assert!(matches!(result, Err(CdnifyError::UnsafeStagingDir { .. })), "{result:?}");
    assert!(dir.path().join("px-demo.html").exists());
}

#[tokio::test]
async fn credentials_without_a_store_attempt_the_upload() {
    let dir = project();
    let mut options = options(dir.path());
    options.credentials = Some(Credentials::new("AKID", "secret"));
    options.proxy = None;

    let report = cdnify(&config(), &options, Collaborators::default())
        .await
        .unwrap();

    match &report.publish {
        PublishOutcome::Published(result) => {
            assert!(!result.is_success());
            assert!(!result.failures.is_empty());
        }
        other => panic!("expected an upload attempt, got {other:?}"),
    }
    assert!(report.stages.contains(&Stage::Publishing));
    assert!(options.staging_dir.join("px-demo.html").exists());
}

#[tokio::test]
async fn unusable_store_endpoint_is_reported_when_building_the_client() {
    let dir = project();
    let mut options = options(dir.path());
    options.credentials = Some(Credentials::new("AKID", "secret"));
    let mut config = config();
    config.store_endpoint = "not a url".into();

    let err = cdnify(&config, &options, Collaborators::default())
        .await
        .unwrap_err();

    assert!(matches!(err, CdnifyError::StoreClient(StoreError::Protocol(_))));
}
