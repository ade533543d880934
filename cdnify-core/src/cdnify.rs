//! High-level pipeline: validate → build manifest → stage → bundle → publish.
//!
//! This module sequences one publish operation. A [`Pipeline`] is assembled
//! from two interchangeable strategies, a [`Discovery`] (explicit file list or
//! recursive scan) and a [`StagingStrategy`] (direct write or bundle-then-rewrite),
//! and run against an optional [`ObjectStore`].
//!
//! # Stages
//! `Validating → BuildingManifest → StagingFiles → Bundling? → Publishing? → Done`,
//! with `Aborted` reachable from `Validating` (no version, or a name, version
//! or namespace that is not a single key segment) and `Bundling` (bundler
//! failure).
//!
//! # Responsibilities
//! - No I/O happens before the version has been validated.
//! - Missing input files are warnings; the run continues without them.
//! - A bundler failure aborts the run before any bundled output is written.
//! - The staging directory is resolved through symlinks and `..` before it is
//!   emptied, and refused when it holds the source root.
//! - Without a caller-supplied store, an S3 client is built from the resolved
//!   credentials. Publishing is skipped on dry runs and when no credentials
//!   resolve; the staging directory is then left in place for inspection.
//!
//! # Navigation
//! - Main entrypoint: [`cdnify`]
//! - Supporting types: [`CdnifyOptions`], [`CdnifyReport`], [`Pipeline`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::asset::AssetFile;
use crate::bundle::CommandBundler;
use crate::config::CdnConfig;
use crate::contract::{BundleError, Bundler, ObjectStore, StoreError};
use crate::discover::{Discovery, ExplicitList, FileFilter, RecursiveScan};
use crate::manifest::{build_manifest, ExtraRule, ManifestError, ManifestRequest};
use crate::normalize::PathNormalizer;
use crate::publish::{publish, CancelHandle, PublishOptions, PublishResult, PublishTarget};
use crate::rewrite::ReferenceRewriter;
use crate::s3::{Credentials, S3Client};
use crate::stage::{BundleStaging, DirectStaging, StageContext, StageError, StagingStrategy};
use crate::versions::{InstalledVersions, VersionTable};

/// Directories a recursive scan never enters.
const SCAN_SKIP: [&str; 3] = ["bower_components", "node_modules", ".git"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Process exactly the declared `files`.
    #[default]
    Explicit,
    /// Walk `root` and process paths accepted by `files` (all when empty).
    Scan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleOptions {
    /// Staged entry document; defaults to `<name>.html`.
    pub entry: Option<PathBuf>,
    /// Bundled output; defaults to `<name>.vulcanized.html`.
    pub output: Option<PathBuf>,
}

/// One publish operation, as configured by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CdnifyOptions {
    pub name: String,
    pub version: Option<String>,
    pub namespace: Option<String>,
    pub root: PathBuf,
    pub files: Vec<String>,
    pub discovery: DiscoveryMode,
    pub siblings: Vec<String>,
    pub strings: Vec<ExtraRule>,
    pub bundle: Option<BundleOptions>,
    pub staging_dir: PathBuf,
    pub dry_run: bool,
    pub update_in_place: bool,
    /// Keep the staging directory after a fully successful publish.
    pub preserve_staging: bool,
    pub credentials: Option<Credentials>,
    pub proxy: Option<String>,
}

impl Default for CdnifyOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: None,
            namespace: None,
            root: PathBuf::from("./"),
            files: Vec::new(),
            discovery: DiscoveryMode::Explicit,
            siblings: Vec::new(),
            strings: Vec::new(),
            bundle: None,
            staging_dir: PathBuf::from("cdn/"),
            dry_run: false,
            update_in_place: false,
            preserve_staging: false,
            credentials: None,
            proxy: None,
        }
    }
}

impl CdnifyOptions {
    pub fn trace_loaded(&self) {
        info!(
            name = %self.name,
            version = self.version.as_deref().unwrap_or("<missing>"),
            namespace = self.namespace.as_deref().unwrap_or(""),
            files = self.files.len(),
            siblings = self.siblings.len(),
            discovery = ?self.discovery,
            dry_run = self.dry_run,
            "Loaded CdnifyOptions"
        );
    }

    /// Explicit credentials, else the environment.
    pub fn resolved_credentials(&self) -> Option<Credentials> {
        self.credentials.clone().or_else(Credentials::from_env)
    }

    /// Explicit proxy, else `HTTP_PROXY`.
    pub fn resolved_proxy(&self) -> Option<String> {
        self.proxy
            .clone()
            .or_else(|| std::env::var("HTTP_PROXY").ok())
            .filter(|p| !p.is_empty())
    }

    fn validated_version(&self) -> Result<&str, CdnifyError> {
        match self.version.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(CdnifyError::MissingVersion),
        }
    }

    /// Name, version and namespace must each map onto whole key segments.
    fn validate_key_segments(&self, version: &str) -> Result<(), CdnifyError> {
        check_segment("name", &self.name)?;
        check_segment("version", version)?;
        if let Some(namespace) = &self.namespace {
            let trimmed = namespace.trim_matches('/');
            if !trimmed.is_empty() {
                for segment in trimmed.split('/') {
                    check_segment("namespace", segment).map_err(|_| {
                        CdnifyError::InvalidKeySegment {
                            field: "namespace",
                            value: namespace.clone(),
                        }
                    })?;
                }
            }
        }
        Ok(())
    }
}

fn check_segment(field: &'static str, value: &str) -> Result<(), CdnifyError> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(CdnifyError::InvalidKeySegment {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    BuildingManifest,
    StagingFiles,
    Bundling,
    Publishing,
    Done,
    Aborted,
}

/// A declared input that could not be read and was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFile {
    pub relative_path: PathBuf,
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug)]
pub enum PublishOutcome {
    Published(PublishResult),
    /// Dry run requested; nothing left the machine.
    DryRun,
    /// No credentials (hence no store); nothing left the machine.
    NoCredentials,
}

#[derive(Debug)]
pub struct CdnifyReport {
    pub key_prefix: String,
    pub staging_dir: PathBuf,
    pub staged: Vec<PathBuf>,
    pub missing: Vec<MissingFile>,
    pub bundled: Option<PathBuf>,
    pub publish: PublishOutcome,
    pub stages: Vec<Stage>,
}

impl CdnifyReport {
    /// False only when a publish ran and at least one transfer failed.
    pub fn is_success(&self) -> bool {
        match &self.publish {
            PublishOutcome::Published(result) => result.is_success(),
            PublishOutcome::DryRun | PublishOutcome::NoCredentials => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum CdnifyError {
    #[error("no version specified; pass a semantic version for this publish")]
    MissingVersion,
    #[error("no package name specified")]
    MissingName,
    #[error("{field} {value:?} is not a valid object key segment")]
    InvalidKeySegment { field: &'static str, value: String },
    #[error("refusing to use staging directory {path}: {reason}")]
    UnsafeStagingDir { path: PathBuf, reason: String },
    #[error("failed to prepare staging directory {path}: {source}")]
    PrepareStaging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("bundling failed: {0}")]
    Bundle(#[source] BundleError),
    #[error(transparent)]
    Stage(StageError),
    #[error("failed to construct object store client: {0}")]
    StoreClient(#[source] StoreError),
}

impl From<StageError> for CdnifyError {
    fn from(e: StageError) -> Self {
        match e {
            StageError::Bundle(b) => CdnifyError::Bundle(b),
            other => CdnifyError::Stage(other),
        }
    }
}

/// External collaborators of one run.
#[derive(Default)]
pub struct Collaborators<'a> {
    /// `None` builds an S3 client from the resolved credentials, if any.
    pub store: Option<&'a dyn ObjectStore>,
    /// Used by bundle staging; defaults to [`CommandBundler::vulcanize`].
    pub bundler: Option<Box<dyn Bundler + 'a>>,
    pub cancel: Option<CancelHandle>,
}

pub struct Pipeline<'a> {
    config: &'a CdnConfig,
    discovery: Box<dyn Discovery + 'a>,
    staging: Box<dyn StagingStrategy + 'a>,
}

/// Drops `.` components so `./cdn` and `cdn` compare equal.
fn lexical(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a CdnConfig,
        discovery: Box<dyn Discovery + 'a>,
        staging: Box<dyn StagingStrategy + 'a>,
    ) -> Self {
        Self {
            config,
            discovery,
            staging,
        }
    }

    /// Picks the strategies named by `options`. Performs no I/O.
    pub fn from_options(
        config: &'a CdnConfig,
        options: &CdnifyOptions,
        bundler: Option<Box<dyn Bundler + 'a>>,
    ) -> Self {
        let discovery: Box<dyn Discovery + 'a> = match options.discovery {
            DiscoveryMode::Explicit => Box::new(ExplicitList::new(options.files.clone())),
            DiscoveryMode::Scan => {
                let mut skip: Vec<PathBuf> = SCAN_SKIP.iter().map(PathBuf::from).collect();
                if let Ok(inside) = lexical(&options.staging_dir).strip_prefix(lexical(&options.root)) {
                    skip.push(inside.to_path_buf());
                }
                Box::new(RecursiveScan::new(FileFilter::new(&options.files)).skipping(skip))
            }
        };
        let staging: Box<dyn StagingStrategy + 'a> = match &options.bundle {
            None => Box::new(DirectStaging),
            Some(bundle) => {
                let entry = bundle
                    .entry
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(format!("{}.html", options.name)));
                let output = bundle
                    .output
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(format!("{}.vulcanized.html", options.name)));
                let bundler = bundler.unwrap_or_else(|| Box::new(CommandBundler::vulcanize()));
                Box::new(BundleStaging::new(bundler, entry, output))
            }
        };
        Self::new(config, discovery, staging)
    }

    pub async fn run(
        &self,
        options: &CdnifyOptions,
        store: Option<&dyn ObjectStore>,
        cancel: Option<CancelHandle>,
    ) -> Result<CdnifyReport, CdnifyError> {
        let mut stages = vec![Stage::Validating];
        info!(name = %options.name, "[CDNIFY] Validating publish request");
        let version = match options.validated_version() {
            Ok(v) => v,
            Err(e) => {
                error!("[CDNIFY][ERROR] Please specify a version; aborting before any file or network I/O");
                return Err(e);
            }
        };
        if options.name.trim().is_empty() {
            error!("[CDNIFY][ERROR] No package name specified; aborting");
            return Err(CdnifyError::MissingName);
        }
        if let Err(e) = options.validate_key_segments(version) {
            error!(error = %e, "[CDNIFY][ERROR] Invalid key segment; aborting");
            return Err(e);
        }
        let target = PublishTarget {
            namespace: options.namespace.clone(),
            name: options.name.clone(),
            version: version.to_string(),
            bucket: self.config.bucket.clone(),
        };
        let key_prefix = target.key_prefix();

        stages.push(Stage::BuildingManifest);
        let manifest = build_manifest(
            self.config,
            &ManifestRequest {
                name: &options.name,
                version,
                namespace: options.namespace.as_deref(),
                siblings: &options.siblings,
                extra: &options.strings,
            },
        );
        let rewriter = ReferenceRewriter::new(&manifest, &self.config.component_root)?;
        let normalizer =
            PathNormalizer::new(&self.config.component_tokens, &self.config.component_root)?;
        let versions = VersionTable::new()
            .with(options.name.clone(), version)
            .with_installed(InstalledVersions::new(
                options.root.join(&self.config.component_root),
            ));
        info!(rules = manifest.len(), "[CDNIFY] Built rewrite manifest");

        stages.push(Stage::StagingFiles);
        let staging_dir = options.staging_dir.clone();
        prepare_staging(&staging_dir, &options.root)?;
        let ctx = StageContext {
            staging_dir: &staging_dir,
            normalizer: &normalizer,
            rewriter: &rewriter,
            versions: &versions,
        };

        let mut staged = Vec::new();
        let mut missing = Vec::new();
        for discovered in self.discovery.discover(&options.root) {
            let mut asset = match AssetFile::read(&discovered) {
                Ok(asset) => asset,
                Err(e) => {
                    warn!(
                        path = %discovered.path.display(),
                        error = %e,
                        "[CDNIFY] No file found, skipping"
                    );
                    missing.push(MissingFile {
                        relative_path: discovered.relative_path,
                        path: discovered.path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            asset.transform(&ctx);
            asset.stage(&staging_dir)?;
            if options.update_in_place {
                asset.write_back()?;
            }
            staged.push(asset.relative_path);
        }
        info!(
            staged = staged.len(),
            missing = missing.len(),
            staging = %staging_dir.display(),
            "[CDNIFY] Staged files"
        );

        if options.bundle.is_some() {
            stages.push(Stage::Bundling);
        }
        let bundled = match self.staging.finish(&ctx) {
            Ok(bundled) => bundled,
            Err(e) => {
                stages.push(Stage::Aborted);
                error!(error = %e, "[CDNIFY][ERROR] Staging strategy failed; aborting");
                return Err(e.into());
            }
        };

        let fallback;
        let store = match store {
            Some(store) => Some(store),
            None if options.dry_run => None,
            None => match options.resolved_credentials() {
                Some(credentials) => {
                    fallback = S3Client::new(
                        self.config,
                        credentials,
                        options.resolved_proxy().as_deref(),
                    )
                    .map_err(CdnifyError::StoreClient)?;
                    Some(&fallback as &dyn ObjectStore)
                }
                None => None,
            },
        };

        let publish_outcome = if options.dry_run {
            info!(staging = %staging_dir.display(), "[CDNIFY] Dry run completed. Files are in staging directory");
            PublishOutcome::DryRun
        } else if let Some(store) = store {
            stages.push(Stage::Publishing);
            let result = publish(
                store,
                &self.config.publish,
                &target,
                &staging_dir,
                &PublishOptions {
                    preserve_staging: options.preserve_staging,
                    cancel,
                },
            )
            .await;
            if result.is_success() {
                info!(
                    uploaded = result.uploaded,
                    url = %self.config.public_base(&key_prefix),
                    "[CDNIFY] Uploaded files"
                );
            } else {
                error!(summary = %result.summary(), "[CDNIFY][ERROR] Unable to upload build");
            }
            PublishOutcome::Published(result)
        } else {
            warn!(staging = %staging_dir.display(), "[CDNIFY] No credentials available; skipping upload. Files are in staging directory");
            PublishOutcome::NoCredentials
        };
        stages.push(Stage::Done);

        Ok(CdnifyReport {
            key_prefix,
            staging_dir,
            staged,
            missing,
            bundled,
            publish: publish_outcome,
            stages,
        })
    }
}

/// Canonical form of `path`, which need not exist yet: the nearest existing
/// ancestor is canonicalized and the remaining components appended.
fn resolve(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(mut resolved) => {
                resolved.extend(rest.iter().rev());
                return Ok(resolved);
            }
            Err(e) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    rest.push(name.to_os_string());
                    existing = parent;
                }
                // A `..` past a missing directory cannot be resolved.
                _ => return Err(e),
            },
        }
    }
}

/// Empties (or creates) the staging directory, refusing paths that hold the sources.
fn prepare_staging(staging_dir: &Path, root: &Path) -> Result<(), CdnifyError> {
    let unsafe_dir = |reason: String| CdnifyError::UnsafeStagingDir {
        path: staging_dir.to_path_buf(),
        reason,
    };
    if lexical(staging_dir).as_os_str().is_empty() {
        return Err(unsafe_dir("it is the working directory".to_string()));
    }
    let staging = resolve(staging_dir)
        .map_err(|e| unsafe_dir(format!("it cannot be resolved: {e}")))?;
    let source = resolve(root)
        .map_err(|e| unsafe_dir(format!("the source root cannot be resolved: {e}")))?;
    if source.starts_with(&staging) {
        return Err(unsafe_dir(format!(
            "it contains the source root {}",
            source.display()
        )));
    }
    let prepare = || -> io::Result<()> {
        if staging_dir.exists() {
            fs::remove_dir_all(staging_dir)?;
        }
        fs::create_dir_all(staging_dir)
    };
    prepare().map_err(|source| CdnifyError::PrepareStaging {
        path: staging_dir.to_path_buf(),
        source,
    })
}

/// Runs one publish operation with strategies chosen from `options`.
pub async fn cdnify(
    config: &CdnConfig,
    options: &CdnifyOptions,
    collaborators: Collaborators<'_>,
) -> Result<CdnifyReport, CdnifyError> {
    options.trace_loaded();
    let Collaborators {
        store,
        bundler,
        cancel,
    } = collaborators;
    Pipeline::from_options(config, options, bundler)
        .run(options, store, cancel)
        .await
}
