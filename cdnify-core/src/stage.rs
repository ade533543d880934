//! Staging area writes and the post-staging strategies.
//!
//! Every operation writes each rewritten input into the staging directory.
//! What happens afterwards is a [`StagingStrategy`]: [`DirectStaging`] stops
//! there, [`BundleStaging`] flattens the staged entry document with a
//! [`Bundler`] and sends the merged output through normalization and rewriting
//! once more, since the bundler inlines files whose relative references were
//! never resolved in the merged context.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};

use crate::contract::{BundleError, Bundler};
use crate::discover::slash_path;
use crate::normalize::PathNormalizer;
use crate::rewrite::ReferenceRewriter;
use crate::versions::VersionLookup;

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("failed to write staged file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything a strategy needs to post-process the staging directory.
pub struct StageContext<'a> {
    pub staging_dir: &'a Path,
    pub normalizer: &'a PathNormalizer,
    pub rewriter: &'a ReferenceRewriter,
    pub versions: &'a dyn VersionLookup,
}

impl StageContext<'_> {
    pub fn transform(&self, text: &str) -> String {
        self.rewriter
            .rewrite(&self.normalizer.normalize(text), self.versions)
    }
}

pub trait StagingStrategy {
    /// Runs once all discovered files are staged. Returns the extra artifact, if any.
    fn finish(&self, ctx: &StageContext<'_>) -> Result<Option<PathBuf>, StageError>;
}

/// Writes `contents` to `<staging_dir>/<relative>`, creating parent directories.
///
/// Parent and root components of `relative` are dropped so a staged file can
/// never land outside the staging directory.
pub fn write_staged(staging_dir: &Path, relative: &Path, contents: &[u8]) -> Result<PathBuf, StageError> {
    let target = staging_dir.join(slash_path(relative));
    let write = |path: &Path| -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)
    };
    write(&target).map_err(|source| {
        error!(path = %target.display(), error = %source, "Failed to write staged file");
        StageError::Write {
            path: target.clone(),
            source,
        }
    })?;
    Ok(target)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectStaging;

impl StagingStrategy for DirectStaging {
    fn finish(&self, _ctx: &StageContext<'_>) -> Result<Option<PathBuf>, StageError> {
        Ok(None)
    }
}

pub struct BundleStaging<'a> {
    bundler: Box<dyn Bundler + 'a>,
    entry: PathBuf,
    output: PathBuf,
}

impl<'a> BundleStaging<'a> {
    /// `entry` and `output` are relative to the staging directory.
    pub fn new(bundler: Box<dyn Bundler + 'a>, entry: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            bundler,
            entry: entry.into(),
            output: output.into(),
        }
    }
}

impl StagingStrategy for BundleStaging<'_> {
    fn finish(&self, ctx: &StageContext<'_>) -> Result<Option<PathBuf>, StageError> {
        let entry = ctx.staging_dir.join(&self.entry);
        info!(entry = %entry.display(), "[STAGE] Bundling staged entry document");
        // Nothing is written unless the bundler succeeds.
        let merged = self.bundler.bundle(&entry)?;
        let rewritten = ctx.transform(&merged);
        let written = write_staged(ctx.staging_dir, &self.output, rewritten.as_bytes())?;
        info!(output = %written.display(), bytes = rewritten.len(), "[STAGE] Wrote bundled document");
        Ok(Some(written))
    }
}
