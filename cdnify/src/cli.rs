//! # cdnify CLI Interface (Module)
//!
//! Command parsing and the async entrypoint behind the `cdnify` binary.
//!
//! All domain logic (manifest, rewriting, staging, publishing) lives in
//! [`cdnify_core`]; this module only loads the config file, applies command
//! line overrides, wires Ctrl-C to cancellation and turns the report into an
//! exit status. The object store client is built by the core from the
//! resolved credentials.
//!
//! For programmatic or integration use, call [`run`] with a constructed [`Cli`].

use crate::load_config::{load_config, CliConfig};
use anyhow::Result;
use cdnify_core::publish::CancelHandle;
use cdnify_core::{cdnify, Collaborators, PublishOutcome};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI for cdnify: rewrite component references to CDN URLs and publish a version.
#[derive(Parser)]
#[clap(
    name = "cdnify",
    version,
    about = "Rewrite web component references to CDN URLs and publish them under a versioned prefix"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stage, rewrite and upload one component version
    Publish {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Version to publish; overrides the config file
        #[clap(long)]
        version: Option<String>,
        /// Stage only; never contact the object store
        #[clap(long)]
        dry_run: bool,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Publish {
            config,
            version,
            dry_run,
        } => {
            let CliConfig { cdn, mut publish } = load_config(config)?;
            if version.is_some() {
                publish.version = version;
            }
            publish.dry_run |= dry_run;
            tracing::info!(command = "publish", name = %publish.name, "Starting publish");

            let cancel = CancelHandle::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted; no further transfers will be dispatched");
                    on_interrupt.cancel();
                }
            });

            let collaborators = Collaborators {
                cancel: Some(cancel),
                ..Default::default()
            };
            let report = match cdnify(&cdn, &publish, collaborators).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(command = "publish", error = %e, "Publish aborted");
                    return Err(anyhow::Error::new(e));
                }
            };

            match &report.publish {
                PublishOutcome::Published(result) if result.is_success() => {
                    tracing::info!(
                        command = "publish",
                        url = %cdn.public_base(&report.key_prefix),
                        summary = %result.summary(),
                        "Publish complete"
                    );
                    Ok(())
                }
                PublishOutcome::Published(result) => {
                    for failure in &result.failures {
                        tracing::error!(path = %failure.path, error = %failure.cause, "Transfer failed");
                    }
                    Err(anyhow::anyhow!(
                        "Unable to upload build: {}; staging kept at {}",
                        result.summary(),
                        report.staging_dir.display()
                    ))
                }
                PublishOutcome::DryRun | PublishOutcome::NoCredentials => {
                    tracing::info!(
                        command = "publish",
                        staging = %report.staging_dir.display(),
                        staged = report.staged.len(),
                        "Files staged; nothing uploaded"
                    );
                    Ok(())
                }
            }
        }
    }
}
