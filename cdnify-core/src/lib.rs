//! This crate contains the reference-rewriting engine and the publish protocol
//! behind the `cdnify` CLI: rewriting relative component references into CDN
//! URLs, staging the result and tree-syncing it to a versioned object store
//! prefix.
//!
//! # Layout
//! - [`normalize`], [`manifest`], [`rewrite`], [`versions`]: the pure text side.
//! - [`discover`], [`stage`], [`asset`], [`bundle`]: local files and staging.
//! - [`contract`], [`publish`], [`s3`]: the object store seam and the publisher.
//! - [`cdnify`]: the orchestrator tying one operation together.
//! - [`config`]: the immutable deployment configuration.

pub mod asset;
pub mod bundle;
pub mod cdnify;
pub mod config;
pub mod contract;
pub mod discover;
pub mod manifest;
pub mod normalize;
pub mod publish;
pub mod rewrite;
pub mod s3;
pub mod stage;
pub mod versions;

pub use cdnify::{cdnify, CdnifyError, CdnifyOptions, CdnifyReport, Collaborators, PublishOutcome};
pub use config::CdnConfig;
