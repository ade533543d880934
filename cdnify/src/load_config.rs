//! `load_config` module: loads a static YAML publish file into the core's
//! [`CdnConfig`] and [`CdnifyOptions`].
//!
//! This is the only place untrusted YAML is parsed. Secrets are not expected in
//! the file: credentials and proxy fall back to the environment
//! (`AWS_ACCESS_KEY`, `AWS_SECRET_ACCESS_KEY`, `HTTP_PROXY`) when absent, see
//! [`CdnifyOptions::resolved_credentials`].
//!
//! # Accepted schema
//! ```yaml
//! cdn:              # optional; every key defaults to the production deployment
//!   bucket: apmcdn
//!   publish:
//!     max_in_flight: 20
//! publish:
//!   name: px-demo
//!   version: 1.0.0  # may also be passed as --version
//!   files: [px-demo.html, css/px-demo.css]
//!   siblings: [px-button]
//!   strings:
//!     - file: px-theme/px-theme.html
//!       package: px-theme
//!       cdn: //cdn.example.com/px-theme/${version}/px-theme.html
//! ```
//!
//! # Errors
//! All errors use `anyhow::Error` and are surfaced at the CLI boundary.

use anyhow::Result;
use cdnify_core::{CdnConfig, CdnifyOptions};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{error, info};

#[derive(Debug, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub cdn: CdnConfig,
    pub publish: CdnifyOptions,
}

/// Loads a static YAML config file (no secrets expected).
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    let config: CliConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    config.cdn.trace_loaded();
    config.publish.trace_loaded();
    Ok(config)
}
