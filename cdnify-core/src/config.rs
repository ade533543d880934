//! Immutable CDN configuration passed explicitly into every operation.
//!
//! Everything that used to be process-wide (CDN host, bucket, font table,
//! default third-party rules, publish tuning) lives in [`CdnConfig`], so several
//! publish operations against different endpoints can run side by side in one
//! process or test binary.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// A font family rewritten to a fixed CDN location wherever it is referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FontRule {
    /// Short identifier (e.g. `fa`), used only for logging.
    pub name: String,
    /// Directory reference as it appears in sources, e.g. `font-awesome/`.
    pub path: String,
    /// Absolute (protocol-relative) CDN base replacing the reference.
    pub cdn: String,
}

/// A rule for a known third-party base dependency, appended last to every manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRule {
    pub file: String,
    pub package: String,
    /// Target template; `${version}` is replaced with the resolved package version.
    pub cdn: String,
}

/// Transfer tuning for the publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishTuning {
    /// Maximum number of simultaneous in-flight requests.
    pub max_in_flight: usize,
    /// Retries after the first attempt, per request.
    pub retry_count: u32,
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    /// Files at or above this size are uploaded in parts.
    pub multipart_threshold: u64,
    pub multipart_part_size: u64,
    pub cache_control: String,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
}

impl Default for PublishTuning {
    fn default() -> Self {
        Self {
            max_in_flight: 20,
            retry_count: 3,
            retry_delay: Duration::from_millis(1000),
            multipart_threshold: 20 * 1024 * 1024,
            multipart_part_size: 15 * 1024 * 1024,
            cache_control: "max-age=31536000, no-transform, public".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// The full, immutable configuration of a CDN deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CdnConfig {
    /// Public CDN host the rewritten URLs point at.
    pub endpoint: String,
    pub bucket: String,
    /// Object store API base URL (path-style addressing).
    pub store_endpoint: String,
    pub region: String,
    /// Directory installed components live in, relative to the package root.
    pub component_root: String,
    /// Top-level path tokens identifying internal component families.
    pub component_tokens: Vec<String>,
    pub fonts: Vec<FontRule>,
    pub defaults: Vec<DefaultRule>,
    pub publish: PublishTuning,
}

impl Default for CdnConfig {
    fn default() -> Self {
        let endpoint = "dzlpbrbc7yvq0.cloudfront.net".to_string();
        Self {
            fonts: vec![
                FontRule {
                    name: "ge".to_string(),
                    path: "px-typography-design/type/".to_string(),
                    cdn: format!("//{endpoint}/predixdev/fonts/1.0.0/"),
                },
                FontRule {
                    name: "fa".to_string(),
                    path: "font-awesome/".to_string(),
                    cdn: "//cdnjs.cloudflare.com/ajax/libs/font-awesome/4.6.3/".to_string(),
                },
            ],
            defaults: vec![DefaultRule {
                file: "polymer/polymer.html".to_string(),
                package: "polymer".to_string(),
                cdn: "//polygit.org/polymer+:${version}/components/polymer/polymer.html"
                    .to_string(),
            }],
            endpoint,
            bucket: "apmcdn".to_string(),
            store_endpoint: "https://s3.amazonaws.com".to_string(),
            region: "us-east-1".to_string(),
            component_root: "bower_components/".to_string(),
            component_tokens: vec![
                "iron-".to_string(),
                "polymer".to_string(),
                "px-".to_string(),
            ],
            publish: PublishTuning::default(),
        }
    }
}

impl CdnConfig {
    pub fn trace_loaded(&self) {
        info!(
            endpoint = %self.endpoint,
            bucket = %self.bucket,
            store_endpoint = %self.store_endpoint,
            fonts = self.fonts.len(),
            defaults = self.defaults.len(),
            "Loaded CdnConfig"
        );
        debug!(?self, "CdnConfig loaded (full debug)");
    }

    /// Public URL of a published key prefix, e.g. `dzl...net/my-comp/1.0.0/`.
    pub fn public_base(&self, key_prefix: &str) -> String {
        format!("{}/{}", self.endpoint, key_prefix)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_one_year_public_cache_directive() {
        let config = CdnConfig::default();
        assert_eq!(
            config.publish.cache_control,
            "max-age=31536000, no-transform, public"
        );
        assert_eq!(config.publish.retry_count, 3);
        assert_eq!(config.publish.max_in_flight, 20);
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config: CdnConfig =
            serde_json::from_str(r#"{"bucket":"other","publish":{"retry_delay":5}}"#).unwrap();
        assert_eq!(config.bucket, "other");
        assert_eq!(config.endpoint, "dzlpbrbc7yvq0.cloudfront.net");
        assert_eq!(config.publish.retry_delay, Duration::from_millis(5));
        assert_eq!(config.publish.retry_count, 3);
    }
}
