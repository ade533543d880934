//! Per-package version lookup used to fill `${version}` in rule targets.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

pub trait VersionLookup {
    fn version_of(&self, package: &str) -> Option<String>;
}

impl VersionLookup for HashMap<String, String> {
    fn version_of(&self, package: &str) -> Option<String> {
        self.get(package).cloned()
    }
}

impl VersionLookup for BTreeMap<String, String> {
    fn version_of(&self, package: &str) -> Option<String> {
        self.get(package).cloned()
    }
}

/// Reads versions from installed component metadata.
///
/// Looks at `<components_dir>/<package>/.bower.json`, then `bower.json`, then
/// `package.json`, and returns the first `version` field found.
#[derive(Debug, Clone)]
pub struct InstalledVersions {
    components_dir: PathBuf,
}

#[derive(Deserialize)]
struct PackageMetadata {
    version: Option<String>,
}

const METADATA_FILES: [&str; 3] = [".bower.json", "bower.json", "package.json"];

impl InstalledVersions {
    pub fn new(components_dir: impl Into<PathBuf>) -> Self {
        Self {
            components_dir: components_dir.into(),
        }
    }
}

impl VersionLookup for InstalledVersions {
    fn version_of(&self, package: &str) -> Option<String> {
        if package.is_empty() || package.contains(['/', '\\']) || package.starts_with('.') {
            return None;
        }
        let package_dir = self.components_dir.join(package);
        for file in METADATA_FILES {
            let path = package_dir.join(file);
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<PackageMetadata>(&raw) {
                Ok(PackageMetadata {
                    version: Some(version),
                }) if !version.is_empty() => {
                    debug!(package, version = %version, path = %path.display(), "Resolved installed version");
                    return Some(version);
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(package, path = %path.display(), error = %e, "Unreadable package metadata");
                    continue;
                }
            }
        }
        None
    }
}

/// Explicit entries first, installed metadata second.
#[derive(Debug, Clone, Default)]
pub struct VersionTable {
    entries: BTreeMap<String, String>,
    installed: Option<InstalledVersions>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, package: impl Into<String>, version: impl Into<String>) -> Self {
        self.entries.insert(package.into(), version.into());
        self
    }

    pub fn with_installed(mut self, installed: InstalledVersions) -> Self {
        self.installed = Some(installed);
        self
    }
}

impl VersionLookup for VersionTable {
    fn version_of(&self, package: &str) -> Option<String> {
        self.entries
            .version_of(package)
            .or_else(|| self.installed.as_ref().and_then(|i| i.version_of(package)))
    }
}
