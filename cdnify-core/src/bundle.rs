//! Process-backed [`Bundler`]: runs an external HTML import flattener.

use std::path::Path;
use std::process::Command;
use tracing::{error, info};

use crate::contract::{BundleError, Bundler};

/// Runs `<program> <args...> <entry>` and takes stdout as the merged document.
#[derive(Debug, Clone)]
pub struct CommandBundler {
    program: String,
    args: Vec<String>,
}

impl CommandBundler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `vulcanize` with scripts and styles inlined and comments kept.
    pub fn vulcanize() -> Self {
        Self::new(
            "vulcanize",
            vec!["--inline-scripts".to_string(), "--inline-css".to_string()],
        )
    }
}

impl Default for CommandBundler {
    fn default() -> Self {
        Self::vulcanize()
    }
}

impl Bundler for CommandBundler {
    fn bundle(&self, entry: &Path) -> Result<String, BundleError> {
        if !entry.is_file() {
            return Err(BundleError::MissingEntry(entry.to_path_buf()));
        }

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(entry)
            .output()
            .map_err(|e| {
                error!(error = ?e, program = %self.program, "Failed to launch bundler process");
                BundleError::Launch {
                    program: self.program.clone(),
                    source: e,
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                program = %self.program,
                entry = %entry.display(),
                status = %output.status,
                "Bundler exited with non-zero code"
            );
            return Err(BundleError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }

        let merged = String::from_utf8(output.stdout)
            .map_err(|e| BundleError::InvalidOutput(format!("stdout is not UTF-8: {e}")))?;
        info!(
            program = %self.program,
            entry = %entry.display(),
            bytes = merged.len(),
            "Bundled entry document"
        );
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_entry_is_reported_without_spawning() {
        let dir = tempdir().unwrap();
        let bundler = CommandBundler::new("definitely-not-a-real-bundler", vec![]);
        let err = bundler.bundle(&dir.path().join("nope.html")).unwrap_err();
        assert!(matches!(err, BundleError::MissingEntry(_)));
    }

    #[test]
    fn unlaunchable_program_is_a_launch_error() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("entry.html");
        std::fs::write(&entry, "<html></html>").unwrap();
        let bundler = CommandBundler::new("definitely-not-a-real-bundler", vec![]);
        let err = bundler.bundle(&entry).unwrap_err();
        assert!(matches!(err, BundleError::Launch { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn stdout_of_successful_process_is_the_merged_document() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("entry.html");
        std::fs::write(&entry, "<link rel=\"import\" href=\"a.html\">").unwrap();
        let bundler = CommandBundler::new("cat", vec![]);
        assert_eq!(
            bundler.bundle(&entry).unwrap(),
            "<link rel=\"import\" href=\"a.html\">"
        );
    }
}
