//! Collapses `../` traversal in front of known component families.
//!
//! Component sources reference their siblings as `../px-foo/px-foo.html`
//! because at install time they sit next to each other. Once staged they are
//! resolved from the package root instead, so every run of parent hops that
//! immediately precedes a recognized token is replaced by the canonical
//! component prefix (`bower_components/` by default).

use regex::{Captures, Regex};

use crate::manifest::ManifestError;

#[derive(Debug, Clone)]
pub struct PathNormalizer {
    pattern: Option<Regex>,
    canonical_prefix: String,
}

impl PathNormalizer {
    pub fn new<S: AsRef<str>>(tokens: &[S], canonical_prefix: &str) -> Result<Self, ManifestError> {
        let alternatives: Vec<String> = tokens
            .iter()
            .map(|t| t.as_ref())
            .filter(|t| !t.is_empty())
            .map(regex::escape)
            .collect();
        // No tokens means nothing is recognized: the normalizer is the identity.
        let pattern = if alternatives.is_empty() {
            None
        } else {
            let source = format!(r"(?:\.\./)+({})", alternatives.join("|"));
            let regex = Regex::new(&source).map_err(|e| ManifestError::InvalidPattern {
                pattern: source.clone(),
                source: e,
            })?;
            Some(regex)
        };
        Ok(Self {
            pattern,
            canonical_prefix: canonical_prefix.to_string(),
        })
    }

    /// Rewrites every `../`-run before a recognized token. Total and idempotent.
    pub fn normalize(&self, text: &str) -> String {
        match &self.pattern {
            Some(pattern) => pattern
                .replace_all(text, |caps: &Captures| {
                    format!("{}{}", self.canonical_prefix, &caps[1])
                })
                .into_owned(),
            None => text.to_string(),
        }
    }
}
