//! Applies a compiled [`Manifest`] to text, rule by rule, in manifest order.

use regex::{Captures, Regex};
use std::borrow::Cow;
use tracing::{trace, warn};

use crate::manifest::{
    relative_prefix, Manifest, ManifestError, Matcher, REFERENCE_LEAD, VERSION_PLACEHOLDER,
};
use crate::versions::VersionLookup;

#[derive(Debug, Clone)]
struct CompiledRule {
    regex: Regex,
    target: String,
    package: Option<String>,
    /// Only literal targets are templates; pattern targets are used verbatim.
    templated: bool,
}

/// A manifest compiled once and applied to any number of documents.
///
/// Rewriting is pure: the same text, manifest and versions always produce the
/// same output. A literal rule whose target needs a version that cannot be
/// resolved is skipped and the reference is left as it was.
#[derive(Debug, Clone)]
pub struct ReferenceRewriter {
    rules: Vec<CompiledRule>,
}

impl ReferenceRewriter {
    pub fn new(manifest: &Manifest, component_root: &str) -> Result<Self, ManifestError> {
        let prefix = relative_prefix(component_root);
        let mut rules = Vec::with_capacity(manifest.len());
        for (index, rule) in manifest.rules.iter().enumerate() {
            let (source, templated) = match &rule.matcher {
                Matcher::Pattern(pattern) => (pattern.clone(), false),
                Matcher::Literal(path) => {
                    if path.is_empty() {
                        return Err(ManifestError::EmptyLiteral { index });
                    }
                    (
                        format!("{REFERENCE_LEAD}{prefix}{}", regex::escape(path)),
                        true,
                    )
                }
            };
            let regex = Regex::new(&source).map_err(|e| ManifestError::InvalidPattern {
                pattern: source.clone(),
                source: e,
            })?;
            rules.push(CompiledRule {
                regex,
                target: rule.target.clone(),
                package: rule.package.clone(),
                templated,
            });
        }
        Ok(Self { rules })
    }

    pub fn rewrite(&self, text: &str, versions: &dyn VersionLookup) -> String {
        let mut out = text.to_string();
        for rule in &self.rules {
            let Some(target) = self.resolve_target(rule, &out, versions) else {
                continue;
            };
            let replaced = match rule.regex.replace_all(&out, |caps: &Captures| {
                let lead = caps.name("lead").map_or("", |m| m.as_str());
                format!("{lead}{target}")
            }) {
                Cow::Owned(s) => Some(s),
                Cow::Borrowed(_) => None,
            };
            if let Some(s) = replaced {
                trace!(pattern = rule.regex.as_str(), "Rule rewrote references");
                out = s;
            }
        }
        out
    }

    fn resolve_target<'r>(
        &self,
        rule: &'r CompiledRule,
        text: &str,
        versions: &dyn VersionLookup,
    ) -> Option<Cow<'r, str>> {
        if !rule.templated || !rule.target.contains(VERSION_PLACEHOLDER) {
            return Some(Cow::Borrowed(rule.target.as_str()));
        }
        let version = rule.package.as_deref().and_then(|p| versions.version_of(p));
        match version {
            Some(v) => Some(Cow::Owned(rule.target.replace(VERSION_PLACEHOLDER, &v))),
            None => {
                if rule.regex.is_match(text) {
                    warn!(
                        package = rule.package.as_deref().unwrap_or("<none>"),
                        target = %rule.target,
                        "No version resolvable for rule; leaving references unrewritten"
                    );
                }
                None
            }
        }
    }
}
