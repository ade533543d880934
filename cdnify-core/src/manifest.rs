//! Rewrite rules and the ordered manifest built for one publish operation.
//!
//! A manifest is assembled in a fixed order: font rules, one rule per sibling
//! component, caller-supplied rules, then the default third-party rules. The
//! generic defaults come last so that they can never shadow the more specific
//! rules in front of them. Construction is a pure function of its inputs, so two
//! builds from the same request serialize to identical bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::CdnConfig;

/// Placeholder substituted with a package version inside literal rule targets.
pub const VERSION_PLACEHOLDER: &str = "${version}";

/// How a rule finds the references it rewrites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Matcher {
    /// A regular expression. A capture group named `lead` is kept in front of the target.
    Pattern(String),
    /// A reference path such as `px-button/px-button.html`, matched as a whole URL.
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub matcher: Matcher,
    pub target: String,
    /// Package whose version fills [`VERSION_PLACEHOLDER`] in `target`.
    pub package: Option<String>,
}

/// A caller-supplied rule, as written in the operation's `strings` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraRule {
    Literal {
        file: String,
        #[serde(default)]
        package: Option<String>,
        cdn: String,
    },
    Pattern {
        pattern: String,
        cdn: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub package: String,
    pub version: String,
    pub rules: Vec<RewriteRule>,
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Canonical serialized form, used to compare manifests byte for byte.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid rewrite pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("rewrite rule #{index} has an empty literal path")]
    EmptyLiteral { index: usize },
}

/// Inputs of [`build_manifest`].
#[derive(Debug, Clone, Default)]
pub struct ManifestRequest<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub namespace: Option<&'a str>,
    pub siblings: &'a [String],
    pub extra: &'a [ExtraRule],
}

/// Characters after which a URL reference may start (or the start of a line):
/// quotes, template literal backticks, `(`, `=`, whitespace, the `,` between
/// `srcset` candidates and the `>` closing a tag before a text node.
pub(crate) const REFERENCE_LEAD: &str = r#"(?m)(?P<lead>^|["'`(=,>\s])"#;

/// Regex fragment for relative prefixes absorbed into a reference.
pub(crate) fn relative_prefix(component_root: &str) -> String {
    if component_root.is_empty() {
        r"(?:\./|\.\./)*".to_string()
    } else {
        format!(r"(?:\./|\.\./|{})*", regex::escape(component_root))
    }
}

/// Pattern matching a font directory reference wherever it starts a URL.
pub fn font_pattern(component_root: &str, path: &str) -> String {
    format!(
        "{}{}{}",
        REFERENCE_LEAD,
        relative_prefix(component_root),
        regex::escape(path)
    )
}

/// CDN location of a sibling component's entry document.
pub fn sibling_target(endpoint: &str, namespace: Option<&str>, component: &str) -> String {
    match namespace {
        Some(ns) => format!("//{endpoint}/{ns}/{component}/{VERSION_PLACEHOLDER}/{component}.html"),
        None => format!("//{endpoint}/{component}/{VERSION_PLACEHOLDER}/{component}.html"),
    }
}

pub fn build_manifest(config: &CdnConfig, request: &ManifestRequest<'_>) -> Manifest {
    let mut rules = Vec::with_capacity(
        config.fonts.len() + request.siblings.len() + request.extra.len() + config.defaults.len(),
    );

    for font in &config.fonts {
        rules.push(RewriteRule {
            matcher: Matcher::Pattern(font_pattern(&config.component_root, &font.path)),
            target: font.cdn.clone(),
            package: None,
        });
    }

    for sibling in request.siblings.iter().filter(|s| !s.is_empty()) {
        rules.push(RewriteRule {
            matcher: Matcher::Literal(format!("{sibling}/{sibling}.html")),
            target: sibling_target(&config.endpoint, request.namespace, sibling),
            package: Some(sibling.clone()),
        });
    }

    for extra in request.extra {
        rules.push(match extra {
            ExtraRule::Literal { file, package, cdn } => RewriteRule {
                matcher: Matcher::Literal(file.clone()),
                target: cdn.clone(),
                // An unnamed package refers to the one being published.
                package: Some(package.clone().unwrap_or_else(|| request.name.to_string())),
            },
            ExtraRule::Pattern { pattern, cdn } => RewriteRule {
                matcher: Matcher::Pattern(pattern.clone()),
                target: cdn.clone(),
                package: None,
            },
        });
    }

    for default in &config.defaults {
        rules.push(RewriteRule {
            matcher: Matcher::Literal(default.file.clone()),
            target: default.cdn.clone(),
            package: Some(default.package.clone()),
        });
    }

    debug!(
        package = request.name,
        version = request.version,
        rules = rules.len(),
        "Built rewrite manifest"
    );

    Manifest {
        package: request.name.to_string(),
        version: request.version.to_string(),
        rules,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_target_includes_namespace_when_present() {
        assert_eq!(
            sibling_target("cdn.example", Some("predixdev"), "px-modal"),
            "//cdn.example/predixdev/px-modal/${version}/px-modal.html"
        );
        assert_eq!(
            sibling_target("cdn.example", None, "px-modal"),
            "//cdn.example/px-modal/${version}/px-modal.html"
        );
    }

    #[test]
    fn extra_rules_deserialize_from_either_shape() {
        let rules: Vec<ExtraRule> = serde_json::from_str(
            r#"[{"file":"a/a.html","cdn":"//x/a.html"},{"pattern":"foo/","cdn":"//x/"}]"#,
        )
        .unwrap();
        assert!(matches!(rules[0], ExtraRule::Literal { package: None, .. }));
        assert!(matches!(rules[1], ExtraRule::Pattern { .. }));
    }
}
