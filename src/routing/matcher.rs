//! # Request Matchers
//!
//! Host, path and method matchers used by routing rules and by the built-in conditions.
//!
//! - Hosts are literal names, globs (`*` is one DNS label) or regular expressions.
//! - Paths are regular expressions or templates with named parameters (`/users/:id`)
//!   and a trailing wildcard (`/static/*`). Templates are matched by `matchit` radix trees.
//! - Methods are restricted to the standard HTTP verbs.

use axum::http::Method;
use matchit::Router as RadixRouter;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::fmt;

use crate::config_error;
use crate::core::error::GatewayResult;

/// Name under which a trailing `*` wildcard is exposed in path params
pub const WILDCARD_PARAM: &str = "wildcard";

/// Translate a glob into an anchored, case-insensitive regex; `*` becomes `star`
pub fn glob_to_regex(pattern: &str, star: &str) -> GatewayResult<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(star);

    RegexBuilder::new(&format!("^{}$", body))
        .case_insensitive(true)
        .build()
        .map_err(|e| config_error!("Invalid glob pattern '{}': {}", pattern, e))
}

/// Remove one trailing `/`, keeping the root path intact
pub fn normalize_path(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

/// Host part of a routing rule
#[derive(Debug, Clone)]
pub enum HostPattern {
    /// No host given, or the literal `*`
    Any,
    /// Literal host name, lowercased
    Exact(String),
    /// Glob where `*` matches exactly one DNS label
    Glob { source: String, regex: Regex },
    /// `hostRegex`, searched in the host name
    Regex { source: String, regex: Regex },
}

impl HostPattern {
    pub fn from_definition(host: Option<&str>, host_regex: Option<&str>) -> GatewayResult<Self> {
        if let Some(source) = host_regex {
            // request hosts are lowercased before matching
            let regex = RegexBuilder::new(source)
                .case_insensitive(true)
                .build()
                .map_err(|e| config_error!("Invalid hostRegex '{}': {}", source, e))?;
            return Ok(HostPattern::Regex {
                source: source.to_string(),
                regex,
            });
        }

        match host.map(str::trim) {
            None | Some("") | Some("*") => Ok(HostPattern::Any),
            Some(source) if source.contains('*') => Ok(HostPattern::Glob {
                source: source.to_ascii_lowercase(),
                regex: glob_to_regex(source, "[^.]+")?,
            }),
            Some(source) => Ok(HostPattern::Exact(source.to_ascii_lowercase())),
        }
    }

    /// Match a normalized (lowercase, port-free) host
    pub fn matches(&self, host: Option<&str>) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Exact(expected) => host == Some(expected.as_str()),
            HostPattern::Glob { regex, .. } | HostPattern::Regex { regex, .. } => {
                host.map(|host| regex.is_match(host)).unwrap_or(false)
            }
        }
    }

    /// Key identifying rules that share a host group
    pub fn group_key(&self) -> String {
        match self {
            HostPattern::Any => "*".to_string(),
            HostPattern::Exact(host) => host.clone(),
            HostPattern::Glob { source, .. } => format!("glob:{}", source),
            HostPattern::Regex { source, .. } => format!("regex:{}", source),
        }
    }
}

/// One `paths` entry
pub struct PathTemplate {
    source: String,
    kind: TemplateKind,
}

enum TemplateKind {
    All,
    Radix {
        router: RadixRouter<()>,
        /// Set for `/prefix/*` templates so `/prefix` itself also matches
        prefix: Option<String>,
    },
}

impl PathTemplate {
    pub fn parse(source: &str) -> GatewayResult<Self> {
        let trimmed = source.trim();
        if trimmed == "*" {
            return Ok(Self {
                source: source.to_string(),
                kind: TemplateKind::All,
            });
        }
        if !trimmed.starts_with('/') {
            return Err(config_error!("Path '{}' must start with '/'", source));
        }

        let normalized = normalize_path(trimmed);
        let (pattern, prefix) = match normalized.strip_suffix("/*") {
            Some(prefix) => (
                format!("{}/*{}", prefix, WILDCARD_PARAM),
                Some(if prefix.is_empty() { "/".to_string() } else { prefix.to_string() }),
            ),
            None => (normalized.to_string(), None),
        };

        if pattern.trim_end_matches(&format!("*{}", WILDCARD_PARAM)).contains('*') {
            return Err(config_error!(
                "Path '{}' may only use '*' as its last segment",
                source
            ));
        }

        let mut router = RadixRouter::new();
        router
            .insert(pattern.as_str(), ())
            .map_err(|e| config_error!("Invalid path '{}': {}", source, e))?;

        Ok(Self {
            source: source.to_string(),
            kind: TemplateKind::Radix { router, prefix },
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Match a normalized path, returning extracted parameters
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        match &self.kind {
            TemplateKind::All => Some(HashMap::new()),
            TemplateKind::Radix { router, prefix } => {
                if let Ok(matched) = router.at(path) {
                    return Some(
                        matched
                            .params
                            .iter()
                            .map(|(key, value)| (key.to_string(), value.to_string()))
                            .collect(),
                    );
                }
                match prefix {
                    Some(prefix) if prefix == path => {
                        let mut params = HashMap::new();
                        params.insert(WILDCARD_PARAM.to_string(), String::new());
                        Some(params)
                    }
                    _ => None,
                }
            }
        }
    }
}

impl fmt::Debug for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathTemplate").field(&self.source).finish()
    }
}

/// Path part of a routing rule
#[derive(Debug)]
pub enum PathMatcher {
    /// Neither `paths` nor `pathRegex`
    Any,
    /// `pathRegex`, searched in the request path
    Regex(Regex),
    /// `paths` in declaration order
    Templates(Vec<PathTemplate>),
}

impl PathMatcher {
    pub fn from_definition(paths: Option<Vec<String>>, path_regex: Option<&str>) -> GatewayResult<Self> {
        if let Some(source) = path_regex {
            let regex = Regex::new(source)
                .map_err(|e| config_error!("Invalid pathRegex '{}': {}", source, e))?;
            return Ok(PathMatcher::Regex(regex));
        }

        match paths {
            None => Ok(PathMatcher::Any),
            Some(paths) if paths.is_empty() => Ok(PathMatcher::Any),
            Some(paths) => paths
                .iter()
                .map(|path| PathTemplate::parse(path))
                .collect::<GatewayResult<Vec<_>>>()
                .map(PathMatcher::Templates),
        }
    }

    /// Match a raw request path; templates see it with one trailing `/` removed
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        match self {
            PathMatcher::Any => Some(HashMap::new()),
            PathMatcher::Regex(regex) => regex.is_match(path).then(HashMap::new),
            PathMatcher::Templates(templates) => {
                let path = normalize_path(path);
                templates.iter().find_map(|template| template.matches(path))
            }
        }
    }
}

const KNOWN_METHODS: [Method; 9] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::CONNECT,
    Method::OPTIONS,
    Method::TRACE,
    Method::PATCH,
];

/// Method restriction of a rule or `method` condition
#[derive(Debug, Clone, PartialEq)]
pub enum MethodFilter {
    Any,
    Only(Vec<Method>),
}

impl MethodFilter {
    /// Parse verbs; each entry may itself be a comma-separated list
    pub fn parse(values: &[String]) -> GatewayResult<Self> {
        let mut methods = Vec::new();

        for name in values.iter().flat_map(|value| value.split(',')) {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let upper = name.to_ascii_uppercase();
            let method = KNOWN_METHODS
                .iter()
                .find(|m| m.as_str() == upper)
                .cloned()
                .ok_or_else(|| config_error!("Unknown HTTP method '{}'", name))?;
            if !methods.contains(&method) {
                methods.push(method);
            }
        }

        if methods.is_empty() {
            Ok(MethodFilter::Any)
        } else {
            Ok(MethodFilter::Only(methods))
        }
    }

    pub fn allows(&self, method: &Method) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::Only(methods) => methods.contains(method),
        }
    }
}
