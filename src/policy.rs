//! Access policy engine — whitelist bypass and fence (deny) rules.
//!
//! # Design
//!
//! Two independent predicates, evaluated by the dispatcher in a fixed order:
//!
//! 1. [`AccessPolicy::whitelisted`] runs before identity matters and may let
//!    anonymous traffic through.
//! 2. [`AccessPolicy::fenced`] runs only once a principal is known and can
//!    only take access away.
//!
//! ## Host patterns
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `app.example.com` | exactly that host (case-insensitive, port ignored) |
//! | `*.example.com` | any subdomain of `example.com`, not the apex |
//! | `*` | every host |
//!
//! ## Path patterns
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `/static/*` | one segment below `/static/` (`*` never crosses `/`) |
//! | `/static/**` | any depth below `/static/` |
//! | `/api/**/health` | `/api/health`, `/api/v1/health`, `/api/v1/x/health` |
//!
//! A rule without a path covers the whole host. Paths are matched in the
//! normalized form produced by [`crate::target::normalize_path`].

use glob::{MatchOptions, Pattern};
use tracing::{debug, warn};

use crate::config::{FenceRule, PolicyConfig, WhitelistRule};
use crate::target::strip_port;

const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Outcome of evaluating the policy for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// Whitelisted, forward regardless of identity
    Whitelisted,
    /// No principal and not whitelisted
    ForceLogin,
    /// Principal is fenced out
    Deny,
    /// Principal may proceed
    Allow,
}

struct CompiledWhitelist {
    host: String,
    path: Option<Pattern>,
    methods: Vec<String>,
}

struct CompiledFence {
    host: String,
    path: Option<Pattern>,
    allow: Vec<String>,
}

/// Compiled policy, built once at startup.
pub struct AccessPolicy {
    whitelist: Vec<CompiledWhitelist>,
    fence: Vec<CompiledFence>,
}

impl AccessPolicy {
    /// Compile rules from configuration. Invalid globs are skipped with a
    /// warning; [`crate::config::Config::validate`] rejects them earlier.
    #[must_use]
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            whitelist: config.whitelist.iter().filter_map(compile_whitelist).collect(),
            fence: config.fence.iter().filter_map(compile_fence).collect(),
        }
    }

    /// `true` when the request may bypass authentication entirely.
    #[must_use]
    pub fn whitelisted(&self, host: &str, path: &str, method: &str) -> bool {
        self.whitelist.iter().any(|rule| {
            host_matches(&rule.host, host)
                && path_matches(rule.path.as_ref(), path)
                && (rule.methods.is_empty()
                    || rule.methods.iter().any(|m| m.eq_ignore_ascii_case(method)))
        })
    }

    /// `true` when an authenticated principal must be turned away.
    #[must_use]
    pub fn fenced(&self, principal: &str, host: &str, path: &str) -> bool {
        let denied = self.fence.iter().any(|rule| {
            host_matches(&rule.host, host)
                && path_matches(rule.path.as_ref(), path)
                && !rule.allow.iter().any(|a| principal_matches(a, principal))
        });
        if denied {
            debug!(principal = %principal, host = %host, path = %path, "Fence rule denied request");
        }
        denied
    }

    /// Combined decision, in pipeline order.
    #[must_use]
    pub fn decide(&self, principal: Option<&str>, host: &str, path: &str, method: &str) -> AccessDecision {
        if self.whitelisted(host, path, method) {
            return AccessDecision::Whitelisted;
        }
        match principal {
            None => AccessDecision::ForceLogin,
            Some(p) if self.fenced(p, host, path) => AccessDecision::Deny,
            Some(_) => AccessDecision::Allow,
        }
    }
}

fn compile_path(path: Option<&String>) -> Result<Option<Pattern>, glob::PatternError> {
    path.map(|p| Pattern::new(p)).transpose()
}

fn compile_whitelist(rule: &WhitelistRule) -> Option<CompiledWhitelist> {
    match compile_path(rule.path.as_ref()) {
        Ok(path) => Some(CompiledWhitelist {
            host: rule.host.to_ascii_lowercase(),
            path,
            methods: rule.methods.clone(),
        }),
        Err(e) => {
            warn!(host = %rule.host, error = %e, "Skipping whitelist rule with invalid path");
            None
        }
    }
}

fn compile_fence(rule: &FenceRule) -> Option<CompiledFence> {
    match compile_path(rule.path.as_ref()) {
        Ok(path) => Some(CompiledFence {
            host: rule.host.to_ascii_lowercase(),
            path,
            allow: rule.allow.clone(),
        }),
        Err(e) => {
            warn!(host = %rule.host, error = %e, "Skipping fence rule with invalid path");
            None
        }
    }
}

/// Match a lowercase host pattern against a request host.
fn host_matches(pattern: &str, host: &str) -> bool {
    let host = strip_port(host).to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host
            .strip_suffix(suffix)
            .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1);
    }
    pattern == host
}

fn path_matches(pattern: Option<&Pattern>, path: &str) -> bool {
    pattern.is_none_or(|p| p.matches_with(path, PATH_MATCH))
}

/// `@domain` entries match any principal in that email domain.
fn principal_matches(entry: &str, principal: &str) -> bool {
    if entry.starts_with('@') {
        principal
            .rfind('@')
            .is_some_and(|at| principal[at..].eq_ignore_ascii_case(entry))
    } else {
        entry == principal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AccessPolicy {
        AccessPolicy::new(&PolicyConfig {
            whitelist: vec![
                WhitelistRule {
                    host: "status.example.com".to_string(),
                    path: None,
                    methods: Vec::new(),
                },
                WhitelistRule {
                    host: "*.cdn.example.com".to_string(),
                    path: Some("/assets/*".to_string()),
                    methods: vec!["GET".to_string(), "HEAD".to_string()],
                },
            ],
            fence: vec![
                FenceRule {
                    host: "admin.example.com".to_string(),
                    path: None,
                    allow: vec!["root@example.com".to_string(), "@ops.example.com".to_string()],
                },
                FenceRule {
                    host: "wiki.example.com".to_string(),
                    path: Some("/private/*".to_string()),
                    allow: vec!["alice@example.com".to_string()],
                },
            ],
        })
    }

    #[test]
    fn whitelist_matches_host_path_and_method() {
        let policy = policy();

        assert!(policy.whitelisted("status.example.com", "/anything", "POST"));
        assert!(policy.whitelisted("STATUS.example.com:443", "/", "GET"));
        assert!(policy.whitelisted("eu.cdn.example.com", "/assets/app.js", "GET"));

        assert!(!policy.whitelisted("eu.cdn.example.com", "/assets/app.js", "POST"));
        assert!(!policy.whitelisted("eu.cdn.example.com", "/api", "GET"));
        assert!(!policy.whitelisted("cdn.example.com", "/assets/app.js", "GET"));
        assert!(!policy.whitelisted("app.example.com", "/", "GET"));
    }

    #[test]
    fn fence_denies_unlisted_principals() {
        let policy = policy();

        assert!(!policy.fenced("root@example.com", "admin.example.com", "/"));
        assert!(!policy.fenced("bob@ops.example.com", "admin.example.com", "/users"));
        assert!(policy.fenced("bob@example.com", "admin.example.com", "/"));
        // Domain entries do not match subdomains or lookalikes
        assert!(policy.fenced("eve@evilops.example.com", "admin.example.com", "/"));
    }

    #[test]
    fn fence_scoped_to_path() {
        let policy = policy();

        assert!(!policy.fenced("bob@example.com", "wiki.example.com", "/public/page"));
        assert!(policy.fenced("bob@example.com", "wiki.example.com", "/private/page"));
        assert!(!policy.fenced("alice@example.com", "wiki.example.com", "/private/page"));
    }

    #[test]
    fn unfenced_host_allows_everyone() {
        assert!(!policy().fenced("anyone", "app.example.com", "/"));
    }

    #[test]
    fn decide_follows_pipeline_order() {
        let policy = policy();

        assert_eq!(
            policy.decide(None, "status.example.com", "/", "GET"),
            AccessDecision::Whitelisted
        );
        assert_eq!(
            policy.decide(None, "app.example.com", "/", "GET"),
            AccessDecision::ForceLogin
        );
        assert_eq!(
            policy.decide(Some("bob@example.com"), "admin.example.com", "/", "GET"),
            AccessDecision::Deny
        );
        assert_eq!(
            policy.decide(Some("bob@example.com"), "app.example.com", "/", "GET"),
            AccessDecision::Allow
        );
    }

    #[test]
    fn single_star_stays_within_one_segment() {
        let policy = policy();

        assert!(policy.whitelisted("eu.cdn.example.com", "/assets/app.js", "GET"));
        assert!(!policy.whitelisted("eu.cdn.example.com", "/assets/js/app.js", "GET"));
        assert!(policy.fenced("bob@example.com", "wiki.example.com", "/private/page"));
        assert!(!policy.fenced("bob@example.com", "wiki.example.com", "/private/a/b"));
    }

    #[test]
    fn double_star_spans_segments() {
        let policy = AccessPolicy::new(&PolicyConfig {
            whitelist: vec![WhitelistRule {
                host: "app.example.com".to_string(),
                path: Some("/api/**/health".to_string()),
                methods: Vec::new(),
            }],
            fence: Vec::new(),
        });

        assert!(policy.whitelisted("app.example.com", "/api/health", "GET"));
        assert!(policy.whitelisted("app.example.com", "/api/v1/db/health", "GET"));
        assert!(!policy.whitelisted("app.example.com", "/api/v1/db/status", "GET"));
    }

    #[test]
    fn host_port_is_ignored_but_not_other_suffixes() {
        let policy = policy();

        assert!(policy.whitelisted("status.example.com:8443", "/", "GET"));
        assert!(policy.whitelisted("eu.cdn.example.com:443", "/assets/a.css", "GET"));
        assert!(!policy.whitelisted("status.example.com:evil", "/", "GET"));
    }
}
