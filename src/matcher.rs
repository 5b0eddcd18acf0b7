//! Principal, resource and action matching.
//!
//! Resource expressions are either globs (`*` matches any run, `?` one
//! character) or `expr:`-prefixed regular expressions, compiled once when
//! a snapshot is built.

use std::collections::HashSet;

use regex::Regex;

use crate::api::Permission;

/// A pre-compiled resource expression.
#[derive(Debug, Clone)]
pub enum ResourcePattern {
    Glob(String),
    Regex(Regex),
    /// A pattern that failed to compile. It never matches; the defect is
    /// logged when the snapshot is built.
    Invalid(String),
}

pub const EXPR_PREFIX: &str = "expr:";

impl ResourcePattern {
    pub fn compile(expression: &str) -> ResourcePattern {
        if let Some(raw) = expression.strip_prefix(EXPR_PREFIX) {
            match Regex::new(raw) {
                Ok(re) => ResourcePattern::Regex(re),
                Err(e) => {
                    tracing::warn!(
                        expression,
                        error = %e,
                        "resource expression does not compile; it will never match"
                    );
                    ResourcePattern::Invalid(expression.to_string())
                }
            }
        } else {
            ResourcePattern::Glob(expression.to_string())
        }
    }

    pub fn matches(&self, resource: &str) -> bool {
        match self {
            ResourcePattern::Glob(pattern) => glob_match(pattern, resource),
            ResourcePattern::Regex(re) => re.is_match(resource),
            ResourcePattern::Invalid(_) => false,
        }
    }
}

/// Glob matching with `*` (any run, including empty) and `?` (exactly one
/// character). Iterative with star backtracking, no allocation.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// A permission with its expression compiled.
#[derive(Debug, Clone)]
pub struct CompiledPermission {
    pub resource: Option<String>,
    pub expression: Option<String>,
    pub pattern: Option<ResourcePattern>,
    pub actions: Vec<String>,
}

impl CompiledPermission {
    pub fn compile(permission: &Permission) -> CompiledPermission {
        CompiledPermission {
            resource: permission.resource.clone(),
            expression: permission.resource_expression.clone(),
            pattern: permission
                .resource_expression
                .as_deref()
                .map(ResourcePattern::compile),
            actions: permission.actions.clone(),
        }
    }

    /// An empty permission (no resource, no expression) applies to any
    /// resource; an empty actions list applies to any action.
    pub fn matches(&self, resource: &str, action: &str) -> bool {
        let resource_matched = match (&self.resource, &self.pattern) {
            (None, None) => true,
            (Some(named), _) if named == resource => true,
            (_, Some(pattern)) => pattern.matches(resource),
            _ => false,
        };
        if !resource_matched {
            return false;
        }
        self.actions.is_empty() || self.actions.iter().any(|a| a == action)
    }

    /// Resource-only match, used when subtracting denied permissions.
    pub fn matches_resource(&self, resource: &str) -> bool {
        match (&self.resource, &self.pattern) {
            (None, None) => true,
            (Some(named), _) if named == resource => true,
            (_, Some(pattern)) => pattern.matches(resource),
            _ => false,
        }
    }
}

/// Policy principal match: the OR-list matches when any AND-group is
/// fully contained in the effective principal set. An empty list matches
/// any principal.
pub fn match_principal_groups(effective: &HashSet<String>, groups: &[Vec<String>]) -> bool {
    if effective.is_empty() {
        return false;
    }
    if groups.is_empty() {
        return true;
    }
    groups
        .iter()
        .any(|group| group.iter().all(|p| effective.contains(p)))
}

/// Role policy principal match: a flat OR list; empty matches anyone.
pub fn match_any_principal(effective: &HashSet<String>, principals: &[String]) -> bool {
    if effective.is_empty() {
        return false;
    }
    if principals.is_empty() {
        return true;
    }
    principals.iter().any(|p| effective.contains(p))
}

/// Role policy resource scope: empty scope applies to any resource.
pub fn match_role_policy_scope(
    resource: &str,
    resources: &[String],
    patterns: &[ResourcePattern],
) -> bool {
    if resources.is_empty() && patterns.is_empty() {
        return true;
    }
    resources.iter().any(|r| r == resource) || patterns.iter().any(|p| p.matches(resource))
}

/// Subtract denied permissions from granted ones at the action level.
/// A denied entry with no actions removes the whole resource; a granted
/// resource that loses all its actions disappears from the result.
pub fn subtract_permissions(
    granted: Vec<Permission>,
    denied: &[CompiledPermission],
) -> Vec<Permission> {
    if denied.is_empty() {
        return granted;
    }
    let mut result = Vec::new();
    'next_grant: for grant in granted {
        let Some(resource) = grant.resource.clone() else {
            continue;
        };
        let mut actions = grant.actions;
        for deny in denied {
            if !deny.matches_resource(&resource) {
                continue;
            }
            if deny.actions.is_empty() {
                continue 'next_grant;
            }
            actions.retain(|a| !deny.actions.contains(a));
            if actions.is_empty() {
                continue 'next_grant;
            }
        }
        result.push(Permission {
            resource: Some(resource),
            resource_expression: None,
            actions,
        });
    }
    result
}
