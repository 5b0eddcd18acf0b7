//! Data model of the decision point: principals, policies, role policies,
//! request contexts and decision results.
//!
//! These types mirror what the policy store serves. They are immutable from
//! the engine's point of view: the engine only observes them and compiles
//! them into snapshots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::condition::Value;

// ---------- Principals and subjects ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalType {
    User,
    Group,
    Role,
    Entity,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::User => "user",
            PrincipalType::Group => "group",
            PrincipalType::Role => "role",
            PrincipalType::Entity => "entity",
        }
    }
}

impl std::fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An identity reference. Encoded as `type:name`, e.g. `user:alice`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "type")]
    pub kind: PrincipalType,
    pub name: String,
}

impl Principal {
    pub fn new(kind: PrincipalType, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self::new(PrincipalType::User, name)
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::new(PrincipalType::Group, name)
    }

    pub fn entity(name: impl Into<String>) -> Self {
        Self::new(PrincipalType::Entity, name)
    }

    /// The `type:name` form used in policy principal lists.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }
}

/// Prefix a role name into its principal form, e.g. `role:admin`.
pub fn role_principal(role: &str) -> String {
    format!("role:{role}")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub principals: Vec<Principal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Set once the token has been asserted; assertion runs at most once
    /// per request.
    #[serde(default)]
    pub asserted: bool,
}

/// One authorization question: does `subject` get to perform `action` on
/// `resource` within `service_name`?
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    pub service_name: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

// ---------- Policy domain types ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Grant,
    Deny,
}

/// A set of actions over one resource. Exactly one of `resource` and
/// `resource_expression` is set; `resource_expression` is either a glob
/// (`*`, `?`) or an `expr:`-prefixed regular expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_expression: Option<String>,
    #[serde(default)]
    pub actions: Vec<String>,
}

/// Grant/deny mapping from principals to permissions, optionally gated by
/// a condition expression.
///
/// `principals` is an OR-list of AND-groups: the policy applies when any
/// group is fully contained in the effective principal set. An empty list
/// applies to any principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub effect: Effect,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub principals: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Grant/deny mapping from principals to roles, optionally resource-scoped
/// and condition-gated. `principals` is a flat OR list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePolicy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub effect: Effect,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub principals: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub resource_expressions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A remote custom function usable from condition expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub func_url: String,
    /// PEM bundle for the transport layer when the function endpoint uses
    /// a private CA. Opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    #[serde(default)]
    pub result_cachable: bool,
    /// TTL of a cached result in seconds; 0 means no expiry.
    #[serde(default)]
    pub result_ttl: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A named scope owning policies and role policies. Created and deleted
/// as a unit in the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(rename = "type", default)]
    pub service_type: String,
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub role_policies: Vec<RolePolicy>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

// ---------- Decision results ----------

/// Why a decision came out the way it did. The numeric encoding belongs
/// to the transport layer; the engine only guarantees the symbolic value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    GrantPolicyFound,
    DenyPolicyFound,
    NoApplicablePolicies,
    ErrorInEvaluation,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Reason::GrantPolicyFound => "GRANT_POLICY_FOUND",
            Reason::DenyPolicyFound => "DENY_POLICY_FOUND",
            Reason::NoApplicablePolicies => "NO_APPLICABLE_POLICIES",
            Reason::ErrorInEvaluation => "ERROR_IN_EVALUATION",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Reason,
}

impl Decision {
    pub fn new(allowed: bool, reason: Reason) -> Self {
        Self { allowed, reason }
    }
}

/// Outcome of one policy or role policy during `diagnose`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvalStatus {
    /// Principal/resource matched and the condition (if any) held.
    TakeEffect,
    /// Principal/resource matched but the condition evaluated to false.
    ConditionFailed,
    /// Condition evaluation failed with an error.
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosedPolicy {
    pub id: String,
    pub name: String,
    pub effect: Effect,
    pub status: EvalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_result: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosedRolePolicy {
    pub id: String,
    pub name: String,
    pub effect: Effect,
    pub roles: Vec<String>,
    pub status: EvalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_result: Option<bool>,
}

/// Full trace of a decision: everything the engine considered, with the
/// same final decision `is_allowed` would have produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub allowed: bool,
    pub reason: Reason,
    pub request: RequestContext,
    pub attributes: HashMap<String, Value>,
    pub granted_roles: Vec<String>,
    pub role_policies: Vec<DiagnosedRolePolicy>,
    pub policies: Vec<DiagnosedPolicy>,
}

// ---------- Built-in attribute and role names ----------

pub const ATTR_REQUEST_USER: &str = "request_user";
pub const ATTR_REQUEST_GROUPS: &str = "request_groups";
pub const ATTR_REQUEST_ENTITY: &str = "request_entity";
pub const ATTR_REQUEST_RESOURCE: &str = "request_resource";
pub const ATTR_REQUEST_ACTION: &str = "request_action";
pub const ATTR_REQUEST_TIME: &str = "request_time";
pub const ATTR_REQUEST_YEAR: &str = "request_year";
pub const ATTR_REQUEST_MONTH: &str = "request_month";
pub const ATTR_REQUEST_DAY: &str = "request_day";
pub const ATTR_REQUEST_HOUR: &str = "request_hour";
pub const ATTR_REQUEST_WEEKDAY: &str = "request_weekday";

pub const ROLE_EVERYONE: &str = "everyone_role";
pub const ROLE_AUTHENTICATED: &str = "authenticated_role";
pub const ROLE_ANONYMOUS: &str = "anonymous_role";
