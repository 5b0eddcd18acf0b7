//! Immutable, indexed, pre-parsed view of one service's policies and
//! role policies. A snapshot is built once from store data and shared
//! behind an `Arc`; in-flight evaluations keep superseded snapshots
//! alive until they finish.

use std::collections::{BTreeMap, HashMap};

use crate::api::{Policy, RolePolicy};
use crate::condition::{parse, Expr};
use crate::matcher::{CompiledPermission, ResourcePattern};

/// A condition pre-parsed at compile time. A string that does not parse
/// is retained poisoned: evaluating it yields the parse error, so the
/// decision fails closed instead of silently skipping the policy.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub text: String,
    pub parsed: Result<Expr, String>,
}

impl CompiledCondition {
    fn compile(text: &str) -> CompiledCondition {
        let parsed = parse(text).map_err(|e| e.to_string());
        if let Err(error) = &parsed {
            tracing::warn!(condition = text, %error, "condition does not parse; it will fail closed");
        }
        CompiledCondition {
            text: text.to_string(),
            parsed,
        }
    }
}

#[derive(Debug)]
pub struct CompiledPolicy {
    pub policy: Policy,
    pub permissions: Vec<CompiledPermission>,
    pub condition: Option<CompiledCondition>,
}

#[derive(Debug)]
pub struct CompiledRolePolicy {
    pub policy: RolePolicy,
    pub resource_patterns: Vec<ResourcePattern>,
    pub condition: Option<CompiledCondition>,
}

/// Candidate index: policy ids by principal, plus the bucket of policies
/// that name no principal (they apply to anyone). The index is a
/// superset filter; candidates still go through the full matcher.
#[derive(Debug, Default)]
struct PrincipalIndex {
    by_principal: HashMap<String, Vec<String>>,
    any_principal: Vec<String>,
}

impl PrincipalIndex {
    fn insert(&mut self, principals: impl Iterator<Item = String>, id: &str, any: bool) {
        if any {
            self.any_principal.push(id.to_string());
            return;
        }
        for principal in principals {
            self.by_principal
                .entry(principal)
                .or_default()
                .push(id.to_string());
        }
    }

    fn candidates_for<'a>(&'a self, principal: &str) -> impl Iterator<Item = &'a String> {
        self.any_principal
            .iter()
            .chain(self.by_principal.get(principal).into_iter().flatten())
    }
}

#[derive(Debug)]
pub struct Snapshot {
    service: String,
    policies: HashMap<String, CompiledPolicy>,
    role_policies: HashMap<String, CompiledRolePolicy>,
    policy_index: PrincipalIndex,
    role_index: PrincipalIndex,
}

impl Snapshot {
    /// Compile a service's policies into an immutable snapshot. Duplicate
    /// ids keep the last occurrence and are logged; stores are expected
    /// to enforce uniqueness.
    pub fn compile(
        service: &str,
        policies: &[Policy],
        role_policies: &[RolePolicy],
    ) -> Snapshot {
        let mut snapshot = Snapshot {
            service: service.to_string(),
            policies: HashMap::new(),
            role_policies: HashMap::new(),
            policy_index: PrincipalIndex::default(),
            role_index: PrincipalIndex::default(),
        };

        for policy in policies {
            if snapshot.policies.contains_key(&policy.id) {
                tracing::warn!(service, id = %policy.id, "duplicate policy id; keeping the later one");
            }
            let compiled = CompiledPolicy {
                permissions: policy.permissions.iter().map(CompiledPermission::compile).collect(),
                condition: policy.condition.as_deref().map(CompiledCondition::compile),
                policy: policy.clone(),
            };
            // Index the policy under every principal it mentions; AND/OR
            // structure is verified by the matcher on the candidates.
            let principals = policy
                .principals
                .iter()
                .flatten()
                .cloned()
                .collect::<Vec<_>>();
            snapshot
                .policy_index
                .insert(principals.into_iter(), &policy.id, policy.principals.is_empty());
            snapshot.policies.insert(policy.id.clone(), compiled);
        }

        for role_policy in role_policies {
            if snapshot.role_policies.contains_key(&role_policy.id) {
                tracing::warn!(service, id = %role_policy.id, "duplicate role policy id; keeping the later one");
            }
            let compiled = CompiledRolePolicy {
                resource_patterns: role_policy
                    .resource_expressions
                    .iter()
                    .map(|e| ResourcePattern::compile(e))
                    .collect(),
                condition: role_policy
                    .condition
                    .as_deref()
                    .map(CompiledCondition::compile),
                policy: role_policy.clone(),
            };
            snapshot.role_index.insert(
                role_policy.principals.iter().cloned(),
                &role_policy.id,
                role_policy.principals.is_empty(),
            );
            snapshot
                .role_policies
                .insert(role_policy.id.clone(), compiled);
        }

        tracing::debug!(
            service,
            policies = snapshot.policies.len(),
            role_policies = snapshot.role_policies.len(),
            "compiled snapshot"
        );
        snapshot
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn has_policies(&self) -> bool {
        !self.policies.is_empty()
    }

    /// Candidate policies for an effective principal set, deduplicated
    /// and in id order so evaluation is deterministic.
    pub fn candidate_policies<'a, I>(&self, principals: I) -> Vec<&CompiledPolicy>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut seen: BTreeMap<&str, &CompiledPolicy> = BTreeMap::new();
        for id in self.policy_index.any_principal.iter() {
            if let Some(p) = self.policies.get(id) {
                seen.insert(id, p);
            }
        }
        for principal in principals {
            if let Some(ids) = self.policy_index.by_principal.get(principal) {
                for id in ids {
                    if let Some(p) = self.policies.get(id) {
                        seen.insert(id, p);
                    }
                }
            }
        }
        seen.into_values().collect()
    }

    /// Candidate role policies for one principal, in id order.
    pub fn candidate_role_policies(&self, principal: &str) -> Vec<&CompiledRolePolicy> {
        let mut seen: BTreeMap<&str, &CompiledRolePolicy> = BTreeMap::new();
        for id in self.role_index.candidates_for(principal) {
            if let Some(p) = self.role_policies.get(id) {
                seen.insert(id, p);
            }
        }
        seen.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Effect, Permission};

    fn grant_policy(id: &str, principals: Vec<Vec<&str>>, condition: Option<&str>) -> Policy {
        Policy {
            id: id.into(),
            name: format!("policy-{id}"),
            effect: Effect::Grant,
            permissions: vec![Permission {
                resource: Some("/node1".into()),
                resource_expression: None,
                actions: vec!["get".into()],
            }],
            principals: principals
                .into_iter()
                .map(|g| g.into_iter().map(String::from).collect())
                .collect(),
            condition: condition.map(String::from),
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_candidates_indexed_by_principal() {
        let policies = vec![
            grant_policy("p1", vec![vec!["user:alice"]], None),
            grant_policy("p2", vec![vec!["user:bob"]], None),
            grant_policy("p3", vec![], None),
        ];
        let snapshot = Snapshot::compile("crm", &policies, &[]);

        let alice = "user:alice".to_string();
        let ids: Vec<&str> = snapshot
            .candidate_policies([&alice])
            .iter()
            .map(|p| p.policy.id.as_str())
            .collect();
        // p1 via the principal index, p3 via the any-principal bucket.
        assert_eq!(ids, vec!["p1", "p3"]);
    }

    #[test]
    fn test_candidates_deduplicated_and_ordered() {
        // One policy mentioning the same principal in two AND-groups must
        // appear once.
        let policies = vec![grant_policy(
            "p9",
            vec![vec!["user:alice", "group:g"], vec!["user:alice"]],
            None,
        )];
        let snapshot = Snapshot::compile("crm", &policies, &[]);
        let alice = "user:alice".to_string();
        let group = "group:g".to_string();
        let ids: Vec<&str> = snapshot
            .candidate_policies([&alice, &group])
            .iter()
            .map(|p| p.policy.id.as_str())
            .collect();
        assert_eq!(ids, vec!["p9"]);
    }

    #[test]
    fn test_conditions_are_pre_parsed() {
        let policies = vec![grant_policy("p1", vec![], Some("a == 1"))];
        let snapshot = Snapshot::compile("crm", &policies, &[]);
        let p = snapshot.candidate_policies(std::iter::empty::<&String>())[0];
        assert!(p.condition.as_ref().unwrap().parsed.is_ok());
    }

    #[test]
    fn test_bad_condition_is_poisoned_not_dropped() {
        let policies = vec![grant_policy("p1", vec![], Some("a &&"))];
        let snapshot = Snapshot::compile("crm", &policies, &[]);
        let p = snapshot.candidate_policies(std::iter::empty::<&String>())[0];
        let condition = p.condition.as_ref().unwrap();
        assert!(condition.parsed.is_err());
        assert_eq!(condition.text, "a &&");
    }

    #[test]
    fn test_role_policy_candidates() {
        let role_policies = vec![RolePolicy {
            id: "rp1".into(),
            name: String::new(),
            effect: Effect::Grant,
            roles: vec!["admin".into()],
            principals: vec!["user:alice".into()],
            resources: vec![],
            resource_expressions: vec!["/books/*".into()],
            condition: None,
            metadata: Default::default(),
        }];
        let snapshot = Snapshot::compile("crm", &[], &role_policies);
        assert_eq!(snapshot.candidate_role_policies("user:alice").len(), 1);
        assert!(snapshot.candidate_role_policies("user:bob").is_empty());
        assert!(!snapshot.has_policies());
    }
}
