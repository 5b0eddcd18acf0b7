//! Role-closure resolution: the transitive set of roles granted to a
//! principal set, with deny-overrides semantics.
//!
//! The closure is a fixpoint over a work queue of principals. Denies for
//! a popped principal apply before its grants, a denied role is never
//! pushed onward (so it cannot cascade further grants), and a visited set
//! guarantees termination on cyclic role graphs.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::time::Instant;

use crate::api::{role_principal, DiagnosedRolePolicy, Effect, EvalStatus};
use crate::condition::{evaluate_bool, Env};
use crate::errors::EvalError;
use crate::matcher::{match_any_principal, match_role_policy_scope};
use crate::snapshot::{CompiledRolePolicy, Snapshot};

pub struct RoleResolution {
    /// Sorted, deduplicated role names, denies already subtracted.
    pub granted: Vec<String>,
}

fn check_deadline(deadline: Option<Instant>) -> Result<(), EvalError> {
    match deadline {
        Some(at) if Instant::now() >= at => Err(EvalError::DeadlineExceeded),
        _ => Ok(()),
    }
}

/// Evaluate a role policy's condition; absent conditions hold trivially.
/// A poisoned (unparsable) condition is an evaluation error: the closure
/// fails closed rather than guessing.
fn condition_holds(policy: &CompiledRolePolicy, env: &Env<'_>) -> Result<bool, EvalError> {
    match &policy.condition {
        None => Ok(true),
        Some(compiled) => match &compiled.parsed {
            Ok(expr) => evaluate_bool(expr, env),
            Err(error) => Err(EvalError::Parse(error.clone())),
        },
    }
}

/// Compute the granted role closure for `principals` against `resource`.
///
/// Any condition-evaluation error anywhere in the closure aborts the
/// whole resolution with that error.
pub fn resolve_roles(
    snapshot: &Snapshot,
    principals: &[String],
    resource: &str,
    env: &Env<'_>,
    deadline: Option<Instant>,
    mut trace: Option<&mut Vec<DiagnosedRolePolicy>>,
) -> Result<RoleResolution, EvalError> {
    let mut frontier: VecDeque<String> = principals.iter().cloned().collect();
    let mut visited: HashSet<String> = HashSet::new();
    let mut processed_policies: HashSet<String> = HashSet::new();
    let mut granted: BTreeSet<String> = BTreeSet::new();
    let mut denied: BTreeSet<String> = BTreeSet::new();

    while let Some(principal) = frontier.pop_front() {
        check_deadline(deadline)?;
        if !visited.insert(principal.clone()) {
            continue;
        }
        // A role denied before its turn never cascades.
        if let Some(role) = principal.strip_prefix("role:") {
            if denied.contains(role) {
                continue;
            }
        }

        let mut granting: Vec<&CompiledRolePolicy> = Vec::new();
        let mut denying: Vec<&CompiledRolePolicy> = Vec::new();

        for candidate in snapshot.candidate_role_policies(&principal) {
            if processed_policies.contains(&candidate.policy.id) {
                continue;
            }
            let principal_set: HashSet<String> = std::iter::once(principal.clone()).collect();
            if !match_any_principal(&principal_set, &candidate.policy.principals) {
                continue;
            }
            if !match_role_policy_scope(
                resource,
                &candidate.policy.resources,
                &candidate.resource_patterns,
            ) {
                continue;
            }
            processed_policies.insert(candidate.policy.id.clone());

            let holds = condition_holds(candidate, env)?;
            if let Some(trace) = trace.as_mut() {
                trace.push(DiagnosedRolePolicy {
                    id: candidate.policy.id.clone(),
                    name: candidate.policy.name.clone(),
                    effect: candidate.policy.effect,
                    roles: candidate.policy.roles.clone(),
                    status: if holds {
                        EvalStatus::TakeEffect
                    } else {
                        EvalStatus::ConditionFailed
                    },
                    condition: candidate.condition.as_ref().map(|c| c.text.clone()),
                    condition_result: candidate.condition.as_ref().map(|_| holds),
                });
            }
            if !holds {
                continue;
            }
            match candidate.policy.effect {
                Effect::Grant => granting.push(candidate),
                Effect::Deny => denying.push(candidate),
            }
        }

        // Denies first: a role denied here must not cascade through the
        // grants found in the same pass.
        for policy in denying {
            for role in &policy.policy.roles {
                denied.insert(role.clone());
            }
        }
        for policy in granting {
            for role in &policy.policy.roles {
                if denied.contains(role) {
                    continue;
                }
                if granted.insert(role.clone()) {
                    frontier.push_back(role_principal(role));
                }
            }
        }
    }

    let granted = granted.difference(&denied).cloned().collect();
    Ok(RoleResolution { granted })
}
