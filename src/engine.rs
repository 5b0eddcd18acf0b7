//! The evaluator facade: token assertion, role resolution, policy
//! matching and the deny-overrides combinator behind one API.
//!
//! Evaluation is a pure function of `(RequestContext, Snapshot)`. The
//! facade reads the snapshot pointer once per request, runs the decision
//! core on the blocking pool and never holds a lock while deciding, so
//! requests run fully in parallel against each other and against
//! snapshot swaps.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, Timelike};
use parking_lot::RwLock;

use crate::api::{
    role_principal, Decision, DiagnosedPolicy, DiagnosedRolePolicy, Diagnosis, Effect, EvalStatus,
    Permission, PrincipalType, Reason, RequestContext, ATTR_REQUEST_ACTION, ATTR_REQUEST_DAY,
    ATTR_REQUEST_ENTITY, ATTR_REQUEST_GROUPS, ATTR_REQUEST_HOUR, ATTR_REQUEST_MONTH,
    ATTR_REQUEST_RESOURCE, ATTR_REQUEST_TIME, ATTR_REQUEST_USER, ATTR_REQUEST_WEEKDAY,
    ATTR_REQUEST_YEAR, ROLE_ANONYMOUS, ROLE_AUTHENTICATED, ROLE_EVERYONE,
};
use crate::asserter::{TokenAsserter, WebhookAsserter};
use crate::cache::SnapshotCache;
use crate::condition::{evaluate_bool, Env, Value};
use crate::errors::{EvalError, PdpError};
use crate::functions::FunctionRegistry;
use crate::matcher::{match_principal_groups, subtract_permissions, CompiledPermission};
use crate::roles::resolve_roles;
use crate::settings::Settings;
use crate::snapshot::{CompiledPolicy, Snapshot};
use crate::store::{DiscoverRequestManager, PolicyStore};

/// The policy decision point.
pub struct Pdp {
    cache: SnapshotCache,
    functions: Arc<FunctionRegistry>,
    asserter: RwLock<Option<Arc<dyn TokenAsserter>>>,
    discover: Option<Arc<dyn DiscoverRequestManager>>,
    settings: Settings,
}

impl Pdp {
    /// Build the engine against a store. The discover capability is
    /// queried here, once; a webhook asserter is wired up when the
    /// settings configure one.
    pub async fn new(store: Arc<dyn PolicyStore>, settings: Settings) -> Result<Self, PdpError> {
        let functions = Arc::new(FunctionRegistry::new(settings.function_call_timeout())?);
        functions.replace_all(store.read_functions().await?);

        let asserter: Option<Arc<dyn TokenAsserter>> = match &settings.asserter {
            Some(cfg) => Some(Arc::new(WebhookAsserter::new(cfg)?)),
            None => None,
        };
        let discover = store.discover_requests();

        let cache = SnapshotCache::new(store, functions.clone());
        cache.start(settings.reload_interval(), settings.cache.watch);

        Ok(Self {
            cache,
            functions,
            asserter: RwLock::new(asserter),
            discover,
            settings,
        })
    }

    /// Replace the token asserter.
    pub fn set_asserter(&self, asserter: Arc<dyn TokenAsserter>) {
        *self.asserter.write() = Some(asserter);
    }

    /// Assert the subject's token, at most once per request. Without an
    /// asserter, a token or a subject this is a no-op.
    pub async fn assert_token(&self, ctx: &mut RequestContext) -> Result<(), PdpError> {
        let asserter: Option<Arc<dyn TokenAsserter>> = self.asserter.read().as_ref().cloned();
        let Some(asserter) = asserter else {
            return Ok(());
        };
        let Some(subject) = ctx.subject.as_mut() else {
            return Ok(());
        };
        if subject.asserted {
            return Ok(());
        }
        let (Some(token), Some(token_type)) = (subject.token.clone(), subject.token_type.clone())
        else {
            return Ok(());
        };
        if token.is_empty() || token_type.is_empty() {
            return Ok(());
        }
        let principals = asserter
            .assert_token(&token, &token_type, None, &HashMap::new())
            .await?;
        subject.principals.extend(principals);
        subject.asserted = true;
        Ok(())
    }

    pub async fn is_allowed(&self, mut ctx: RequestContext) -> Result<Decision, PdpError> {
        let deadline = Instant::now() + self.settings.decision_timeout();
        self.assert_token(&mut ctx).await?;
        let snapshot = self.cache.snapshot(&ctx.service_name).await?;
        let functions = self.functions.clone();
        let prepared = PreparedRequest::from_context(&ctx);

        let parts = self
            .run_blocking(deadline, move || {
                decide(&snapshot, &functions, &prepared, Some(deadline), None)
            })
            .await?;
        Ok(parts.decision)
    }

    pub async fn get_all_granted_roles(
        &self,
        mut ctx: RequestContext,
    ) -> Result<Vec<String>, PdpError> {
        let deadline = Instant::now() + self.settings.decision_timeout();
        self.assert_token(&mut ctx).await?;
        let snapshot = self.cache.snapshot(&ctx.service_name).await?;
        let functions = self.functions.clone();
        let prepared = PreparedRequest::from_context(&ctx);

        self.run_blocking(deadline, move || {
            let env = Env::new(&prepared.attributes, functions.as_ref());
            let resolution = resolve_roles(
                &snapshot,
                &prepared.principals,
                &prepared.resource,
                &env,
                Some(deadline),
                None,
            )?;
            Ok(resolution.granted)
        })
        .await
    }

    /// The permissions the subject effectively holds, per concrete
    /// resource: the union over matching grant policies minus the
    /// actions matching deny policies take away. Resource expressions
    /// on the grant side are not expanded.
    pub async fn get_all_granted_permissions(
        &self,
        mut ctx: RequestContext,
    ) -> Result<Vec<Permission>, PdpError> {
        let deadline = Instant::now() + self.settings.decision_timeout();
        self.assert_token(&mut ctx).await?;
        let snapshot = self.cache.snapshot(&ctx.service_name).await?;
        let functions = self.functions.clone();
        let prepared = PreparedRequest::from_context(&ctx);

        self.run_blocking(deadline, move || {
            if !snapshot.has_policies() {
                return Ok(Vec::new());
            }
            let env = Env::new(&prepared.attributes, functions.as_ref());
            let resolution = resolve_roles(
                &snapshot,
                &prepared.principals,
                &prepared.resource,
                &env,
                Some(deadline),
                None,
            )?;
            let effective = prepared.effective_set(&resolution.granted);
            let matched = match_policies(
                &snapshot,
                &effective,
                &prepared,
                &env,
                Some(deadline),
                false,
                false,
                None,
            )?;

            let mut granted: Vec<Permission> = Vec::new();
            for policy in &matched.granted {
                // A grant without permissions grants anything; there is
                // no concrete resource to report for it.
                for perm in &policy.permissions {
                    if let Some(resource) = &perm.resource {
                        granted.push(Permission {
                            resource: Some(resource.clone()),
                            resource_expression: None,
                            actions: perm.actions.clone(),
                        });
                    }
                }
            }
            let mut denied: Vec<CompiledPermission> = Vec::new();
            for policy in &matched.denied {
                if policy.permissions.is_empty() {
                    // Denies every permission.
                    return Ok(Vec::new());
                }
                denied.extend(policy.permissions.iter().cloned());
            }

            let mut result = subtract_permissions(granted, &denied);
            result.sort_by(|a, b| a.resource.cmp(&b.resource).then(a.actions.cmp(&b.actions)));
            Ok(result)
        })
        .await
    }

    /// Run the full pipeline without short-circuiting and report every
    /// policy and role policy considered, alongside the decision
    /// `is_allowed` would have returned.
    pub async fn diagnose(&self, mut ctx: RequestContext) -> Result<Diagnosis, PdpError> {
        let deadline = Instant::now() + self.settings.decision_timeout();
        self.assert_token(&mut ctx).await?;
        let snapshot = self.cache.snapshot(&ctx.service_name).await?;
        let functions = self.functions.clone();
        let prepared = PreparedRequest::from_context(&ctx);

        let (parts, trace, attributes) = self
            .run_blocking(deadline, move || {
                let mut trace = DecisionTrace::default();
                let parts = decide(
                    &snapshot,
                    &functions,
                    &prepared,
                    Some(deadline),
                    Some(&mut trace),
                )?;
                Ok((parts, trace, prepared.attributes))
            })
            .await?;

        Ok(Diagnosis {
            allowed: parts.decision.allowed,
            reason: parts.decision.reason,
            request: ctx,
            attributes,
            granted_roles: parts.granted_roles,
            role_policies: trace.role_policies,
            policies: trace.policies,
        })
    }

    /// Decide, and when nothing applied, record the request so policies
    /// can be authored from observed traffic. Recording needs the
    /// store's discover capability; its absence or failure is surfaced
    /// as an error, not a changed decision.
    pub async fn discover(&self, ctx: RequestContext) -> Result<Decision, PdpError> {
        let decision = self.is_allowed(ctx.clone()).await?;
        if decision.reason == Reason::NoApplicablePolicies {
            let Some(sink) = &self.discover else {
                return Err(PdpError::Discover(
                    "the policy store does not support discover recording".into(),
                ));
            };
            if let Err(error) = sink.record(&ctx).await {
                tracing::warn!(%error, "failed to record discover request");
                return Err(PdpError::Discover(error.to_string()));
            }
            tracing::debug!(
                service = %ctx.service_name,
                resource = %ctx.resource,
                action = %ctx.action,
                "recorded discover request"
            );
        }
        Ok(decision)
    }

    /// Reload every snapshot and the function registry from the store.
    pub async fn refresh(&self) -> Result<(), PdpError> {
        self.cache.full_reload().await
    }

    async fn run_blocking<T, F>(&self, deadline: Instant, f: F) -> Result<T, PdpError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, EvalError> + Send + 'static,
    {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        let joined = tokio::time::timeout(remaining, tokio::task::spawn_blocking(f))
            .await
            .map_err(|_| EvalError::DeadlineExceeded)?;
        let result = joined.map_err(|e| PdpError::Internal(e.to_string()))?;
        Ok(result?)
    }
}

// ---------- Request preparation ----------

/// A request context lowered to what the decision core consumes: encoded
/// principal strings (built-in roles included) and the full attribute
/// environment.
struct PreparedRequest {
    principals: Vec<String>,
    attributes: HashMap<String, Value>,
    resource: String,
    action: String,
}

impl PreparedRequest {
    fn from_context(ctx: &RequestContext) -> PreparedRequest {
        let mut users = Vec::new();
        let mut groups = Vec::new();
        let mut entities = Vec::new();
        let mut group_names = Vec::new();
        let mut first_user: Option<String> = None;
        let mut first_entity: Option<String> = None;

        if let Some(subject) = &ctx.subject {
            for principal in &subject.principals {
                match principal.kind {
                    PrincipalType::User => {
                        users.push(principal.encode());
                        first_user.get_or_insert_with(|| principal.name.clone());
                    }
                    PrincipalType::Group => {
                        groups.push(principal.encode());
                        group_names.push(Value::String(principal.name.clone()));
                    }
                    PrincipalType::Entity => {
                        entities.push(principal.encode());
                        first_entity.get_or_insert_with(|| principal.name.clone());
                    }
                    // Role membership is computed, not asserted.
                    PrincipalType::Role => {}
                }
            }
        }

        // Built-in roles: everyone always; authenticated with any
        // asserted principal; anonymous otherwise.
        let mut principals = vec![role_principal(ROLE_EVERYONE)];
        if users.is_empty() && groups.is_empty() && entities.is_empty() {
            principals.push(role_principal(ROLE_ANONYMOUS));
        } else {
            principals.extend(users);
            principals.extend(entities);
            principals.push(role_principal(ROLE_AUTHENTICATED));
            principals.extend(groups);
        }

        let now = Local::now();
        let mut attributes: HashMap<String, Value> = HashMap::new();
        attributes.insert(
            ATTR_REQUEST_TIME.into(),
            Value::Number(now.timestamp() as f64),
        );
        attributes.insert(
            ATTR_REQUEST_YEAR.into(),
            Value::Number(f64::from(now.year())),
        );
        attributes.insert(
            ATTR_REQUEST_MONTH.into(),
            Value::Number(f64::from(now.month())),
        );
        attributes.insert(ATTR_REQUEST_DAY.into(), Value::Number(f64::from(now.day())));
        attributes.insert(
            ATTR_REQUEST_HOUR.into(),
            Value::Number(f64::from(now.hour())),
        );
        attributes.insert(
            ATTR_REQUEST_WEEKDAY.into(),
            Value::String(now.format("%A").to_string()),
        );
        attributes.insert(
            ATTR_REQUEST_RESOURCE.into(),
            Value::String(ctx.resource.clone()),
        );
        attributes.insert(ATTR_REQUEST_ACTION.into(), Value::String(ctx.action.clone()));
        if ctx.subject.is_some() {
            attributes.insert(ATTR_REQUEST_GROUPS.into(), Value::Array(group_names));
        }
        if let Some(user) = first_user {
            attributes.insert(ATTR_REQUEST_USER.into(), Value::String(user));
        }
        if let Some(entity) = first_entity {
            attributes.insert(ATTR_REQUEST_ENTITY.into(), Value::String(entity));
        }
        // Request attributes override the built-ins.
        for (key, value) in &ctx.attributes {
            attributes.insert(key.clone(), value.clone());
        }

        PreparedRequest {
            principals,
            attributes,
            resource: ctx.resource.clone(),
            action: ctx.action.clone(),
        }
    }

    fn effective_set(&self, granted_roles: &[String]) -> HashSet<String> {
        let mut effective: HashSet<String> = self.principals.iter().cloned().collect();
        for role in granted_roles {
            effective.insert(role_principal(role));
        }
        effective
    }
}

// ---------- Decision core (synchronous) ----------

#[derive(Default)]
struct DecisionTrace {
    role_policies: Vec<DiagnosedRolePolicy>,
    policies: Vec<DiagnosedPolicy>,
}

struct DecisionParts {
    decision: Decision,
    granted_roles: Vec<String>,
}

struct MatchedPolicies<'s> {
    granted: Vec<&'s CompiledPolicy>,
    denied: Vec<&'s CompiledPolicy>,
    /// First condition error, kept instead of short-circuiting when the
    /// caller asked for an exhaustive pass.
    eval_error: Option<EvalError>,
}

fn check_deadline(deadline: Option<Instant>) -> Result<(), EvalError> {
    match deadline {
        Some(at) if Instant::now() >= at => Err(EvalError::DeadlineExceeded),
        _ => Ok(()),
    }
}

fn decide(
    snapshot: &Snapshot,
    functions: &FunctionRegistry,
    prepared: &PreparedRequest,
    deadline: Option<Instant>,
    mut trace: Option<&mut DecisionTrace>,
) -> Result<DecisionParts, EvalError> {
    if !snapshot.has_policies() {
        return Ok(DecisionParts {
            decision: Decision::new(false, Reason::NoApplicablePolicies),
            granted_roles: Vec::new(),
        });
    }

    let env = Env::new(&prepared.attributes, functions);
    let resolution = resolve_roles(
        snapshot,
        &prepared.principals,
        &prepared.resource,
        &env,
        deadline,
        trace.as_mut().map(|t| &mut t.role_policies),
    )?;
    let effective = prepared.effective_set(&resolution.granted);

    let exhaustive = trace.is_some();
    let matched = match_policies(
        snapshot,
        &effective,
        prepared,
        &env,
        deadline,
        true,
        exhaustive,
        trace.as_mut().map(|t| &mut t.policies),
    )?;

    let decision = if matched.eval_error.is_some() {
        Decision::new(false, Reason::ErrorInEvaluation)
    } else if !matched.denied.is_empty() {
        Decision::new(false, Reason::DenyPolicyFound)
    } else if !matched.granted.is_empty() {
        Decision::new(true, Reason::GrantPolicyFound)
    } else {
        Decision::new(false, Reason::NoApplicablePolicies)
    };

    Ok(DecisionParts {
        decision,
        granted_roles: resolution.granted,
    })
}

/// Match the service's policies against the effective principal set and,
/// when `match_resource` is set, the request's resource and action.
/// Deny overrides grant; in enforce mode the first condition error
/// aborts, in exhaustive mode it is recorded and matching continues.
#[allow(clippy::too_many_arguments)]
fn match_policies<'s>(
    snapshot: &'s Snapshot,
    effective: &HashSet<String>,
    prepared: &PreparedRequest,
    env: &Env<'_>,
    deadline: Option<Instant>,
    match_resource: bool,
    exhaustive: bool,
    mut trace: Option<&mut Vec<DiagnosedPolicy>>,
) -> Result<MatchedPolicies<'s>, EvalError> {
    let mut matched = MatchedPolicies {
        granted: Vec::new(),
        denied: Vec::new(),
        eval_error: None,
    };

    for candidate in snapshot.candidate_policies(effective.iter()) {
        check_deadline(deadline)?;
        if !match_principal_groups(effective, &candidate.policy.principals) {
            continue;
        }
        if match_resource {
            let permissions_apply = candidate.permissions.is_empty()
                || candidate
                    .permissions
                    .iter()
                    .any(|p| p.matches(&prepared.resource, &prepared.action));
            if !permissions_apply {
                continue;
            }
        }

        let held = match &candidate.condition {
            None => Ok(true),
            Some(compiled) => match &compiled.parsed {
                Ok(expr) => evaluate_bool(expr, env),
                Err(error) => Err(EvalError::Parse(error.clone())),
            },
        };

        match held {
            Ok(held) => {
                if let Some(trace) = trace.as_mut() {
                    trace.push(diagnosed(candidate, held.into()));
                }
                if held {
                    match candidate.policy.effect {
                        Effect::Grant => matched.granted.push(candidate),
                        Effect::Deny => matched.denied.push(candidate),
                    }
                }
            }
            Err(error) => {
                if let Some(trace) = trace.as_mut() {
                    trace.push(diagnosed(candidate, DiagStatus::Error));
                }
                if !exhaustive {
                    return Err(error);
                }
                matched.eval_error.get_or_insert(error);
            }
        }
    }
    Ok(matched)
}

enum DiagStatus {
    Held,
    Failed,
    Error,
}

impl From<bool> for DiagStatus {
    fn from(held: bool) -> Self {
        if held {
            DiagStatus::Held
        } else {
            DiagStatus::Failed
        }
    }
}

fn diagnosed(candidate: &CompiledPolicy, status: DiagStatus) -> DiagnosedPolicy {
    let (status, result) = match status {
        DiagStatus::Held => (EvalStatus::TakeEffect, Some(true)),
        DiagStatus::Failed => (EvalStatus::ConditionFailed, Some(false)),
        DiagStatus::Error => (EvalStatus::Error, None),
    };
    DiagnosedPolicy {
        id: candidate.policy.id.clone(),
        name: candidate.policy.name.clone(),
        effect: candidate.policy.effect,
        status,
        condition: candidate.condition.as_ref().map(|c| c.text.clone()),
        condition_result: candidate.condition.as_ref().and(result),
    }
}
