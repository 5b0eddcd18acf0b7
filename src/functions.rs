//! Remote custom functions: registry, invocation, result cache and
//! request de-duplication.
//!
//! A function call inside a condition resolves here when the name is not
//! a built-in. The call is a POST of `{"params": [...]}` to the function
//! URL; the response carries `{"result": ...}` or `{"error": "..."}`.
//! Cacheable results are kept per `(name, argument tuple)` with their
//! TTL, and concurrent evaluations of the same key share one in-flight
//! call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::api::FunctionDef;
use crate::condition::{FunctionResolver, Value};
use crate::errors::EvalError;

#[derive(Debug, Serialize)]
struct FunctionRequest {
    params: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FunctionResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone)]
struct CachedResult {
    value: Value,
    expires_at: Option<Instant>,
}

impl CachedResult {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// One in-flight remote call; followers block on the condvar until the
/// leader publishes the outcome.
#[derive(Default)]
struct InflightCall {
    slot: Mutex<Option<Result<Value, EvalError>>>,
    done: Condvar,
}

pub struct FunctionRegistry {
    functions: DashMap<String, Arc<FunctionDef>>,
    cache: DashMap<String, CachedResult>,
    inflight: Mutex<HashMap<String, Arc<InflightCall>>>,
    client: reqwest::blocking::Client,
}

impl FunctionRegistry {
    pub fn new(call_timeout: Duration) -> Result<Self, EvalError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| EvalError::Function {
                name: "<client>".into(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            functions: DashMap::new(),
            cache: DashMap::new(),
            inflight: Mutex::new(HashMap::new()),
            client,
        })
    }

    pub fn register(&self, def: FunctionDef) {
        tracing::info!(function = %def.name, url = %def.func_url, "registered custom function");
        self.evict(&def.name);
        self.functions.insert(def.name.clone(), Arc::new(def));
    }

    /// Drop a function and every cached result it produced.
    pub fn evict(&self, name: &str) {
        self.functions.remove(name);
        let prefix = format!("{name}(");
        self.cache.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Swap in a whole new function set; the result cache starts fresh.
    pub fn replace_all(&self, defs: Vec<FunctionDef>) {
        self.functions.clear();
        self.cache.clear();
        for def in defs {
            self.functions.insert(def.name.clone(), Arc::new(def));
        }
    }

    /// Drop expired cache entries. Called from a periodic background task.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.cache.retain(|_, cached| !cached.expired(now));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let def = self
            .functions
            .get(name)
            .map(|f| f.value().clone())
            .ok_or_else(|| EvalError::UnknownFunction(name.to_string()))?;

        if !def.result_cachable {
            return self.call_remote(&def, args);
        }

        let key = cache_key(name, args);
        if let Some(hit) = self.read_cache(&key) {
            return Ok(hit);
        }

        // Single-flight: the first arrival performs the call, everyone
        // else waits for its outcome.
        let (call, leader) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let call = Arc::new(InflightCall::default());
                    inflight.insert(key.clone(), call.clone());
                    (call, true)
                }
            }
        };

        if !leader {
            let mut slot = call.slot.lock();
            while slot.is_none() {
                call.done.wait(&mut slot);
            }
            return slot.clone().unwrap_or_else(|| {
                Err(EvalError::Function {
                    name: name.to_string(),
                    detail: "in-flight call vanished".into(),
                })
            });
        }

        let outcome = self.call_remote(&def, args);
        if let Ok(value) = &outcome {
            let expires_at = if def.result_ttl > 0 {
                Some(Instant::now() + Duration::from_secs(def.result_ttl as u64))
            } else {
                None
            };
            self.cache.insert(
                key.clone(),
                CachedResult {
                    value: value.clone(),
                    expires_at,
                },
            );
        }
        {
            let mut inflight = self.inflight.lock();
            inflight.remove(&key);
        }
        {
            let mut slot = call.slot.lock();
            *slot = Some(outcome.clone());
            call.done.notify_all();
        }
        outcome
    }

    fn read_cache(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        if let Some(hit) = self.cache.get(key) {
            if !hit.expired(now) {
                return Some(hit.value.clone());
            }
        }
        // Lazy expiry: drop the stale entry if it is still the same one.
        self.cache.remove_if(key, |_, cached| cached.expired(now));
        None
    }

    fn call_remote(&self, def: &FunctionDef, args: &[Value]) -> Result<Value, EvalError> {
        let request = FunctionRequest {
            params: args.iter().map(serde_json::Value::from).collect(),
        };
        let fail = |detail: String| EvalError::Function {
            name: def.name.clone(),
            detail,
        };

        let response = self
            .client
            .post(&def.func_url)
            .json(&request)
            .send()
            .map_err(|e| fail(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("unexpected http status {status}")));
        }
        let body: FunctionResponse = response.json().map_err(|e| fail(e.to_string()))?;
        if let Some(error) = body.error.filter(|e| !e.is_empty()) {
            return Err(fail(error));
        }
        let result = body
            .result
            .ok_or_else(|| fail("response carries neither result nor error".into()))?;
        Value::try_from(result)
            .map_err(|e| fail(format!("result is not a valid value: {e}")))
    }
}

impl FunctionResolver for FunctionRegistry {
    fn call(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        self.invoke(name, args)
    }
}

fn cache_key(name: &str, args: &[Value]) -> String {
    let rendered: Vec<String> = args
        .iter()
        .map(|v| serde_json::Value::from(v).to_string())
        .collect();
    format!("{name}({})", rendered.join(","))
}
