//! Compiled-state cache: one immutable snapshot per service, kept
//! consistent with the store by a background task.
//!
//! Readers take an `Arc` clone of the current snapshot and never observe
//! a partially rebuilt state; a swap installs a whole new snapshot and
//! the old one stays alive until its last reader finishes. With watch
//! enabled, store events schedule asynchronous rebuilds (at most one in
//! flight per service, overlapping invalidations coalesce); without
//! watch, a polling task refreshes everything on an interval.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::api::Service;
use crate::errors::PdpError;
use crate::functions::FunctionRegistry;
use crate::snapshot::Snapshot;
use crate::store::{ChangeEvent, PolicyStore};

#[derive(Default)]
struct RebuildState {
    /// Services with an invalidation not yet consumed by a rebuild.
    pending: HashSet<String>,
    /// Services with a rebuild task currently running.
    inflight: HashSet<String>,
}

struct CacheInner {
    store: Arc<dyn PolicyStore>,
    snapshots: DashMap<String, Arc<Snapshot>>,
    functions: Arc<FunctionRegistry>,
    rebuilds: Mutex<RebuildState>,
}

#[derive(Clone)]
pub struct SnapshotCache {
    inner: Arc<CacheInner>,
}

const FUNCTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

impl SnapshotCache {
    pub fn new(store: Arc<dyn PolicyStore>, functions: Arc<FunctionRegistry>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                snapshots: DashMap::new(),
                functions,
                rebuilds: Mutex::new(RebuildState::default()),
            }),
        }
    }

    /// Start the background refresh machinery. With watch enabled and a
    /// watching store this consumes its event stream; otherwise it polls
    /// on `reload_interval`. Tasks hold only weak references and stop
    /// when the cache is dropped.
    pub fn start(&self, reload_interval: Duration, use_watch: bool) {
        let weak = Arc::downgrade(&self.inner);
        let watch_rx = if use_watch {
            self.inner.store.watch()
        } else {
            None
        };
        match watch_rx {
            Some(mut rx) => {
                tracing::info!("policy store watch enabled");
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let Some(inner) = weak.upgrade() else { break };
                        SnapshotCache { inner }.handle_event(event).await;
                    }
                    tracing::info!("policy store watch stream closed");
                });
            }
            None => {
                tracing::info!(
                    interval_secs = reload_interval.as_secs(),
                    "policy store does not watch; polling"
                );
                let weak = Arc::downgrade(&self.inner);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(reload_interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    // The first tick fires immediately; skip it, the
                    // cache was just built.
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let Some(inner) = weak.upgrade() else { break };
                        if let Err(error) = (SnapshotCache { inner }).full_reload().await {
                            tracing::error!(%error, "periodic policy reload failed");
                        }
                    }
                });
            }
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FUNCTION_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.functions.sweep_expired();
            }
        });
    }

    /// The current snapshot for a service, building it on first access.
    pub async fn snapshot(&self, service: &str) -> Result<Arc<Snapshot>, PdpError> {
        if let Some(hit) = self.inner.snapshots.get(service) {
            return Ok(hit.value().clone());
        }
        let loaded = self
            .inner
            .store
            .read_service(service)
            .await?
            .ok_or_else(|| PdpError::ServiceNotFound(service.to_string()))?;
        let snapshot = Arc::new(compile(&loaded));
        // Two concurrent first reads may both compile; the later insert
        // wins and both snapshots are equally fresh.
        self.inner
            .snapshots
            .insert(service.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    async fn handle_event(&self, event: ChangeEvent) {
        tracing::debug!(?event, "store change event");
        match event {
            ChangeEvent::ServiceDeleted(name) => {
                self.inner.snapshots.remove(&name);
            }
            ChangeEvent::ServiceChanged(name) => self.schedule_rebuild(name),
            ChangeEvent::FunctionsChanged => match self.inner.store.read_functions().await {
                Ok(defs) => self.inner.functions.replace_all(defs),
                Err(error) => tracing::error!(%error, "failed to reload functions"),
            },
            ChangeEvent::FullReload => {
                if let Err(error) = self.full_reload().await {
                    tracing::error!(%error, "full policy reload failed");
                }
            }
        }
    }

    fn schedule_rebuild(&self, service: String) {
        let spawn = {
            let mut state = self.inner.rebuilds.lock();
            state.pending.insert(service.clone());
            state.inflight.insert(service.clone())
        };
        if !spawn {
            // A running rebuild will pick the pending mark up.
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else { break };
                let cache = SnapshotCache { inner };
                {
                    cache.inner.rebuilds.lock().pending.remove(&service);
                }
                cache.rebuild(&service).await;
                let mut state = cache.inner.rebuilds.lock();
                if state.pending.contains(&service) {
                    continue;
                }
                state.inflight.remove(&service);
                break;
            }
        });
    }

    /// Rebuild one service's snapshot and swap it in atomically. Store
    /// failures keep the previous snapshot: stale-but-consistent beats
    /// unavailable, and the poll/watch machinery retries.
    async fn rebuild(&self, service: &str) {
        match self.inner.store.read_service(service).await {
            Ok(Some(loaded)) => {
                let snapshot = Arc::new(compile(&loaded));
                self.inner.snapshots.insert(service.to_string(), snapshot);
                tracing::info!(service, "snapshot rebuilt");
            }
            Ok(None) => {
                self.inner.snapshots.remove(service);
                tracing::info!(service, "service gone; snapshot dropped");
            }
            Err(error) => {
                tracing::error!(service, %error, "snapshot rebuild failed; keeping previous");
            }
        }
    }

    /// Reload every known service and the function registry.
    pub async fn full_reload(&self) -> Result<(), PdpError> {
        let names = self.inner.store.list_service_names().await?;
        let keep: HashSet<&String> = names.iter().collect();
        self.inner
            .snapshots
            .retain(|name, _| keep.contains(name));
        for name in &names {
            self.rebuild(name).await;
        }
        let defs = self.inner.store.read_functions().await?;
        self.inner.functions.replace_all(defs);
        tracing::info!(services = names.len(), "full policy reload complete");
        Ok(())
    }
}

fn compile(service: &Service) -> Snapshot {
    Snapshot::compile(&service.name, &service.policies, &service.role_policies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Effect, Permission, Policy};
    use crate::store::MemoryStore;

    fn service_with_policy(service: &str, policy_id: &str) -> Service {
        Service {
            name: service.into(),
            policies: vec![Policy {
                id: policy_id.into(),
                name: String::new(),
                effect: Effect::Grant,
                permissions: vec![Permission {
                    resource: Some("/node1".into()),
                    resource_expression: None,
                    actions: vec!["get".into()],
                }],
                principals: vec![],
                condition: None,
                metadata: Default::default(),
            }],
            ..Service::default()
        }
    }

    fn registry() -> Arc<FunctionRegistry> {
        Arc::new(FunctionRegistry::new(Duration::from_secs(1)).unwrap())
    }

    #[tokio::test]
    async fn test_snapshot_built_on_first_access() {
        let store = Arc::new(MemoryStore::new());
        store.create_service(service_with_policy("crm", "p1")).unwrap();
        let cache = SnapshotCache::new(store, registry());

        let snap = cache.snapshot("crm").await.unwrap();
        assert!(snap.has_policies());
        assert_eq!(snap.service(), "crm");

        let err = cache.snapshot("nope").await.unwrap_err();
        assert!(matches!(err, PdpError::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn test_watch_event_swaps_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.create_service(service_with_policy("crm", "p1")).unwrap();
        let cache = SnapshotCache::new(store.clone(), registry());
        cache.start(Duration::from_secs(3600), true);

        let before = cache.snapshot("crm").await.unwrap();
        assert!(before.has_policies());

        store.delete_policy("crm", "p1").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let after = cache.snapshot("crm").await.unwrap();
        assert!(!after.has_policies());
        // The old snapshot is still usable by in-flight readers.
        assert!(before.has_policies());
    }

    #[tokio::test]
    async fn test_service_delete_drops_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.create_service(service_with_policy("crm", "p1")).unwrap();
        let cache = SnapshotCache::new(store.clone(), registry());
        cache.start(Duration::from_secs(3600), true);

        cache.snapshot("crm").await.unwrap();
        store.delete_service("crm").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = cache.snapshot("crm").await.unwrap_err();
        assert!(matches!(err, PdpError::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn test_coalesced_rebuilds_converge() {
        let store = Arc::new(MemoryStore::new());
        store.create_service(service_with_policy("crm", "p1")).unwrap();
        let cache = SnapshotCache::new(store.clone(), registry());
        cache.start(Duration::from_secs(3600), true);
        cache.snapshot("crm").await.unwrap();

        // A burst of mutations; the cache must end up reflecting the
        // final state.
        for i in 2..20 {
            store
                .create_policy("crm", Policy {
                    id: format!("p{i}"),
                    name: String::new(),
                    effect: Effect::Grant,
                    permissions: vec![],
                    principals: vec![],
                    condition: None,
                    metadata: Default::default(),
                })
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snap = cache.snapshot("crm").await.unwrap();
        let ids = snap.candidate_policies(std::iter::empty::<&String>());
        assert_eq!(ids.len(), 19);
        let state = cache.inner.rebuilds.lock();
        assert!(state.pending.is_empty());
        assert!(state.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_full_reload() {
        let store = Arc::new(MemoryStore::new());
        store.create_service(service_with_policy("a", "p1")).unwrap();
        store.create_service(service_with_policy("b", "p1")).unwrap();
        let cache = SnapshotCache::new(store.clone(), registry());

        cache.snapshot("a").await.unwrap();
        cache.snapshot("b").await.unwrap();

        // Mutate behind the cache's back, then reload everything.
        store.delete_service("b").unwrap();
        cache.full_reload().await.unwrap();

        assert!(cache.snapshot("a").await.is_ok());
        assert!(matches!(
            cache.snapshot("b").await.unwrap_err(),
            PdpError::ServiceNotFound(_)
        ));
    }
}
