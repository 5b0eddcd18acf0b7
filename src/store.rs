//! The policy store interface and an in-memory implementation.
//!
//! Concrete backends (file, etcd, ...) live outside this crate; the
//! engine only consumes this narrow read-and-watch surface. `MemoryStore`
//! backs tests and embedded deployments.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::api::{FunctionDef, Policy, RequestContext, RolePolicy, Service};
use crate::errors::PdpError;

/// A change in the store. Events are coarse on purpose: any mutation
/// inside a service invalidates that service's snapshot as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    ServiceChanged(String),
    ServiceDeleted(String),
    FunctionsChanged,
    FullReload,
}

pub type ChangeReceiver = mpsc::UnboundedReceiver<ChangeEvent>;

/// Read surface the decision engine needs from a policy store.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn read_service(&self, name: &str) -> Result<Option<Service>, PdpError>;

    async fn list_service_names(&self) -> Result<Vec<String>, PdpError>;

    async fn read_functions(&self) -> Result<Vec<FunctionDef>, PdpError>;

    /// Subscribe to change events. `None` means the backend cannot watch;
    /// the cache then falls back to interval polling.
    fn watch(&self) -> Option<ChangeReceiver> {
        None
    }

    /// Optional capability for recording discover requests. Queried once
    /// at engine construction, never type-asserted later.
    fn discover_requests(&self) -> Option<Arc<dyn DiscoverRequestManager>> {
        None
    }
}

/// Records request contexts that matched no policy, so policies can be
/// authored from observed traffic. Storage of the records is the
/// implementor's concern.
#[async_trait]
pub trait DiscoverRequestManager: Send + Sync {
    async fn record(&self, ctx: &RequestContext) -> Result<(), PdpError>;
}

// ---------- In-memory store ----------

/// In-memory policy store with watch support. Mutations emit change
/// events to every subscriber.
#[derive(Default)]
pub struct MemoryStore {
    services: DashMap<String, Service>,
    functions: DashMap<String, FunctionDef>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    discover: Option<Arc<DiscoverLog>>,
}

/// Discover requests retained in memory.
#[derive(Default)]
pub struct DiscoverLog {
    recorded: Mutex<Vec<RequestContext>>,
}

impl DiscoverLog {
    pub fn recorded(&self) -> Vec<RequestContext> {
        self.recorded.lock().clone()
    }
}

#[async_trait]
impl DiscoverRequestManager for DiscoverLog {
    async fn record(&self, ctx: &RequestContext) -> Result<(), PdpError> {
        self.recorded.lock().push(ctx.clone());
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that also records discover requests.
    pub fn with_discover_log() -> (Self, Arc<DiscoverLog>) {
        let log = Arc::new(DiscoverLog::default());
        let store = Self {
            discover: Some(log.clone()),
            ..Self::default()
        };
        (store, log)
    }

    fn emit(&self, event: ChangeEvent) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn create_service(&self, service: Service) -> Result<(), PdpError> {
        let name = service.name.clone();
        if self.services.contains_key(&name) {
            return Err(PdpError::Store(format!("service `{name}` already exists")));
        }
        self.services.insert(name.clone(), service);
        self.emit(ChangeEvent::ServiceChanged(name));
        Ok(())
    }

    pub fn delete_service(&self, name: &str) -> Result<(), PdpError> {
        self.services
            .remove(name)
            .ok_or_else(|| PdpError::Store(format!("service `{name}` does not exist")))?;
        self.emit(ChangeEvent::ServiceDeleted(name.to_string()));
        Ok(())
    }

    pub fn create_policy(&self, service: &str, policy: Policy) -> Result<(), PdpError> {
        let mut entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| PdpError::Store(format!("service `{service}` does not exist")))?;
        if entry.policies.iter().any(|p| p.id == policy.id) {
            return Err(PdpError::Store(format!(
                "policy `{}` already exists in service `{service}`",
                policy.id
            )));
        }
        entry.policies.push(policy);
        drop(entry);
        self.emit(ChangeEvent::ServiceChanged(service.to_string()));
        Ok(())
    }

    pub fn delete_policy(&self, service: &str, id: &str) -> Result<(), PdpError> {
        let mut entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| PdpError::Store(format!("service `{service}` does not exist")))?;
        let before = entry.policies.len();
        entry.policies.retain(|p| p.id != id);
        if entry.policies.len() == before {
            return Err(PdpError::Store(format!(
                "policy `{id}` does not exist in service `{service}`"
            )));
        }
        drop(entry);
        self.emit(ChangeEvent::ServiceChanged(service.to_string()));
        Ok(())
    }

    pub fn create_role_policy(&self, service: &str, policy: RolePolicy) -> Result<(), PdpError> {
        let mut entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| PdpError::Store(format!("service `{service}` does not exist")))?;
        if entry.role_policies.iter().any(|p| p.id == policy.id) {
            return Err(PdpError::Store(format!(
                "role policy `{}` already exists in service `{service}`",
                policy.id
            )));
        }
        entry.role_policies.push(policy);
        drop(entry);
        self.emit(ChangeEvent::ServiceChanged(service.to_string()));
        Ok(())
    }

    pub fn delete_role_policy(&self, service: &str, id: &str) -> Result<(), PdpError> {
        let mut entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| PdpError::Store(format!("service `{service}` does not exist")))?;
        let before = entry.role_policies.len();
        entry.role_policies.retain(|p| p.id != id);
        if entry.role_policies.len() == before {
            return Err(PdpError::Store(format!(
                "role policy `{id}` does not exist in service `{service}`"
            )));
        }
        drop(entry);
        self.emit(ChangeEvent::ServiceChanged(service.to_string()));
        Ok(())
    }

    pub fn create_function(&self, function: FunctionDef) -> Result<(), PdpError> {
        let name = function.name.clone();
        if self.functions.contains_key(&name) {
            return Err(PdpError::Store(format!("function `{name}` already exists")));
        }
        self.functions.insert(name, function);
        self.emit(ChangeEvent::FunctionsChanged);
        Ok(())
    }

    pub fn delete_function(&self, name: &str) -> Result<(), PdpError> {
        self.functions
            .remove(name)
            .ok_or_else(|| PdpError::Store(format!("function `{name}` does not exist")))?;
        self.emit(ChangeEvent::FunctionsChanged);
        Ok(())
    }

    /// Load a whole store snapshot at once, e.g. from a JSON fixture.
    pub fn load_services(&self, services: Vec<Service>) {
        for service in services {
            self.services.insert(service.name.clone(), service);
        }
        self.emit(ChangeEvent::FullReload);
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn read_service(&self, name: &str) -> Result<Option<Service>, PdpError> {
        Ok(self.services.get(name).map(|s| s.value().clone()))
    }

    async fn list_service_names(&self) -> Result<Vec<String>, PdpError> {
        let mut names: Vec<String> = self.services.iter().map(|s| s.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn read_functions(&self) -> Result<Vec<FunctionDef>, PdpError> {
        let mut functions: Vec<FunctionDef> =
            self.functions.iter().map(|f| f.value().clone()).collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(functions)
    }

    fn watch(&self) -> Option<ChangeReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push(tx);
        Some(rx)
    }

    fn discover_requests(&self) -> Option<Arc<dyn DiscoverRequestManager>> {
        self.discover
            .as_ref()
            .map(|log| log.clone() as Arc<dyn DiscoverRequestManager>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Effect;

    fn service(name: &str) -> Service {
        Service {
            name: name.into(),
            ..Service::default()
        }
    }

    fn policy(id: &str) -> Policy {
        Policy {
            id: id.into(),
            name: String::new(),
            effect: Effect::Grant,
            permissions: vec![],
            principals: vec![],
            condition: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_service_crud_and_events() {
        let store = MemoryStore::new();
        let mut rx = store.watch().unwrap();

        store.create_service(service("crm")).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ChangeEvent::ServiceChanged("crm".into()))
        );
        assert!(store.read_service("crm").await.unwrap().is_some());

        store.create_policy("crm", policy("p1")).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ChangeEvent::ServiceChanged("crm".into()))
        );

        store.delete_service("crm").unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ChangeEvent::ServiceDeleted("crm".into()))
        );
        assert!(store.read_service("crm").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let store = MemoryStore::new();
        store.create_service(service("crm")).unwrap();
        store.create_policy("crm", policy("p1")).unwrap();
        assert!(store.create_policy("crm", policy("p1")).is_err());
        assert!(store.create_policy("nope", policy("p2")).is_err());
    }

    #[tokio::test]
    async fn test_discover_log_capability() {
        let plain = MemoryStore::new();
        assert!(plain.discover_requests().is_none());

        let (store, log) = MemoryStore::with_discover_log();
        let manager = store.discover_requests().unwrap();
        let ctx = RequestContext {
            service_name: "crm".into(),
            resource: "/node1".into(),
            action: "get".into(),
            ..RequestContext::default()
        };
        manager.record(&ctx).await.unwrap();
        assert_eq!(log.recorded().len(), 1);
        assert_eq!(log.recorded()[0].resource, "/node1");
    }

    #[tokio::test]
    async fn test_function_events() {
        let store = MemoryStore::new();
        let mut rx = store.watch().unwrap();
        store
            .create_function(FunctionDef {
                name: "IsWorkday".into(),
                description: String::new(),
                func_url: "http://localhost:9999/f".into(),
                ca: None,
                result_cachable: true,
                result_ttl: 60,
                metadata: Default::default(),
            })
            .unwrap();
        assert_eq!(rx.recv().await, Some(ChangeEvent::FunctionsChanged));
        assert_eq!(store.read_functions().await.unwrap().len(), 1);
    }
}
