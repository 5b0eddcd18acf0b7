//! Fulcrum - Policy Decision Point
//!
//! An embeddable authorization engine: grant/deny policies with condition
//! expressions, role-hierarchy closure with deny-overrides, and a
//! watch-driven compiled-policy cache. Transports and storage backends
//! live outside this crate and talk to it through the `Pdp` facade and
//! the `PolicyStore` trait.

pub mod api;
pub mod asserter;
pub mod cache;
pub mod condition;
pub mod engine;
pub mod errors;
pub mod functions;
pub mod matcher;
pub mod roles;
pub mod settings;
pub mod snapshot;
pub mod store;

pub use api::{
    Decision, Diagnosis, Effect, FunctionDef, Permission, Policy, Principal, PrincipalType,
    Reason, RequestContext, RolePolicy, Service, Subject,
};
pub use asserter::{TokenAsserter, WebhookAsserter};
pub use condition::Value;
pub use engine::Pdp;
pub use errors::{EvalError, PdpError};
pub use settings::Settings;
pub use store::{ChangeEvent, DiscoverRequestManager, MemoryStore, PolicyStore};
