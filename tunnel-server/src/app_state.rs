//! The shared axum router state: everything a request handler needs to
//! reach the registry, the injected capabilities, the request log, and
//! the L4 port allocator, cloned cheaply per request via `Arc`/`Clone`.

use crate::allocator::PortAllocator;
use crate::deps::Deps;
use crate::registry::Registry;
use crate::request_log::RequestLog;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub deps: Deps,
    pub request_log: Arc<RequestLog>,
    pub port_allocator: Arc<PortAllocator>,
}

impl AppState {
    pub fn new(deps: Deps) -> Self {
        let registry = Arc::new(Registry::new(deps.config.base_domain.clone()));
        let request_log = Arc::new(RequestLog::new(deps.persistence.clone()));
        let port_allocator = Arc::new(PortAllocator::new(deps.config.l4_port_range.0, deps.config.l4_port_range.1));
        Self {
            registry,
            deps,
            request_log,
            port_allocator,
        }
    }
}
