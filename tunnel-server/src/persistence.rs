//! The Persistence Adapter: a narrow, capability-shaped
//! contract. Every method is wrapped so a backend failure produces
//! [`ServiceError::PersistenceUnavailable`] and never an exception that
//! could unwind into the data path — callers in the proxy/control plane
//! log the error and continue, since persistence failure never blocks
//! traffic forwarding.
//!
//! The schema behind this trait (columns, tables, migrations) is
//! explicitly out of scope; [`InMemoryPersistence`] is a
//! complete, dependency-free implementation sufficient for the core to
//! run and for tests, standing in for whatever real database-backed
//! adapter a deployment wires in.

use crate::error::ServiceError;
use crate::model::{CustomDomain, RequestRecord, RequestRecordFilter, Tunnel, TunnelId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn save_tunnel(&self, tunnel: &Tunnel) -> Result<(), ServiceError>;
    async fn mark_tunnel_inactive(&self, id: TunnelId) -> Result<(), ServiceError>;
    async fn get_tunnel(&self, id: TunnelId) -> Result<Option<Tunnel>, ServiceError>;
    async fn list_tunnels_by_user(&self, user_id: UserId, page: Page) -> Result<Vec<Tunnel>, ServiceError>;
    async fn count_tunnels(&self) -> Result<usize, ServiceError>;
    async fn list_all_tunnels(&self, page: Page) -> Result<Vec<Tunnel>, ServiceError>;

    async fn save_request_record(&self, record: &RequestRecord) -> Result<(), ServiceError>;
    async fn list_request_records(
        &self,
        tunnel_id: TunnelId,
        filter: RequestRecordFilter,
    ) -> Result<Vec<RequestRecord>, ServiceError>;
    async fn get_request_record(
        &self,
        tunnel_id: TunnelId,
        request_id: Uuid,
    ) -> Result<Option<RequestRecord>, ServiceError>;

    async fn find_custom_domain(&self, host: &str) -> Result<Option<TunnelId>, ServiceError>;
}

/// Default, fully in-process implementation. Good enough to run the
/// edge and to back integration tests; a production deployment is
/// expected to swap this for a real database-backed adapter behind the
/// same trait.
#[derive(Default)]
pub struct InMemoryPersistence {
    tunnels: DashMap<TunnelId, Tunnel>,
    requests: DashMap<TunnelId, Vec<RequestRecord>>,
    custom_domains: DashMap<String, TunnelId>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_custom_domain(self: Arc<Self>, domain: impl Into<String>, tunnel_id: TunnelId) -> Arc<Self> {
        self.custom_domains.insert(domain.into(), tunnel_id);
        self
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn save_tunnel(&self, tunnel: &Tunnel) -> Result<(), ServiceError> {
        self.tunnels.insert(tunnel.id, tunnel.clone());
        Ok(())
    }

    async fn mark_tunnel_inactive(&self, id: TunnelId) -> Result<(), ServiceError> {
        if let Some(mut t) = self.tunnels.get_mut(&id) {
            t.status = crate::model::TunnelStatus::Inactive;
        }
        Ok(())
    }

    async fn get_tunnel(&self, id: TunnelId) -> Result<Option<Tunnel>, ServiceError> {
        Ok(self.tunnels.get(&id).map(|r| r.clone()))
    }

    async fn list_tunnels_by_user(&self, user_id: UserId, page: Page) -> Result<Vec<Tunnel>, ServiceError> {
        let mut items: Vec<Tunnel> = self
            .tunnels
            .iter()
            .filter(|e| e.owner_user_id == Some(user_id))
            .map(|e| e.clone())
            .collect();
        items.sort_by_key(|t| t.created_at);
        Ok(paginate(items, page))
    }

    async fn count_tunnels(&self) -> Result<usize, ServiceError> {
        Ok(self.tunnels.len())
    }

    async fn list_all_tunnels(&self, page: Page) -> Result<Vec<Tunnel>, ServiceError> {
        let mut items: Vec<Tunnel> = self.tunnels.iter().map(|e| e.clone()).collect();
        items.sort_by_key(|t| t.created_at);
        Ok(paginate(items, page))
    }

    async fn save_request_record(&self, record: &RequestRecord) -> Result<(), ServiceError> {
        self.requests.entry(record.tunnel_id).or_default().push(record.clone());
        Ok(())
    }

    async fn list_request_records(
        &self,
        tunnel_id: TunnelId,
        filter: RequestRecordFilter,
    ) -> Result<Vec<RequestRecord>, ServiceError> {
        let records = self.requests.get(&tunnel_id).map(|r| r.clone()).unwrap_or_default();
        let filtered: Vec<RequestRecord> = records
            .into_iter()
            .rev()
            .filter(|r| filter.method.as_ref().is_none_or(|m| m.eq_ignore_ascii_case(&r.method)))
            .filter(|r| filter.path.as_ref().is_none_or(|p| &r.path == p))
            .collect();
        Ok(paginate(filtered, Page { offset: filter.offset, limit: filter.limit }))
    }

    async fn get_request_record(
        &self,
        tunnel_id: TunnelId,
        request_id: Uuid,
    ) -> Result<Option<RequestRecord>, ServiceError> {
        Ok(self
            .requests
            .get(&tunnel_id)
            .and_then(|recs| recs.iter().find(|r| r.id == request_id).cloned()))
    }

    async fn find_custom_domain(&self, host: &str) -> Result<Option<TunnelId>, ServiceError> {
        Ok(self.custom_domains.get(host).map(|r| *r))
    }
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    let limit = if page.limit == 0 { items.len() } else { page.limit };
    items.into_iter().skip(page.offset).take(limit).collect()
}
