//! Request Log & Replay: captures one `RequestRecord` per
//! proxied HTTP call, indexed by `tunnel_id` and `request_id`, and
//! reconstructs a stored request to fire it again through whichever
//! session is currently active for that tunnel.

use crate::error::{ServiceError, ServiceResult};
use crate::model::RequestRecord;
use crate::model::{RequestId, RequestRecordFilter, TunnelId};
use crate::persistence::PersistenceAdapter;
use crate::proxy_http::{dispatch_request, OutboundRequest};
use crate::registry::Registry;
use std::sync::Arc;
use tracing::warn;
use tunnel_protocol::is_hop_by_hop;

pub struct RequestLog {
    persistence: Arc<dyn PersistenceAdapter>,
}

impl RequestLog {
    pub fn new(persistence: Arc<dyn PersistenceAdapter>) -> Self {
        Self { persistence }
    }

    /// Best-effort append — a persistence failure is logged and
    /// swallowed: it must never propagate into the proxy data path.
    pub async fn append(&self, record: RequestRecord) {
        if let Err(e) = self.persistence.save_request_record(&record).await {
            warn!(request_id = %record.id, error = %e, "failed to persist request record");
        }
    }

    pub async fn list(&self, tunnel_id: TunnelId, filter: RequestRecordFilter) -> ServiceResult<Vec<RequestRecord>> {
        self.persistence.list_request_records(tunnel_id, filter).await
    }

    pub async fn get(&self, tunnel_id: TunnelId, request_id: RequestId) -> ServiceResult<RequestRecord> {
        self.persistence
            .get_request_record(tunnel_id, request_id)
            .await?
            .ok_or(ServiceError::RequestRecordNotFound)
    }

    /// Reconstructs the `REQUEST` frame from a stored record and sends
    /// it through the tunnel's currently active session. Hop-by-hop
    /// headers are stripped before resending.
    pub async fn replay(
        &self,
        registry: &Registry,
        deps: &crate::deps::Deps,
        tunnel_id: TunnelId,
        request_id: RequestId,
    ) -> ServiceResult<RequestRecord> {
        let stored = self.get(tunnel_id, request_id).await?;

        let session = registry.lookup_by_id(tunnel_id).ok_or(ServiceError::TunnelDisconnected)?;

        let headers: Vec<(String, String)> = stored
            .headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .cloned()
            .collect();

        let outbound = OutboundRequest {
            method: stored.method.clone(),
            path: stored.path.clone(),
            query: stored.query_string.clone(),
            headers,
            body: stored.body.clone(),
            remote_addr: stored.remote_addr.clone(),
            user_agent: stored.user_agent.clone(),
        };

        let outcome = dispatch_request(&session, tunnel_id, outbound, deps).await;
        self.append(outcome.record.clone()).await;
        Ok(outcome.record)
    }
}
