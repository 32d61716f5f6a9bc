//! The Tunnel Registry: the single source of truth for "which session
//! handles which subdomain right now". Built on [`DashMap`] for
//! lock-free, fine-grained locking per shard, so reads (the hot
//! `lookup_by_host` path) are never blocked by writes to unrelated keys.

use crate::error::{ServiceError, ServiceResult};
use crate::model::{Tunnel, TunnelId};
use crate::session::Session;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct Registry {
    base_domain: std::sync::RwLock<String>,
    by_subdomain: DashMap<String, TunnelId>,
    sessions: DashMap<TunnelId, Arc<Session>>,
    tunnels: DashMap<TunnelId, Tunnel>,
}

impl Registry {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: std::sync::RwLock::new(base_domain.into()),
            ..Default::default()
        }
    }

    /// Atomic check-and-insert (`register`). Rejected with
    /// `SubdomainConflict` unless the existing occupant is the very same
    /// `tunnel_id` presenting `resume=true` (handshake step 2), and with
    /// `TunnelIdConflict` if `tunnel_id` already names a live session and
    /// this isn't a resume — a client can't adopt someone else's id to
    /// steal their session.
    pub fn register(
        &self,
        subdomain: &str,
        tunnel_id: TunnelId,
        session: Arc<Session>,
        tunnel: Tunnel,
        resume: bool,
    ) -> ServiceResult<()> {
        if !resume && self.sessions.contains_key(&tunnel_id) {
            return Err(ServiceError::TunnelIdConflict);
        }
        match self.by_subdomain.entry(subdomain.to_string()) {
            Entry::Occupied(e) => {
                let existing = *e.get();
                if !(resume && existing == tunnel_id) {
                    return Err(ServiceError::SubdomainConflict);
                }
            }
            Entry::Vacant(e) => {
                e.insert(tunnel_id);
            }
        }
        self.sessions.insert(tunnel_id, session);
        self.tunnels.insert(tunnel_id, tunnel);
        Ok(())
    }

    /// Strips the configured base-domain suffix to obtain the
    /// subdomain; returns `None` if `host` doesn't match
    /// `*.<base_domain>`, signalling the caller to consult the
    /// custom-domain map instead (`lookup_by_host`).
    pub fn subdomain_of_host(&self, host: &str) -> Option<String> {
        let base = self.base_domain.read().unwrap();
        let host = host.split(':').next().unwrap_or(host);
        let suffix = format!(".{}", *base);
        host.strip_suffix(&suffix).map(|label| label.to_string())
    }

    pub fn lookup_by_host(&self, host: &str) -> Option<Arc<Session>> {
        let subdomain = self.subdomain_of_host(host)?;
        let tunnel_id = *self.by_subdomain.get(&subdomain)?;
        self.sessions.get(&tunnel_id).map(|s| s.clone())
    }

    pub fn lookup_by_id(&self, tunnel_id: TunnelId) -> Option<Arc<Session>> {
        self.sessions.get(&tunnel_id).map(|s| s.clone())
    }

    pub fn tunnel_snapshot(&self, tunnel_id: TunnelId) -> Option<Tunnel> {
        self.tunnels.get(&tunnel_id).map(|t| t.clone())
    }

    pub fn update_tunnel(&self, tunnel_id: TunnelId, f: impl FnOnce(&mut Tunnel)) {
        if let Some(mut t) = self.tunnels.get_mut(&tunnel_id) {
            f(&mut t);
        }
    }

    pub fn is_subdomain_taken(&self, subdomain: &str) -> bool {
        self.by_subdomain.contains_key(subdomain)
    }

    /// Idempotent: removing an id that isn't registered is a no-op.
    pub fn unregister(&self, tunnel_id: TunnelId) {
        if let Some((_, tunnel)) = self.tunnels.remove(&tunnel_id) {
            self.by_subdomain.remove(&tunnel.subdomain);
        }
        self.sessions.remove(&tunnel_id);
    }

    pub fn active_count(&self) -> usize {
        self.tunnels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TunnelStatus;
    use tunnel_protocol::TunnelProtocol;
    use uuid::Uuid;

    fn sample_tunnel(id: TunnelId, subdomain: &str) -> Tunnel {
        Tunnel {
            id,
            subdomain: subdomain.to_string(),
            protocol: TunnelProtocol::Http,
            local_url: "http://localhost:3000".into(),
            public_url: format!("https://{subdomain}.example.test"),
            custom_domain: None,
            owner_user_id: None,
            status: TunnelStatus::Active,
            allocated_port: None,
            created_at: chrono::Utc::now(),
            last_active_at: chrono::Utc::now(),
            active_since: Some(chrono::Utc::now()),
        }
    }

    fn dummy_session(id: TunnelId) -> Arc<Session> {
        Arc::new(Session::new_for_test(id))
    }

    #[test]
    fn register_lookup_unregister_is_left_inverse() {
        let reg = Registry::new("example.test");
        let id = Uuid::new_v4();
        reg.register("abc", id, dummy_session(id), sample_tunnel(id, "abc"), false)
            .unwrap();

        assert!(reg.lookup_by_host("abc.example.test").is_some());
        assert_eq!(reg.active_count(), 1);

        reg.unregister(id);
        assert!(reg.lookup_by_host("abc.example.test").is_none());
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn conflicting_subdomain_is_rejected() {
        let reg = Registry::new("example.test");
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        reg.register("abc", id1, dummy_session(id1), sample_tunnel(id1, "abc"), false)
            .unwrap();
        let err = reg
            .register("abc", id2, dummy_session(id2), sample_tunnel(id2, "abc"), false)
            .unwrap_err();
        assert_eq!(err, ServiceError::SubdomainConflict);
    }

    #[test]
    fn adopting_a_live_tunnel_id_under_a_new_subdomain_is_rejected() {
        let reg = Registry::new("example.test");
        let id = Uuid::new_v4();
        reg.register("abc", id, dummy_session(id), sample_tunnel(id, "abc"), false)
            .unwrap();
        let err = reg
            .register("xyz", id, dummy_session(id), sample_tunnel(id, "xyz"), false)
            .unwrap_err();
        assert_eq!(err, ServiceError::TunnelIdConflict);
    }

    #[test]
    fn resume_with_same_id_is_allowed() {
        let reg = Registry::new("example.test");
        let id = Uuid::new_v4();
        reg.register("abc", id, dummy_session(id), sample_tunnel(id, "abc"), false)
            .unwrap();
        reg.register("abc", id, dummy_session(id), sample_tunnel(id, "abc"), true)
            .unwrap();
    }

    #[test]
    fn host_with_unknown_suffix_falls_through() {
        let reg = Registry::new("example.test");
        assert!(reg.subdomain_of_host("abc.other.test").is_none());
        assert_eq!(reg.subdomain_of_host("abc.example.test").unwrap(), "abc");
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = Registry::new("example.test");
        reg.unregister(Uuid::new_v4());
        reg.unregister(Uuid::new_v4());
    }
}
