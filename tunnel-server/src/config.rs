//! Every environment-driven setting this edge needs, loaded with the
//! teacher's own convention (`main.rs` reading `RUST_LOG`, default if
//! unset) generalized to the whole set.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Suffix for subdomain hosts, e.g. `example.test`.
    pub base_domain: String,
    /// Allocation window for TCP/TLS/UDP public ports.
    pub l4_port_range: (u16, u16),
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// `T_req`
    pub request_deadline: Duration,
    /// `B_inline`
    pub inline_body_threshold: usize,
    /// `B_log`
    pub log_body_cap: usize,
    /// `M_session`
    pub max_inflight_bytes_per_session: usize,
    pub subdomain_alphabet: Vec<char>,
    /// `L`
    pub subdomain_length: usize,
    /// `K`
    pub subdomain_retry: u32,
    pub require_auth_at_handshake: bool,
    /// Idle timeout for a UDP flow keyed by source address.
    pub udp_flow_idle: Duration,
    /// Address the public HTTP/handshake listener binds to.
    pub listen_addr: std::net::SocketAddr,
    /// Address the admin JSON surface binds to.
    pub admin_listen_addr: std::net::SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_domain: env_or("TUNNEL_BASE_DOMAIN", "example.test"),
            l4_port_range: (
                env_or_parse("TUNNEL_L4_PORT_LO", 20000),
                env_or_parse("TUNNEL_L4_PORT_HI", 30000),
            ),
            heartbeat_interval: Duration::from_secs(env_or_parse("TUNNEL_HEARTBEAT_INTERVAL_SECS", 20)),
            heartbeat_timeout: Duration::from_secs(env_or_parse("TUNNEL_HEARTBEAT_TIMEOUT_SECS", 45)),
            request_deadline: Duration::from_secs(env_or_parse("TUNNEL_REQUEST_DEADLINE_SECS", 60)),
            inline_body_threshold: env_or_parse("TUNNEL_INLINE_BODY_THRESHOLD", 64 * 1024),
            log_body_cap: env_or_parse("TUNNEL_LOG_BODY_CAP", 64 * 1024),
            max_inflight_bytes_per_session: env_or_parse("TUNNEL_MAX_INFLIGHT_BYTES", 32 * 1024 * 1024),
            subdomain_alphabet: "abcdefghjkmnpqrstuvwxyz23456789".chars().collect(),
            subdomain_length: env_or_parse("TUNNEL_SUBDOMAIN_LENGTH", 8),
            subdomain_retry: env_or_parse("TUNNEL_SUBDOMAIN_RETRY", 10),
            require_auth_at_handshake: env_or_parse("TUNNEL_REQUIRE_AUTH", false),
            udp_flow_idle: Duration::from_secs(env_or_parse("TUNNEL_UDP_FLOW_IDLE_SECS", 30)),
            listen_addr: env_or_parse("TUNNEL_LISTEN_ADDR", "0.0.0.0:7070".parse().unwrap()),
            admin_listen_addr: env_or_parse("TUNNEL_ADMIN_LISTEN_ADDR", "127.0.0.1:7071".parse().unwrap()),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
