//! Turn service.
//!
//! The protocol core of the relay: per-session state, allocations with
//! their permissions, channels and TCP connection tables, the
//! authentication pipeline and the request processing state machine.
//! The crate owns no sockets; the embedding server drives it with
//! decoded packets and reacts to the outputs (see
//! [`processor::Output`]).

pub mod auth;
pub mod processor;
pub mod session;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    auth::{Credentials, PeerPolicy},
    processor::Processor,
    session::{SessionManager, ports::PortRange},
};

/// The identifier of a client session.
///
/// Each session needs to be identified by a combination of three pieces
/// of information: the source address, the listening endpoint the
/// packet arrived on, and the transport protocol. Together they stand
/// in for the 5-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub source: SocketAddr,
    pub interface: SocketAddr,
    pub transport: Transport,
}

/// The client-facing transport of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    /// Whether messages arrive framed on a byte stream.
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Tcp | Self::Tls)
    }
}

/// What kind of relay endpoint an allocation carries: a UDP socket, or
/// a TCP listener in RFC 6062 mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Udp,
    Tcp,
}

/// A credential as stored in the user database.
///
/// Long-term entries may be kept as the plaintext password or as the
/// precomputed MD5 key (the `0x`-prefixed form of the flat-file
/// database).
#[derive(Debug, Clone)]
pub enum Credential {
    Password(String),
    Key([u8; 16]),
}

/// The service's view of the embedding server.
///
/// `get_credential` is the asynchronous authentication round-trip: the
/// session state machine suspends the request until the answer comes
/// back from wherever the user database lives. The remaining callbacks
/// are lifecycle notifications.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn get_credential(&self, username: &str) -> Option<Credential>;

    /// A relay endpoint was reserved for an allocation and the I/O
    /// layer should bring up the socket. Returning false aborts the
    /// allocation with 508.
    #[allow(unused_variables)]
    async fn relay_bound(&self, id: &Identifier, relay: SocketAddr, kind: RelayKind) -> bool {
        true
    }

    #[allow(unused_variables)]
    fn on_allocated(&self, id: &Identifier, username: &str, port: u16) {}

    #[allow(unused_variables)]
    fn on_channel_bind(&self, id: &Identifier, username: &str, channel: u16) {}

    #[allow(unused_variables)]
    fn on_create_permission(&self, id: &Identifier, username: &str, peers: &[IpAddr]) {}

    #[allow(unused_variables)]
    fn on_refresh(&self, id: &Identifier, username: &str, lifetime: u32) {}

    #[allow(unused_variables)]
    fn on_connect(&self, id: &Identifier, username: &str, connection: u32) {}

    #[allow(unused_variables)]
    fn on_connection_bind(&self, id: &Identifier, username: &str, connection: u32) {}

    /// Triggered when the session leaves the turn. Possible reasons:
    /// the session life cycle has expired, refresh with a zero
    /// lifetime, or teardown of the transport. `relay` names the relay
    /// endpoint to be closed, if one was allocated.
    #[allow(unused_variables)]
    fn on_destroy(&self, id: &Identifier, username: &str, relay: Option<SocketAddr>) {}
}

/// Behaviour toggles of the service, one field per policy knob of the
/// command line.
#[derive(Debug, Default, Clone)]
pub struct ServiceFlags {
    pub stun_only: bool,
    pub secure_stun: bool,
    pub no_udp_relay: bool,
    pub no_tcp_relay: bool,
    pub mobility: bool,
    /// Non-standard RFC 6062 mode: accept peer connections without a
    /// matching permission.
    pub server_relay: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub realm: String,
    pub software: String,
    pub credentials: Credentials,
    pub port_range: PortRange,
    /// Local addresses relay sockets bind on, one per address family at
    /// most.
    pub relay_ips: Vec<IpAddr>,
    /// Public/private address mapping when the relay is behind NAT:
    /// `(public, private)`. A mapping with no private side applies to
    /// every relay address.
    pub external_ips: Vec<(IpAddr, Option<IpAddr>)>,
    pub alternate_server: Option<SocketAddr>,
    /// A separate redirect target for TLS sessions, falling back to
    /// `alternate_server`.
    pub tls_alternate_server: Option<SocketAddr>,
    /// Concurrent allocations allowed per user, 0 for no limit.
    pub user_quota: usize,
    /// Concurrent allocations allowed in total, 0 for no limit.
    pub total_quota: usize,
    /// Bytes per second a session may relay, both directions combined,
    /// 0 for no limit.
    pub max_bps: usize,
    /// Upper bound an allocation lifetime may be refreshed to.
    pub max_lifetime: u32,
    /// Seconds a session may sit without a successful Allocate.
    pub max_allocate_timeout: u64,
    /// Seconds before an issued nonce goes stale.
    pub nonce_lifetime: u64,
    pub peer_policy: PeerPolicy,
    pub flags: ServiceFlags,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            realm: "localhost".to_string(),
            software: concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION")).to_string(),
            credentials: Credentials::default(),
            port_range: PortRange::default(),
            relay_ips: vec![IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)],
            external_ips: Vec::new(),
            alternate_server: None,
            tls_alternate_server: None,
            user_quota: 0,
            total_quota: 0,
            max_bps: 0,
            max_lifetime: 3600,
            max_allocate_timeout: 60,
            nonce_lifetime: 600,
            peer_policy: PeerPolicy::default(),
            flags: ServiceFlags::default(),
        }
    }
}

impl ServiceConfig {
    /// The address reported in XOR-RELAYED-ADDRESS for a relay bound on
    /// `relay`: the external mapping when one covers the relay IP, the
    /// local address otherwise.
    pub fn map_external(&self, relay: SocketAddr) -> SocketAddr {
        for (public, private) in &self.external_ips {
            match private {
                Some(it) if *it == relay.ip() => return SocketAddr::new(*public, relay.port()),
                None => return SocketAddr::new(*public, relay.port()),
                _ => {}
            }
        }

        relay
    }

    /// The relay IP for a requested address family.
    pub fn relay_ip(&self, family: codec::message::attributes::AddressFamily) -> Option<IpAddr> {
        use codec::message::attributes::AddressFamily;

        self.relay_ips.iter().copied().find(|ip| match family {
            AddressFamily::V4 => ip.is_ipv4(),
            AddressFamily::V6 => ip.is_ipv6(),
        })
    }
}

pub struct ServiceOptions<T> {
    pub config: ServiceConfig,
    pub handler: T,
}

/// Turn service.
#[derive(Clone)]
pub struct Service<T> {
    config: Arc<ServiceConfig>,
    manager: Arc<SessionManager<T>>,
    handler: T,
}

impl<T> Service<T>
where
    T: Observer + Clone + 'static,
{
    /// Create turn service.
    pub fn new(options: ServiceOptions<T>) -> Self {
        let config = Arc::new(options.config);

        Self {
            manager: SessionManager::new(config.clone(), options.handler.clone()),
            handler: options.handler,
            config,
        }
    }

    /// A request processor owned by one worker. `server_id` seeds the
    /// high bits of RFC 6062 connection ids, so every worker must get
    /// its own value.
    pub fn get_processor(
        &self,
        server_id: u8,
        interface: SocketAddr,
        transport: Transport,
    ) -> Processor<T> {
        Processor::new(self, server_id, interface, transport)
    }

    pub fn get_session_manager(&self) -> &Arc<SessionManager<T>> {
        &self.manager
    }

    pub fn get_config(&self) -> &Arc<ServiceConfig> {
        &self.config
    }

    pub fn get_handler(&self) -> &T {
        &self.handler
    }
}
