pub mod allocation;
pub mod ports;

use crate::{
    Identifier, Observer, RelayKind, ServiceConfig,
    auth::make_nonce,
    session::{
        allocation::{Allocation, TCP_TIMEOUT, TcpConnectionState},
        ports::PortAllocator,
    },
};

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use codec::crypto::Password;
use codec::message::attributes::{AddressFamily, ErrorType};
use parking_lot::{Mutex, RwLock};

/// The default grant when an Allocate or Refresh names no lifetime.
pub const DEFAULT_LIFETIME: u32 = 600;

/// After a nonce rotation the previous nonce stays acceptable for a
/// short grace window, so a request raced by the rotation does not
/// bounce twice.
const NONCE_GRACE: u64 = 30;

/// How long a reserved even-port partner waits for its token to be
/// redeemed.
const RESERVATION_LIFETIME: u64 = 30;

/// A specially optimised timer.
///
/// This timer does not advance automatically and needs to be advanced
/// externally and manually, which the manager's reaper thread does once
/// a second.
///
/// ```
/// use turn_relay_service::session::Timer;
///
/// let timer = Timer::default();
///
/// assert_eq!(timer.get(), 0);
/// assert_eq!(timer.add(), 1);
/// assert_eq!(timer.get(), 1);
/// ```
#[derive(Default)]
pub struct Timer(AtomicU64);

impl Timer {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// The server nonce issued to a session, with one rotation of history.
#[derive(Debug, Clone)]
pub struct Nonce {
    pub value: String,
    pub created: u64,
    pub previous: Option<(String, u64)>,
}

impl Nonce {
    fn new(now: u64) -> Self {
        Self {
            value: make_nonce(),
            created: now,
            previous: None,
        }
    }

    fn rotate(&mut self, now: u64) {
        self.previous = Some((std::mem::replace(&mut self.value, make_nonce()), now));
        self.created = now;
    }
}

/// Authentication state once the key is bound.
#[derive(Debug, Clone)]
pub struct SessionAuth {
    pub username: String,
    pub password: Password,
}

/// Received/sent packet and byte counts, and the one-second bandwidth
/// window.
#[derive(Debug, Default, Clone)]
pub struct Counters {
    pub received_packets: u64,
    pub received_bytes: u64,
    pub sent_packets: u64,
    pub sent_bytes: u64,
    rate_window: u64,
    rate_used: usize,
}

/// turn session information.
///
/// A logical client association, keyed by the 5-tuple. Auth state,
/// the owned allocation and traffic accounting all hang off it.
pub struct Session {
    pub session_id: u64,
    pub created_at: u64,
    pub expires: u64,
    pub nonce: Nonce,
    pub auth: Option<SessionAuth>,
    pub allocation: Option<Allocation>,
    pub mobile_id: Option<u64>,
    pub counters: Counters,
}

/// Parameters of an Allocate request after decoding.
#[derive(Debug, Clone, Copy)]
pub struct AllocateRequest {
    pub kind: RelayKind,
    pub family: AddressFamily,
    /// `Some(reserve)` when EVEN-PORT was present.
    pub even_port: Option<bool>,
    pub token: Option<u64>,
    pub lifetime: Option<u32>,
}

/// What the allocation handed back to the client.
#[derive(Debug, Clone, Copy)]
pub struct AllocateGrant {
    pub relay: SocketAddr,
    pub lifetime: u32,
    pub reservation: Option<u64>,
    pub mobility_ticket: Option<u64>,
}

/// Routing decision for a datagram arriving on a relay socket.
#[derive(Debug, Clone, Copy)]
pub struct PeerInbound {
    pub id: Identifier,
    /// Frame as ChannelData on this number when a channel is bound to
    /// the exact peer address, as a Data indication otherwise.
    pub channel: Option<u16>,
}

struct Reservation {
    port: u16,
    relay_ip: IpAddr,
    expires: u64,
}

pub struct SessionManager<T> {
    config: Arc<ServiceConfig>,
    sessions: RwLock<HashMap<Identifier, Session>>,
    // session id to identifier, the stable handle carried through the
    // async auth round-trip.
    index: RwLock<HashMap<u64, Identifier>>,
    // relay port to owning session.
    port_mapping: RwLock<HashMap<u16, Identifier>>,
    // RFC 6062 connection id to owning session.
    tcp_index: RwLock<HashMap<u32, Identifier>>,
    // mobility ticket to session.
    mobility: RwLock<HashMap<u64, Identifier>>,
    reservations: Mutex<HashMap<u64, Reservation>>,
    port_allocator: Mutex<PortAllocator>,
    user_allocations: Mutex<HashMap<String, usize>>,
    total_allocations: AtomicUsize,
    sequence: AtomicU64,
    timer: Timer,
    handler: T,
}

impl<T> SessionManager<T>
where
    T: Observer + 'static,
{
    pub fn new(config: Arc<ServiceConfig>, handler: T) -> Arc<Self> {
        let this = Arc::new(Self {
            port_allocator: Mutex::new(PortAllocator::new(config.port_range)),
            sessions: RwLock::new(HashMap::with_capacity(1024)),
            index: RwLock::new(HashMap::with_capacity(1024)),
            port_mapping: RwLock::new(HashMap::with_capacity(1024)),
            tcp_index: RwLock::new(HashMap::with_capacity(64)),
            mobility: RwLock::new(HashMap::with_capacity(64)),
            reservations: Mutex::new(HashMap::with_capacity(64)),
            user_allocations: Mutex::new(HashMap::with_capacity(64)),
            total_allocations: AtomicUsize::new(0),
            sequence: AtomicU64::new(1),
            timer: Timer::default(),
            handler,
            config,
        });

        // This is a background thread that silently advances the clock,
        // reaps expired sessions and sweeps expired sub-state out of
        // the live ones.
        let this_ = Arc::downgrade(&this);
        thread::spawn(move || {
            let mut expired = Vec::with_capacity(255);

            while let Some(this) = this_.upgrade() {
                let now = this.timer.add();

                {
                    this.sessions
                        .read()
                        .iter()
                        .filter(|(_, v)| v.expires <= now)
                        .for_each(|(k, _)| expired.push(*k));
                }

                if !expired.is_empty() {
                    this.remove_sessions(&expired);
                    expired.clear();
                }

                {
                    let mut sessions = this.sessions.write();
                    let mut tcp_index = this.tcp_index.write();
                    for (id, session) in sessions.iter_mut() {
                        if let Some(allocation) = session.allocation.as_mut() {
                            allocation.sweep(now);
                            tcp_index.retain(|cid, owner| {
                                *owner != *id || allocation.get_tcp_connection(*cid).is_some()
                            });
                        }
                    }
                }

                {
                    let mut port_allocator = this.port_allocator.lock();
                    this.reservations.lock().retain(|_, it| {
                        if it.expires > now {
                            return true;
                        }

                        port_allocator.restore(it.port);
                        false
                    });
                }

                drop(this);
                thread::sleep(Duration::from_secs(1));
            }
        });

        this
    }

    pub fn now(&self) -> u64 {
        self.timer.get()
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Number of live allocations.
    pub fn allocated(&self) -> usize {
        self.total_allocations.load(Ordering::Relaxed)
    }

    /// Ensure a session exists for the identifier and return its id.
    pub fn touch(&self, id: &Identifier) -> u64 {
        {
            if let Some(session) = self.sessions.read().get(id) {
                return session.session_id;
            }
        }

        let now = self.timer.get();
        let session_id = self.sequence.fetch_add(1, Ordering::Relaxed);

        self.sessions.write().insert(
            *id,
            Session {
                session_id,
                created_at: now,
                expires: now + self.config.max_allocate_timeout,
                nonce: Nonce::new(now),
                auth: None,
                allocation: None,
                mobile_id: None,
                counters: Counters::default(),
            },
        );

        self.index.write().insert(session_id, *id);
        session_id
    }

    pub fn session_id(&self, id: &Identifier) -> Option<u64> {
        self.sessions.read().get(id).map(|it| it.session_id)
    }

    pub fn identifier_of(&self, session_id: u64) -> Option<Identifier> {
        self.index.read().get(&session_id).copied()
    }

    /// The current nonce for the session, rotating it first when it has
    /// gone stale. Creates the session as a side effect.
    pub fn get_nonce(&self, id: &Identifier) -> String {
        self.touch(id);

        let now = self.timer.get();
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(id) else {
            return make_nonce();
        };

        if now - session.nonce.created >= self.config.nonce_lifetime {
            session.nonce.rotate(now);
        }

        session.nonce.value.clone()
    }

    /// Whether a presented nonce is acceptable: the unexpired current
    /// one, or the previous one within its grace window.
    pub fn check_nonce(&self, id: &Identifier, presented: &str) -> bool {
        let now = self.timer.get();
        let sessions = self.sessions.read();
        let Some(session) = sessions.get(id) else {
            return false;
        };

        if now - session.nonce.created < self.config.nonce_lifetime
            && session.nonce.value == presented
        {
            return true;
        }

        session
            .nonce
            .previous
            .as_ref()
            .is_some_and(|(value, rotated)| value == presented && now - rotated < NONCE_GRACE)
    }

    /// The key bound to the session by an earlier round-trip to the
    /// authenticator, if any.
    pub fn cached_password(&self, id: &Identifier) -> Option<Password> {
        self.sessions
            .read()
            .get(id)?
            .auth
            .as_ref()
            .map(|it| it.password.clone())
    }

    /// Bind the derived key to the session; subsequent requests skip
    /// the authenticator round-trip.
    pub fn bind_key(&self, id: &Identifier, username: &str, password: Password) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.auth = Some(SessionAuth {
                username: username.to_string(),
                password,
            });
        }
    }

    /// The session owning a relay port.
    pub fn owner_of_port(&self, relay_port: u16) -> Option<Identifier> {
        self.port_mapping.read().get(&relay_port).copied()
    }

    /// The local relay address of the session's allocation.
    pub fn relay_of(&self, id: &Identifier) -> Option<(SocketAddr, RelayKind)> {
        self.sessions
            .read()
            .get(id)?
            .allocation
            .as_ref()
            .map(|it| (it.relay, it.kind))
    }

    pub fn username(&self, id: &Identifier) -> Option<String> {
        self.sessions
            .read()
            .get(id)?
            .auth
            .as_ref()
            .map(|it| it.username.clone())
    }

    /// Create the relay endpoint for the session.
    ///
    /// Everything about the request that can be refused is refused
    /// here: a second allocation, quota exhaustion, an address family
    /// the relay has no interface for, port exhaustion, an unknown
    /// reservation token.
    pub fn create_allocation(
        &self,
        id: &Identifier,
        request: AllocateRequest,
    ) -> Result<AllocateGrant, ErrorType> {
        let now = self.timer.get();
        let username = self.username(id).unwrap_or_default();

        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id).ok_or(ErrorType::AllocationMismatch)?;

        if session.allocation.is_some() {
            return Err(ErrorType::AllocationMismatch);
        }

        // Quota checks are done before any resource is taken.
        if self.config.user_quota > 0 {
            let users = self.user_allocations.lock();
            if users.get(&username).copied().unwrap_or(0) >= self.config.user_quota {
                return Err(ErrorType::AllocationQuotaReached);
            }
        }

        if self.config.total_quota > 0
            && self.total_allocations.load(Ordering::Relaxed) >= self.config.total_quota
        {
            return Err(ErrorType::InsufficientCapacity);
        }

        let mut relay_ip = self
            .config
            .relay_ip(request.family)
            .ok_or(ErrorType::AddressFamilyNotSupported)?;

        // EVEN-PORT and RESERVATION-TOKEN are mutually exclusive, the
        // processor rejects that combination before coming here.
        let (port, reservation) = if let Some(token) = request.token {
            let mut reservations = self.reservations.lock();
            let reservation = reservations.remove(&token).ok_or(ErrorType::InsufficientCapacity)?;

            // The partner port was reserved on a specific interface.
            relay_ip = reservation.relay_ip;
            (reservation.port, None)
        } else {
            let mut ports = self.port_allocator.lock();
            match request.even_port {
                Some(reserve) => {
                    let (port, partner) =
                        ports.alloc_even(reserve).ok_or(ErrorType::InsufficientCapacity)?;

                    let token = partner.map(|partner| {
                        let token = rand::random::<u64>();
                        self.reservations.lock().insert(
                            token,
                            Reservation {
                                port: partner,
                                relay_ip,
                                expires: now + RESERVATION_LIFETIME,
                            },
                        );

                        token
                    });

                    (port, token)
                }
                None => (ports.alloc().ok_or(ErrorType::InsufficientCapacity)?, None),
            }
        };

        let lifetime = self.grant_lifetime(request.lifetime);
        let relay = SocketAddr::new(relay_ip, port);

        let mut allocation = Allocation::new(request.kind, relay, now + lifetime as u64);
        allocation.reservation = reservation;
        session.allocation = Some(allocation);
        session.expires = now + lifetime as u64;

        let mobility_ticket = if self.config.flags.mobility {
            let ticket = rand::random::<u64>();
            session.mobile_id = Some(ticket);
            self.mobility.write().insert(ticket, *id);

            Some(ticket)
        } else {
            None
        };

        self.port_mapping.write().insert(port, *id);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        *self.user_allocations.lock().entry(username).or_insert(0) += 1;

        Ok(AllocateGrant {
            relay,
            lifetime,
            reservation,
            mobility_ticket,
        })
    }

    /// The relay socket came up, the allocation becomes usable.
    pub fn validate_allocation(&self, id: &Identifier) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            if let Some(allocation) = session.allocation.as_mut() {
                allocation.is_valid = true;
            }
        }
    }

    /// The relay socket failed to come up; undo everything
    /// `create_allocation` did.
    pub fn abort_allocation(&self, id: &Identifier) {
        let username = self.username(id).unwrap_or_default();
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(id) else {
            return;
        };

        let Some(allocation) = session.allocation.take() else {
            return;
        };

        let now = self.timer.get();
        session.expires = now + self.config.max_allocate_timeout;
        if let Some(ticket) = session.mobile_id.take() {
            self.mobility.write().remove(&ticket);
        }

        self.port_mapping.write().remove(&allocation.relay.port());
        self.port_allocator.lock().restore(allocation.relay.port());
        self.total_allocations.fetch_sub(1, Ordering::Relaxed);
        if let Some(count) = self.user_allocations.lock().get_mut(&username) {
            *count = count.saturating_sub(1);
        }
    }

    /// Re-arm or destroy the allocation.
    ///
    /// A zero lifetime removes the whole session before the response
    /// goes out; the response is still a success.
    pub fn refresh(&self, id: &Identifier, lifetime: u32) -> Result<u32, ErrorType> {
        if lifetime == 0 {
            {
                let sessions = self.sessions.read();
                let session = sessions.get(id).ok_or(ErrorType::AllocationMismatch)?;
                if session.allocation.is_none() {
                    return Err(ErrorType::AllocationMismatch);
                }
            }

            self.remove_sessions(&[*id]);
            return Ok(0);
        }

        let granted = self.grant_lifetime(Some(lifetime));
        let now = self.timer.get();

        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id).ok_or(ErrorType::AllocationMismatch)?;
        let allocation = session
            .allocation
            .as_mut()
            .ok_or(ErrorType::AllocationMismatch)?;

        allocation.expires = now + granted as u64;
        session.expires = now + granted as u64;

        Ok(granted)
    }

    /// Install or refresh permissions for the peer hosts. All-or-
    /// nothing validation happened in the processor; at this level the
    /// inserts always apply.
    pub fn add_permissions(&self, id: &Identifier, peers: &[IpAddr]) -> Result<(), ErrorType> {
        let now = self.timer.get();
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id).ok_or(ErrorType::AllocationMismatch)?;
        let allocation = session
            .allocation
            .as_mut()
            .ok_or(ErrorType::AllocationMismatch)?;

        for peer in peers {
            allocation.add_permission(*peer, now);
        }

        Ok(())
    }

    pub fn bind_channel(
        &self,
        id: &Identifier,
        number: u16,
        peer: SocketAddr,
    ) -> Result<(), ErrorType> {
        let now = self.timer.get();
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id).ok_or(ErrorType::AllocationMismatch)?;
        let allocation = session
            .allocation
            .as_mut()
            .ok_or(ErrorType::AllocationMismatch)?;

        // Channels belong to the UDP relay; an RFC 6062 allocation
        // exchanges data over its connections instead.
        if allocation.kind != RelayKind::Udp {
            return Err(ErrorType::BadRequest);
        }

        allocation.bind_channel(number, peer, now)
    }

    /// Where a Send indication goes: the local relay address to emit
    /// from, provided a permission covers the peer. `None` means the
    /// indication is silently dropped.
    pub fn send_target(&self, id: &Identifier, peer: &SocketAddr) -> Option<SocketAddr> {
        let sessions = self.sessions.read();
        let allocation = sessions.get(id)?.allocation.as_ref()?;

        if !allocation.is_valid
            || allocation.kind != RelayKind::Udp
            || !allocation.has_permission(&peer.ip())
        {
            return None;
        }

        Some(allocation.relay)
    }

    /// Where a ChannelData frame goes. `None` for an unbound number,
    /// and the frame is silently dropped.
    pub fn channel_target(&self, id: &Identifier, number: u16) -> Option<(SocketAddr, SocketAddr)> {
        let sessions = self.sessions.read();
        let allocation = sessions.get(id)?.allocation.as_ref()?;

        if !allocation.is_valid || allocation.kind != RelayKind::Udp {
            return None;
        }

        allocation
            .get_channel(number)
            .map(|it| (it.peer, allocation.relay))
    }

    /// Routing for a datagram a peer sent to a relay port. `None` drops
    /// it: no session, invalid allocation, or no permission for the
    /// source host.
    pub fn peer_to_client(&self, relay_port: u16, peer: &SocketAddr) -> Option<PeerInbound> {
        let id = *self.port_mapping.read().get(&relay_port)?;

        let sessions = self.sessions.read();
        let allocation = sessions.get(&id)?.allocation.as_ref()?;
        if !allocation.is_valid || !allocation.has_permission(&peer.ip()) {
            return None;
        }

        Some(PeerInbound {
            id,
            channel: allocation.channel_by_peer(peer),
        })
    }

    /// The per-session token bucket: `max_bps` bytes per one-second
    /// window, input and output combined, drop-on-exceed.
    pub fn consume_bandwidth(&self, id: &Identifier, bytes: usize) -> bool {
        if self.config.max_bps == 0 {
            return true;
        }

        let now = self.timer.get();
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };

        if session.counters.rate_window != now {
            session.counters.rate_window = now;
            session.counters.rate_used = 0;
        }

        if session.counters.rate_used + bytes > self.config.max_bps {
            return false;
        }

        session.counters.rate_used += bytes;
        true
    }

    pub fn report_received(&self, id: &Identifier, bytes: usize) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.counters.received_packets += 1;
            session.counters.received_bytes += bytes as u64;
        }
    }

    pub fn report_sent(&self, id: &Identifier, bytes: usize) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.counters.sent_packets += 1;
            session.counters.sent_bytes += bytes as u64;
        }
    }

    pub fn counters(&self, id: &Identifier) -> Option<Counters> {
        self.sessions.read().get(id).map(|it| it.counters.clone())
    }

    /// Create a connection record for a client-initiated Connect.
    pub fn tcp_connect(
        &self,
        id: &Identifier,
        server_id: u8,
        peer: SocketAddr,
        transaction: [u8; 12],
    ) -> Result<u32, ErrorType> {
        let now = self.timer.get();
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id).ok_or(ErrorType::AllocationMismatch)?;
        let allocation = session
            .allocation
            .as_mut()
            .ok_or(ErrorType::AllocationMismatch)?;

        if allocation.kind != RelayKind::Tcp {
            return Err(ErrorType::BadRequest);
        }

        if !self.config.flags.server_relay && !allocation.has_permission(&peer.ip()) {
            return Err(ErrorType::Forbidden);
        }

        let cid = allocation.create_tcp_connection(
            server_id,
            peer,
            transaction,
            TcpConnectionState::PeerConnecting,
            now,
        )?;

        self.tcp_index.write().insert(cid, *id);
        Ok(cid)
    }

    /// The peer leg of a Connect finished. Returns the transaction id
    /// of the originating request so the deferred response can be
    /// built; on failure the record is dropped.
    pub fn complete_tcp_connect(&self, id: &Identifier, cid: u32, ok: bool) -> Option<[u8; 12]> {
        let now = self.timer.get();
        let mut sessions = self.sessions.write();
        let allocation = sessions.get_mut(id)?.allocation.as_mut()?;

        if ok {
            let connection = allocation.get_tcp_connection_mut(cid)?;
            connection.state = TcpConnectionState::AwaitingBind;
            connection.deadline = now + TCP_TIMEOUT;

            Some(connection.transaction)
        } else {
            let connection = allocation.remove_tcp_connection(cid)?;
            self.tcp_index.write().remove(&cid);

            Some(connection.transaction)
        }
    }

    /// A peer connected to an RFC 6062 relay listener. Creates the
    /// half-open record awaiting the client's ConnectionBind and names
    /// the control session the ConnectionAttempt indication goes to.
    pub fn tcp_peer_attempt(
        &self,
        relay_port: u16,
        peer: SocketAddr,
        server_id: u8,
    ) -> Option<(u32, Identifier)> {
        let id = *self.port_mapping.read().get(&relay_port)?;
        let now = self.timer.get();

        let mut sessions = self.sessions.write();
        let allocation = sessions.get_mut(&id)?.allocation.as_mut()?;

        if allocation.kind != RelayKind::Tcp || !allocation.is_valid {
            return None;
        }

        if !self.config.flags.server_relay && !allocation.has_permission(&peer.ip()) {
            return None;
        }

        let cid = allocation
            .create_tcp_connection(server_id, peer, [0u8; 12], TcpConnectionState::AwaitingBind, now)
            .ok()?;

        self.tcp_index.write().insert(cid, id);
        Some((cid, id))
    }

    /// The client presented a ConnectionBind for a pending connection.
    /// Validates the pre-bind state and flips it to forwarding.
    pub fn tcp_connection_bind(&self, cid: u32) -> Result<(Identifier, SocketAddr), ErrorType> {
        let id = *self
            .tcp_index
            .read()
            .get(&cid)
            .ok_or(ErrorType::BadRequest)?;

        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id).ok_or(ErrorType::BadRequest)?;
        let allocation = session.allocation.as_mut().ok_or(ErrorType::BadRequest)?;
        let connection = allocation
            .get_tcp_connection_mut(cid)
            .ok_or(ErrorType::BadRequest)?;

        if connection.state != TcpConnectionState::AwaitingBind {
            return Err(ErrorType::BadRequest);
        }

        connection.state = TcpConnectionState::Bound;
        Ok((id, connection.peer))
    }

    /// Either leg of a bound connection closed; drop the record.
    pub fn tcp_connection_closed(&self, cid: u32) {
        let Some(id) = self.tcp_index.write().remove(&cid) else {
            return;
        };

        if let Some(session) = self.sessions.write().get_mut(&id) {
            if let Some(allocation) = session.allocation.as_mut() {
                allocation.remove_tcp_connection(cid);
            }
        }
    }

    /// Re-home a mobile session onto a new 5-tuple. Auth state, the
    /// allocation and every table entry move with it.
    pub fn mobility_rebind(&self, ticket: u64, new_id: Identifier) -> bool {
        let Some(old_id) = self.mobility.read().get(&ticket).copied() else {
            return false;
        };

        if old_id == new_id {
            return true;
        }

        let mut sessions = self.sessions.write();
        let Some(session) = sessions.remove(&old_id) else {
            return false;
        };

        self.index.write().insert(session.session_id, new_id);
        self.mobility.write().insert(ticket, new_id);

        if let Some(allocation) = session.allocation.as_ref() {
            self.port_mapping
                .write()
                .insert(allocation.relay.port(), new_id);

            let mut tcp_index = self.tcp_index.write();
            for (cid, _) in allocation.tcp_connections() {
                tcp_index.insert(*cid, new_id);
            }
        }

        sessions.insert(new_id, session);
        log::info!("session moved: ticket={}, addr={:?}", ticket, new_id.source);
        true
    }

    /// Remove sessions and release everything they own. The observer
    /// learns about each removal, with the relay address when one was
    /// allocated so the I/O layer can close the socket.
    pub fn remove_sessions(&self, ids: &[Identifier]) {
        let mut sessions = self.sessions.write();
        let mut index = self.index.write();
        let mut port_allocator = self.port_allocator.lock();
        let mut port_mapping = self.port_mapping.write();
        let mut tcp_index = self.tcp_index.write();
        let mut mobility = self.mobility.write();

        for id in ids {
            let Some(session) = sessions.remove(id) else {
                continue;
            };

            index.remove(&session.session_id);
            if let Some(ticket) = session.mobile_id {
                mobility.remove(&ticket);
            }

            let username = session
                .auth
                .as_ref()
                .map(|it| it.username.clone())
                .unwrap_or_default();

            let relay = session.allocation.as_ref().map(|it| it.relay);
            if let Some(allocation) = session.allocation {
                port_mapping.remove(&allocation.relay.port());
                port_allocator.restore(allocation.relay.port());
                self.total_allocations.fetch_sub(1, Ordering::Relaxed);

                let mut users = self.user_allocations.lock();
                if let Some(count) = users.get_mut(&username) {
                    *count -= 1;
                    if *count == 0 {
                        users.remove(&username);
                    }
                }

                for (cid, _) in allocation.tcp_connections() {
                    tcp_index.remove(cid);
                }
            }

            self.handler.on_destroy(id, &username, relay);
        }
    }

    fn grant_lifetime(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(it) => it.min(self.config.max_lifetime).max(DEFAULT_LIFETIME),
            None => DEFAULT_LIFETIME,
        }
    }
}
