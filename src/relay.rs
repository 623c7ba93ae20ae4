use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use bytes::BytesMut;
use codec::{
    channel_data::ChannelData,
    message::{
        MessageEncoder,
        attributes::{Data, XorPeerAddress},
        methods::DATA_INDICATION,
    },
};
use parking_lot::Mutex;
use rand::Rng;
use service::{Identifier, RelayKind, Service, session::allocation::TCP_TIMEOUT};
use tokio::{
    net::{TcpSocket, TcpStream, UdpSocket},
    task::JoinHandle,
    time::timeout,
};

use crate::{observer::ServerObserver, server::Router, statistics::Statistics};

struct UdpRelay {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

/// The sockets behind allocations.
///
/// The session manager accounts for relay endpoints; this registry owns
/// them: the per-allocation UDP socket and its read task, the RFC 6062
/// relay listeners, the half-open peer connections waiting for a
/// ConnectionBind, and the outgoing peer connect attempts.
pub struct RelayRegistry {
    router: Arc<Router>,
    statistics: Statistics,
    // Set right after the service is built; the cycle between the
    // observer and this registry leaves no better seam.
    service: OnceLock<Service<ServerObserver>>,
    udp: Mutex<HashMap<u16, UdpRelay>>,
    listeners: Mutex<HashMap<u16, JoinHandle<()>>>,
    pending: Mutex<HashMap<u32, TcpStream>>,
}

impl RelayRegistry {
    pub fn new(router: Arc<Router>, statistics: Statistics) -> Arc<Self> {
        Arc::new(Self {
            udp: Mutex::new(HashMap::with_capacity(1024)),
            listeners: Mutex::new(HashMap::with_capacity(64)),
            pending: Mutex::new(HashMap::with_capacity(64)),
            service: OnceLock::new(),
            statistics,
            router,
        })
    }

    pub fn set_service(&self, service: Service<ServerObserver>) {
        let _ = self.service.set(service);
    }

    /// Bring up the relay endpoint for a fresh allocation. A failure to
    /// bind turns into a 508 for the client.
    pub async fn open(self: &Arc<Self>, relay: SocketAddr, kind: RelayKind) -> bool {
        match kind {
            RelayKind::Udp => {
                let socket = match UdpSocket::bind(relay).await {
                    Ok(it) => Arc::new(it),
                    Err(e) => {
                        log::warn!("relay socket bind failed: addr={:?}, {}", relay, e);
                        return false;
                    }
                };

                let task = tokio::spawn(udp_relay_loop(
                    self.clone(),
                    relay.port(),
                    socket.clone(),
                ));

                self.udp.lock().insert(relay.port(), UdpRelay { socket, task });
                true
            }
            RelayKind::Tcp => {
                // The listener and later outgoing Connect attempts share
                // the relay address, so both sides set reuseaddr.
                let listener = match bound_socket(relay)
                    .and_then(|socket| socket.listen(64))
                {
                    Ok(it) => it,
                    Err(e) => {
                        log::warn!("relay listener bind failed: addr={:?}, {}", relay, e);
                        return false;
                    }
                };

                let task = tokio::spawn(tcp_relay_loop(self.clone(), relay.port(), listener));
                self.listeners.lock().insert(relay.port(), task);
                true
            }
        }
    }

    /// The allocation is gone; close its socket and stop its tasks.
    pub fn close(&self, relay: &SocketAddr) {
        if let Some(entry) = self.udp.lock().remove(&relay.port()) {
            entry.task.abort();
        }

        if let Some(task) = self.listeners.lock().remove(&relay.port()) {
            task.abort();
        }
    }

    /// Client-to-peer emission for Send indications and channel data.
    pub async fn send_to_peer(&self, relay: SocketAddr, peer: SocketAddr, bytes: &[u8]) -> bool {
        let socket = {
            match self.udp.lock().get(&relay.port()) {
                Some(it) => it.socket.clone(),
                None => return false,
            }
        };

        match socket.send_to(bytes, peer).await {
            Ok(_) => {
                self.statistics.report_sent(bytes.len());
                true
            }
            Err(e) => {
                log::trace!("relay send failed: peer={:?}, {}", peer, e);
                false
            }
        }
    }

    /// The peer leg of a client Connect. The deferred response goes out
    /// when the attempt settles, inside the 30 second budget.
    pub fn connect(self: &Arc<Self>, id: Identifier, connection: u32, peer: SocketAddr, relay: SocketAddr) {
        let this = self.clone();

        tokio::spawn(async move {
            let stream = match bound_socket(relay) {
                Ok(socket) => match timeout(Duration::from_secs(TCP_TIMEOUT), socket.connect(peer)).await {
                    Ok(Ok(stream)) => Some(stream),
                    Ok(Err(e)) => {
                        log::info!("peer connect failed: peer={:?}, {}", peer, e);
                        None
                    }
                    Err(_) => {
                        log::info!("peer connect timeout: peer={:?}", peer);
                        None
                    }
                },
                Err(e) => {
                    log::warn!("peer connect socket failed: relay={:?}, {}", relay, e);
                    None
                }
            };

            let Some(service) = this.service.get() else {
                return;
            };

            let ok = stream.is_some();
            let mut bytes = BytesMut::with_capacity(256);
            if service.connect_response(&id, connection, ok, &mut bytes).is_some() {
                this.router.send_to_client(&id, &bytes).await;
            }

            if let Some(stream) = stream {
                this.store_pending(connection, stream);
            }
        });
    }

    /// Hold a peer-side stream until the client's ConnectionBind claims
    /// it, or the bind timeout throws it away.
    fn store_pending(self: &Arc<Self>, connection: u32, stream: TcpStream) {
        self.pending.lock().insert(connection, stream);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(TCP_TIMEOUT)).await;
            if this.pending.lock().remove(&connection).is_some() {
                log::info!("connection bind timeout: connection={}", connection);
            }
        });
    }

    pub fn take_peer(&self, connection: u32) -> Option<TcpStream> {
        self.pending.lock().remove(&connection)
    }
}

fn bound_socket(relay: SocketAddr) -> std::io::Result<TcpSocket> {
    let socket = if relay.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    socket.set_reuseaddr(true)?;
    socket.bind(relay)?;
    Ok(socket)
}

/// The peer-to-client path of one UDP allocation.
///
/// Reads from the relay socket, asks the session manager for the
/// framing decision, and emits either a ChannelData frame or a Data
/// indication on the client's transport. Everything without a
/// permission is dropped on the floor.
async fn udp_relay_loop(registry: Arc<RelayRegistry>, port: u16, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 4096];
    let mut out = BytesMut::with_capacity(4096);

    loop {
        let (size, peer) = match socket.recv_from(&mut buf).await {
            Ok(it) => it,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::ConnectionReset {
                    continue;
                }

                log::warn!("relay socket receive error: {:?}", e);
                return;
            }
        };

        let Some(service) = registry.service.get() else {
            continue;
        };

        let manager = service.get_session_manager();
        registry.statistics.report_received(size);

        let Some(inbound) = manager.peer_to_client(port, &peer) else {
            registry.statistics.report_dropped();
            continue;
        };

        if !manager.consume_bandwidth(&inbound.id, size) {
            registry.statistics.report_dropped();
            continue;
        }

        match inbound.channel {
            Some(number) => {
                ChannelData {
                    bytes: &buf[..size],
                    number,
                }
                .encode(&mut out, inbound.id.transport.is_stream());
            }
            None => {
                let mut transaction = [0u8; 12];
                rand::rng().fill(&mut transaction);

                let mut message = MessageEncoder::new(DATA_INDICATION, &transaction, &mut out);
                message.append::<XorPeerAddress>(peer);
                message.append::<Data>(&buf[..size]);
                if message.flush(None).is_err() {
                    continue;
                }
            }
        }

        if registry.router.send_to_client(&inbound.id, &out).await {
            manager.report_sent(&inbound.id, out.len());
            registry.statistics.report_sent(out.len());

            log::trace!(
                "relay to client: peer={:?}, addr={:?}, size={}",
                peer,
                inbound.id.source,
                size
            );
        }
    }
}

/// The accept side of an RFC 6062 allocation: every peer connection
/// becomes a half-open record and a ConnectionAttempt indication on the
/// control session, then waits for the matching ConnectionBind.
async fn tcp_relay_loop(registry: Arc<RelayRegistry>, port: u16, listener: tokio::net::TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(it) => it,
            Err(e) => {
                log::warn!("relay listener accept error: {:?}", e);
                return;
            }
        };

        let Some(service) = registry.service.get() else {
            continue;
        };

        let manager = service.get_session_manager();
        let Some(owner) = manager.owner_of_port(port) else {
            continue;
        };

        // The connection id carries the owning worker in its high byte.
        let server_id = registry.router.worker_for(owner.source.port()) as u8;
        let Some((connection, owner)) = manager.tcp_peer_attempt(port, peer, server_id) else {
            log::trace!("peer connection refused: peer={:?}, port={}", peer, port);
            continue;
        };

        let mut bytes = BytesMut::with_capacity(256);
        if service.connection_attempt(connection, peer, &mut bytes).is_some() {
            registry.router.send_to_client(&owner, &bytes).await;
        }

        log::info!(
            "peer connection attempt: peer={:?}, connection={}",
            peer,
            connection
        );

        registry.store_pending(connection, stream);
    }
}
