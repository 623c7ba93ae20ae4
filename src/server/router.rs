use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use service::Identifier;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::server::Environment;

/// A fixed 32-bit mix. Client sessions are steered to workers by the
/// mixed source port, which keeps a 5-tuple on the same worker for its
/// whole life.
pub fn mix32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x85EB_CA6B);
    x ^= x >> 13;
    x = x.wrapping_mul(0xC2B2_AE35);
    x ^ (x >> 16)
}

/// The cross-thread handoff from a listener to a worker.
pub enum WorkerEvent {
    /// A datagram for the worker's session table, with the socket it
    /// arrived on for the answer.
    Datagram {
        socket: Arc<UdpSocket>,
        interface: SocketAddr,
        source: SocketAddr,
        data: Vec<u8>,
    },
    /// A freshly accepted stream socket, ownership moves to the worker.
    Socket {
        stream: TcpStream,
        interface: SocketAddr,
        source: SocketAddr,
    },
}

/// How to reach a client: the listener socket plus address for UDP, the
/// write half of the connection task for stream transports.
pub enum Sink {
    Udp {
        socket: Arc<UdpSocket>,
        addr: SocketAddr,
    },
    Tcp {
        sender: mpsc::Sender<Vec<u8>>,
    },
}

/// The RFC 5780 counterpart endpoints of a listener: where a
/// CHANGE-REQUEST answer may come from instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct Alternates {
    pub other_ip: Option<IpAddr>,
    pub other_port: Option<u16>,
}

/// Listener-to-worker routing and the client sink table.
pub struct Router {
    workers: OnceLock<Vec<mpsc::Sender<WorkerEvent>>>,
    worker_count: usize,
    sinks: RwLock<HashMap<Identifier, Sink>>,
    endpoints: RwLock<HashMap<SocketAddr, Arc<UdpSocket>>>,
    alternates: RwLock<HashMap<SocketAddr, Alternates>>,
}

impl Router {
    pub fn new(worker_count: usize) -> Self {
        Self {
            workers: OnceLock::new(),
            sinks: RwLock::new(HashMap::with_capacity(1024)),
            endpoints: RwLock::new(HashMap::with_capacity(8)),
            alternates: RwLock::new(HashMap::with_capacity(8)),
            worker_count,
        }
    }

    pub fn set_workers(&self, workers: Vec<mpsc::Sender<WorkerEvent>>) {
        let _ = self.workers.set(workers);
    }

    /// Which worker a client belongs to. Sticky by construction: the
    /// mix depends on nothing but the source port.
    pub fn worker_for(&self, source_port: u16) -> usize {
        if self.worker_count == 0 {
            return 0;
        }

        mix32(source_port as u32) as usize % self.worker_count
    }

    pub async fn dispatch(&self, source_port: u16, event: WorkerEvent) {
        let Some(workers) = self.workers.get() else {
            return;
        };

        let index = self.worker_for(source_port);
        if workers[index].send(event).await.is_err() {
            log::error!("worker queue closed: index={}", index);
        }
    }

    /// A UDP listener socket, registered at startup with its RFC 5780
    /// counterparts.
    pub fn register_endpoint(
        &self,
        interface: SocketAddr,
        socket: Arc<UdpSocket>,
        alternates: Alternates,
    ) {
        self.endpoints.write().insert(interface, socket);
        self.alternates.write().insert(interface, alternates);
    }

    pub fn alternates_of(&self, interface: &SocketAddr) -> Alternates {
        self.alternates
            .read()
            .get(interface)
            .copied()
            .unwrap_or_default()
    }

    /// The socket a CHANGE-REQUEST answer leaves from, given the
    /// endpoint the request arrived on.
    pub fn change_endpoint(
        &self,
        interface: &SocketAddr,
        change_ip: bool,
        change_port: bool,
    ) -> Option<Arc<UdpSocket>> {
        let alternates = self.alternates_of(interface);

        let ip = if change_ip {
            alternates.other_ip?
        } else {
            interface.ip()
        };

        let port = if change_port {
            alternates.other_port?
        } else {
            interface.port()
        };

        self.endpoints.read().get(&SocketAddr::new(ip, port)).cloned()
    }

    pub fn ensure_udp_sink(&self, id: Identifier, socket: &Arc<UdpSocket>) {
        {
            if self.sinks.read().contains_key(&id) {
                return;
            }
        }

        self.sinks.write().insert(
            id,
            Sink::Udp {
                socket: socket.clone(),
                addr: id.source,
            },
        );
    }

    pub fn register_tcp_sink(&self, id: Identifier, sender: mpsc::Sender<Vec<u8>>) {
        self.sinks.write().insert(id, Sink::Tcp { sender });
    }

    pub fn remove_sink(&self, id: &Identifier) {
        self.sinks.write().remove(id);
    }

    /// Deliver server-originated bytes to a client: data indications,
    /// channel frames, deferred connect responses, connection attempt
    /// indications.
    pub async fn send_to_client(&self, id: &Identifier, bytes: &[u8]) -> bool {
        enum Route {
            Udp(Arc<UdpSocket>, SocketAddr),
            Tcp(mpsc::Sender<Vec<u8>>),
        }

        let route = {
            match self.sinks.read().get(id) {
                Some(Sink::Udp { socket, addr }) => Route::Udp(socket.clone(), *addr),
                Some(Sink::Tcp { sender }) => Route::Tcp(sender.clone()),
                None => return false,
            }
        };

        match route {
            Route::Udp(socket, addr) => socket.send_to(bytes, addr).await.is_ok(),
            Route::Tcp(sender) => sender.send(bytes.to_vec()).await.is_ok(),
        }
    }
}

/// One relay worker: an event loop owning the UDP processors of the
/// sessions steered to it. Stream sockets arrive whole by handoff and
/// run as tasks seeded with this worker's id.
pub async fn worker_loop(
    index: u8,
    mut queue: mpsc::Receiver<WorkerEvent>,
    env: Arc<Environment>,
    barrier: Arc<tokio::sync::Barrier>,
) {
    let mut processors = HashMap::with_capacity(8);

    // The rendezvous: dispatch starts only after every worker built its
    // tables.
    barrier.wait().await;

    while let Some(event) = queue.recv().await {
        match event {
            WorkerEvent::Datagram {
                socket,
                interface,
                source,
                data,
            } => {
                let processor = processors
                    .entry(interface)
                    .or_insert_with(|| crate::server::udp::make_processor(&env, index, interface));

                crate::server::udp::handle(processor, &env, &socket, interface, &data, source)
                    .await;
            }
            WorkerEvent::Socket {
                stream,
                interface,
                source,
            } => {
                log::info!(
                    "tcp socket handoff: addr={:?}, interface={:?}, worker={}",
                    source,
                    interface,
                    index
                );

                tokio::spawn(crate::server::tcp::handle(
                    env.clone(),
                    index,
                    stream,
                    interface,
                    source,
                    service::Transport::Tcp,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steering_is_sticky_and_bounded() {
        let router = Router::new(4);

        for port in [1u16, 3478, 51678, 65535] {
            let a = router.worker_for(port);
            let b = router.worker_for(port);

            assert_eq!(a, b);
            assert!(a < 4);
        }
    }

    #[test]
    fn mix32_spreads_adjacent_ports() {
        // Adjacent source ports should not collapse onto one worker.
        let workers: Vec<u32> = (50000u32..50016).map(|p| mix32(p) % 8).collect();
        let first = workers[0];

        assert!(workers.iter().any(|w| *w != first));
    }
}
