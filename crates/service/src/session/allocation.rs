use std::net::{IpAddr, SocketAddr};

use ahash::{HashMap, HashMapExt};
use codec::message::attributes::ErrorType;

use crate::RelayKind;

/// Permissions are refreshed to 5 minutes, channels to 10; the two run
/// independently, but refreshing a channel refreshes its permission.
pub const PERMISSION_LIFETIME: u64 = 300;
pub const CHANNEL_LIFETIME: u64 = 600;

/// Both the peer connect attempt and the client's ConnectionBind get
/// 30 seconds before the connection record is dropped.
pub const TCP_TIMEOUT: u64 = 30;

/// An authorisation for a peer host to reach the relay.
///
/// A permission is keyed by the peer IP only; one permission governs
/// any port on that host. It owns the channels bound towards that
/// host, keyed by the peer port.
#[derive(Debug)]
pub struct Permission {
    pub expires: u64,
    /// peer port to channel number, the channels living under this
    /// permission.
    pub channels: HashMap<u16, u16>,
}

/// A channel binding: a short-header shorthand for a peer address.
///
/// Within the context of an allocation, a channel binding is uniquely
/// identified either by the channel number or by the peer's transport
/// address.  Thus, the same channel cannot be bound to two different
/// transport addresses, nor can the same transport address be bound to
/// two different channels.
#[derive(Debug)]
pub struct Channel {
    pub peer: SocketAddr,
    pub expires: u64,
}

/// The life of an RFC 6062 peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpConnectionState {
    /// The server is connecting towards the peer (client-initiated
    /// Connect).
    PeerConnecting,
    /// The peer leg is up; the client has not presented its
    /// ConnectionBind yet.
    AwaitingBind,
    /// Both legs are up, bytes stream freely.
    Bound,
}

/// An RFC 6062 peer connection record.
///
/// The sockets themselves live with the I/O layer; the record tracks
/// identity, state and deadlines. The id is 32 bits: the high 8
/// identify the owning worker, the low 24 are a non-zero random value
/// unique within that worker's table.
#[derive(Debug)]
pub struct TcpConnection {
    pub peer: SocketAddr,
    pub state: TcpConnectionState,
    /// transaction id of the originating Connect request, for the
    /// deferred response.
    pub transaction: [u8; 12],
    pub deadline: u64,
}

/// A server-side relay endpoint created for a client.
///
/// Exactly one per session. Created invalid, validated once the relay
/// socket is up, invalid again on refresh-to-zero or expiry.
#[derive(Debug)]
pub struct Allocation {
    pub kind: RelayKind,
    /// The local relay transport address the socket is bound on.
    pub relay: SocketAddr,
    pub expires: u64,
    pub is_valid: bool,
    /// The reservation token issued alongside this allocation, if
    /// EVEN-PORT requested one.
    pub reservation: Option<u64>,
    permissions: HashMap<IpAddr, Permission>,
    channels: HashMap<u16, Channel>,
    connections: HashMap<u32, TcpConnection>,
}

impl Allocation {
    pub fn new(kind: RelayKind, relay: SocketAddr, expires: u64) -> Self {
        Self {
            kind,
            relay,
            expires,
            is_valid: false,
            reservation: None,
            permissions: HashMap::with_capacity(8),
            channels: HashMap::with_capacity(8),
            connections: HashMap::with_capacity(4),
        }
    }

    /// Install or refresh the permission for a peer host. Idempotent.
    pub fn add_permission(&mut self, peer: IpAddr, now: u64) {
        self.permissions
            .entry(peer)
            .or_insert_with(|| Permission {
                expires: 0,
                channels: HashMap::with_capacity(4),
            })
            .expires = now + PERMISSION_LIFETIME;
    }

    pub fn get_permission(&self, peer: &IpAddr) -> Option<&Permission> {
        self.permissions.get(peer)
    }

    pub fn has_permission(&self, peer: &IpAddr) -> bool {
        self.permissions.contains_key(peer)
    }

    /// Bind or refresh a channel.
    ///
    /// The number must sit in the valid range, and neither the number
    /// nor the peer address may already be bound to a different
    /// counterpart. A bind to the existing pair refreshes both the
    /// channel and the underlying permission.
    pub fn bind_channel(&mut self, number: u16, peer: SocketAddr, now: u64) -> Result<(), ErrorType> {
        if !(0x4000..=0x7FFF).contains(&number) {
            return Err(ErrorType::BadRequest);
        }

        if let Some(channel) = self.channels.get(&number) {
            if channel.peer != peer {
                return Err(ErrorType::BadRequest);
            }
        } else if self
            .permissions
            .get(&peer.ip())
            .is_some_and(|it| it.channels.contains_key(&peer.port()))
        {
            // The peer address is already carried by a different
            // number.
            return Err(ErrorType::BadRequest);
        }

        self.add_permission(peer.ip(), now);
        if let Some(permission) = self.permissions.get_mut(&peer.ip()) {
            permission.channels.insert(peer.port(), number);
        }

        self.channels.insert(
            number,
            Channel {
                peer,
                expires: now + CHANNEL_LIFETIME,
            },
        );

        Ok(())
    }

    pub fn get_channel(&self, number: u16) -> Option<&Channel> {
        self.channels.get(&number)
    }

    /// The channel number bound towards this exact peer address, if
    /// any. Decides the peer-to-client framing.
    pub fn channel_by_peer(&self, peer: &SocketAddr) -> Option<u16> {
        self.permissions
            .get(&peer.ip())?
            .channels
            .get(&peer.port())
            .copied()
    }

    /// Create a connection record for a client-initiated Connect.
    ///
    /// `server_id` becomes the high byte of the connection id. A second
    /// connection towards the same peer is refused with 446.
    pub fn create_tcp_connection(
        &mut self,
        server_id: u8,
        peer: SocketAddr,
        transaction: [u8; 12],
        state: TcpConnectionState,
        now: u64,
    ) -> Result<u32, ErrorType> {
        if self.connections.values().any(|it| it.peer == peer) {
            return Err(ErrorType::ConnectionAlreadyExists);
        }

        let mut id;
        loop {
            id = rand::random::<u32>() & 0x00FF_FFFF;
            if id == 0 {
                continue;
            }

            id |= (server_id as u32) << 24;
            if !self.connections.contains_key(&id) {
                break;
            }
        }

        self.connections.insert(
            id,
            TcpConnection {
                peer,
                state,
                transaction,
                deadline: now + TCP_TIMEOUT,
            },
        );

        Ok(id)
    }

    pub fn get_tcp_connection(&self, id: u32) -> Option<&TcpConnection> {
        self.connections.get(&id)
    }

    pub fn get_tcp_connection_mut(&mut self, id: u32) -> Option<&mut TcpConnection> {
        self.connections.get_mut(&id)
    }

    pub fn remove_tcp_connection(&mut self, id: u32) -> Option<TcpConnection> {
        self.connections.remove(&id)
    }

    pub fn tcp_connections(&self) -> impl Iterator<Item = (&u32, &TcpConnection)> {
        self.connections.iter()
    }

    /// Drop expired permissions, channels and connection records.
    ///
    /// A channel past its own lifetime goes alone; a permission past
    /// its lifetime takes all of its channels with it.
    pub fn sweep(&mut self, now: u64) {
        self.channels.retain(|number, channel| {
            if channel.expires > now {
                return true;
            }

            if let Some(permission) = self.permissions.get_mut(&channel.peer.ip()) {
                permission.channels.remove(&channel.peer.port());
            }

            log::trace!("channel expired: number={}", number);
            false
        });

        let channels = &mut self.channels;
        self.permissions.retain(|ip, permission| {
            if permission.expires > now {
                return true;
            }

            for number in permission.channels.values() {
                channels.remove(number);
            }

            log::trace!("permission expired: peer={}", ip);
            false
        });

        self.connections
            .retain(|_, it| it.state == TcpConnectionState::Bound || it.deadline > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1000;

    fn allocation() -> Allocation {
        Allocation::new(RelayKind::Udp, "127.0.0.1:49152".parse().unwrap(), NOW + 600)
    }

    #[test]
    fn permission_is_port_insensitive() {
        let mut alloc = allocation();

        alloc.add_permission("10.0.0.5".parse().unwrap(), NOW);

        assert!(alloc.has_permission(&"10.0.0.5".parse().unwrap()));
        assert!(!alloc.has_permission(&"10.0.0.6".parse().unwrap()));
    }

    #[test]
    fn add_permission_is_idempotent() {
        let mut alloc = allocation();
        let peer: IpAddr = "10.0.0.5".parse().unwrap();

        alloc.add_permission(peer, NOW);
        let first = alloc.get_permission(&peer).unwrap().expires;

        alloc.add_permission(peer, NOW + 10);
        let second = alloc.get_permission(&peer).unwrap().expires;

        assert_eq!(first, NOW + PERMISSION_LIFETIME);
        assert_eq!(second, NOW + 10 + PERMISSION_LIFETIME);
    }

    #[test]
    fn channel_number_range() {
        let mut alloc = allocation();
        let peer: SocketAddr = "10.0.0.5:9999".parse().unwrap();

        assert_eq!(alloc.bind_channel(0x3FFF, peer, NOW), Err(ErrorType::BadRequest));
        assert_eq!(alloc.bind_channel(0x8000, peer, NOW), Err(ErrorType::BadRequest));
        assert_eq!(alloc.bind_channel(0x4000, peer, NOW), Ok(()));
        assert_eq!(alloc.bind_channel(0x7FFF, "10.0.0.5:9998".parse().unwrap(), NOW), Ok(()));
    }

    #[test]
    fn channel_bindings_are_exclusive() {
        let mut alloc = allocation();
        let peer: SocketAddr = "10.0.0.5:9999".parse().unwrap();
        let other: SocketAddr = "10.0.0.5:9998".parse().unwrap();

        alloc.bind_channel(0x4001, peer, NOW).unwrap();

        // Same number, different peer.
        assert_eq!(alloc.bind_channel(0x4001, other, NOW), Err(ErrorType::BadRequest));
        // Same peer, different number.
        assert_eq!(alloc.bind_channel(0x4002, peer, NOW), Err(ErrorType::BadRequest));
        // The identical pair refreshes.
        assert_eq!(alloc.bind_channel(0x4001, peer, NOW + 10), Ok(()));

        assert_eq!(alloc.get_channel(0x4001).unwrap().expires, NOW + 10 + CHANNEL_LIFETIME);
        assert_eq!(alloc.channel_by_peer(&peer), Some(0x4001));
        assert_eq!(alloc.channel_by_peer(&other), None);
    }

    #[test]
    fn channel_refreshes_permission() {
        let mut alloc = allocation();
        let peer: SocketAddr = "10.0.0.5:9999".parse().unwrap();

        alloc.add_permission(peer.ip(), NOW);
        alloc.bind_channel(0x4001, peer, NOW + 100).unwrap();

        assert_eq!(
            alloc.get_permission(&peer.ip()).unwrap().expires,
            NOW + 100 + PERMISSION_LIFETIME
        );
    }

    #[test]
    fn expired_permission_takes_channels_with_it() {
        let mut alloc = allocation();
        let peer: SocketAddr = "10.0.0.5:9999".parse().unwrap();

        alloc.bind_channel(0x4001, peer, NOW).unwrap();

        // The channel outlives the permission; once the permission is
        // gone the channel must be too.
        alloc.sweep(NOW + PERMISSION_LIFETIME + 1);

        assert!(!alloc.has_permission(&peer.ip()));
        assert!(alloc.get_channel(0x4001).is_none());
        assert_eq!(alloc.channel_by_peer(&peer), None);
    }

    #[test]
    fn expired_channel_unbinds_peer() {
        let mut alloc = allocation();
        let peer: SocketAddr = "10.0.0.5:9999".parse().unwrap();

        alloc.bind_channel(0x4001, peer, NOW).unwrap();
        // Keep the permission alive past the channel expiry.
        alloc.add_permission(peer.ip(), NOW + CHANNEL_LIFETIME);

        alloc.sweep(NOW + CHANNEL_LIFETIME + 1);

        assert!(alloc.has_permission(&peer.ip()));
        assert!(alloc.get_channel(0x4001).is_none());
        assert_eq!(alloc.channel_by_peer(&peer), None);

        // The number and the address are both free again.
        assert_eq!(
            alloc.bind_channel(0x4001, "10.0.0.5:9998".parse().unwrap(), NOW + CHANNEL_LIFETIME),
            Ok(())
        );
    }

    #[test]
    fn tcp_connection_ids_carry_the_server_id() {
        let mut alloc = allocation();

        for (i, port) in [9999u16, 9998, 9997].iter().enumerate() {
            let peer: SocketAddr = format!("10.0.0.5:{}", port).parse().unwrap();
            let id = alloc
                .create_tcp_connection(7, peer, [0u8; 12], TcpConnectionState::PeerConnecting, NOW)
                .unwrap();

            assert_eq!(id >> 24, 7);
            assert_ne!(id & 0x00FF_FFFF, 0);
            assert_eq!(alloc.tcp_connections().count(), i + 1);
        }
    }

    #[test]
    fn duplicate_peer_connection_is_refused() {
        let mut alloc = allocation();
        let peer: SocketAddr = "10.0.0.5:9999".parse().unwrap();

        alloc
            .create_tcp_connection(0, peer, [0u8; 12], TcpConnectionState::PeerConnecting, NOW)
            .unwrap();

        assert_eq!(
            alloc.create_tcp_connection(0, peer, [0u8; 12], TcpConnectionState::PeerConnecting, NOW),
            Err(ErrorType::ConnectionAlreadyExists)
        );
    }

    #[test]
    fn unbound_connections_time_out() {
        let mut alloc = allocation();
        let peer: SocketAddr = "10.0.0.5:9999".parse().unwrap();
        let bound: SocketAddr = "10.0.0.6:9999".parse().unwrap();

        let pending = alloc
            .create_tcp_connection(0, peer, [0u8; 12], TcpConnectionState::AwaitingBind, NOW)
            .unwrap();
        let live = alloc
            .create_tcp_connection(0, bound, [0u8; 12], TcpConnectionState::AwaitingBind, NOW)
            .unwrap();
        alloc.get_tcp_connection_mut(live).unwrap().state = TcpConnectionState::Bound;

        alloc.sweep(NOW + TCP_TIMEOUT + 1);

        assert!(alloc.get_tcp_connection(pending).is_none());
        assert!(alloc.get_tcp_connection(live).is_some());
    }
}
