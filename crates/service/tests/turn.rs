use std::net::SocketAddr;

use bytes::BytesMut;
use turn_relay_service::{
    Credential, Identifier, Observer, Service, ServiceConfig, ServiceOptions, Transport,
    auth::Credentials,
    processor::{Output, Processor, Response},
};

use codec::{
    Attributes,
    channel_data::ChannelData,
    crypto::{Password, PasswordAlgorithm, generate_password},
    message::{Message, MessageEncoder, attributes::*, methods::*},
};

const TOKEN: [u8; 12] = [
    0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31, 0x64, 0x4f, 0x5a, 0x78,
];

#[derive(Default, Clone)]
struct AuthHandler;

impl AuthHandler {
    const fn username() -> &'static str {
        "alice"
    }

    const fn password() -> &'static str {
        "secret"
    }

    const fn realm() -> &'static str {
        "example.org"
    }

    fn key() -> Password {
        generate_password(
            Self::username(),
            Self::password(),
            Self::realm(),
            PasswordAlgorithm::Md5,
        )
    }
}

#[async_trait::async_trait]
impl Observer for AuthHandler {
    async fn get_credential(&self, username: &str) -> Option<Credential> {
        (username == Self::username()).then(|| Credential::Password(Self::password().to_string()))
    }
}

fn interface() -> SocketAddr {
    "127.0.0.1:3478".parse().unwrap()
}

fn client() -> SocketAddr {
    "127.0.0.1:51678".parse().unwrap()
}

fn service(config: ServiceConfig) -> Service<AuthHandler> {
    Service::new(ServiceOptions {
        handler: AuthHandler,
        config,
    })
}

fn long_term_config() -> ServiceConfig {
    ServiceConfig {
        realm: AuthHandler::realm().to_string(),
        credentials: Credentials::LongTerm,
        ..ServiceConfig::default()
    }
}

fn processor(service: &Service<AuthHandler>) -> Processor<AuthHandler> {
    service.get_processor(0, interface(), Transport::Udp)
}

/// Run the 401 challenge dance and bring back the issued nonce.
async fn challenge(processor: &mut Processor<AuthHandler>, addr: SocketAddr) -> String {
    let mut buf = BytesMut::with_capacity(1280);

    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut buf);
        message.append::<RequestedTransport>(TRANSPORT_UDP);
        message.flush(None).unwrap();
    }

    let output = processor.route(&buf, addr).await.unwrap().unwrap();
    let Output::Response(Response { method, bytes, .. }) = output else {
        panic!("expected a response");
    };

    assert_eq!(method, ALLOCATE_ERROR);

    let mut attributes = Attributes::default();
    let message = Message::decode(bytes, &mut attributes).unwrap();

    assert_eq!(
        message.get::<ErrorCode>().unwrap().code,
        ErrorType::Unauthorized as u16
    );
    assert_eq!(message.get::<Realm>(), Some(AuthHandler::realm()));

    message.get::<Nonce>().unwrap().to_string()
}

/// A signed Allocate for the UDP relay.
async fn allocate(
    processor: &mut Processor<AuthHandler>,
    addr: SocketAddr,
    nonce: &str,
) -> SocketAddr {
    let mut buf = BytesMut::with_capacity(1280);

    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut buf);
        message.append::<RequestedTransport>(TRANSPORT_UDP);
        message.append::<UserName>(AuthHandler::username());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(nonce);
        message.flush(Some(&AuthHandler::key())).unwrap();
    }

    let output = processor.route(&buf, addr).await.unwrap().unwrap();
    let Output::Response(Response { method, bytes, .. }) = output else {
        panic!("expected a response");
    };

    assert_eq!(method, ALLOCATE_RESPONSE);

    let mut attributes = Attributes::default();
    let message = Message::decode(bytes, &mut attributes).unwrap();

    message.checksum(&AuthHandler::key()).unwrap();
    assert_eq!(message.get::<XorMappedAddress>(), Some(addr));
    assert_eq!(message.get::<Lifetime>(), Some(600));

    let relayed = message.get::<XorRelayedAddress>().unwrap();
    assert!((49152..=65535).contains(&relayed.port()));

    relayed
}

async fn create_permission(
    processor: &mut Processor<AuthHandler>,
    addr: SocketAddr,
    nonce: &str,
    peer: SocketAddr,
) {
    let mut buf = BytesMut::with_capacity(1280);

    {
        let mut message = MessageEncoder::new(CREATE_PERMISSION_REQUEST, &TOKEN, &mut buf);
        message.append::<XorPeerAddress>(peer);
        message.append::<UserName>(AuthHandler::username());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(nonce);
        message.flush(Some(&AuthHandler::key())).unwrap();
    }

    let output = processor.route(&buf, addr).await.unwrap().unwrap();
    let Output::Response(Response { method, .. }) = output else {
        panic!("expected a response");
    };

    assert_eq!(method, CREATE_PERMISSION_RESPONSE);
}

async fn channel_bind(
    processor: &mut Processor<AuthHandler>,
    addr: SocketAddr,
    nonce: &str,
    number: u16,
    peer: SocketAddr,
) -> Method {
    let mut buf = BytesMut::with_capacity(1280);

    {
        let mut message = MessageEncoder::new(CHANNEL_BIND_REQUEST, &TOKEN, &mut buf);
        message.append::<ChannelNumber>(number);
        message.append::<XorPeerAddress>(peer);
        message.append::<UserName>(AuthHandler::username());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(nonce);
        message.flush(Some(&AuthHandler::key())).unwrap();
    }

    let output = processor.route(&buf, addr).await.unwrap().unwrap();
    let Output::Response(Response { method, .. }) = output else {
        panic!("expected a response");
    };

    method
}

#[tokio::test]
async fn long_term_allocate_flow() {
    let service = service(long_term_config());
    let mut processor = processor(&service);

    let nonce = challenge(&mut processor, client()).await;
    let relayed = allocate(&mut processor, client(), &nonce).await;

    assert_eq!(relayed.ip().to_string(), "127.0.0.1");
    assert_eq!(service.get_session_manager().allocated(), 1);
}

#[tokio::test]
async fn wrong_password_is_441() {
    let service = service(long_term_config());
    let mut processor = processor(&service);

    let nonce = challenge(&mut processor, client()).await;
    let wrong = generate_password("alice", "guess", "example.org", PasswordAlgorithm::Md5);

    let mut buf = BytesMut::with_capacity(1280);
    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut buf);
        message.append::<RequestedTransport>(TRANSPORT_UDP);
        message.append::<UserName>("alice");
        message.append::<Realm>("example.org");
        message.append::<Nonce>(nonce.as_str());
        message.flush(Some(&wrong)).unwrap();
    }

    let output = processor.route(&buf, client()).await.unwrap().unwrap();
    let Output::Response(Response { bytes, .. }) = output else {
        panic!("expected a response");
    };

    let mut attributes = Attributes::default();
    let message = Message::decode(bytes, &mut attributes).unwrap();
    assert_eq!(
        message.get::<ErrorCode>().unwrap().code,
        ErrorType::WrongCredentials as u16
    );
}

#[tokio::test]
async fn second_allocate_is_437() {
    let service = service(long_term_config());
    let mut processor = processor(&service);

    let nonce = challenge(&mut processor, client()).await;
    allocate(&mut processor, client(), &nonce).await;

    let mut buf = BytesMut::with_capacity(1280);
    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut buf);
        message.append::<RequestedTransport>(TRANSPORT_UDP);
        message.append::<UserName>(AuthHandler::username());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(nonce.as_str());
        message.flush(Some(&AuthHandler::key())).unwrap();
    }

    let output = processor.route(&buf, client()).await.unwrap().unwrap();
    let Output::Response(Response { method, bytes, .. }) = output else {
        panic!("expected a response");
    };

    assert_eq!(method, ALLOCATE_ERROR);

    let mut attributes = Attributes::default();
    let message = Message::decode(bytes, &mut attributes).unwrap();
    assert_eq!(
        message.get::<ErrorCode>().unwrap().code,
        ErrorType::AllocationMismatch as u16
    );
}

#[tokio::test]
async fn send_indication_reaches_the_peer() {
    let service = service(long_term_config());
    let mut processor = processor(&service);
    let peer: SocketAddr = "10.0.0.5:9999".parse().unwrap();

    let nonce = challenge(&mut processor, client()).await;
    let relayed = allocate(&mut processor, client(), &nonce).await;
    create_permission(&mut processor, client(), &nonce, peer).await;

    let mut buf = BytesMut::with_capacity(1280);
    {
        let mut message = MessageEncoder::new(SEND_INDICATION, &TOKEN, &mut buf);
        message.append::<XorPeerAddress>(peer);
        message.append::<Data>(b"hello");
        message.flush(None).unwrap();
    }

    let output = processor.route(&buf, client()).await.unwrap().unwrap();
    let Output::RelayToPeer { relay, peer: to, bytes } = output else {
        panic!("expected relayed data");
    };

    assert_eq!(relay.port(), relayed.port());
    assert_eq!(to, peer);
    assert_eq!(bytes, b"hello");
}

#[tokio::test]
async fn send_without_permission_is_dropped() {
    let service = service(long_term_config());
    let mut processor = processor(&service);

    let nonce = challenge(&mut processor, client()).await;
    allocate(&mut processor, client(), &nonce).await;

    let mut buf = BytesMut::with_capacity(1280);
    {
        let mut message = MessageEncoder::new(SEND_INDICATION, &TOKEN, &mut buf);
        message.append::<XorPeerAddress>("10.0.0.5:9999".parse::<SocketAddr>().unwrap());
        message.append::<Data>(b"hello");
        message.flush(None).unwrap();
    }

    assert!(processor.route(&buf, client()).await.unwrap().is_none());
}

#[tokio::test]
async fn channel_binding_and_framing() {
    let service = service(long_term_config());
    let mut processor = processor(&service);
    let peer: SocketAddr = "10.0.0.5:9999".parse().unwrap();

    let nonce = challenge(&mut processor, client()).await;
    let relayed = allocate(&mut processor, client(), &nonce).await;

    // The edges just outside the channel range are refused.
    for number in [0x3FFF, 0x8000] {
        assert_eq!(
            channel_bind(&mut processor, client(), &nonce, number, peer).await,
            CHANNEL_BIND_ERROR
        );
    }

    assert_eq!(
        channel_bind(&mut processor, client(), &nonce, 0x4001, peer).await,
        CHANNEL_BIND_RESPONSE
    );

    // Rebinding the same pair is idempotent, conflicts are not.
    assert_eq!(
        channel_bind(&mut processor, client(), &nonce, 0x4001, peer).await,
        CHANNEL_BIND_RESPONSE
    );
    assert_eq!(
        channel_bind(&mut processor, client(), &nonce, 0x4002, peer).await,
        CHANNEL_BIND_ERROR
    );

    // `40 01 00 05` followed by the payload relays to the bound peer.
    let mut frame = BytesMut::with_capacity(1500);
    ChannelData {
        number: 0x4001,
        bytes: b"hello",
    }
    .encode(&mut frame, false);

    {
        let output = processor.route(&frame, client()).await.unwrap().unwrap();
        let Output::RelayToPeer { peer: to, bytes, .. } = output else {
            panic!("expected relayed data");
        };

        assert_eq!(to, peer);
        assert_eq!(bytes, b"hello");
    }

    // An unbound number is silently dropped.
    ChannelData {
        number: 0x4002,
        bytes: b"hello",
    }
    .encode(&mut frame, false);

    assert!(processor.route(&frame, client()).await.unwrap().is_none());

    // Traffic back from the exact bound address frames as ChannelData;
    // from another port of the host, as a Data indication.
    let manager = service.get_session_manager();
    let id = Identifier {
        source: client(),
        interface: interface(),
        transport: Transport::Udp,
    };

    let inbound = manager.peer_to_client(relayed.port(), &peer).unwrap();
    assert_eq!(inbound.id, id);
    assert_eq!(inbound.channel, Some(0x4001));

    let inbound = manager
        .peer_to_client(relayed.port(), &"10.0.0.5:1234".parse().unwrap())
        .unwrap();
    assert_eq!(inbound.channel, None);

    // And from a host without permission, nothing at all.
    assert!(manager
        .peer_to_client(relayed.port(), &"10.0.0.99:9999".parse().unwrap())
        .is_none());
}

#[tokio::test]
async fn refresh_to_zero_destroys_the_allocation() {
    let service = service(long_term_config());
    let mut processor = processor(&service);

    let nonce = challenge(&mut processor, client()).await;
    allocate(&mut processor, client(), &nonce).await;

    let mut buf = BytesMut::with_capacity(1280);
    {
        let mut message = MessageEncoder::new(REFRESH_REQUEST, &TOKEN, &mut buf);
        message.append::<Lifetime>(0);
        message.append::<UserName>(AuthHandler::username());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(nonce.as_str());
        message.flush(Some(&AuthHandler::key())).unwrap();
    }

    {
        let output = processor.route(&buf, client()).await.unwrap().unwrap();
        let Output::Response(Response { method, bytes, .. }) = output else {
            panic!("expected a response");
        };

        assert_eq!(method, REFRESH_RESPONSE);

        let mut attributes = Attributes::default();
        let message = Message::decode(bytes, &mut attributes).unwrap();
        assert_eq!(message.get::<Lifetime>(), Some(0));
    }

    // Destroyed before the response went out.
    assert_eq!(service.get_session_manager().allocated(), 0);
}

#[tokio::test]
async fn stale_nonce_is_438_with_a_fresh_one() {
    let service = service(long_term_config());
    let mut processor = processor(&service);

    let nonce = challenge(&mut processor, client()).await;
    allocate(&mut processor, client(), &nonce).await;

    let manager = service.get_session_manager().clone();

    // A long refresh keeps the allocation alive while the nonce idles
    // past its lifetime.
    let mut buf = BytesMut::with_capacity(1280);
    {
        let mut message = MessageEncoder::new(REFRESH_REQUEST, &TOKEN, &mut buf);
        message.append::<Lifetime>(3600);
        message.append::<UserName>(AuthHandler::username());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(nonce.as_str());
        message.flush(Some(&AuthHandler::key())).unwrap();
    }

    {
        let output = processor.route(&buf, client()).await.unwrap().unwrap();
        let Output::Response(Response { method, .. }) = output else {
            panic!("expected a response");
        };
        assert_eq!(method, REFRESH_RESPONSE);
    }

    for _ in 0..601 {
        manager.timer().add();
    }

    {
        let mut message = MessageEncoder::new(REFRESH_REQUEST, &TOKEN, &mut buf);
        message.append::<Lifetime>(600);
        message.append::<UserName>(AuthHandler::username());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(nonce.as_str());
        message.flush(Some(&AuthHandler::key())).unwrap();
    }

    let fresh = {
        let output = processor.route(&buf, client()).await.unwrap().unwrap();
        let Output::Response(Response { method, bytes, .. }) = output else {
            panic!("expected a response");
        };

        assert_eq!(method, REFRESH_ERROR);

        let mut attributes = Attributes::default();
        let message = Message::decode(bytes, &mut attributes).unwrap();
        assert_eq!(
            message.get::<ErrorCode>().unwrap().code,
            ErrorType::StaleNonce as u16
        );

        let fresh = message.get::<Nonce>().unwrap().to_string();
        assert_ne!(fresh, nonce);
        fresh
    };

    // The retry with the fresh nonce succeeds.
    {
        let mut message = MessageEncoder::new(REFRESH_REQUEST, &TOKEN, &mut buf);
        message.append::<Lifetime>(600);
        message.append::<UserName>(AuthHandler::username());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(fresh.as_str());
        message.flush(Some(&AuthHandler::key())).unwrap();
    }

    let output = processor.route(&buf, client()).await.unwrap().unwrap();
    let Output::Response(Response { method, .. }) = output else {
        panic!("expected a response");
    };
    assert_eq!(method, REFRESH_RESPONSE);
}

#[tokio::test]
async fn user_quota_is_486() {
    let mut config = long_term_config();
    config.user_quota = 1;

    let service = service(config);
    let mut processor = processor(&service);

    let nonce = challenge(&mut processor, client()).await;
    allocate(&mut processor, client(), &nonce).await;

    let other: SocketAddr = "127.0.0.1:51679".parse().unwrap();
    let nonce = challenge(&mut processor, other).await;

    let mut buf = BytesMut::with_capacity(1280);
    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut buf);
        message.append::<RequestedTransport>(TRANSPORT_UDP);
        message.append::<UserName>(AuthHandler::username());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(nonce.as_str());
        message.flush(Some(&AuthHandler::key())).unwrap();
    }

    let output = processor.route(&buf, other).await.unwrap().unwrap();
    let Output::Response(Response { bytes, .. }) = output else {
        panic!("expected a response");
    };

    let mut attributes = Attributes::default();
    let message = Message::decode(bytes, &mut attributes).unwrap();
    assert_eq!(
        message.get::<ErrorCode>().unwrap().code,
        ErrorType::AllocationQuotaReached as u16
    );
}

#[tokio::test]
async fn peers_behind_policy_are_403() {
    let mut config = long_term_config();
    config.peer_policy.no_loopback = true;

    let service = service(config);
    let mut processor = processor(&service);

    let nonce = challenge(&mut processor, client()).await;
    allocate(&mut processor, client(), &nonce).await;

    let mut buf = BytesMut::with_capacity(1280);
    {
        let mut message = MessageEncoder::new(CREATE_PERMISSION_REQUEST, &TOKEN, &mut buf);
        // One fine peer and one loopback peer: all-or-nothing fails the
        // whole request.
        message.append::<XorPeerAddress>("10.0.0.5:9999".parse::<SocketAddr>().unwrap());
        message.append::<XorPeerAddress>("127.0.0.1:9999".parse::<SocketAddr>().unwrap());
        message.append::<UserName>(AuthHandler::username());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(nonce.as_str());
        message.flush(Some(&AuthHandler::key())).unwrap();
    }

    let output = processor.route(&buf, client()).await.unwrap().unwrap();
    let Output::Response(Response { bytes, .. }) = output else {
        panic!("expected a response");
    };

    let mut attributes = Attributes::default();
    let message = Message::decode(bytes, &mut attributes).unwrap();
    assert_eq!(
        message.get::<ErrorCode>().unwrap().code,
        ErrorType::Forbidden as u16
    );

    // Nothing was installed for the fine peer either.
    assert!(service
        .get_session_manager()
        .send_target(
            &Identifier {
                source: client(),
                interface: interface(),
                transport: Transport::Udp,
            },
            &"10.0.0.5:9999".parse().unwrap()
        )
        .is_none());
}

#[tokio::test]
async fn binding_needs_no_credentials() {
    let service = service(long_term_config());
    let mut processor = processor(&service);

    let mut buf = BytesMut::with_capacity(1280);
    {
        MessageEncoder::new(BINDING_REQUEST, &TOKEN, &mut buf)
            .flush(None)
            .unwrap();
    }

    let output = processor.route(&buf, client()).await.unwrap().unwrap();
    let Output::Response(Response { method, bytes, .. }) = output else {
        panic!("expected a response");
    };

    assert_eq!(method, BINDING_RESPONSE);

    let mut attributes = Attributes::default();
    let message = Message::decode(bytes, &mut attributes).unwrap();
    assert_eq!(message.get::<XorMappedAddress>(), Some(client()));
    assert_eq!(message.get::<MappedAddress>(), Some(client()));
    assert_eq!(message.get::<ResponseOrigin>(), Some(interface()));
}

#[tokio::test]
async fn unknown_comprehension_required_attribute_is_420() {
    use bytes::BufMut;

    let service = service(long_term_config());
    let mut processor = processor(&service);

    let mut buf = BytesMut::with_capacity(64);
    buf.put_u16(0x0001);
    buf.put_u16(8);
    buf.put_u32(0x2112A442);
    buf.put(TOKEN.as_slice());
    buf.put_u16(0x0033);
    buf.put_u16(4);
    buf.put_u32(0);

    let output = processor.route(&buf, client()).await.unwrap().unwrap();
    let Output::Response(Response { method, bytes, .. }) = output else {
        panic!("expected a response");
    };

    assert_eq!(method, BINDING_ERROR);

    let mut attributes = Attributes::default();
    let message = Message::decode(bytes, &mut attributes).unwrap();
    assert_eq!(
        message.get::<ErrorCode>().unwrap().code,
        ErrorType::UnknownAttribute as u16
    );
    assert_eq!(message.get::<UnknownAttributes>(), Some(vec![0x0033]));
}

#[tokio::test]
async fn rest_api_credentials() {
    let secret = "north-relay-1";
    let config = ServiceConfig {
        realm: AuthHandler::realm().to_string(),
        credentials: Credentials::TimedSecret {
            secrets: vec![secret.to_string()],
            separator: ':',
        },
        ..ServiceConfig::default()
    };

    let service = service(config);
    let mut processor = processor(&service);

    let nonce = challenge(&mut processor, client()).await;

    // username = "<expiry>:<suffix>", password = base64(hmac(secret, username))
    let username = format!("{}:caller", u32::MAX);
    let password = codec::crypto::rest_api_password(secret, &username);
    let key = generate_password(&username, &password, AuthHandler::realm(), PasswordAlgorithm::Md5);

    let mut buf = BytesMut::with_capacity(1280);
    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut buf);
        message.append::<RequestedTransport>(TRANSPORT_UDP);
        message.append::<UserName>(username.as_str());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(nonce.as_str());
        message.flush(Some(&key)).unwrap();
    }

    let output = processor.route(&buf, client()).await.unwrap().unwrap();
    let Output::Response(Response { method, .. }) = output else {
        panic!("expected a response");
    };

    assert_eq!(method, ALLOCATE_RESPONSE);

    // An expired timestamp is refused outright.
    let expired = "100:caller".to_string();
    let password = codec::crypto::rest_api_password(secret, &expired);
    let key = generate_password(&expired, &password, AuthHandler::realm(), PasswordAlgorithm::Md5);

    let other: SocketAddr = "127.0.0.1:51680".parse().unwrap();
    let nonce = challenge(&mut processor, other).await;

    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut buf);
        message.append::<RequestedTransport>(TRANSPORT_UDP);
        message.append::<UserName>(expired.as_str());
        message.append::<Realm>(AuthHandler::realm());
        message.append::<Nonce>(nonce.as_str());
        message.flush(Some(&key)).unwrap();
    }

    let output = processor.route(&buf, other).await.unwrap().unwrap();
    let Output::Response(Response { method, .. }) = output else {
        panic!("expected a response");
    };

    assert_eq!(method, ALLOCATE_ERROR);
}

#[tokio::test]
async fn tcp_relay_connect_and_bind() {
    let config = ServiceConfig {
        realm: AuthHandler::realm().to_string(),
        credentials: Credentials::LongTerm,
        ..ServiceConfig::default()
    };

    let service = service(config);
    let mut control = service.get_processor(5, interface(), Transport::Tcp);
    let peer: SocketAddr = "10.0.0.5:9999".parse().unwrap();
    let addr = client();

    // Challenge over the control connection.
    let nonce = {
        let mut buf = BytesMut::with_capacity(1280);
        {
            let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut buf);
            message.append::<RequestedTransport>(TRANSPORT_TCP);
            message.flush(None).unwrap();
        }

        let output = control.route(&buf, addr).await.unwrap().unwrap();
        let Output::Response(Response { bytes, .. }) = output else {
            panic!("expected a response");
        };

        let mut attributes = Attributes::default();
        let message = Message::decode(bytes, &mut attributes).unwrap();
        message.get::<Nonce>().unwrap().to_string()
    };

    // Allocate with REQUESTED-TRANSPORT=TCP.
    {
        let mut buf = BytesMut::with_capacity(1280);
        {
            let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut buf);
            message.append::<RequestedTransport>(TRANSPORT_TCP);
            message.append::<UserName>(AuthHandler::username());
            message.append::<Realm>(AuthHandler::realm());
            message.append::<Nonce>(nonce.as_str());
            message.flush(Some(&AuthHandler::key())).unwrap();
        }

        let output = control.route(&buf, addr).await.unwrap().unwrap();
        let Output::Response(Response { method, .. }) = output else {
            panic!("expected a response");
        };
        assert_eq!(method, ALLOCATE_RESPONSE);
    }

    // CreatePermission for the peer, then Connect.
    create_permission(&mut control, addr, &nonce, peer).await;

    let connection = {
        let mut buf = BytesMut::with_capacity(1280);
        {
            let mut message = MessageEncoder::new(CONNECT_REQUEST, &TOKEN, &mut buf);
            message.append::<XorPeerAddress>(peer);
            message.append::<UserName>(AuthHandler::username());
            message.append::<Realm>(AuthHandler::realm());
            message.append::<Nonce>(nonce.as_str());
            message.flush(Some(&AuthHandler::key())).unwrap();
        }

        let output = control.route(&buf, addr).await.unwrap().unwrap();
        let Output::ConnectPeer { connection, peer: to } = output else {
            panic!("expected a connect directive");
        };

        assert_eq!(to, peer);
        assert_eq!(connection >> 24, 5);
        connection
    };

    // A second Connect to the same peer is 446.
    {
        let mut buf = BytesMut::with_capacity(1280);
        {
            let mut message = MessageEncoder::new(CONNECT_REQUEST, &TOKEN, &mut buf);
            message.append::<XorPeerAddress>(peer);
            message.append::<UserName>(AuthHandler::username());
            message.append::<Realm>(AuthHandler::realm());
            message.append::<Nonce>(nonce.as_str());
            message.flush(Some(&AuthHandler::key())).unwrap();
        }

        let output = control.route(&buf, addr).await.unwrap().unwrap();
        let Output::Response(Response { bytes, .. }) = output else {
            panic!("expected a response");
        };

        let mut attributes = Attributes::default();
        let message = Message::decode(bytes, &mut attributes).unwrap();
        assert_eq!(
            message.get::<ErrorCode>().unwrap().code,
            ErrorType::ConnectionAlreadyExists as u16
        );
    }

    // The peer leg settles; the deferred response carries the id.
    let id = Identifier {
        source: addr,
        interface: interface(),
        transport: Transport::Tcp,
    };

    {
        let mut buf = BytesMut::with_capacity(1280);
        let method = service.connect_response(&id, connection, true, &mut buf).unwrap();
        assert_eq!(method, CONNECT_RESPONSE);

        let mut attributes = Attributes::default();
        let message = Message::decode(&buf, &mut attributes).unwrap();
        assert_eq!(message.get::<ConnectionId>(), Some(connection));
        assert_eq!(message.token(), &TOKEN);
    }

    // The client opens its data connection and binds it.
    let mut data = service.get_processor(5, interface(), Transport::Tcp);
    let data_addr: SocketAddr = "127.0.0.1:51700".parse().unwrap();

    let data_nonce = {
        let mut buf = BytesMut::with_capacity(1280);
        {
            let mut message = MessageEncoder::new(CONNECTION_BIND_REQUEST, &TOKEN, &mut buf);
            message.append::<ConnectionId>(connection);
            message.flush(None).unwrap();
        }

        let output = data.route(&buf, data_addr).await.unwrap().unwrap();
        let Output::Response(Response { bytes, .. }) = output else {
            panic!("expected a response");
        };

        let mut attributes = Attributes::default();
        let message = Message::decode(bytes, &mut attributes).unwrap();
        assert_eq!(
            message.get::<ErrorCode>().unwrap().code,
            ErrorType::Unauthorized as u16
        );
        message.get::<Nonce>().unwrap().to_string()
    };

    {
        let mut buf = BytesMut::with_capacity(1280);
        {
            let mut message = MessageEncoder::new(CONNECTION_BIND_REQUEST, &TOKEN, &mut buf);
            message.append::<ConnectionId>(connection);
            message.append::<UserName>(AuthHandler::username());
            message.append::<Realm>(AuthHandler::realm());
            message.append::<Nonce>(data_nonce.as_str());
            message.flush(Some(&AuthHandler::key())).unwrap();
        }

        let output = data.route(&buf, data_addr).await.unwrap().unwrap();
        let Output::Promote { method, connection: bound, .. } = output else {
            panic!("expected a promote");
        };

        assert_eq!(method, CONNECTION_BIND_RESPONSE);
        assert_eq!(bound, connection);
    }

    // And binding twice is refused.
    {
        let mut buf = BytesMut::with_capacity(1280);
        {
            let mut message = MessageEncoder::new(CONNECTION_BIND_REQUEST, &TOKEN, &mut buf);
            message.append::<ConnectionId>(connection);
            message.append::<UserName>(AuthHandler::username());
            message.append::<Realm>(AuthHandler::realm());
            message.append::<Nonce>(data_nonce.as_str());
            message.flush(Some(&AuthHandler::key())).unwrap();
        }

        let output = data.route(&buf, data_addr).await.unwrap().unwrap();
        let Output::Response(Response { method, .. }) = output else {
            panic!("expected a response");
        };

        assert_eq!(method, CONNECTION_BIND_ERROR);
    }
}
