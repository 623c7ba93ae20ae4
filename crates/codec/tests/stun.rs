use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use turn_relay_codec::{
    Attributes, DecodeResult, Decoder,
    channel_data::ChannelData,
    crypto::{Password, PasswordAlgorithm, generate_password},
    message::{Message, MessageEncoder, attributes::*, methods::*},
};

const TOKEN: [u8; 12] = [
    0x64, 0x4f, 0x5a, 0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31,
];

#[test]
fn encode_decode_allocate_request() {
    let peer: SocketAddr = "10.0.0.5:9999".parse().unwrap();
    let mut buf = BytesMut::with_capacity(1280);

    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TOKEN, &mut buf);
        message.append::<RequestedTransport>(TRANSPORT_UDP);
        message.append::<UserName>("alice");
        message.append::<Realm>("example.org");
        message.append::<Nonce>("8d6a45f0313no8a21w9e14l57d2q0z68");
        message.append::<XorPeerAddress>(peer);
        message.append::<Lifetime>(600);
        message.flush(None).unwrap();
    }

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf, &mut attributes).unwrap();

    assert_eq!(message.method(), ALLOCATE_REQUEST);
    assert_eq!(message.token(), &TOKEN);
    assert_eq!(message.get::<RequestedTransport>(), Some(TRANSPORT_UDP));
    assert_eq!(message.get::<UserName>(), Some("alice"));
    assert_eq!(message.get::<Realm>(), Some("example.org"));
    assert_eq!(message.get::<Lifetime>(), Some(600));
    assert_eq!(message.get::<XorPeerAddress>(), Some(peer));
    assert!(message.unknown_attributes().is_empty());
}

#[test]
fn multiple_peer_addresses_keep_order() {
    let peers: Vec<SocketAddr> = vec![
        "10.0.0.5:9999".parse().unwrap(),
        "10.0.0.6:1234".parse().unwrap(),
        "[2001:db8::7]:49152".parse().unwrap(),
    ];

    let mut buf = BytesMut::with_capacity(1280);

    {
        let mut message = MessageEncoder::new(CREATE_PERMISSION_REQUEST, &TOKEN, &mut buf);
        for peer in &peers {
            message.append::<XorPeerAddress>(*peer);
        }
        message.flush(None).unwrap();
    }

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf, &mut attributes).unwrap();

    let decoded: Vec<SocketAddr> = message.get_all::<XorPeerAddress>().collect();
    assert_eq!(decoded, peers);
}

#[test]
fn integrity_sha1_and_sha256() {
    for algorithm in [PasswordAlgorithm::Md5, PasswordAlgorithm::Sha256] {
        let password = generate_password("alice", "secret", "example.org", algorithm);
        let mut buf = BytesMut::with_capacity(1280);

        {
            let mut message = MessageEncoder::new(REFRESH_REQUEST, &TOKEN, &mut buf);
            message.append::<UserName>("alice");
            message.append::<Lifetime>(0);
            message.flush(Some(&password)).unwrap();
        }

        let mut attributes = Attributes::default();
        let message = Message::decode(&buf, &mut attributes).unwrap();

        assert!(message.checksum(&password).is_ok());

        // The wrong key must not pass.
        let wrong = generate_password("alice", "wrong", "example.org", algorithm);
        assert!(message.checksum(&wrong).is_err());
    }
}

#[test]
fn short_term_integrity_uses_raw_password() {
    let password = Password::Raw(b"fragile".to_vec());
    let mut buf = BytesMut::with_capacity(1280);

    {
        let mut message = MessageEncoder::new(BINDING_REQUEST, &TOKEN, &mut buf);
        message.append::<UserName>("bob");
        message.flush(Some(&password)).unwrap();
    }

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf, &mut attributes).unwrap();

    assert!(message.checksum(&password).is_ok());
    assert!(message.checksum(&Password::Raw(b"other".to_vec())).is_err());
}

#[test]
fn unknown_comprehension_required_attribute() {
    let mut buf = BytesMut::with_capacity(64);

    buf.put_u16(0x0001);
    buf.put_u16(8);
    buf.put_u32(0x2112A442);
    buf.put(TOKEN.as_slice());

    // 0x0033 is unassigned and comprehension-required.
    buf.put_u16(0x0033);
    buf.put_u16(4);
    buf.put_u32(0);

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf, &mut attributes).unwrap();

    assert_eq!(message.unknown_attributes(), &[0x0033]);
}

#[test]
fn unknown_comprehension_optional_attribute_is_skipped() {
    let mut buf = BytesMut::with_capacity(64);

    buf.put_u16(0x0001);
    buf.put_u16(8);
    buf.put_u32(0x2112A442);
    buf.put(TOKEN.as_slice());

    buf.put_u16(0x80AA);
    buf.put_u16(4);
    buf.put_u32(0);

    let mut attributes = Attributes::default();
    let message = Message::decode(&buf, &mut attributes).unwrap();

    assert!(message.unknown_attributes().is_empty());
}

#[test]
fn truncated_attribute_is_rejected() {
    let mut buf = BytesMut::with_capacity(64);

    buf.put_u16(0x0001);
    buf.put_u16(8);
    buf.put_u32(0x2112A442);
    buf.put(TOKEN.as_slice());

    // An attribute claiming more content than the buffer holds.
    buf.put_u16(0x0006);
    buf.put_u16(64);

    let mut attributes = Attributes::default();
    assert!(Message::decode(&buf, &mut attributes).is_err());
}

#[test]
fn channel_data_framing() {
    let mut buf = BytesMut::with_capacity(1500);

    ChannelData {
        number: 0x4001,
        bytes: b"hello",
    }
    .encode(&mut buf, false);

    // `40 01 00 05` followed by the payload, no padding over udp.
    assert_eq!(&buf[..], &[0x40, 0x01, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);

    ChannelData {
        number: 0x4001,
        bytes: b"hello",
    }
    .encode(&mut buf, true);

    assert_eq!(buf.len(), 12);
    assert_eq!(Decoder::message_size(&buf, true).unwrap(), 12);
    assert_eq!(Decoder::message_size(&buf, false).unwrap(), 9);

    let frame = ChannelData::decode(&buf).unwrap();
    assert_eq!(frame.number(), 0x4001);
    assert_eq!(frame.as_bytes(), b"hello");
}

#[test]
fn channel_number_out_of_range_is_rejected() {
    // 0x3FFF and 0x8000 both sit outside the valid channel range.
    for number in [0x3FFFu16, 0x8000] {
        let mut buf = BytesMut::new();
        buf.put_u16(number);
        buf.put_u16(0);

        assert!(ChannelData::decode(&buf).is_err());
    }
}

#[test]
fn decoder_discriminates_message_kinds() {
    let mut decoder = Decoder::default();
    let mut buf = BytesMut::with_capacity(64);

    {
        MessageEncoder::new(BINDING_REQUEST, &TOKEN, &mut buf)
            .flush(None)
            .unwrap();
    }

    assert!(matches!(
        decoder.decode(&buf).unwrap(),
        DecodeResult::Message(_)
    ));

    ChannelData {
        number: 0x4000,
        bytes: b"x",
    }
    .encode(&mut buf, false);

    assert!(matches!(
        decoder.decode(&buf).unwrap(),
        DecodeResult::ChannelData(_)
    ));
}
