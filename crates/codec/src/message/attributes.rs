use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::Error;

/// STUN Attributes Registry
///
/// Attribute types in the range 0x0000-0x7FFF are comprehension-required:
/// a request carrying an unknown attribute in that range must be answered
/// with 420 (Unknown Attribute). Types in the range 0x8000-0xFFFF are
/// comprehension-optional and are silently skipped when unknown.
#[repr(u16)]
#[derive(TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    MappedAddress = 0x0001,
    ChangeRequest = 0x0003,
    UserName = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    RequestedAddressFamily = 0x0017,
    EvenPort = 0x0018,
    RequestedTransport = 0x0019,
    DontFragment = 0x001A,
    MessageIntegritySha256 = 0x001C,
    XorMappedAddress = 0x0020,
    ReservationToken = 0x0022,
    Padding = 0x0026,
    ResponsePort = 0x0027,
    ConnectionId = 0x002A,
    AdditionalAddressFamily = 0x8000,
    Software = 0x8022,
    AlternateServer = 0x8023,
    Fingerprint = 0x8028,
    ResponseOrigin = 0x802B,
    OtherAddress = 0x802C,
    Origin = 0x802F,
    MobilityTicket = 0x8030,
}

impl AttributeType {
    /// Whether an unknown occurrence of this range must be reported in an
    /// UNKNOWN-ATTRIBUTES answer.
    pub fn is_comprehension_required(value: u16) -> bool {
        value < 0x8000
    }
}

/// dyn stun/turn message attribute.
pub trait Attribute<'a> {
    const TYPE: AttributeType;
    /// current attribute inner type.
    type Item;
    /// write the current attribute to the buffer.
    fn serialize(value: Self::Item, bytes: &mut BytesMut, token: &[u8]);
    /// convert buffer to current attribute.
    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error>;
}

static MAGIC_COOKIE: u32 = 0x2112A442;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// The address family of a relayed transport address, RFC 6156.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// Address attribute codec shared by the `*-ADDRESS` family.
///
/// X-Port is computed by XOR'ing the mapped port with the most
/// significant 16 bits of the magic cookie.  If the IP address family is
/// IPv4, X-Address is computed by XOR'ing the mapped IP address with the
/// magic cookie.  If the IP address family is IPv6, X-Address is
/// computed by XOR'ing the mapped IP address with the concatenation of
/// the magic cookie and the 96-bit transaction ID.
fn encode_addr(addr: &SocketAddr, token: &[u8], bytes: &mut BytesMut, xor: bool) {
    bytes.put_u8(0);
    let port = if xor {
        addr.port() ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        addr.port()
    };

    match addr.ip() {
        IpAddr::V4(ip) => {
            bytes.put_u8(FAMILY_IPV4);
            bytes.put_u16(port);

            let mut octets = u32::from(ip);
            if xor {
                octets ^= MAGIC_COOKIE;
            }

            bytes.put_u32(octets);
        }
        IpAddr::V6(ip) => {
            bytes.put_u8(FAMILY_IPV6);
            bytes.put_u16(port);

            let mut octets = ip.octets();
            if xor {
                for (i, b) in MAGIC_COOKIE.to_be_bytes().iter().chain(token.iter()).enumerate() {
                    octets[i] ^= b;
                }
            }

            bytes.put(octets.as_slice());
        }
    }
}

fn decode_addr(bytes: &[u8], token: &[u8], xor: bool) -> Result<SocketAddr, Error> {
    if bytes.len() < 8 {
        return Err(Error::InvalidInput);
    }

    let mut port = u16::from_be_bytes(bytes[2..4].try_into()?);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    Ok(match bytes[1] {
        FAMILY_IPV4 => {
            let mut octets = u32::from_be_bytes(bytes[4..8].try_into()?);
            if xor {
                octets ^= MAGIC_COOKIE;
            }

            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)
        }
        FAMILY_IPV6 => {
            if bytes.len() < 20 {
                return Err(Error::InvalidInput);
            }

            let mut octets: [u8; 16] = bytes[4..20].try_into()?;
            if xor {
                for (i, b) in MAGIC_COOKIE.to_be_bytes().iter().chain(token.iter()).enumerate() {
                    octets[i] ^= b;
                }
            }

            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        }
        _ => return Err(Error::InvalidInput),
    })
}

fn as_u32(bytes: &[u8]) -> Result<u32, Error> {
    if bytes.len() < 4 {
        return Err(Error::InvalidInput);
    }

    Ok(u32::from_be_bytes(bytes[..4].try_into()?))
}

/// The error kinds delivered to clients, with the RFC error codes.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    TryAlternate = 300,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    UnknownAttribute = 420,
    AllocationMismatch = 437,
    StaleNonce = 438,
    AddressFamilyNotSupported = 440,
    WrongCredentials = 441,
    UnsupportedTransportProtocol = 442,
    PeerAddressFamilyMismatch = 443,
    ConnectionAlreadyExists = 446,
    ConnectionTimeoutOrFailure = 447,
    AllocationQuotaReached = 486,
    ServerError = 500,
    InsufficientCapacity = 508,
}

impl ErrorType {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TryAlternate => "Try Alternate",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::UnknownAttribute => "Unknown Attribute",
            Self::AllocationMismatch => "Allocation Mismatch",
            Self::StaleNonce => "Stale Nonce",
            Self::AddressFamilyNotSupported => "Address Family not Supported",
            Self::WrongCredentials => "Wrong Credentials",
            Self::UnsupportedTransportProtocol => "Unsupported Transport Protocol",
            Self::PeerAddressFamilyMismatch => "Peer Address Family Mismatch",
            Self::ConnectionAlreadyExists => "Connection Already Exists",
            Self::ConnectionTimeoutOrFailure => "Connection Timeout or Failure",
            Self::AllocationQuotaReached => "Allocation Quota Reached",
            Self::ServerError => "Server Error",
            Self::InsufficientCapacity => "Insufficient Capacity",
        }
    }
}

/// The ERROR-CODE attribute is used in error response messages.  It
/// contains a numeric error code value in the range of 300 to 699 plus a
/// textual reason phrase encoded in UTF-8; the reason phrase is meant
/// for diagnostic purposes and can be anything appropriate for the
/// error code.
///
/// ```bash
///   0                   1                   2                   3
///   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |           Reserved, should be 0         |Class|     Number    |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |      Reason Phrase (variable)                                ..
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode<'a> {
    pub code: u16,
    pub reason: &'a str,
}

impl From<ErrorType> for ErrorCode<'static> {
    /// # Test
    ///
    /// ```
    /// use turn_relay_codec::message::attributes::*;
    ///
    /// let error = ErrorCode::from(ErrorType::Unauthorized);
    ///
    /// assert_eq!(error.code, 401);
    /// assert_eq!(error.reason, "Unauthorized");
    /// ```
    fn from(value: ErrorType) -> Self {
        Self {
            code: value as u16,
            reason: value.reason(),
        }
    }
}

impl<'a> Attribute<'a> for ErrorCode<'a> {
    const TYPE: AttributeType = AttributeType::ErrorCode;
    type Item = ErrorCode<'a>;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put_u16(0);
        bytes.put_u8((value.code / 100) as u8);
        bytes.put_u8((value.code % 100) as u8);
        bytes.put(value.reason.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            code: bytes[2] as u16 * 100 + bytes[3] as u16,
            reason: std::str::from_utf8(&bytes[4..])?,
        })
    }
}

/// The USERNAME attribute is used for message integrity.  It identifies
/// the username and password combination used in the message-integrity
/// check.
///
/// The value of USERNAME is a variable-length value containing the
/// authentication username.  It MUST contain a UTF-8-encoded sequence
/// of fewer than 509 bytes.
pub struct UserName;

impl<'a> Attribute<'a> for UserName {
    const TYPE: AttributeType = AttributeType::UserName;
    type Item = &'a str;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put(value.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(bytes)?)
    }
}

/// The REALM attribute may be present in requests and responses.
///
/// Presence of the REALM attribute in a request indicates that long-term
/// credentials are being used for authentication.  Presence in certain
/// error responses indicates that the server wishes the client to use a
/// long-term credential in that realm for authentication.
pub struct Realm;

impl<'a> Attribute<'a> for Realm {
    const TYPE: AttributeType = AttributeType::Realm;
    type Item = &'a str;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put(value.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(bytes)?)
    }
}

/// The NONCE attribute may be present in requests and responses.  It
/// contains a sequence of qdtext or quoted-pair and MUST be fewer than
/// 128 characters.  A server issues a fresh nonce on 401 and 438 and
/// rejects requests whose nonce has gone stale.
pub struct Nonce;

impl<'a> Attribute<'a> for Nonce {
    const TYPE: AttributeType = AttributeType::Nonce;
    type Item = &'a str;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put(value.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(bytes)?)
    }
}

/// The SOFTWARE attribute contains a textual description of the software
/// being used by the agent sending the message.  The attribute has no
/// impact on operation of the protocol and serves only as a tool for
/// diagnostic and debugging purposes.
pub struct Software;

impl<'a> Attribute<'a> for Software {
    const TYPE: AttributeType = AttributeType::Software;
    type Item = &'a str;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put(value.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(bytes)?)
    }
}

/// The ORIGIN attribute carries the origin of the request in the sense
/// of the web origin concept. Decoded for diagnostics only.
pub struct Origin;

impl<'a> Attribute<'a> for Origin {
    const TYPE: AttributeType = AttributeType::Origin;
    type Item = &'a str;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put(value.as_bytes());
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(std::str::from_utf8(bytes)?)
    }
}

/// The DATA attribute is present in all Send and Data indications.  The
/// value portion of this attribute is variable length and consists of
/// the application data (that is, the data that would immediately follow
/// the UDP header if the data was been sent directly between the client
/// and the peer).
pub struct Data;

impl<'a> Attribute<'a> for Data {
    const TYPE: AttributeType = AttributeType::Data;
    type Item = &'a [u8];

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(bytes)
    }
}

/// The MESSAGE-INTEGRITY attribute contains an HMAC-SHA1 of the STUN
/// message.  Since it uses the SHA-1 hash, the HMAC will be 20 bytes.
///
/// The text used as input to HMAC is the STUN message, up to and
/// including the attribute preceding the MESSAGE-INTEGRITY attribute.
/// The Length field of the STUN message header is adjusted to point to
/// the end of the MESSAGE-INTEGRITY attribute.
pub struct MessageIntegrity;

impl<'a> Attribute<'a> for MessageIntegrity {
    const TYPE: AttributeType = AttributeType::MessageIntegrity;
    type Item = &'a [u8];

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(bytes)
    }
}

/// Like MESSAGE-INTEGRITY, with HMAC-SHA256 and a 32-byte value.
pub struct MessageIntegritySha256;

impl<'a> Attribute<'a> for MessageIntegritySha256 {
    const TYPE: AttributeType = AttributeType::MessageIntegritySha256;
    type Item = &'a [u8];

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(bytes)
    }
}

/// The FINGERPRINT attribute MAY be present in all STUN messages.
///
/// The value of the attribute is computed as the CRC-32 of the STUN
/// message up to (but excluding) the FINGERPRINT attribute itself,
/// XOR'ed with the 32-bit value 0x5354554e.  When present, the
/// FINGERPRINT attribute MUST be the last attribute in the message.
pub struct Fingerprint;

impl<'a> Attribute<'a> for Fingerprint {
    const TYPE: AttributeType = AttributeType::Fingerprint;
    type Item = u32;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put_u32(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        as_u32(bytes)
    }
}

/// The MAPPED-ADDRESS attribute indicates a reflexive transport address
/// of the client.  It consists of an 8-bit address family and a 16-bit
/// port, followed by a fixed-length value representing the IP address.
/// This attribute is used only by servers for achieving backwards
/// compatibility with RFC 3489 clients.
pub struct MappedAddress;

impl<'a> Attribute<'a> for MappedAddress {
    const TYPE: AttributeType = AttributeType::MappedAddress;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, token: &[u8]) {
        encode_addr(&value, token, bytes, false);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        decode_addr(bytes, token, false)
    }
}

/// The XOR-MAPPED-ADDRESS attribute is identical to the MAPPED-ADDRESS
/// attribute, except that the reflexive transport address is obfuscated
/// through the XOR function.
///
/// Deployment experience found that some NATs rewrite the 32-bit binary
/// payloads containing the NAT's public IP address, such as STUN's
/// MAPPED-ADDRESS attribute, in the well-meaning but misguided attempt
/// to provide a generic Application Layer Gateway function.  Such
/// behavior interferes with the operation of STUN and also causes
/// failure of STUN's message-integrity checking.
pub struct XorMappedAddress;

impl<'a> Attribute<'a> for XorMappedAddress {
    const TYPE: AttributeType = AttributeType::XorMappedAddress;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, token: &[u8]) {
        encode_addr(&value, token, bytes, true);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        decode_addr(bytes, token, true)
    }
}

/// The XOR-PEER-ADDRESS specifies the address and port of the peer as
/// seen from the TURN server.  It is encoded in the same way as
/// XOR-MAPPED-ADDRESS.  A CreatePermission request may carry several of
/// these.
pub struct XorPeerAddress;

impl<'a> Attribute<'a> for XorPeerAddress {
    const TYPE: AttributeType = AttributeType::XorPeerAddress;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, token: &[u8]) {
        encode_addr(&value, token, bytes, true);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        decode_addr(bytes, token, true)
    }
}

/// The XOR-RELAYED-ADDRESS is present in Allocate responses.  It
/// specifies the address and port that the server allocated to the
/// client.  It is encoded in the same way as XOR-MAPPED-ADDRESS.
pub struct XorRelayedAddress;

impl<'a> Attribute<'a> for XorRelayedAddress {
    const TYPE: AttributeType = AttributeType::XorRelayedAddress;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, token: &[u8]) {
        encode_addr(&value, token, bytes, true);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        decode_addr(bytes, token, true)
    }
}

/// The RESPONSE-ORIGIN attribute is inserted by the server and indicates
/// the source IP address and port the response was sent from.  It is
/// useful for detecting double NAT configurations.
pub struct ResponseOrigin;

impl<'a> Attribute<'a> for ResponseOrigin {
    const TYPE: AttributeType = AttributeType::ResponseOrigin;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, token: &[u8]) {
        encode_addr(&value, token, bytes, false);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        decode_addr(bytes, token, false)
    }
}

/// The OTHER-ADDRESS attribute advertises the alternate address and
/// port the server would answer a CHANGE-REQUEST from, RFC 5780.
pub struct OtherAddress;

impl<'a> Attribute<'a> for OtherAddress {
    const TYPE: AttributeType = AttributeType::OtherAddress;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, token: &[u8]) {
        encode_addr(&value, token, bytes, false);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        decode_addr(bytes, token, false)
    }
}

/// The ALTERNATE-SERVER attribute carries the redirect target of a
/// 300 (Try Alternate) answer.
pub struct AlternateServer;

impl<'a> Attribute<'a> for AlternateServer {
    const TYPE: AttributeType = AttributeType::AlternateServer;
    type Item = SocketAddr;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, token: &[u8]) {
        encode_addr(&value, token, bytes, false);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        decode_addr(bytes, token, false)
    }
}

/// The LIFETIME attribute represents the duration for which the server
/// will maintain an allocation in the absence of a refresh.  The value
/// portion of this attribute is 4-bytes long and consists of a 32-bit
/// unsigned integral value representing the number of seconds remaining
/// until expiration.
pub struct Lifetime;

impl<'a> Attribute<'a> for Lifetime {
    const TYPE: AttributeType = AttributeType::Lifetime;
    type Item = u32;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put_u32(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        as_u32(bytes)
    }
}

/// The CHANNEL-NUMBER attribute contains the number of the channel.  The
/// value portion of this attribute is 4 bytes long and consists of a
/// 16-bit unsigned integer followed by a two-octet RFFU field, which
/// MUST be set to 0 on transmission and MUST be ignored on reception.
pub struct ChannelNumber;

impl<'a> Attribute<'a> for ChannelNumber {
    const TYPE: AttributeType = AttributeType::ChannelNumber;
    type Item = u16;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put_u16(value);
        bytes.put_u16(0);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if bytes.len() < 2 {
            return Err(Error::InvalidInput);
        }

        Ok(u16::from_be_bytes(bytes[..2].try_into()?))
    }
}

/// This attribute is used by the client to request a specific transport
/// protocol for the allocated transport address.
///
/// The Protocol field specifies the desired protocol.  The codepoints
/// used in this field are taken from those allowed in the Protocol field
/// in the IPv4 header: 17 for UDP, and 6 for TCP in the RFC 6062
/// extension.
pub struct RequestedTransport;

pub const TRANSPORT_UDP: u8 = 17;
pub const TRANSPORT_TCP: u8 = 6;

impl<'a> Attribute<'a> for RequestedTransport {
    const TYPE: AttributeType = AttributeType::RequestedTransport;
    type Item = u8;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put_u8(value);
        bytes.put_bytes(0, 3);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput);
        }

        Ok(bytes[0])
    }
}

/// The REQUESTED-ADDRESS-FAMILY attribute, RFC 6156: 0x01 for IPv4 and
/// 0x02 for IPv6.
pub struct RequestedAddressFamily;

impl<'a> Attribute<'a> for RequestedAddressFamily {
    const TYPE: AttributeType = AttributeType::RequestedAddressFamily;
    type Item = AddressFamily;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put_u8(match value {
            AddressFamily::V4 => FAMILY_IPV4,
            AddressFamily::V6 => FAMILY_IPV6,
        });

        bytes.put_bytes(0, 3);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        match bytes.first() {
            Some(&FAMILY_IPV4) => Ok(AddressFamily::V4),
            Some(&FAMILY_IPV6) => Ok(AddressFamily::V6),
            _ => Err(Error::InvalidInput),
        }
    }
}

/// The ADDITIONAL-ADDRESS-FAMILY attribute of the dual-allocation
/// extension. Comprehension-optional.
pub struct AdditionalAddressFamily;

impl<'a> Attribute<'a> for AdditionalAddressFamily {
    const TYPE: AttributeType = AttributeType::AdditionalAddressFamily;
    type Item = AddressFamily;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, token: &[u8]) {
        RequestedAddressFamily::serialize(value, bytes, token);
    }

    fn deserialize(bytes: &'a [u8], token: &'a [u8]) -> Result<Self::Item, Error> {
        RequestedAddressFamily::deserialize(bytes, token)
    }
}

/// This attribute allows the client to request that the port in the
/// relayed transport address be even, and (optionally) that the server
/// reserve the next-higher port number.  The value contains a single
/// R bit in the most significant position.
pub struct EvenPort;

impl<'a> Attribute<'a> for EvenPort {
    const TYPE: AttributeType = AttributeType::EvenPort;
    /// whether the next-higher port should be reserved.
    type Item = bool;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put_u8(if value { 0x80 } else { 0 });
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(bytes.first().is_some_and(|it| it & 0x80 != 0))
    }
}

/// The DONT-FRAGMENT attribute requests the server to set the DF bit on
/// datagrams it relays to the peer. Zero-length, presence only.
pub struct DontFragment;

impl<'a> Attribute<'a> for DontFragment {
    const TYPE: AttributeType = AttributeType::DontFragment;
    type Item = ();

    fn serialize(_: Self::Item, _: &mut BytesMut, _: &[u8]) {}

    fn deserialize(_: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(())
    }
}

/// The RESERVATION-TOKEN attribute contains a token that uniquely
/// identifies a relayed transport address being held in reserve by the
/// server.  The server includes this attribute in a success response to
/// tell the client about the token, and the client includes this
/// attribute in a subsequent Allocate request to request the server use
/// that relayed transport address for the allocation.
pub struct ReservationToken;

impl<'a> Attribute<'a> for ReservationToken {
    const TYPE: AttributeType = AttributeType::ReservationToken;
    type Item = u64;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put_u64(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if bytes.len() < 8 {
            return Err(Error::InvalidInput);
        }

        Ok(u64::from_be_bytes(bytes[..8].try_into()?))
    }
}

/// The CONNECTION-ID attribute uniquely identifies a peer data
/// connection, RFC 6062.
pub struct ConnectionId;

impl<'a> Attribute<'a> for ConnectionId {
    const TYPE: AttributeType = AttributeType::ConnectionId;
    type Item = u32;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put_u32(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        as_u32(bytes)
    }
}

/// The CHANGE-REQUEST attribute contains two flags to control the IP
/// address and port that the server uses to send the response, RFC 5780.
pub struct ChangeRequest;

pub const CHANGE_IP: u32 = 0x0000_0004;
pub const CHANGE_PORT: u32 = 0x0000_0002;

impl<'a> Attribute<'a> for ChangeRequest {
    const TYPE: AttributeType = AttributeType::ChangeRequest;
    type Item = u32;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put_u32(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        as_u32(bytes)
    }
}

/// The RESPONSE-PORT attribute asks the server to answer to a port other
/// than the request's source port, RFC 5780.
pub struct ResponsePort;

impl<'a> Attribute<'a> for ResponsePort {
    const TYPE: AttributeType = AttributeType::ResponsePort;
    type Item = u16;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put_u16(value);
        bytes.put_u16(0);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        if bytes.len() < 2 {
            return Err(Error::InvalidInput);
        }

        Ok(u16::from_be_bytes(bytes[..2].try_into()?))
    }
}

/// The PADDING attribute is used to pad a message to a desired size,
/// RFC 5780. The content is ignored.
pub struct Padding;

impl<'a> Attribute<'a> for Padding {
    const TYPE: AttributeType = AttributeType::Padding;
    type Item = &'a [u8];

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(bytes)
    }
}

/// The UNKNOWN-ATTRIBUTES attribute is present only in an error response
/// when the response code in the ERROR-CODE attribute is 420.  The
/// attribute contains a list of 16-bit values, each of which represents
/// an attribute type that was not understood by the server.
pub struct UnknownAttributes;

impl<'a> Attribute<'a> for UnknownAttributes {
    const TYPE: AttributeType = AttributeType::UnknownAttributes;
    type Item = Vec<u16>;

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        for it in value {
            bytes.put_u16(it);
        }
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(bytes
            .chunks_exact(2)
            .map(|it| u16::from_be_bytes([it[0], it[1]]))
            .collect())
    }
}

/// The MOBILITY-TICKET attribute carries the opaque token a mobile
/// session presents when it resumes from a new transport address.
pub struct MobilityTicket;

impl<'a> Attribute<'a> for MobilityTicket {
    const TYPE: AttributeType = AttributeType::MobilityTicket;
    type Item = &'a [u8];

    fn serialize(value: Self::Item, bytes: &mut BytesMut, _: &[u8]) {
        bytes.put(value);
    }

    fn deserialize(bytes: &'a [u8], _: &'a [u8]) -> Result<Self::Item, Error> {
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::BytesMut;

    const TOKEN: [u8; 12] = [
        0x72, 0x6d, 0x49, 0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    ];

    #[test]
    fn xor_address_round_trip() {
        let mut bytes = BytesMut::new();

        for addr in ["192.0.2.1:32853", "[2001:db8::7]:49152"] {
            let addr: SocketAddr = addr.parse().unwrap();

            bytes.clear();
            XorPeerAddress::serialize(addr, &mut bytes, &TOKEN);
            assert_eq!(XorPeerAddress::deserialize(&bytes, &TOKEN).unwrap(), addr);
        }
    }

    #[test]
    fn plain_address_round_trip() {
        let addr: SocketAddr = "10.0.0.5:9999".parse().unwrap();
        let mut bytes = BytesMut::new();

        MappedAddress::serialize(addr, &mut bytes, &TOKEN);
        assert_eq!(MappedAddress::deserialize(&bytes, &TOKEN).unwrap(), addr);

        // A xor decode of a plain encoding must differ.
        assert_ne!(XorMappedAddress::deserialize(&bytes, &TOKEN).unwrap(), addr);
    }

    #[test]
    fn error_code_round_trip() {
        let mut bytes = BytesMut::new();

        ErrorCode::serialize(ErrorCode::from(ErrorType::StaleNonce), &mut bytes, &TOKEN);

        let error = ErrorCode::deserialize(&bytes, &TOKEN).unwrap();
        assert_eq!(error.code, 438);
        assert_eq!(error.reason, "Stale Nonce");
    }

    #[test]
    fn even_port_flags() {
        let mut bytes = BytesMut::new();

        EvenPort::serialize(true, &mut bytes, &TOKEN);
        assert!(EvenPort::deserialize(&bytes, &TOKEN).unwrap());

        bytes.clear();
        EvenPort::serialize(false, &mut bytes, &TOKEN);
        assert!(!EvenPort::deserialize(&bytes, &TOKEN).unwrap());
    }

    #[test]
    fn unknown_attributes_list() {
        let mut bytes = BytesMut::new();

        UnknownAttributes::serialize(vec![0x0033, 0x0041], &mut bytes, &TOKEN);
        assert_eq!(
            UnknownAttributes::deserialize(&bytes, &TOKEN).unwrap(),
            vec![0x0033, 0x0041]
        );
    }
}
