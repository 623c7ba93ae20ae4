use crate::Error;

/// STUN Methods Registry
///
/// [RFC5389]: https://datatracker.ietf.org/doc/html/rfc5389
/// [RFC5766]: https://datatracker.ietf.org/doc/html/rfc5766
/// [RFC6062]: https://datatracker.ietf.org/doc/html/rfc6062
///
/// A STUN method is a hex number in the range 0x000-0x0FF.  The encoding
/// of a STUN method into a STUN message interleaves the method bits with
/// the two class bits (request, indication, success, error).
///
/// 0x001: Binding
/// 0x003: Allocate
/// 0x004: Refresh
/// 0x006: Send
/// 0x007: Data
/// 0x008: CreatePermission
/// 0x009: ChannelBind
/// 0x00A: Connect
/// 0x00B: ConnectionBind
/// 0x00C: ConnectionAttempt
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum MethodType {
    Request,
    Response,
    Error,
}

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Method {
    Binding(MethodType),
    Allocate(MethodType),
    CreatePermission(MethodType),
    ChannelBind(MethodType),
    Refresh(MethodType),
    Connect(MethodType),
    ConnectionBind(MethodType),
    SendIndication,
    DataIndication,
    ConnectionAttemptIndication,
}

pub const BINDING_REQUEST: Method = Method::Binding(MethodType::Request);
pub const BINDING_RESPONSE: Method = Method::Binding(MethodType::Response);
pub const BINDING_ERROR: Method = Method::Binding(MethodType::Error);
pub const ALLOCATE_REQUEST: Method = Method::Allocate(MethodType::Request);
pub const ALLOCATE_RESPONSE: Method = Method::Allocate(MethodType::Response);
pub const ALLOCATE_ERROR: Method = Method::Allocate(MethodType::Error);
pub const CREATE_PERMISSION_REQUEST: Method = Method::CreatePermission(MethodType::Request);
pub const CREATE_PERMISSION_RESPONSE: Method = Method::CreatePermission(MethodType::Response);
pub const CREATE_PERMISSION_ERROR: Method = Method::CreatePermission(MethodType::Error);
pub const CHANNEL_BIND_REQUEST: Method = Method::ChannelBind(MethodType::Request);
pub const CHANNEL_BIND_RESPONSE: Method = Method::ChannelBind(MethodType::Response);
pub const CHANNEL_BIND_ERROR: Method = Method::ChannelBind(MethodType::Error);
pub const REFRESH_REQUEST: Method = Method::Refresh(MethodType::Request);
pub const REFRESH_RESPONSE: Method = Method::Refresh(MethodType::Response);
pub const REFRESH_ERROR: Method = Method::Refresh(MethodType::Error);
pub const CONNECT_REQUEST: Method = Method::Connect(MethodType::Request);
pub const CONNECT_RESPONSE: Method = Method::Connect(MethodType::Response);
pub const CONNECT_ERROR: Method = Method::Connect(MethodType::Error);
pub const CONNECTION_BIND_REQUEST: Method = Method::ConnectionBind(MethodType::Request);
pub const CONNECTION_BIND_RESPONSE: Method = Method::ConnectionBind(MethodType::Response);
pub const CONNECTION_BIND_ERROR: Method = Method::ConnectionBind(MethodType::Error);
pub const SEND_INDICATION: Method = Method::SendIndication;
pub const DATA_INDICATION: Method = Method::DataIndication;
pub const CONNECTION_ATTEMPT_INDICATION: Method = Method::ConnectionAttemptIndication;

impl Method {
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Method::Binding(MethodType::Request)
                | Method::Allocate(MethodType::Request)
                | Method::CreatePermission(MethodType::Request)
                | Method::ChannelBind(MethodType::Request)
                | Method::Refresh(MethodType::Request)
                | Method::Connect(MethodType::Request)
                | Method::ConnectionBind(MethodType::Request)
        )
    }

    pub fn is_indication(&self) -> bool {
        matches!(
            self,
            Method::SendIndication | Method::DataIndication | Method::ConnectionAttemptIndication
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Method::Binding(MethodType::Error)
                | Method::Refresh(MethodType::Error)
                | Method::Allocate(MethodType::Error)
                | Method::CreatePermission(MethodType::Error)
                | Method::ChannelBind(MethodType::Error)
                | Method::Connect(MethodType::Error)
                | Method::ConnectionBind(MethodType::Error)
        )
    }

    /// The error class counterpart of a request method.
    pub fn error(&self) -> Option<Method> {
        match self {
            Method::Binding(_) => Some(BINDING_ERROR),
            Method::Allocate(_) => Some(ALLOCATE_ERROR),
            Method::CreatePermission(_) => Some(CREATE_PERMISSION_ERROR),
            Method::ChannelBind(_) => Some(CHANNEL_BIND_ERROR),
            Method::Refresh(_) => Some(REFRESH_ERROR),
            Method::Connect(_) => Some(CONNECT_ERROR),
            Method::ConnectionBind(_) => Some(CONNECTION_BIND_ERROR),
            _ => None,
        }
    }

    /// The success class counterpart of a request method.
    pub fn response(&self) -> Option<Method> {
        match self {
            Method::Binding(_) => Some(BINDING_RESPONSE),
            Method::Allocate(_) => Some(ALLOCATE_RESPONSE),
            Method::CreatePermission(_) => Some(CREATE_PERMISSION_RESPONSE),
            Method::ChannelBind(_) => Some(CHANNEL_BIND_RESPONSE),
            Method::Refresh(_) => Some(REFRESH_RESPONSE),
            Method::Connect(_) => Some(CONNECT_RESPONSE),
            Method::ConnectionBind(_) => Some(CONNECTION_BIND_RESPONSE),
            _ => None,
        }
    }
}

impl TryFrom<u16> for Method {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use std::convert::TryFrom;
    /// use turn_relay_codec::message::methods::*;
    ///
    /// assert_eq!(Method::try_from(0x0001).unwrap(), BINDING_REQUEST);
    /// assert_eq!(Method::try_from(0x0101).unwrap(), BINDING_RESPONSE);
    /// assert_eq!(Method::try_from(0x0111).unwrap(), BINDING_ERROR);
    /// assert_eq!(Method::try_from(0x0003).unwrap(), ALLOCATE_REQUEST);
    /// assert_eq!(Method::try_from(0x000A).unwrap(), CONNECT_REQUEST);
    /// assert_eq!(Method::try_from(0x000B).unwrap(), CONNECTION_BIND_REQUEST);
    /// assert_eq!(Method::try_from(0x001C).unwrap(), CONNECTION_ATTEMPT_INDICATION);
    /// assert_eq!(Method::try_from(0x0016).unwrap(), SEND_INDICATION);
    /// assert_eq!(Method::try_from(0x0017).unwrap(), DATA_INDICATION);
    /// ```
    fn try_from(value: u16) -> Result<Self, Error> {
        Ok(match value {
            0x0001 => Self::Binding(MethodType::Request),
            0x0101 => Self::Binding(MethodType::Response),
            0x0111 => Self::Binding(MethodType::Error),
            0x0003 => Self::Allocate(MethodType::Request),
            0x0103 => Self::Allocate(MethodType::Response),
            0x0113 => Self::Allocate(MethodType::Error),
            0x0004 => Self::Refresh(MethodType::Request),
            0x0104 => Self::Refresh(MethodType::Response),
            0x0114 => Self::Refresh(MethodType::Error),
            0x0008 => Self::CreatePermission(MethodType::Request),
            0x0108 => Self::CreatePermission(MethodType::Response),
            0x0118 => Self::CreatePermission(MethodType::Error),
            0x0009 => Self::ChannelBind(MethodType::Request),
            0x0109 => Self::ChannelBind(MethodType::Response),
            0x0119 => Self::ChannelBind(MethodType::Error),
            0x000A => Self::Connect(MethodType::Request),
            0x010A => Self::Connect(MethodType::Response),
            0x011A => Self::Connect(MethodType::Error),
            0x000B => Self::ConnectionBind(MethodType::Request),
            0x010B => Self::ConnectionBind(MethodType::Response),
            0x011B => Self::ConnectionBind(MethodType::Error),
            0x0016 => Self::SendIndication,
            0x0017 => Self::DataIndication,
            0x001C => Self::ConnectionAttemptIndication,
            _ => return Err(Error::UnknownMethod),
        })
    }
}

impl From<Method> for u16 {
    fn from(value: Method) -> Self {
        match value {
            Method::Binding(MethodType::Request) => 0x0001,
            Method::Binding(MethodType::Response) => 0x0101,
            Method::Binding(MethodType::Error) => 0x0111,
            Method::Allocate(MethodType::Request) => 0x0003,
            Method::Allocate(MethodType::Response) => 0x0103,
            Method::Allocate(MethodType::Error) => 0x0113,
            Method::Refresh(MethodType::Request) => 0x0004,
            Method::Refresh(MethodType::Response) => 0x0104,
            Method::Refresh(MethodType::Error) => 0x0114,
            Method::CreatePermission(MethodType::Request) => 0x0008,
            Method::CreatePermission(MethodType::Response) => 0x0108,
            Method::CreatePermission(MethodType::Error) => 0x0118,
            Method::ChannelBind(MethodType::Request) => 0x0009,
            Method::ChannelBind(MethodType::Response) => 0x0109,
            Method::ChannelBind(MethodType::Error) => 0x0119,
            Method::Connect(MethodType::Request) => 0x000A,
            Method::Connect(MethodType::Response) => 0x010A,
            Method::Connect(MethodType::Error) => 0x011A,
            Method::ConnectionBind(MethodType::Request) => 0x000B,
            Method::ConnectionBind(MethodType::Response) => 0x010B,
            Method::ConnectionBind(MethodType::Error) => 0x011B,
            Method::SendIndication => 0x0016,
            Method::DataIndication => 0x0017,
            Method::ConnectionAttemptIndication => 0x001C,
        }
    }
}
