mod allocate;
mod binding;
mod channel_bind;
mod connect;
mod create_permission;
mod indication;
mod refresh;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use codec::{
    DecodeResult, Decoder,
    crypto::{Password, PasswordAlgorithm, generate_password},
    message::{
        Message, MessageEncoder,
        attributes::{
            ConnectionId, ErrorCode, ErrorType, MessageIntegrity, MessageIntegritySha256,
            MobilityTicket, Nonce, Realm, UnknownAttributes, UserName, XorPeerAddress,
        },
        methods::{
            ALLOCATE_REQUEST, BINDING_REQUEST, CHANNEL_BIND_REQUEST, CONNECT_ERROR,
            CONNECT_REQUEST, CONNECT_RESPONSE, CONNECTION_ATTEMPT_INDICATION,
            CONNECTION_BIND_REQUEST, CREATE_PERMISSION_REQUEST, Method, REFRESH_REQUEST,
            SEND_INDICATION,
        },
    },
};
use rand::Rng;

use crate::{
    Credential, Identifier, Observer, Service, ServiceConfig, Transport,
    auth::{Credentials, timed_secret_candidates},
    session::SessionManager,
};

/// Which endpoint a response leaves from, for the RFC 5780
/// CHANGE-REQUEST and RESPONSE-PORT behaviours. The flags are relative
/// to the endpoint the request arrived on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reply {
    pub change_ip: bool,
    pub change_port: bool,
    pub port: Option<u16>,
}

/// A finished response waiting to be written to the client socket.
#[derive(Debug)]
pub struct Response<'a> {
    pub method: Method,
    pub bytes: &'a [u8],
    pub reply: Reply,
}

/// What the state machine asks the I/O layer to do with a routed
/// packet.
#[derive(Debug)]
pub enum Output<'a> {
    /// Write a response back to the client.
    Response(Response<'a>),
    /// Emit a payload from the relay endpoint towards the peer.
    RelayToPeer {
        relay: SocketAddr,
        peer: SocketAddr,
        bytes: &'a [u8],
    },
    /// Open the peer leg of an RFC 6062 connection; the response is
    /// deferred until [`Service::connect_response`].
    ConnectPeer { connection: u32, peer: SocketAddr },
    /// Write the response, then splice this client socket with the
    /// peer leg of the connection.
    Promote {
        method: Method,
        bytes: &'a [u8],
        connection: u32,
    },
}

pub(crate) struct State<T> {
    pub config: Arc<ServiceConfig>,
    pub manager: Arc<SessionManager<T>>,
    pub handler: T,
    pub server_id: u8,
    pub interface: SocketAddr,
    pub other_address: Option<SocketAddr>,
}

pub(crate) struct Request<'a, 'b, T, M> {
    pub id: Identifier,
    pub state: &'a State<T>,
    pub bytes: &'b mut BytesMut,
    pub message: &'a M,
}

impl<'a, 'b, T, M> Request<'a, 'b, T, M>
where
    T: Observer + 'static,
{
    pub fn verify_peer(&self, peer: &SocketAddr) -> Option<ErrorType> {
        let relay = self.state.manager.relay_of(&self.id)?;

        // The peer must share the allocation's address family, and must
        // be permitted by the configured lists.
        if peer.is_ipv4() != relay.0.is_ipv4() {
            return Some(ErrorType::PeerAddressFamilyMismatch);
        }

        if !self.state.config.peer_policy.permits(&peer.ip()) {
            return Some(ErrorType::Forbidden);
        }

        None
    }
}

/// The per-client protocol state machine of one worker.
///
/// A processor is bound to one listening endpoint and one worker; every
/// packet of a session flows through the same processor instance, which
/// is what gives a session its total event order.
pub struct Processor<T> {
    state: State<T>,
    transport: Transport,
    decoder: Decoder,
    bytes: BytesMut,
}

impl<T> Processor<T>
where
    T: Observer + Clone + 'static,
{
    pub(crate) fn new(
        service: &Service<T>,
        server_id: u8,
        interface: SocketAddr,
        transport: Transport,
    ) -> Self {
        Self {
            state: State {
                config: service.get_config().clone(),
                manager: service.get_session_manager().clone(),
                handler: service.get_handler().clone(),
                other_address: None,
                server_id,
                interface,
            },
            bytes: BytesMut::with_capacity(4096),
            decoder: Decoder::default(),
            transport,
        }
    }

    /// The endpoint CHANGE-REQUEST answers may leave from, advertised
    /// as OTHER-ADDRESS. Only the primary RFC 5780 listeners have one.
    pub fn set_other_address(&mut self, address: Option<SocketAddr>) {
        self.state.other_address = address;
    }

    /// Route one packet from the client.
    ///
    /// `Ok(None)` means the packet was consumed without any output:
    /// indications towards unauthorised peers, unbound channel data and
    /// responses from clients all land there.
    pub async fn route<'a, 'b: 'a>(
        &'b mut self,
        bytes: &'b [u8],
        source: SocketAddr,
    ) -> Result<Option<Output<'a>>, codec::Error> {
        let id = Identifier {
            interface: self.state.interface,
            transport: self.transport,
            source,
        };

        let message = match self.decoder.decode(bytes) {
            Ok(DecodeResult::ChannelData(frame)) => {
                return Ok(indication::channel_data(
                    Request {
                        state: &self.state,
                        bytes: &mut self.bytes,
                        message: &frame,
                        id,
                    },
                    bytes,
                ));
            }
            Ok(DecodeResult::Message(message)) => message,
            Err(e) => {
                // A malformed message still gets a 400 when the header
                // was intact enough to name a transaction.
                return Ok(malformed_reply(&mut self.bytes, bytes, e));
            }
        };

        let method = message.method();

        // Sessions under mobility may resume from a fresh 5-tuple; the
        // ticket re-homes the old session before anything else looks it
        // up.
        if self.state.config.flags.mobility
            && method.is_request()
            && self.state.manager.session_id(&id).is_none()
        {
            if let Some(ticket) = message.get::<MobilityTicket>() {
                if let Ok(ticket) = ticket.try_into().map(u64::from_be_bytes) {
                    self.state.manager.mobility_rebind(ticket, id);
                }
            }
        }

        let req = Request {
            state: &self.state,
            bytes: &mut self.bytes,
            message: &message,
            id,
        };

        // Unknown comprehension-required attributes poison any request.
        if method.is_request() && !message.unknown_attributes().is_empty() {
            return Ok(unknown_attributes_reply(req));
        }

        // A pure STUN deployment refuses to relay.
        if self.state.config.flags.stun_only
            && method.is_request()
            && method != BINDING_REQUEST
        {
            return Ok(reject(req, ErrorType::Forbidden));
        }

        Ok(match method {
            BINDING_REQUEST => binding::process(req).await,
            ALLOCATE_REQUEST => allocate::process(req).await,
            CREATE_PERMISSION_REQUEST => create_permission::process(req).await,
            CHANNEL_BIND_REQUEST => channel_bind::process(req).await,
            REFRESH_REQUEST => refresh::process(req).await,
            CONNECT_REQUEST => connect::process(req).await,
            CONNECTION_BIND_REQUEST => connect::process_bind(req).await,
            SEND_INDICATION => indication::send(req),
            _ => None,
        })
    }
}

impl<T> Service<T>
where
    T: Observer + Clone + 'static,
{
    /// The deferred answer to a Connect request, built once the peer
    /// leg finished. Success carries the CONNECTION-ID, failure a 447.
    pub fn connect_response(
        &self,
        id: &Identifier,
        connection: u32,
        ok: bool,
        bytes: &mut BytesMut,
    ) -> Option<Method> {
        let manager = self.get_session_manager();
        let transaction = manager.complete_tcp_connect(id, connection, ok)?;
        let password = manager.cached_password(id);

        let method = if ok { CONNECT_RESPONSE } else { CONNECT_ERROR };

        {
            let mut message = MessageEncoder::new(method, &transaction, bytes);
            if ok {
                message.append::<ConnectionId>(connection);
            } else {
                message.append::<ErrorCode>(ErrorCode::from(ErrorType::ConnectionTimeoutOrFailure));
            }

            message.flush(password.as_ref()).ok()?;
        }

        Some(method)
    }

    /// The ConnectionAttempt indication announcing a peer-initiated
    /// connection to the client's control session.
    pub fn connection_attempt(
        &self,
        connection: u32,
        peer: SocketAddr,
        bytes: &mut BytesMut,
    ) -> Option<()> {
        let mut transaction = [0u8; 12];
        rand::rng().fill(&mut transaction);

        {
            let mut message =
                MessageEncoder::new(CONNECTION_ATTEMPT_INDICATION, &transaction, bytes);
            message.append::<ConnectionId>(connection);
            message.append::<XorPeerAddress>(peer);
            message.flush(None).ok()?;
        }

        Some(())
    }
}

/// An error response; 401 and 438 under a long-term mechanism carry the
/// challenge attributes.
pub(crate) fn reject<'a, T>(
    req: Request<'_, 'a, T, Message<'_>>,
    error: ErrorType,
) -> Option<Output<'a>>
where
    T: Observer + 'static,
{
    let method = req.message.method().error()?;

    {
        let mut message = MessageEncoder::extend(method, req.message, req.bytes);
        message.append::<ErrorCode>(ErrorCode::from(error));

        if req.state.config.credentials.is_long_term()
            && matches!(error, ErrorType::Unauthorized | ErrorType::StaleNonce)
        {
            let nonce = req.state.manager.get_nonce(&req.id);
            message.append::<Nonce>(&nonce);
            message.append::<Realm>(&req.state.config.realm);
        }

        message.flush(None).ok()?;
    }

    Some(Output::Response(Response {
        reply: Reply::default(),
        bytes: req.bytes,
        method,
    }))
}

fn unknown_attributes_reply<'a, T>(req: Request<'_, 'a, T, Message<'_>>) -> Option<Output<'a>> {
    let method = req.message.method().error()?;
    let unknowns = req.message.unknown_attributes().to_vec();

    {
        let mut message = MessageEncoder::extend(method, req.message, req.bytes);
        message.append::<ErrorCode>(ErrorCode::from(ErrorType::UnknownAttribute));
        message.append::<UnknownAttributes>(unknowns);
        message.flush(None).ok()?;
    }

    Some(Output::Response(Response {
        reply: Reply::default(),
        bytes: req.bytes,
        method,
    }))
}

/// The 400 for a message whose attributes failed to parse but whose
/// header still names a method and transaction.
fn malformed_reply<'a>(
    bytes: &'a mut BytesMut,
    input: &[u8],
    error: codec::Error,
) -> Option<Output<'a>> {
    log::trace!("malformed packet: {:?}", error);

    if input.len() < 20 || input[0] >> 6 != 0 {
        return None;
    }

    let method = Method::try_from(u16::from_be_bytes([input[0], input[1]])).ok()?;
    if !method.is_request() {
        return None;
    }

    let error_method = method.error()?;
    let mut transaction = [0u8; 12];
    transaction.copy_from_slice(&input[8..20]);

    {
        let mut message = MessageEncoder::new(error_method, &transaction, bytes);
        message.append::<ErrorCode>(ErrorCode::from(ErrorType::BadRequest));
        message.flush(None).ok()?;
    }

    Some(Output::Response(Response {
        reply: Reply::default(),
        method: error_method,
        bytes,
    }))
}

/// The authentication pipeline shared by every request handler.
///
/// `Ok(None)` is the no-auth mechanism: the request proceeds unsigned.
/// `Ok(Some(password))` is a verified request; the response is signed
/// with the same key. `Err` carries the error code for the reply, and
/// the challenge attributes ride along via [`reject`].
pub(crate) async fn credentials<T>(
    req: &Request<'_, '_, T, Message<'_>>,
) -> Result<Option<Password>, ErrorType>
where
    T: Observer + 'static,
{
    req.state.manager.touch(&req.id);

    if req.state.config.credentials.is_none() {
        return Ok(None);
    }

    // Absent integrity is 401, a failing one 441.
    let has_integrity = req.message.get::<MessageIntegrity>().is_some()
        || req.message.get::<MessageIntegritySha256>().is_some();
    if !has_integrity {
        return Err(ErrorType::Unauthorized);
    }

    let username = req.message.get::<UserName>().ok_or(ErrorType::Unauthorized)?;

    // The challenge is re-validated on every request: a bound key does
    // not excuse a stale nonce.
    if req.state.config.credentials.is_long_term() {
        check_challenge(req)?;
    }

    if let Some(password) = req.state.manager.cached_password(&req.id) {
        return match req.message.checksum(&password) {
            Ok(()) => Ok(Some(password)),
            Err(_) => Err(ErrorType::WrongCredentials),
        };
    }

    let algorithm = if req.message.get::<MessageIntegritySha256>().is_some() {
        PasswordAlgorithm::Sha256
    } else {
        PasswordAlgorithm::Md5
    };

    match &req.state.config.credentials {
        Credentials::NoAuth => Ok(None),
        Credentials::ShortTerm => {
            // RFC 5389 10.1: the password is the HMAC key, no REALM and
            // no NONCE are involved.
            let password = match req.state.handler.get_credential(username).await {
                Some(Credential::Password(it)) => Password::Raw(it.into_bytes()),
                Some(Credential::Key(it)) => Password::Raw(it.to_vec()),
                None => return Err(ErrorType::Unauthorized),
            };

            req.message
                .checksum(&password)
                .map_err(|_| ErrorType::WrongCredentials)?;

            req.state.manager.bind_key(&req.id, username, password.clone());
            Ok(Some(password))
        }
        Credentials::LongTerm => {
            let password = match req.state.handler.get_credential(username).await {
                Some(Credential::Password(it)) => generate_password(
                    username,
                    &it,
                    &req.state.config.realm,
                    algorithm,
                ),
                Some(Credential::Key(it)) => Password::Md5(it),
                None => return Err(ErrorType::Unauthorized),
            };

            req.message
                .checksum(&password)
                .map_err(|_| ErrorType::WrongCredentials)?;

            req.state.manager.bind_key(&req.id, username, password.clone());
            Ok(Some(password))
        }
        Credentials::TimedSecret { secrets, separator } => {
            // Several shared secrets may be live at once; any whose
            // derived key passes the integrity check accepts.
            let candidates =
                timed_secret_candidates(secrets, *separator, username, &req.state.config.realm)
                    .ok_or(ErrorType::Unauthorized)?;

            for password in candidates {
                if req.message.checksum(&password).is_ok() {
                    req.state.manager.bind_key(&req.id, username, password.clone());
                    return Ok(Some(password));
                }
            }

            Err(ErrorType::WrongCredentials)
        }
    }
}

/// The REALM/NONCE handshake of the long-term mechanisms.
fn check_challenge<T>(req: &Request<'_, '_, T, Message<'_>>) -> Result<(), ErrorType>
where
    T: Observer + 'static,
{
    let realm = req.message.get::<Realm>().ok_or(ErrorType::Unauthorized)?;
    if realm != req.state.config.realm {
        return Err(ErrorType::Unauthorized);
    }

    let nonce = req.message.get::<Nonce>().ok_or(ErrorType::Unauthorized)?;
    if !req.state.manager.check_nonce(&req.id, nonce) {
        return Err(ErrorType::StaleNonce);
    }

    Ok(())
}
