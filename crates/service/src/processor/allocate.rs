use codec::message::{
    Message, MessageEncoder,
    attributes::{
        AdditionalAddressFamily, AddressFamily, AlternateServer, ErrorCode, ErrorType, EvenPort,
        Lifetime, MobilityTicket, RequestedAddressFamily, RequestedTransport, ReservationToken,
        Software, TRANSPORT_TCP, TRANSPORT_UDP, XorMappedAddress, XorRelayedAddress,
    },
    methods::{ALLOCATE_ERROR, ALLOCATE_RESPONSE},
};

use crate::{Observer, RelayKind, Transport, session::AllocateRequest};

use super::{Output, Reply, Request, Response, credentials, reject};

/// [RFC5766](https://tools.ietf.org/html/rfc5766#section-6.2)
///
/// In all cases, the server SHOULD only allocate ports from the range
/// 49152 - 65535 (the Dynamic and/or Private Port range), unless the
/// TURN server application knows, through some means not specified
/// here, that other applications running on the same host as the TURN
/// server application will not be impacted by allocating ports outside
/// this range.  In any case, the TURN server SHOULD NOT allocate ports
/// in the range 0 - 1023 (the Well-Known Port range) to discourage
/// clients from using TURN to run standard services.
///
/// The request is checked in the order the RFC prescribes: transport,
/// the EVEN-PORT / RESERVATION-TOKEN interplay, the requested address
/// family, then quotas and the port pool inside the session manager.
/// RFC 6062 mode swaps the relay UDP socket for a TCP listener.
pub(crate) async fn process<'a, T>(req: Request<'_, 'a, T, Message<'_>>) -> Option<Output<'a>>
where
    T: Observer + Clone + 'static,
{
    let auth = credentials(&req).await;
    let password = match auth {
        Ok(it) => it,
        Err(e) => return reject(req, e),
    };

    // A redirect target is configured: every allocation is answered
    // 300 and the client is expected to move there.
    let alternate = match req.id.transport {
        Transport::Tls => req
            .state
            .config
            .tls_alternate_server
            .or(req.state.config.alternate_server),
        _ => req.state.config.alternate_server,
    };

    if let Some(alternate) = alternate {
        {
            let mut message = MessageEncoder::extend(ALLOCATE_ERROR, req.message, req.bytes);
            message.append::<ErrorCode>(ErrorCode::from(ErrorType::TryAlternate));
            message.append::<AlternateServer>(alternate);
            message.flush(password.as_ref()).ok()?;
        }

        return Some(Output::Response(Response {
            method: ALLOCATE_ERROR,
            reply: Reply::default(),
            bytes: req.bytes,
        }));
    }

    let kind = match req.message.get::<RequestedTransport>() {
        Some(TRANSPORT_UDP) => RelayKind::Udp,
        Some(TRANSPORT_TCP) => RelayKind::Tcp,
        Some(_) => return reject(req, ErrorType::UnsupportedTransportProtocol),
        None => return reject(req, ErrorType::BadRequest),
    };

    match kind {
        RelayKind::Udp if req.state.config.flags.no_udp_relay => {
            return reject(req, ErrorType::UnsupportedTransportProtocol);
        }
        // An RFC 6062 relay requires a stream-transport control
        // connection and the tcp relay to be enabled.
        RelayKind::Tcp
            if req.state.config.flags.no_tcp_relay || !req.id.transport.is_stream() =>
        {
            return reject(req, ErrorType::UnsupportedTransportProtocol);
        }
        _ => {}
    }

    let even_port = req.message.get::<EvenPort>();
    let token = req.message.get::<ReservationToken>();
    let family = req.message.get::<RequestedAddressFamily>();

    // RFC 5766 6.2: EVEN-PORT with RESERVATION-TOKEN is malformed;
    // RFC 6156 4.1: so is REQUESTED-ADDRESS-FAMILY with a token.
    if token.is_some() && (even_port.is_some() || family.is_some()) {
        return reject(req, ErrorType::BadRequest);
    }

    // Dual-family allocations are not offered.
    if req.message.get::<AdditionalAddressFamily>().is_some() {
        return reject(req, ErrorType::AddressFamilyNotSupported);
    }

    let grant = match req.state.manager.create_allocation(
        &req.id,
        AllocateRequest {
            family: family.unwrap_or(AddressFamily::V4),
            lifetime: req.message.get::<Lifetime>(),
            even_port,
            token,
            kind,
        },
    ) {
        Ok(it) => it,
        Err(e) => return reject(req, e),
    };

    // The session manager reserved the endpoint; the I/O layer now has
    // to bring the socket up before the response promises it.
    if !req
        .state
        .handler
        .relay_bound(&req.id, grant.relay, kind)
        .await
    {
        req.state.manager.abort_allocation(&req.id);
        return reject(req, ErrorType::InsufficientCapacity);
    }

    req.state.manager.validate_allocation(&req.id);

    let username = req.state.manager.username(&req.id).unwrap_or_default();
    req.state
        .handler
        .on_allocated(&req.id, &username, grant.relay.port());

    {
        let mut message = MessageEncoder::extend(ALLOCATE_RESPONSE, req.message, req.bytes);
        message.append::<XorRelayedAddress>(req.state.config.map_external(grant.relay));
        message.append::<XorMappedAddress>(req.id.source);
        message.append::<Lifetime>(grant.lifetime);
        if let Some(reservation) = grant.reservation {
            message.append::<ReservationToken>(reservation);
        }
        if let Some(ticket) = grant.mobility_ticket {
            message.append::<MobilityTicket>(&ticket.to_be_bytes());
        }
        message.append::<Software>(&req.state.config.software);
        message.flush(password.as_ref()).ok()?;
    }

    Some(Output::Response(Response {
        method: ALLOCATE_RESPONSE,
        reply: Reply::default(),
        bytes: req.bytes,
    }))
}
