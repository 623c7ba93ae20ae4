use codec::message::{
    Message, MessageEncoder,
    attributes::{ConnectionId, ErrorType, XorPeerAddress},
    methods::CONNECTION_BIND_RESPONSE,
};

use crate::Observer;

use super::{Output, Reply, Request, Response, credentials, reject};

/// [RFC6062](https://tools.ietf.org/html/rfc6062#section-5.2)
///
/// When the server receives a Connect request, it processes the request
/// as follows.
///
/// If the request is received on a TCP connection for which no
/// allocation exists, the server MUST return a 437 (Allocation
/// Mismatch) error.
///
/// If the server is currently processing a Connect request for this
/// allocation with the same XOR-PEER-ADDRESS, it MUST return a 446
/// (Connection Already Exists) error.
///
/// Otherwise, the server MUST initiate an outgoing TCP connection.  The
/// local endpoint is the relayed transport address associated with the
/// allocation.  The remote endpoint is the one indicated by the
/// XOR-PEER-ADDRESS attribute.  If the connection attempt fails or
/// times out, the server MUST return a 447 (Connection Timeout or
/// Failure) error.  The timeout value MUST be at least 30 seconds.
///
/// The success response is deferred until the connection attempt
/// settles; this handler only creates the record and hands the attempt
/// to the I/O layer.
pub(crate) async fn process<'a, T>(req: Request<'_, 'a, T, Message<'_>>) -> Option<Output<'a>>
where
    T: Observer + 'static,
{
    let auth = credentials(&req).await;
    if let Err(e) = auth {
        return reject(req, e);
    }

    let Some(peer) = req.message.get::<XorPeerAddress>() else {
        return reject(req, ErrorType::BadRequest);
    };

    if let Some(error) = req.verify_peer(&peer) {
        return reject(req, error);
    }

    let connection = match req.state.manager.tcp_connect(
        &req.id,
        req.state.server_id,
        peer,
        req.message.token_owned(),
    ) {
        Ok(it) => it,
        Err(e) => return reject(req, e),
    };

    let username = req.state.manager.username(&req.id).unwrap_or_default();
    req.state.handler.on_connect(&req.id, &username, connection);

    Some(Output::ConnectPeer { connection, peer })
}

/// [RFC6062](https://tools.ietf.org/html/rfc6062#section-5.4)
///
/// When a server receives a ConnectionBind request, it processes the
/// request as follows.
///
/// If the client connection transport is not TCP or TLS, the server
/// MUST return a 400 (Bad Request) error.
///
/// If the request does not contain the CONNECTION-ID attribute, or if
/// this attribute does not refer to an existing pending connection, the
/// server MUST return a 400 (Bad Request) error.
///
/// Otherwise, the client connection is now called a client data
/// connection.  Data received on it MUST be sent as-is to the related
/// peer data connection.
pub(crate) async fn process_bind<'a, T>(
    req: Request<'_, 'a, T, Message<'_>>,
) -> Option<Output<'a>>
where
    T: Observer + 'static,
{
    let auth = credentials(&req).await;
    let password = match auth {
        Ok(it) => it,
        Err(e) => return reject(req, e),
    };

    if !req.id.transport.is_stream() {
        return reject(req, ErrorType::BadRequest);
    }

    let Some(connection) = req.message.get::<ConnectionId>() else {
        return reject(req, ErrorType::BadRequest);
    };

    let (owner, _peer) = match req.state.manager.tcp_connection_bind(connection) {
        Ok(it) => it,
        Err(e) => return reject(req, e),
    };

    let username = req.state.manager.username(&owner).unwrap_or_default();
    req.state
        .handler
        .on_connection_bind(&owner, &username, connection);

    {
        MessageEncoder::extend(CONNECTION_BIND_RESPONSE, req.message, req.bytes)
            .flush(password.as_ref())
            .ok()?;
    }

    Some(Output::Promote {
        method: CONNECTION_BIND_RESPONSE,
        bytes: req.bytes,
        connection,
    })
}
