use std::net::IpAddr;

use codec::message::{
    Message, MessageEncoder,
    attributes::{ErrorType, XorPeerAddress},
    methods::CREATE_PERMISSION_RESPONSE,
};

use crate::Observer;

use super::{Output, Reply, Request, Response, credentials, reject};

/// [RFC5766](https://tools.ietf.org/html/rfc5766#section-9.2)
///
/// The message is checked for validity.  The CreatePermission request
/// MUST contain at least one XOR-PEER-ADDRESS attribute and MAY contain
/// multiple such attributes.  If no such attribute exists, or if any of
/// these attributes are invalid, then a 400 (Bad Request) error is
/// returned.
///
/// The server MAY impose restrictions on the IP address allowed in the
/// XOR-PEER-ADDRESS attribute; if a value is not allowed, the server
/// rejects the request with a 403 (Forbidden) error.  The validation is
/// all-or-nothing: one disallowed peer fails the whole request and no
/// permission is installed.
///
/// If the message is valid and the server is capable of carrying out
/// the request, then the server installs or refreshes a permission for
/// the IP address contained in each XOR-PEER-ADDRESS attribute.  The
/// port portion of each attribute is ignored and may be any arbitrary
/// value.
///
/// > NOTE: A server need not do anything special to implement
/// > idempotency of CreatePermission requests over UDP using the
/// > "stateless stack approach".  Retransmitted CreatePermission
/// > requests will simply refresh the permissions.
pub(crate) async fn process<'a, T>(req: Request<'_, 'a, T, Message<'_>>) -> Option<Output<'a>>
where
    T: Observer + 'static,
{
    let auth = credentials(&req).await;
    let password = match auth {
        Ok(it) => it,
        Err(e) => return reject(req, e),
    };

    let peers: Vec<_> = req.message.get_all::<XorPeerAddress>().collect();
    if peers.is_empty() {
        return reject(req, ErrorType::BadRequest);
    }

    for peer in &peers {
        if let Some(error) = req.verify_peer(peer) {
            return reject(req, error);
        }
    }

    let ips: Vec<IpAddr> = peers.iter().map(|it| it.ip()).collect();
    if let Err(e) = req.state.manager.add_permissions(&req.id, &ips) {
        return reject(req, e);
    }

    let username = req.state.manager.username(&req.id).unwrap_or_default();
    req.state
        .handler
        .on_create_permission(&req.id, &username, &ips);

    {
        MessageEncoder::extend(CREATE_PERMISSION_RESPONSE, req.message, req.bytes)
            .flush(password.as_ref())
            .ok()?;
    }

    Some(Output::Response(Response {
        method: CREATE_PERMISSION_RESPONSE,
        reply: Reply::default(),
        bytes: req.bytes,
    }))
}
