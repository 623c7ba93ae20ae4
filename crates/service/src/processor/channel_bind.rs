use codec::message::{
    Message, MessageEncoder,
    attributes::{ChannelNumber, ErrorType, XorPeerAddress},
    methods::CHANNEL_BIND_RESPONSE,
};

use crate::Observer;

use super::{Output, Reply, Request, Response, credentials, reject};

/// [RFC5766](https://tools.ietf.org/html/rfc5766#section-11.2)
///
/// If the server can satisfy the request, then the server creates or
/// refreshes the channel binding using the channel number in the
/// CHANNEL-NUMBER attribute and the transport address in the XOR-PEER-
/// ADDRESS attribute.  The server also installs or refreshes a
/// permission for the IP address in the XOR-PEER-ADDRESS attribute.
///
/// The channel number must lie in [0x4000, 0x7FFF], and a number or a
/// peer address already bound to a different counterpart is a 400.
///
/// NOTE: A server need not do anything special to implement
/// idempotency of ChannelBind requests over UDP using the
/// "stateless stack approach".  Retransmitted ChannelBind requests
/// will simply refresh the channel binding and the corresponding
/// permission.  Furthermore, the client must wait 5 minutes before
/// binding a previously bound channel number or peer address to a
/// different channel, eliminating the possibility that the
/// transaction would initially fail but succeed on a
/// retransmission.
pub(crate) async fn process<'a, T>(req: Request<'_, 'a, T, Message<'_>>) -> Option<Output<'a>>
where
    T: Observer + 'static,
{
    let auth = credentials(&req).await;
    let password = match auth {
        Ok(it) => it,
        Err(e) => return reject(req, e),
    };

    let Some(number) = req.message.get::<ChannelNumber>() else {
        return reject(req, ErrorType::BadRequest);
    };

    let Some(peer) = req.message.get::<XorPeerAddress>() else {
        return reject(req, ErrorType::BadRequest);
    };

    if let Some(error) = req.verify_peer(&peer) {
        return reject(req, error);
    }

    if let Err(e) = req.state.manager.bind_channel(&req.id, number, peer) {
        return reject(req, e);
    }

    let username = req.state.manager.username(&req.id).unwrap_or_default();
    req.state.handler.on_channel_bind(&req.id, &username, number);

    {
        MessageEncoder::extend(CHANNEL_BIND_RESPONSE, req.message, req.bytes)
            .flush(password.as_ref())
            .ok()?;
    }

    Some(Output::Response(Response {
        method: CHANNEL_BIND_RESPONSE,
        reply: Reply::default(),
        bytes: req.bytes,
    }))
}
