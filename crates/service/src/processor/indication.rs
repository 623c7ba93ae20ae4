use codec::{
    channel_data::ChannelData,
    message::{
        Message,
        attributes::{Data, XorPeerAddress},
    },
};

use crate::Observer;

use super::{Output, Request};

/// [RFC5766](https://tools.ietf.org/html/rfc5766#section-10.2)
///
/// When the server receives a Send indication, the message is first
/// checked for validity.  The Send indication MUST contain both an
/// XOR-PEER-ADDRESS attribute and a DATA attribute.  If one of these
/// attributes is missing or invalid, then the message is discarded.
///
/// The server also checks that there is a permission installed for the
/// IP address contained in the XOR-PEER-ADDRESS attribute.  If no such
/// permission exists, the message is discarded.  Note that a Send
/// indication never causes the server to refresh the permission.
///
/// Indications are not authenticated and never answered; every failure
/// here is a silent drop. The same applies to the per-session bandwidth
/// cap: data over the budget vanishes without an error response, the
/// indication being a best-effort transport.
pub(crate) fn send<'a, T>(req: Request<'_, 'a, T, Message<'a>>) -> Option<Output<'a>>
where
    T: Observer + 'static,
{
    let peer = req.message.get::<XorPeerAddress>()?;
    let data = req.message.get::<Data>()?;

    let relay = req.state.manager.send_target(&req.id, &peer)?;

    if !req.state.manager.consume_bandwidth(&req.id, data.len()) {
        return None;
    }

    Some(Output::RelayToPeer {
        bytes: data,
        relay,
        peer,
    })
}

/// If the ChannelData message is received on a channel that is not
/// bound to any peer, then the message is silently discarded.
///
/// On the server, the receipt of a ChannelData message MUST NOT refresh
/// either the channel binding or the permission towards the peer.
///
/// Note that if the Length field in the ChannelData message is 0, then
/// there will be no data in the UDP datagram, but the UDP datagram is
/// still formed and sent.
pub(crate) fn channel_data<'a, T>(
    req: Request<'_, 'a, T, ChannelData<'_>>,
    bytes: &'a [u8],
) -> Option<Output<'a>>
where
    T: Observer + 'static,
{
    let (peer, relay) = req
        .state
        .manager
        .channel_target(&req.id, req.message.number())?;

    let size = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let payload = &bytes[4..4 + size];

    if !req.state.manager.consume_bandwidth(&req.id, payload.len()) {
        return None;
    }

    Some(Output::RelayToPeer {
        bytes: payload,
        relay,
        peer,
    })
}
