use codec::message::{
    Message,
    MessageEncoder,
    attributes::{
        CHANGE_IP, CHANGE_PORT, ChangeRequest, MappedAddress, OtherAddress, ResponsePort,
        ResponseOrigin, Software, XorMappedAddress,
    },
    methods::BINDING_RESPONSE,
};

use crate::Observer;

use super::{Output, Reply, Request, Response, credentials, reject};

/// [RFC8489](https://tools.ietf.org/html/rfc8489)
///
/// In the Binding request/response transaction, a Binding request is
/// sent from a STUN client to a STUN server.  As the Binding request
/// message passes through a NAT, the NAT will modify the source
/// transport address of the packet.  The STUN server copies that source
/// transport address into an XOR-MAPPED-ADDRESS attribute in the STUN
/// Binding response and sends the Binding response back to the STUN
/// client.  As this packet passes back through a NAT, the NAT will
/// modify the destination transport address in the IP header, but the
/// transport address in the XOR-MAPPED-ADDRESS attribute within the
/// body of the STUN response will remain untouched.  In this way, the
/// client can learn its reflexive transport address allocated by the
/// outermost NAT with respect to the STUN server.
///
/// The RFC 5780 additions ride on the same request: CHANGE-REQUEST
/// picks the answering endpoint, RESPONSE-PORT the answering port, and
/// OTHER-ADDRESS advertises what a CHANGE-REQUEST could ask for.
pub(crate) async fn process<'a, T>(req: Request<'_, 'a, T, Message<'_>>) -> Option<Output<'a>>
where
    T: Observer + 'static,
{
    // Binding is normally anonymous; `secure-stun` drags it through the
    // same credential pipeline as everything else.
    let mut password = None;
    if req.state.config.flags.secure_stun {
        let auth = credentials(&req).await;
        password = match auth {
            Ok(it) => it,
            Err(e) => return reject(req, e),
        };
    }

    let change = req.message.get::<ChangeRequest>().unwrap_or(0);
    let reply = Reply {
        change_ip: change & CHANGE_IP != 0,
        change_port: change & CHANGE_PORT != 0,
        port: req.message.get::<ResponsePort>(),
    };

    {
        let mut message = MessageEncoder::extend(BINDING_RESPONSE, req.message, req.bytes);
        message.append::<XorMappedAddress>(req.id.source);
        message.append::<MappedAddress>(req.id.source);
        message.append::<ResponseOrigin>(req.state.interface);
        if let Some(other) = req.state.other_address {
            message.append::<OtherAddress>(other);
        }
        message.append::<Software>(&req.state.config.software);
        message.flush(password.as_ref()).ok()?;
    }

    Some(Output::Response(Response {
        method: BINDING_RESPONSE,
        bytes: req.bytes,
        reply,
    }))
}
