use codec::message::{
    Message, MessageEncoder,
    attributes::Lifetime,
    methods::REFRESH_RESPONSE,
};

use crate::Observer;

use super::{Output, Reply, Request, Response, credentials, reject};

/// The server computes a value called the "desired lifetime" as
/// follows: if the request contains a LIFETIME attribute and the
/// attribute value is zero, then the "desired lifetime" is zero.
/// Otherwise, if the request contains a LIFETIME attribute, then the
/// server computes the minimum of the client's requested lifetime and
/// the server's maximum allowed lifetime.  If this computed value is
/// greater than the default lifetime, then the "desired lifetime" is
/// the computed value.  Otherwise, the "desired lifetime" is the
/// default lifetime.
///
/// * If the "desired lifetime" is zero, then the request succeeds and
///   the allocation is deleted.
///
/// * If the "desired lifetime" is non-zero, then the request succeeds
///   and the allocation's time-to-expiry is set to the "desired
///   lifetime".
///
/// The deletion happens before the response goes out, and the response
/// is still a success.
pub(crate) async fn process<'a, T>(req: Request<'_, 'a, T, Message<'_>>) -> Option<Output<'a>>
where
    T: Observer + 'static,
{
    let auth = credentials(&req).await;
    let password = match auth {
        Ok(it) => it,
        Err(e) => return reject(req, e),
    };

    let lifetime = req.message.get::<Lifetime>();
    let username = req.state.manager.username(&req.id).unwrap_or_default();

    let granted = match req.state.manager.refresh(&req.id, lifetime.unwrap_or(600)) {
        Ok(it) => it,
        Err(e) => return reject(req, e),
    };

    req.state.handler.on_refresh(&req.id, &username, granted);

    {
        let mut message = MessageEncoder::extend(REFRESH_RESPONSE, req.message, req.bytes);
        message.append::<Lifetime>(granted);
        message.flush(password.as_ref()).ok()?;
    }

    Some(Output::Response(Response {
        method: REFRESH_RESPONSE,
        reply: Reply::default(),
        bytes: req.bytes,
    }))
}
