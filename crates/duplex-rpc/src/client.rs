//! Client-side request helpers, shared by every endpoint that can carry
//! requests: `request`, `notify`, and `batch`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EndpointError;
use crate::msg::{Request, RequestId, Response};
use crate::pending::PendingSlot;

/// The client surface of an endpoint: the stream endpoint and the HTTP
/// client endpoint both implement it.
pub trait EndpointClient {
    /// Serializes and sends one JSON value to the peer.
    fn write_object<T: Serialize + Sync + ?Sized>(
        &self,
        obj: &T,
    ) -> impl Future<Output = Result<(), EndpointError>> + Send;

    /// Registers a single-slot wait for a response to `id`.
    ///
    /// Fails with [`EndpointError::StreamClosed`] once the endpoint is
    /// closed; the check and the registration are one atomic step.
    fn register_pending(&self, id: RequestId) -> Result<PendingSlot, EndpointError>;

    /// Whether the endpoint can no longer carry requests.
    fn is_closed(&self) -> bool;
}

fn fresh_id() -> RequestId {
    RequestId::from(Uuid::new_v4().to_string())
}

/// Calls `method` on the peer and waits for the typed response.
///
/// The call fails immediately when the endpoint is closed, and resolves as
/// soon as the first of these fires: `ctx` is cancelled, the endpoint
/// closes, or the response arrives. The pending registration is removed on
/// every exit path.
pub async fn request<C, P, R>(
    endpoint: &C,
    ctx: &CancellationToken,
    method: &str,
    params: P,
) -> Result<Response<R>, EndpointError>
where
    C: EndpointClient,
    P: Serialize + Sync,
    R: DeserializeOwned,
{
    let id = fresh_id();
    let mut slot = endpoint.register_pending(id.clone())?;

    let request = Request::new(id, method, params);
    endpoint.write_object(&request).await?;

    tokio::select! {
        _ = ctx.cancelled() => Err(EndpointError::Cancelled),
        msg = slot.recv() => match msg {
            None => Err(EndpointError::StreamClosed),
            Some(msg) => msg.to_response(),
        },
    }
}

/// Sends a notification for `method`: no id, no correlation, no reply.
///
/// An adapter reporting [`EndpointError::EmptyResponse`] counts as success,
/// since a notification expects none.
pub async fn notify<C, P>(endpoint: &C, method: &str, params: P) -> Result<(), EndpointError>
where
    C: EndpointClient,
    P: Serialize + Sync,
{
    if endpoint.is_closed() {
        return Err(EndpointError::StreamClosed);
    }
    let notification = Request::notification(method, params);
    match endpoint.write_object(&notification).await {
        Err(EndpointError::EmptyResponse) => Ok(()),
        other => other,
    }
}

/// One entry of a [`batch`] call.
#[derive(Debug, Clone)]
pub struct RequestInfo<P> {
    /// The method to call.
    pub method: String,
    /// The parameters to pass.
    pub params: P,
    /// When set, the entry is emitted as a notification and produces no
    /// response.
    pub notification: bool,
}

impl<P> RequestInfo<P> {
    /// A batch entry expecting a response.
    pub fn new(method: impl Into<String>, params: P) -> RequestInfo<P> {
        RequestInfo {
            method: method.into(),
            params,
            notification: false,
        }
    }

    /// A batch entry emitted as a notification.
    pub fn notification(method: impl Into<String>, params: P) -> RequestInfo<P> {
        RequestInfo {
            method: method.into(),
            params,
            notification: true,
        }
    }
}

/// Sends the entries as one batch array and collects the responses.
///
/// Responses are returned in the emission order of the non-notification
/// entries. Cancellation or endpoint closure during collection fails the
/// whole call; partial results are not returned.
pub async fn batch<C, P, R>(
    endpoint: &C,
    ctx: &CancellationToken,
    requests: Vec<RequestInfo<P>>,
) -> Result<Vec<Response<R>>, EndpointError>
where
    C: EndpointClient,
    P: Serialize + Sync,
    R: DeserializeOwned,
{
    let mut wire = Vec::with_capacity(requests.len());
    let mut slots = Vec::new();
    for info in requests {
        if info.notification {
            wire.push(Request::notification(info.method, info.params));
            continue;
        }
        let id = fresh_id();
        slots.push(endpoint.register_pending(id.clone())?);
        wire.push(Request::new(id, info.method, info.params));
    }

    endpoint.write_object(&wire).await?;

    let mut responses = Vec::with_capacity(slots.len());
    for slot in &mut slots {
        tokio::select! {
            _ = ctx.cancelled() => return Err(EndpointError::Cancelled),
            msg = slot.recv() => match msg {
                None => return Err(EndpointError::StreamClosed),
                Some(msg) => responses.push(msg.to_response()?),
            },
        }
    }
    Ok(responses)
}
