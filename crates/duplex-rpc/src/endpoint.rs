//! The stream endpoint: both client and server over one framed object
//! stream.
//!
//! A background task reads envelopes, dispatches server-side requests,
//! correlates responses to outstanding client requests, and serializes all
//! concurrent writes on one mutex. Peer misbehavior is logged and dropped;
//! it never kills the connection.

use std::io;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::client::EndpointClient;
use crate::codec::{FramedReader, FramedStream, FramedWriter};
use crate::error::{EndpointError, Error};
use crate::msg::{Envelope, Message, MessageKind, Response};
use crate::pending::{PendingSlot, PendingTable};
use crate::registry::MethodRegistry;

/// A duplex JSON-RPC 2.0 endpoint over a framed object stream, usually
/// carried by a TCP or stdio transport.
///
/// The endpoint is a cheaply cloneable handle; all clones share one
/// connection. It is closed exactly once, by [`close`](Self::close) or by
/// the background reader observing an error or end of stream.
#[derive(Clone)]
pub struct StreamEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    /// Guards all outgoing I/O; taken (`None`) once closed.
    writer: tokio::sync::Mutex<Option<FramedWriter>>,
    /// Pending client requests and the closed flag.
    pending: PendingTable,
    methods: RwLock<MethodRegistry>,
    /// Child of the caller's context; cancelled on close to stop the
    /// reader.
    cancel: CancellationToken,
    /// Cancelled exactly once when the endpoint closes, and stays so.
    close_notify: CancellationToken,
}

impl StreamEndpoint {
    /// Attaches to a stream and spawns the background reader.
    ///
    /// Cancelling `ctx` stops the reader and closes the endpoint.
    pub fn new(ctx: &CancellationToken, stream: FramedStream) -> StreamEndpoint {
        let (reader, writer) = stream.into_split();
        let inner = Arc::new(EndpointInner {
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: PendingTable::new(),
            methods: RwLock::new(MethodRegistry::new()),
            cancel: ctx.child_token(),
            close_notify: CancellationToken::new(),
        });
        tokio::spawn(read_loop(inner.clone(), reader));
        StreamEndpoint { inner }
    }

    /// Registers a typed handler for `method`.
    ///
    /// Registration should happen before the peer starts calling; methods
    /// registered later are picked up, but in-flight envelopes may already
    /// have answered `Method not found`.
    pub fn register<P, R, F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        P: serde::de::DeserializeOwned + Default + Send + 'static,
        R: Serialize + 'static,
        F: Fn(CancellationToken, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
    {
        self.inner.methods.write().register(method, handler);
    }

    /// The registered method names.
    pub fn methods(&self) -> Vec<String> {
        self.inner.methods.read().methods()
    }

    /// Whether the endpoint has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.pending.is_closed()
    }

    /// A token that is cancelled when the endpoint closes and remains
    /// observable forever after.
    pub fn on_close(&self) -> CancellationToken {
        self.inner.close_notify.clone()
    }

    /// Closes the endpoint: wakes every pending awaiter, fires the close
    /// notification, and shuts the stream down.
    ///
    /// Idempotent; the second and later calls return
    /// [`EndpointError::StreamClosed`].
    pub async fn close(&self) -> Result<(), EndpointError> {
        self.inner.close(None).await
    }
}

impl EndpointClient for StreamEndpoint {
    async fn write_object<T: Serialize + Sync + ?Sized>(
        &self,
        obj: &T,
    ) -> Result<(), EndpointError> {
        self.inner.write_object(obj).await
    }

    fn register_pending(
        &self,
        id: crate::msg::RequestId,
    ) -> Result<PendingSlot, EndpointError> {
        self.inner.pending.register(id)
    }

    fn is_closed(&self) -> bool {
        StreamEndpoint::is_closed(self)
    }
}

impl EndpointInner {
    async fn write_object<T: Serialize + ?Sized>(&self, obj: &T) -> Result<(), EndpointError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => Ok(writer.write_object(obj).await?),
            None => Err(EndpointError::StreamClosed),
        }
    }

    /// Closes once; both the write mutex and the pending lock are held
    /// while the closed flag flips.
    async fn close(&self, cause: Option<io::Error>) -> Result<(), EndpointError> {
        let mut writer = self.writer.lock().await;
        if !self.pending.close() {
            return Err(EndpointError::StreamClosed);
        }

        match &cause {
            Some(err) if err.kind() != io::ErrorKind::UnexpectedEof => {
                log::debug!("stream closing, reason: {err}");
            }
            _ => {}
        }

        self.cancel.cancel();
        self.close_notify.cancel();
        if let Some(mut writer) = writer.take() {
            // the peer sees end of stream
            let _ = writer.shutdown().await;
        }
        Ok(())
    }
}

async fn read_loop(inner: Arc<EndpointInner>, mut reader: FramedReader) {
    let cancel = inner.cancel.clone();
    let cause = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("read loop: context cancelled");
                break None;
            }
            read = reader.read_object::<Envelope>() => match read {
                Ok(Some(envelope)) => {
                    tokio::spawn(process_envelope(inner.clone(), envelope));
                }
                Ok(None) => break None,
                Err(err) => {
                    log::debug!("read loop: error reading message: {err}");
                    break Some(err);
                }
            }
        }
    };
    let _ = inner.close(cause).await;
}

/// Processes one envelope: classify every inner message, dispatch requests
/// and notifications, deliver responses, then write the collected results
/// as one envelope under the write mutex.
async fn process_envelope(inner: Arc<EndpointInner>, envelope: Envelope) {
    let is_batch = envelope.is_batch();
    let messages = envelope.into_messages();

    let tasks = messages
        .into_iter()
        .map(|msg| handle_message(inner.clone(), msg));
    // in batch index order regardless of completion order
    let results: Vec<Response<JsonValue>> = join_all(tasks).await.into_iter().flatten().collect();

    if results.is_empty() {
        return;
    }
    let written = if is_batch {
        inner.write_object(&results).await
    } else {
        inner.write_object(&results[0]).await
    };
    if let Err(err) = written {
        log::debug!("failed to write response: {err}");
    }
}

async fn handle_message(
    inner: Arc<EndpointInner>,
    msg: Message,
) -> Option<Response<JsonValue>> {
    match msg.try_kind() {
        Ok(MessageKind::Request) => Some(dispatch(inner, msg).await),
        Ok(MessageKind::Notification) => {
            // no response for notifications, regardless of handler outcome
            let _ = dispatch(inner, msg).await;
            None
        }
        Ok(MessageKind::SuccessResponse | MessageKind::ErrorResponse) => {
            let id = msg.request_id()?;
            if !inner.pending.deliver(&id, msg) {
                log::debug!("ignoring response with no corresponding request ({id})");
            }
            None
        }
        Ok(MessageKind::Invalid) => {
            log::debug!("ignoring invalid message");
            None
        }
        Err(reason) => {
            log::debug!("ignoring invalid message: {reason}");
            None
        }
    }
}

/// Runs the handler in its own task so that a panicking handler answers
/// with an internal error instead of tearing the endpoint down.
async fn dispatch(inner: Arc<EndpointInner>, msg: Message) -> Response<JsonValue> {
    let id = msg.request_id();
    let fut = {
        let methods = inner.methods.read();
        methods.dispatch(inner.cancel.clone(), msg)
    };
    match tokio::spawn(fut).await {
        Ok(response) => response,
        Err(err) if err.is_panic() => Error::internal_error()
            .with_data("handler panicked")
            .to_response(id),
        Err(_) => Error::internal_error().to_response(id),
    }
}
