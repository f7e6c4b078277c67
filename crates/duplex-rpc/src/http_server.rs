//! The HTTP server adapter: a multiplexer mapping request paths to method
//! registries, served with the same dispatch loop as the stream endpoint.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::msg::{Envelope, MessageKind, Response};
use crate::registry::MethodRegistry;

const ACCEPTED_CONTENT_TYPES: [&str; 3] = [
    "application/json",
    "application/json-rpc",
    "application/jsonrequest",
];

/// A multiplexer from request paths to method registries.
///
/// The mux is a cheaply cloneable handle. `/` is registered on
/// construction; further paths via
/// [`register_endpoint`](Self::register_endpoint) or implicitly by
/// [`register_method`](Self::register_method).
#[derive(Clone, Default)]
pub struct ServerMux {
    endpoints: Arc<RwLock<HashMap<String, MethodRegistry>>>,
}

impl ServerMux {
    /// Creates a mux with the default `/` endpoint.
    pub fn new() -> ServerMux {
        let mux = ServerMux::default();
        mux.register_endpoint("/");
        mux
    }

    /// Registers `path` as an RPC endpoint. Registering a path twice is a
    /// no-op.
    pub fn register_endpoint(&self, path: &str) {
        let mut endpoints = self.endpoints.write();
        if !endpoints.contains_key(path) {
            endpoints.insert(path.to_owned(), MethodRegistry::new());
            log::debug!("registered new endpoint: {path}");
        }
    }

    /// Registers a typed handler for `method` under `path`, registering the
    /// path as needed.
    pub fn register_method<P, R, F, Fut>(&self, path: &str, method: impl Into<String>, handler: F)
    where
        P: serde::de::DeserializeOwned + Default + Send + 'static,
        R: serde::Serialize + 'static,
        F: Fn(CancellationToken, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
    {
        let mut endpoints = self.endpoints.write();
        endpoints
            .entry(path.to_owned())
            .or_default()
            .register(method, handler);
    }

    /// The registered paths.
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.read().keys().cloned().collect()
    }

    /// The method names registered under `path`.
    pub fn methods(&self, path: &str) -> Vec<String> {
        self.endpoints
            .read()
            .get(path)
            .map(MethodRegistry::methods)
            .unwrap_or_default()
    }

    fn has_endpoint(&self, path: &str) -> bool {
        self.endpoints.read().contains_key(path)
    }

    /// Binds `addr` and serves the mux until the returned handle shuts it
    /// down.
    pub async fn serve(&self, addr: impl tokio::net::ToSocketAddrs) -> io::Result<HttpServer> {
        type Server = hyper_util::server::conn::auto::Builder<hyper_util::rt::TokioExecutor>;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        log::info!("rpc server listening on http://{addr}");

        let mux = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let graceful = GracefulShutdown::new();
            let mut server = Server::new(hyper_util::rt::TokioExecutor::new());
            server.http1().keep_alive(true);

            loop {
                tokio::select! {
                    conn = listener.accept() => {
                        let (stream, _peer_addr) = match conn {
                            Ok(conn) => conn,
                            Err(err) => {
                                log::error!("accept error: {err}");
                                continue;
                            }
                        };
                        let mux = mux.clone();
                        let service = service_fn(move |req: Request<Incoming>| {
                            let mux = mux.clone();
                            async move { Ok::<_, Infallible>(handle(mux, req).await) }
                        });
                        let conn = server.serve_connection(TokioIo::new(stream), service);
                        let conn = graceful.watch(conn.into_owned());
                        tokio::spawn(async move {
                            if let Err(err) = conn.await {
                                log::debug!("cannot serve http: {err:?}");
                            }
                        });
                    }
                    _ = &mut shutdown_rx => {
                        log::info!("graceful shutdown signal received");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = graceful.shutdown() => {}
                _ = tokio::time::sleep(Duration::from_secs(10)) => {
                    log::info!("waited 10 seconds for graceful shutdown, aborting");
                }
            }
        });

        Ok(HttpServer {
            addr,
            shutdown_tx,
            join,
        })
    }
}

/// A running HTTP server, created by [`ServerMux::serve`].
pub struct HttpServer {
    /// The address the server is listening on.
    pub addr: SocketAddr,
    /// The sender to shut the server down.
    pub shutdown_tx: oneshot::Sender<()>,
    /// The join handle of the server task.
    pub join: tokio::task::JoinHandle<()>,
}

fn json_response(status: StatusCode, body: Vec<u8>) -> hyper::Response<Full<Bytes>> {
    hyper::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::from(Bytes::from(body)))
        .unwrap()
}

fn status_response(status: StatusCode) -> hyper::Response<Full<Bytes>> {
    hyper::Response::builder()
        .status(status)
        .body(Full::default())
        .unwrap()
}

fn error_response(status: StatusCode, err: &Error) -> hyper::Response<Full<Bytes>> {
    let body = serde_json::to_vec(&err.to_response(None)).unwrap_or_default();
    json_response(status, body)
}

async fn handle(mux: ServerMux, req: Request<Incoming>) -> hyper::Response<Full<Bytes>> {
    let path = req.uri().path().to_owned();
    if !mux.has_endpoint(&path) {
        return status_response(StatusCode::NOT_FOUND);
    }

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    if !ACCEPTED_CONTENT_TYPES.contains(&content_type.as_str()) {
        log::debug!("got request with unsupported content type: {content_type}");
        return error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            &Error::invalid_request()
                .with_data(format!("unsupported content type: {content_type}")),
        );
    }

    let content_length = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    let Some(content_length) = content_length else {
        log::debug!("got request with invalid content length");
        return error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            &Error::invalid_request().with_data("invalid content length"),
        );
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            log::debug!("failed to read request body: {err}");
            return error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                &Error::invalid_request().with_data("invalid request body"),
            );
        }
    };
    if body.len() < content_length {
        log::debug!("request body shorter than its content length");
        return error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            &Error::invalid_request().with_data("invalid request body"),
        );
    }
    let body = &body[..content_length];

    let envelope: Envelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::debug!("failed to parse request body: {err}");
            return error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                &Error::parse_error().with_data(err.to_string()),
            );
        }
    };

    let is_batch = envelope.is_batch();
    let messages = envelope.into_messages();
    if messages.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, &Error::invalid_request());
    }

    let ctx = CancellationToken::new();
    let tasks: Vec<BoxFuture<'static, Option<Response<JsonValue>>>> = {
        let endpoints = mux.endpoints.read();
        let Some(registry) = endpoints.get(&path) else {
            return status_response(StatusCode::NOT_FOUND);
        };
        messages
            .into_iter()
            .filter_map(|msg| match msg.try_kind() {
                Ok(MessageKind::Request) => {
                    let fut = registry.dispatch(ctx.clone(), msg);
                    Some(async move { Some(fut.await) }.boxed())
                }
                Ok(MessageKind::Notification) => {
                    let fut = registry.dispatch(ctx.clone(), msg);
                    Some(
                        async move {
                            let _ = fut.await;
                            None
                        }
                        .boxed(),
                    )
                }
                Ok(MessageKind::SuccessResponse | MessageKind::ErrorResponse) => {
                    log::debug!("ignoring response message");
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
            })
            .collect()
    };

    let results: Vec<Response<JsonValue>> = join_all(tasks).await.into_iter().flatten().collect();
    if results.is_empty() {
        return status_response(StatusCode::OK);
    }

    if !is_batch {
        log::debug!("sending single response");
        let status = if results[0].is_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::OK
        };
        return match serde_json::to_vec(&results[0]) {
            Ok(body) => json_response(status, body),
            Err(err) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &Error::internal_error().with_data(err.to_string()),
            ),
        };
    }

    log::debug!("sending batch response");
    // batches travel with 200 regardless of inner error status; the
    // JSON-RPC 2.0 spec is silent here
    match serde_json::to_vec(&results) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &Error::internal_error().with_data(err.to_string()),
        ),
    }
}
