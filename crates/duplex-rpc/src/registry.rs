//! The method registry: method names mapped to type-erased handlers, with a
//! type-safe registration wrapper.

use std::collections::HashMap;
use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::msg::{Message, Response};

/// A type-erased method handler: raw message in, response out.
pub type RpcHandler =
    Box<dyn Fn(CancellationToken, Message) -> BoxFuture<'static, Response<JsonValue>> + Send + Sync>;

/// A mapping from method names to handlers.
///
/// Mutate it before the owning endpoint starts serving; once serving it is
/// read-only by convention.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, RpcHandler>,
}

impl MethodRegistry {
    /// Creates an empty registry.
    pub fn new() -> MethodRegistry {
        MethodRegistry::default()
    }

    /// Registers a typed handler for `method`.
    ///
    /// The adapter projects the raw message into the handler's parameter
    /// type (absent params decode as the type's default; a failed projection
    /// answers with `Invalid params`), converts a returned domain error into
    /// an error response preserving the request id, and otherwise builds a
    /// success response from the returned result.
    pub fn register<P, R, F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        P: DeserializeOwned + Default + Send + 'static,
        R: Serialize + 'static,
        F: Fn(CancellationToken, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
    {
        let adapted = move |ctx: CancellationToken, msg: Message| {
            let id = msg.request_id();
            match msg.to_request::<P>() {
                Err(err) => {
                    let response = Error::invalid_params()
                        .with_data(err.to_string())
                        .to_response(id);
                    futures::future::ready(response).boxed()
                }
                Ok(req) => {
                    let fut = handler(ctx, req.params);
                    async move {
                        match fut.await {
                            Ok(result) => match serde_json::to_value(result) {
                                Ok(value) => Response::success(id, value),
                                Err(err) => Error::internal_error()
                                    .with_data(err.to_string())
                                    .to_response(id),
                            },
                            Err(err) => err.to_response(id),
                        }
                    }
                    .boxed()
                }
            }
        };
        self.handlers.insert(method.into(), Box::new(adapted));
    }

    /// Dispatches a raw message to its handler.
    ///
    /// A non-request answers with `Invalid Request`; an unknown method with
    /// `Method not found`. Notifications run through the same path; the
    /// caller discards their response.
    pub fn dispatch(
        &self,
        ctx: CancellationToken,
        msg: Message,
    ) -> BoxFuture<'static, Response<JsonValue>> {
        if !msg.is_request() {
            let response = Error::invalid_request()
                .with_data("not a request")
                .to_response(msg.request_id());
            return futures::future::ready(response).boxed();
        }
        let Some(handler) = self.handlers.get(&msg.method) else {
            let response = Error::method_not_found().to_response(msg.request_id());
            return futures::future::ready(response).boxed();
        };
        handler(ctx, msg)
    }

    /// The registered method names, in no particular order.
    pub fn methods(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// The number of registered methods.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no methods are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: i64, method: &str, params: &str) -> Message {
        Message {
            jsonrpc: "2.0".to_owned(),
            id: Some(id.into()),
            method: method.to_owned(),
            params: Some(serde_json::value::to_raw_value(params).unwrap()),
            ..Message::default()
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut reg = MethodRegistry::new();
        reg.register("test", |_ctx, data: String| async move {
            Ok::<_, Error>(format!("hello {data}"))
        });

        let response = reg
            .dispatch(CancellationToken::new(), request(1, "test", "world"))
            .await;
        assert_eq!(response.result, Some("hello world".into()));
        assert_eq!(response.id, Some(1i64.into()));
    }

    #[tokio::test]
    async fn unknown_method_answers_method_not_found() {
        let reg = MethodRegistry::new();
        let response = reg
            .dispatch(CancellationToken::new(), request(1, "missing", "x"))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, -32601);
        assert_eq!(error.message, "Method not found");
    }

    #[tokio::test]
    async fn non_request_answers_invalid_request() {
        let reg = MethodRegistry::new();
        let response = reg
            .dispatch(CancellationToken::new(), Message::default())
            .await;
        assert_eq!(response.error.unwrap().code, -32600);
    }

    #[tokio::test]
    async fn bad_params_answer_invalid_params() {
        let mut reg = MethodRegistry::new();
        reg.register("test", |_ctx, n: u32| async move { Ok::<_, Error>(n + 1) });

        let response = reg
            .dispatch(CancellationToken::new(), request(1, "test", "not a number"))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, -32602);
        assert_eq!(response.id, Some(1i64.into()));
    }

    #[tokio::test]
    async fn handler_error_keeps_request_id() {
        let mut reg = MethodRegistry::new();
        reg.register("test", |_ctx, _: String| async move {
            Err::<String, _>(Error::internal_error())
        });

        let response = reg
            .dispatch(CancellationToken::new(), request(7, "test", "x"))
            .await;
        assert_eq!(response.id, Some(7i64.into()));
        assert_eq!(response.error.unwrap().code, -32603);
    }

    #[tokio::test]
    async fn absent_params_decode_as_default() {
        let mut reg = MethodRegistry::new();
        reg.register("test", |_ctx, data: String| async move {
            Ok::<_, Error>(data.is_empty())
        });

        let msg = Message {
            jsonrpc: "2.0".to_owned(),
            id: Some(1i64.into()),
            method: "test".to_owned(),
            ..Message::default()
        };
        let response = reg.dispatch(CancellationToken::new(), msg).await;
        assert_eq!(response.result, Some(true.into()));
    }

    #[test]
    fn lists_methods() {
        let mut reg = MethodRegistry::new();
        assert!(reg.is_empty());
        reg.register("test", |_ctx, data: String| async move {
            Ok::<_, Error>(data)
        });
        assert_eq!(reg.methods(), vec!["test".to_owned()]);
        assert_eq!(reg.len(), 1);
    }
}
