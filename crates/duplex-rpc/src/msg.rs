//! Messages from and to JSON-RPC 2.0 peers.
//!
//! Incoming values are parsed into the raw [`Message`] form, which keeps
//! `params` and `result` as raw JSON so a message can be classified without
//! knowing the user's parameter or result shapes. Typed projections into
//! [`Request`] and [`Response`] happen once a handler or awaiter is resolved.

use std::fmt;

use serde::de::{self, DeserializeOwned, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use serde_json::value::RawValue;

use crate::error::{EndpointError, ErrorObj, InvalidMessage};

pub(crate) const JSONRPC_VERSION: &str = "2.0";

/// A request ID, either a string or an integer.
///
/// Both forms are preserved round-trip; `92` and `"92"` are different ids.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct RequestId(IdRepr);

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(untagged)]
enum IdRepr {
    Int(i64),
    // only reachable for values beyond i64::MAX
    UInt(u64),
    String(String),
}

impl From<i32> for RequestId {
    fn from(id: i32) -> RequestId {
        RequestId(IdRepr::Int(id.into()))
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> RequestId {
        RequestId(IdRepr::Int(id))
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> RequestId {
        RequestId(IdRepr::String(id))
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> RequestId {
        RequestId(IdRepr::String(id.to_owned()))
    }
}

impl RequestId {
    /// Extracts a request ID from a raw `id` value.
    ///
    /// Returns `None` for anything that is not a string or an integer, which
    /// is exactly the set of ids that make a response message invalid.
    pub fn from_json(id: &JsonValue) -> Option<RequestId> {
        match id {
            JsonValue::String(s) => Some(RequestId(IdRepr::String(s.clone()))),
            JsonValue::Number(n) => n
                .as_i64()
                .map(IdRepr::Int)
                .or_else(|| n.as_u64().map(IdRepr::UInt))
                .map(RequestId),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            IdRepr::Int(it) => fmt::Display::fmt(it, f),
            IdRepr::UInt(it) => fmt::Display::fmt(it, f),
            // Use debug here, to make it clear that `92` and `"92"` are
            // different ids.
            IdRepr::String(it) => fmt::Debug::fmt(it, f),
        }
    }
}

/// Marker for the `jsonrpc: "2.0"` version field of typed messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version != JSONRPC_VERSION {
            return Err(de::Error::custom(format!(
                "invalid jsonrpc version: {version}"
            )));
        }
        Ok(Version)
    }
}

/// The derived kind of a raw [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A method call expecting a response.
    Request,
    /// A method call expecting no response.
    Notification,
    /// A response carrying a result.
    SuccessResponse,
    /// A response carrying an error object.
    ErrorResponse,
    /// Anything that fits none of the above.
    Invalid,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageKind::Request => "request",
            MessageKind::Notification => "notification",
            MessageKind::SuccessResponse => "success",
            MessageKind::ErrorResponse => "error",
            MessageKind::Invalid => "invalid",
        })
    }
}

/// A raw JSON-RPC message.
///
/// `params` and `result` are deferred as raw JSON fragments; `id` is kept as
/// an arbitrary JSON value so that a malformed id classifies this one message
/// as invalid instead of failing the parse of a whole batch.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Message {
    /// The protocol version; anything but "2.0" classifies as invalid.
    #[serde(default)]
    pub jsonrpc: String,
    /// The correlation id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonValue>,
    /// The method name; empty means absent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// Raw request parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    /// Raw response result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    /// Response error object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObj>,
}

impl Message {
    /// Whether the message carries a method, i.e. is a request or
    /// notification.
    pub fn is_request(&self) -> bool {
        !self.method.is_empty()
    }

    /// Whether the message carries a result.
    pub fn is_success_response(&self) -> bool {
        self.result.is_some()
    }

    /// Whether the message carries an error object.
    pub fn is_error_response(&self) -> bool {
        self.error.is_some()
    }

    fn indicator_count(&self) -> usize {
        [
            self.is_request(),
            self.is_success_response(),
            self.is_error_response(),
        ]
        .into_iter()
        .filter(|matched| *matched)
        .count()
    }

    /// Classifies the message, reporting the reason when it is invalid.
    pub fn try_kind(&self) -> Result<MessageKind, InvalidMessage> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(InvalidMessage::Version(self.jsonrpc.clone()));
        }
        if self.indicator_count() != 1 {
            return Err(InvalidMessage::Structure);
        }
        if self.is_request() {
            return Ok(if self.id.is_some() {
                MessageKind::Request
            } else {
                MessageKind::Notification
            });
        }
        let id = self.id.as_ref().ok_or(InvalidMessage::MissingId)?;
        if RequestId::from_json(id).is_none() {
            return Err(InvalidMessage::InvalidId(id.clone()));
        }
        Ok(if self.is_success_response() {
            MessageKind::SuccessResponse
        } else {
            MessageKind::ErrorResponse
        })
    }

    /// Classifies the message, folding failures into
    /// [`MessageKind::Invalid`].
    pub fn kind(&self) -> MessageKind {
        self.try_kind().unwrap_or(MessageKind::Invalid)
    }

    /// The id as a correlation key, when it is a scalar.
    pub fn request_id(&self) -> Option<RequestId> {
        self.id.as_ref().and_then(RequestId::from_json)
    }

    /// Projects the message into a typed request.
    ///
    /// Absent `params` decode as the parameter type's default.
    pub fn to_request<P: DeserializeOwned + Default>(
        &self,
    ) -> Result<Request<P>, serde_json::Error> {
        let params = match &self.params {
            Some(raw) => serde_json::from_str(raw.get())?,
            None => P::default(),
        };
        Ok(Request {
            jsonrpc: Version,
            id: self.request_id(),
            method: self.method.clone(),
            params,
        })
    }

    /// Projects the message into a typed response.
    ///
    /// Classifies first; anything that is not a success or error response
    /// fails with the offending kind.
    pub fn to_response<R: DeserializeOwned>(&self) -> Result<Response<R>, EndpointError> {
        let kind = self.try_kind()?;
        let id = self.request_id();
        match kind {
            MessageKind::SuccessResponse => {
                let raw = self
                    .result
                    .as_ref()
                    .ok_or(EndpointError::UnexpectedKind(kind))?;
                Ok(Response {
                    jsonrpc: Version,
                    id,
                    result: Some(serde_json::from_str(raw.get())?),
                    error: None,
                })
            }
            MessageKind::ErrorResponse => Ok(Response {
                jsonrpc: Version,
                id,
                result: None,
                error: self.error.clone(),
            }),
            other => Err(EndpointError::UnexpectedKind(other)),
        }
    }
}

/// A wrapper around a single message or an ordered batch of messages.
///
/// The shape is decided by the first non-whitespace byte of the input and is
/// preserved on output: a batch of one stays a batch of one.
#[derive(Debug, Serialize, Clone)]
#[serde(untagged)]
pub enum Envelope {
    /// An ordered batch. May be empty on input; rejected at dispatch.
    Batch(Vec<Message>),
    /// A single message.
    Single(Message),
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Hand-written so that `RawValue` fields keep borrowing from the
        // original input; an untagged derive would buffer and lose them.
        struct EnvelopeVisitor;

        impl<'de> Visitor<'de> for EnvelopeVisitor {
            type Value = Envelope;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON-RPC message or a batch of messages")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Envelope, A::Error> {
                let mut messages = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(msg) = seq.next_element::<Message>()? {
                    messages.push(msg);
                }
                Ok(Envelope::Batch(messages))
            }

            fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Envelope, A::Error> {
                let msg = Message::deserialize(de::value::MapAccessDeserializer::new(map))?;
                Ok(Envelope::Single(msg))
            }
        }

        deserializer.deserialize_any(EnvelopeVisitor)
    }
}

impl Envelope {
    /// Whether the envelope arrived as a batch.
    pub fn is_batch(&self) -> bool {
        matches!(self, Envelope::Batch(_))
    }

    /// All inner messages, in wire order.
    pub fn messages(&self) -> &[Message] {
        match self {
            Envelope::Batch(messages) => messages,
            Envelope::Single(msg) => std::slice::from_ref(msg),
        }
    }

    /// The single message, if the envelope is not a batch.
    pub fn single(&self) -> Option<&Message> {
        match self {
            Envelope::Batch(_) => None,
            Envelope::Single(msg) => Some(msg),
        }
    }

    /// Consumes the envelope into its messages, in wire order.
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Envelope::Batch(messages) => messages,
            Envelope::Single(msg) => vec![msg],
        }
    }
}

/// A typed request or notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request<P> {
    /// The protocol version, always "2.0".
    pub jsonrpc: Version,
    /// The correlation id; `None` makes this a notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// The method name.
    pub method: String,
    /// The typed parameters.
    pub params: P,
}

impl<P> Request<P> {
    /// Creates a request expecting a response.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: P) -> Request<P> {
        Request {
            jsonrpc: Version,
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Creates a notification, which expects no response.
    pub fn notification(method: impl Into<String>, params: P) -> Request<P> {
        Request {
            jsonrpc: Version,
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Whether this carries no id.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// The kind of the message, request or notification.
    pub fn kind(&self) -> MessageKind {
        if self.is_notification() {
            MessageKind::Notification
        } else {
            MessageKind::Request
        }
    }
}

/// A typed response, carrying either a result or an error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response<R> {
    /// The protocol version, always "2.0".
    pub jsonrpc: Version,
    /// The correlation id. Serialized as `null` when absent, which only
    /// happens for server-reported parse and invalid-request errors.
    pub id: Option<RequestId>,
    /// The result, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<R>,
    /// The error object, on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObj>,
}

impl<R> Response<R> {
    /// Creates a success response.
    pub fn success(id: Option<RequestId>, result: R) -> Response<R> {
        Response {
            jsonrpc: Version,
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn error(id: Option<RequestId>, error: ErrorObj) -> Response<R> {
        Response {
            jsonrpc: Version,
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Whether the response carries no error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Whether the response carries an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Unwraps into the typed result, or the formatted wire error.
    pub fn into_result(self) -> Result<R, ErrorObj> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            // a response with neither side; report it as an empty error
            (None, None) => Err(ErrorObj {
                code: 0,
                message: String::new(),
                data: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(text: &str) -> Message {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn classify_request() {
        let msg = parse(r#"{"jsonrpc": "2.0", "id": 3, "method": "shutdown", "params": null}"#);
        assert_eq!(msg.kind(), MessageKind::Request);
        assert_eq!(msg.request_id(), Some(3i64.into()));
    }

    #[test]
    fn classify_notification() {
        let msg = parse(r#"{"jsonrpc": "2.0", "method": "exit"}"#);
        assert_eq!(msg.kind(), MessageKind::Notification);
    }

    #[test]
    fn classify_responses() {
        let msg = parse(r#"{"jsonrpc": "2.0", "id": "a", "result": [1, 2]}"#);
        assert_eq!(msg.kind(), MessageKind::SuccessResponse);

        let msg = parse(r#"{"jsonrpc": "2.0", "id": 7, "error": {"code": -32601, "message": "Method not found"}}"#);
        assert_eq!(msg.kind(), MessageKind::ErrorResponse);
    }

    #[test]
    fn classify_version_mismatch() {
        let msg = parse(r#"{"jsonrpc": "1.0", "id": 1, "method": "m"}"#);
        assert!(matches!(msg.try_kind(), Err(InvalidMessage::Version(v)) if v == "1.0"));
        assert_eq!(msg.kind(), MessageKind::Invalid);
    }

    #[test]
    fn classify_both_result_and_error() {
        let msg = parse(
            r#"{"jsonrpc": "2.0", "id": 1, "method": "m", "params": [], "error": {}, "result": "x"}"#,
        );
        assert!(matches!(msg.try_kind(), Err(InvalidMessage::Structure)));
        assert_eq!(msg.kind(), MessageKind::Invalid);
    }

    #[test]
    fn classify_response_without_id() {
        let msg = parse(r#"{"jsonrpc": "2.0", "result": 1}"#);
        assert!(matches!(msg.try_kind(), Err(InvalidMessage::MissingId)));

        // an explicit null id is as absent as a missing one
        let msg = parse(r#"{"jsonrpc": "2.0", "id": null, "result": 1}"#);
        assert!(matches!(msg.try_kind(), Err(InvalidMessage::MissingId)));
    }

    #[test]
    fn classify_response_with_non_scalar_id() {
        let msg = parse(r#"{"jsonrpc": "2.0", "id": [1], "result": 1}"#);
        assert!(matches!(msg.try_kind(), Err(InvalidMessage::InvalidId(_))));

        let msg = parse(r#"{"jsonrpc": "2.0", "id": {"a": 1}, "error": {"code": 1, "message": "m"}}"#);
        assert_eq!(msg.kind(), MessageKind::Invalid);
    }

    #[test]
    fn envelope_single_round_trip() {
        let text = r#"{"jsonrpc":"2.0","id":1,"method":"hello","params":{"name":"World"}}"#;
        let envelope: Envelope = serde_json::from_str(text).unwrap();
        assert!(!envelope.is_batch());
        assert!(envelope.single().is_some());
        assert_eq!(serde_json::to_string(&envelope).unwrap(), text);
    }

    #[test]
    fn envelope_batch_of_one_round_trip() {
        let text = r#"[{"jsonrpc":"2.0","id":1,"method":"hello","params":"World"}]"#;
        let envelope: Envelope = serde_json::from_str(text).unwrap();
        assert!(envelope.is_batch());
        assert!(envelope.single().is_none());
        assert_eq!(envelope.messages().len(), 1);
        assert_eq!(serde_json::to_string(&envelope).unwrap(), text);
    }

    #[test]
    fn envelope_empty_batch() {
        let envelope: Envelope = serde_json::from_str("[]").unwrap();
        assert!(envelope.is_batch());
        assert!(envelope.messages().is_empty());
    }

    #[test]
    fn typed_request_round_trip() {
        let req = Request::new("id-1", "test", "world".to_owned());
        let text = serde_json::to_string(&req).unwrap();
        assert_eq!(
            text,
            r#"{"jsonrpc":"2.0","id":"id-1","method":"test","params":"world"}"#
        );

        let msg: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(msg.kind(), MessageKind::Request);
        let back: Request<String> = msg.to_request().unwrap();
        assert_eq!(back.id, req.id);
        assert_eq!(back.method, req.method);
        assert_eq!(back.params, req.params);
    }

    #[test]
    fn notification_serializes_without_id() {
        let note = Request::notification("exit", JsonValue::Null);
        let text = serde_json::to_string(&note).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","method":"exit","params":null}"#);
    }

    #[test]
    fn request_projection_defaults_absent_params() {
        let msg = parse(r#"{"jsonrpc": "2.0", "id": 1, "method": "test"}"#);
        let req: Request<String> = msg.to_request().unwrap();
        assert_eq!(req.params, String::new());
    }

    #[test]
    fn response_projection() {
        let msg = parse(r#"{"jsonrpc": "2.0", "id": 1, "result": "hello world"}"#);
        let response: Response<String> = msg.to_response().unwrap();
        assert_eq!(response.into_result().unwrap(), "hello world");

        let msg = parse(
            r#"{"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "Method not found"}}"#,
        );
        let response: Response<String> = msg.to_response().unwrap();
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, -32601);
        assert!(err.to_string().contains("Method not found"));
    }

    #[test]
    fn response_projection_rejects_requests() {
        let msg = parse(r#"{"jsonrpc": "2.0", "id": 1, "method": "m"}"#);
        let err = msg.to_response::<String>().unwrap_err();
        assert!(matches!(
            err,
            EndpointError::UnexpectedKind(MessageKind::Request)
        ));
    }

    #[test]
    fn error_response_serializes_null_id() {
        let response: Response<JsonValue> = Response::error(
            None,
            ErrorObj {
                code: -32700,
                message: "Parse error".into(),
                data: None,
            },
        );
        let text = serde_json::to_string(&response).unwrap();
        assert_eq!(
            text,
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#
        );
    }

    #[test]
    fn request_id_forms_are_distinct() {
        let by_num = RequestId::from_json(&json!(92)).unwrap();
        let by_str = RequestId::from_json(&json!("92")).unwrap();
        assert_ne!(by_num, by_str);
        assert_eq!(by_num, 92i64.into());
        assert_eq!(by_str, "92".into());
        assert_eq!(by_num.to_string(), "92");
        assert_eq!(by_str.to_string(), "\"92\"");
    }

    #[test]
    fn request_id_rejects_non_scalars() {
        assert!(RequestId::from_json(&json!(1.5)).is_none());
        assert!(RequestId::from_json(&json!(null)).is_none());
        assert!(RequestId::from_json(&json!([1])).is_none());
        assert!(RequestId::from_json(&json!({"a": 1})).is_none());
    }
}
