//! The error taxonomy: wire error objects, domain errors with fixed codes,
//! and transport-level endpoint errors.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::msg::{MessageKind, RequestId, Response};

/// A JSON-RPC 2.0 wire error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObj {
    /// The error code.
    // Defaulted so that a degenerate `"error": {}` still parses and the
    // carrying message classifies as invalid instead of poisoning its batch.
    #[serde(default)]
    pub code: i32,
    /// The error message.
    #[serde(default)]
    pub message: String,
    /// Additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl fmt::Display for ErrorObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(data) => write!(
                f,
                "rpc error: {} (code: {}, data: {})",
                self.message, self.code, data
            ),
            None => write!(f, "rpc error: {} (code: {})", self.message, self.code),
        }
    }
}

impl std::error::Error for ErrorObj {}

impl ErrorObj {
    /// Wraps the error object into an error response for `id`.
    pub fn to_response(&self, id: Option<RequestId>) -> Response<JsonValue> {
        Response::error(id, self.clone())
    }
}

/// The fixed domain error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid JSON was received by the peer.
    ParseError,
    /// The JSON sent is not a valid request object.
    InvalidRequest,
    /// The method does not exist or is not available.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// Implementation-defined server error, -32099..=-32000.
    ServerError,
    /// Fallback error.
    UnknownError,
}

impl ErrorKind {
    /// The kind name as it appears in wire error messages.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "Parse error",
            ErrorKind::InvalidRequest => "Invalid Request",
            ErrorKind::MethodNotFound => "Method not found",
            ErrorKind::InvalidParams => "Invalid params",
            ErrorKind::InternalError => "Internal error",
            ErrorKind::ServerError => "Server error",
            ErrorKind::UnknownError => "Unknown error",
        }
    }
}

/// A domain error: a kind, its wire code, and optional data.
///
/// Handlers return these; the registry turns them into error responses that
/// preserve the request id.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    code: i32,
    data: Option<JsonValue>,
}

impl Error {
    const fn new(kind: ErrorKind, code: i32) -> Error {
        Error {
            kind,
            code,
            data: None,
        }
    }

    /// Invalid JSON was received (-32700).
    pub const fn parse_error() -> Error {
        Error::new(ErrorKind::ParseError, -32700)
    }

    /// The envelope or message shape is invalid (-32600).
    pub const fn invalid_request() -> Error {
        Error::new(ErrorKind::InvalidRequest, -32600)
    }

    /// The method is absent from the registry (-32601).
    pub const fn method_not_found() -> Error {
        Error::new(ErrorKind::MethodNotFound, -32601)
    }

    /// The params fail the typed projection (-32602).
    pub const fn invalid_params() -> Error {
        Error::new(ErrorKind::InvalidParams, -32602)
    }

    /// A handler or adapter failure (-32603).
    pub const fn internal_error() -> Error {
        Error::new(ErrorKind::InternalError, -32603)
    }

    /// The fallback error (-32000).
    pub const fn unknown() -> Error {
        Error::new(ErrorKind::UnknownError, -32000)
    }

    /// A handler-defined server error.
    ///
    /// `code` must be in -32099..=-32000; anything else is a programming
    /// error.
    pub fn server(code: i32) -> Error {
        debug_assert!(
            (-32099..=-32000).contains(&code),
            "server error code {code} outside -32099..=-32000"
        );
        Error::new(ErrorKind::ServerError, code)
    }

    /// Attaches arbitrary data to the error.
    pub fn with_data(mut self, data: impl Into<JsonValue>) -> Error {
        self.data = Some(data.into());
        self
    }

    /// The kind of the error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The wire code of the error.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// The attached data, if any.
    pub fn data(&self) -> Option<&JsonValue> {
        self.data.as_ref()
    }

    /// Converts into the wire error object; the message is the kind name.
    pub fn to_error_obj(&self) -> ErrorObj {
        ErrorObj {
            code: self.code,
            message: self.kind.message().to_owned(),
            data: self.data.clone(),
        }
    }

    /// Wraps into an error response for `id`.
    pub fn to_response(&self, id: Option<RequestId>) -> Response<JsonValue> {
        Response::error(id, self.to_error_obj())
    }

    /// Recovers the domain error from a wire error object.
    ///
    /// The kind is derived from the code; the code itself is preserved.
    pub fn from_error_obj(obj: &ErrorObj) -> Error {
        let kind = match obj.code {
            -32700 => ErrorKind::ParseError,
            -32600 => ErrorKind::InvalidRequest,
            -32601 => ErrorKind::MethodNotFound,
            -32602 => ErrorKind::InvalidParams,
            -32603 => ErrorKind::InternalError,
            -32000 => ErrorKind::UnknownError,
            code if (-32099..=-32001).contains(&code) => ErrorKind::ServerError,
            _ => ErrorKind::UnknownError,
        };
        Error {
            kind,
            code: obj.code,
            data: obj.data.clone(),
        }
    }

    /// The HTTP status an error response for this error travels with.
    pub fn http_status(&self) -> u16 {
        match self.kind {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::MethodNotFound => 404,
            _ => 500,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the lowercase kind name, for stable comparisons
        f.write_str(&self.kind.message().to_lowercase())
    }
}

impl std::error::Error for Error {}

/// Why a message failed classification.
#[derive(Debug, Clone)]
pub enum InvalidMessage {
    /// The `jsonrpc` field was not "2.0".
    Version(String),
    /// Not exactly one of method, result, and error is present.
    Structure,
    /// A response without an id.
    MissingId,
    /// A response id that is neither a string nor an integer.
    InvalidId(JsonValue),
}

impl fmt::Display for InvalidMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidMessage::Version(version) => {
                write!(f, "invalid jsonrpc version: {version}")
            }
            InvalidMessage::Structure => f.write_str("invalid message structure"),
            InvalidMessage::MissingId => f.write_str("id is required"),
            InvalidMessage::InvalidId(id) => write!(f, "invalid id type: {id}"),
        }
    }
}

impl std::error::Error for InvalidMessage {}

/// Transport-level endpoint failures.
#[derive(Debug)]
pub enum EndpointError {
    /// The endpoint is closed; no further objects can travel.
    StreamClosed,
    /// An HTTP 200 with an empty body. Benign for notifications.
    EmptyResponse,
    /// The caller-provided context was cancelled.
    Cancelled,
    /// An underlying I/O failure.
    Io(io::Error),
    /// A JSON (de)serialization failure.
    Json(serde_json::Error),
    /// A message that cannot be classified.
    InvalidMessage(InvalidMessage),
    /// A classified message of a kind the operation cannot accept.
    UnexpectedKind(MessageKind),
    /// A peer protocol violation.
    Protocol(String),
    /// An HTTP transport failure.
    #[cfg(feature = "http-client")]
    Http(reqwest::Error),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::StreamClosed => f.write_str("stream closed"),
            EndpointError::EmptyResponse => f.write_str("empty response"),
            EndpointError::Cancelled => f.write_str("context cancelled"),
            EndpointError::Io(err) => write!(f, "i/o error: {err}"),
            EndpointError::Json(err) => write!(f, "json error: {err}"),
            EndpointError::InvalidMessage(reason) => fmt::Display::fmt(reason, f),
            EndpointError::UnexpectedKind(kind) => write!(f, "invalid message kind: {kind}"),
            EndpointError::Protocol(msg) => f.write_str(msg),
            #[cfg(feature = "http-client")]
            EndpointError::Http(err) => write!(f, "http error: {err}"),
        }
    }
}

impl std::error::Error for EndpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EndpointError::Io(err) => Some(err),
            EndpointError::Json(err) => Some(err),
            EndpointError::InvalidMessage(reason) => Some(reason),
            #[cfg(feature = "http-client")]
            EndpointError::Http(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for EndpointError {
    fn from(err: io::Error) -> EndpointError {
        EndpointError::Io(err)
    }
}

impl From<serde_json::Error> for EndpointError {
    fn from(err: serde_json::Error) -> EndpointError {
        EndpointError::Json(err)
    }
}

impl From<InvalidMessage> for EndpointError {
    fn from(reason: InvalidMessage) -> EndpointError {
        EndpointError::InvalidMessage(reason)
    }
}

#[cfg(feature = "http-client")]
impl From<reqwest::Error> for EndpointError {
    fn from(err: reqwest::Error) -> EndpointError {
        EndpointError::Http(err)
    }
}
