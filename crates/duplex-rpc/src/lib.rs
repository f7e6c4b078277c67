//! Transport-agnostic JSON-RPC 2.0 endpoints.
//!
//! One [`StreamEndpoint`] plays both client and server over a single framed
//! byte stream: a background task reads and dispatches incoming requests
//! while [`request`], [`notify`], and [`batch`] correlate outgoing calls
//! with their responses. The same helpers drive the HTTP adapters, enabled
//! by the `http-client` and `http-server` features.
//!
//! # Example
//!
//! ```no_run
//! use duplex_rpc::{Error, FramedStream, StreamEndpoint};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(socket: tokio::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = CancellationToken::new();
//! let endpoint = StreamEndpoint::new(&ctx, FramedStream::plain(socket));
//! endpoint.register("greet", |_ctx, name: String| async move {
//!     Ok::<_, Error>(format!("hello {name}"))
//! });
//!
//! let reply: String = duplex_rpc::request(&endpoint, &ctx, "greet", "world")
//!     .await?
//!     .into_result()?;
//! # Ok(())
//! # }
//! ```

mod client;
mod codec;
mod endpoint;
mod error;
mod msg;
mod pending;
mod registry;

#[cfg(feature = "http-client")]
mod http_client;
#[cfg(feature = "http-server")]
mod http_server;

pub use client::*;
pub use codec::{FramedReader, FramedStream, FramedWriter, ObjectCodec};
pub use endpoint::*;
pub use error::*;
pub use msg::*;
pub use pending::PendingSlot;
pub use registry::*;

#[cfg(feature = "http-client")]
pub use http_client::*;
#[cfg(feature = "http-server")]
pub use http_server::*;
