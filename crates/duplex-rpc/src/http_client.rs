//! The HTTP client adapter: the same client surface as the stream endpoint,
//! carried by one POST per written object.

use reqwest::header::CONTENT_TYPE;

use crate::client::EndpointClient;
use crate::error::EndpointError;
use crate::msg::{Envelope, MessageKind, RequestId};
use crate::pending::{PendingSlot, PendingTable};

/// An endpoint-like client over HTTP.
///
/// Every [`write_object`](EndpointClient::write_object) performs one POST;
/// any responses in the reply body are delivered through the same pending
/// table the stream endpoint uses, so [`request`](crate::request) and
/// friends work unchanged. An HTTP endpoint is never closed.
pub struct HttpClientEndpoint {
    client: reqwest::Client,
    url: String,
    pending: PendingTable,
}

impl HttpClientEndpoint {
    /// Creates a client endpoint POSTing to `url`.
    ///
    /// Pass an underlying [`reqwest::Client`] to share connection pools or
    /// custom TLS configuration; it is defaulted when absent.
    pub fn new(url: impl Into<String>, client: Option<reqwest::Client>) -> HttpClientEndpoint {
        HttpClientEndpoint {
            client: client.unwrap_or_default(),
            url: url.into(),
            pending: PendingTable::new(),
        }
    }

    /// The URL this endpoint POSTs to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Closing an HTTP endpoint is a no-op; there is no connection to shut
    /// down.
    pub fn close(&self) -> Result<(), EndpointError> {
        Ok(())
    }
}

impl EndpointClient for HttpClientEndpoint {
    async fn write_object<T: serde::Serialize + Sync + ?Sized>(
        &self,
        obj: &T,
    ) -> Result<(), EndpointError> {
        let body = serde_json::to_vec(obj)?;
        log::debug!("sending request to {}: {}", self.url, String::from_utf8_lossy(&body));

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;

        // checked before the status so that a 2xx without content still
        // reads as an empty response
        if body.is_empty() {
            return Err(EndpointError::EmptyResponse);
        }
        if status != reqwest::StatusCode::OK {
            return Err(EndpointError::Protocol(format!(
                "http error: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let envelope: Envelope = serde_json::from_slice(&body)?;
        log::debug!("received message: {}", String::from_utf8_lossy(&body));
        for msg in envelope.into_messages() {
            match msg.try_kind() {
                Ok(MessageKind::Request) => {
                    return Err(EndpointError::Protocol(
                        "request received on client endpoint".to_owned(),
                    ));
                }
                Ok(MessageKind::Notification) => {
                    return Err(EndpointError::Protocol(
                        "notification received on client endpoint".to_owned(),
                    ));
                }
                Ok(MessageKind::SuccessResponse | MessageKind::ErrorResponse) => {
                    let Some(id) = msg.request_id() else { continue };
                    if !self.pending.deliver(&id, msg) {
                        log::debug!("ignoring response with no corresponding request ({id})");
                    }
                }
                Ok(MessageKind::Invalid) | Err(_) => {
                    return Err(EndpointError::Protocol(
                        "invalid message received on client endpoint".to_owned(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn register_pending(&self, id: RequestId) -> Result<PendingSlot, EndpointError> {
        self.pending.register(id)
    }

    fn is_closed(&self) -> bool {
        false
    }
}
