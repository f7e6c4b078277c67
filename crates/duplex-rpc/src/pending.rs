//! The pending table: correlation from request ids to single-slot response
//! delivery channels. Shared by the stream endpoint and the HTTP client.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::EndpointError;
use crate::msg::{Message, RequestId};

#[derive(Default)]
struct PendingState {
    closed: bool,
    pending: HashMap<RequestId, mpsc::Sender<Message>>,
}

/// The set of requests awaiting a response, keyed by id.
///
/// An id is registered exactly once before the outgoing request is written
/// and removed exactly once when its [`PendingSlot`] drops. Closing the
/// table closes every slot without delivering.
#[derive(Clone, Default)]
pub(crate) struct PendingTable {
    state: Arc<Mutex<PendingState>>,
}

impl PendingTable {
    pub(crate) fn new() -> PendingTable {
        PendingTable::default()
    }

    /// Registers a slot for `id`. Fails once the table is closed.
    pub(crate) fn register(&self, id: RequestId) -> Result<PendingSlot, EndpointError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EndpointError::StreamClosed);
        }
        let (tx, rx) = mpsc::channel(1);
        state.pending.insert(id.clone(), tx);
        Ok(PendingSlot {
            rx,
            id,
            table: self.clone(),
        })
    }

    /// Delivers a response message to the slot registered for `id`.
    ///
    /// Returns false when no such slot exists. Delivery is at-most-once and
    /// never blocks; a duplicate response for an id whose slot is already
    /// full is dropped.
    pub(crate) fn deliver(&self, id: &RequestId, msg: Message) -> bool {
        let state = self.state.lock();
        let Some(tx) = state.pending.get(id) else {
            return false;
        };
        if tx.try_send(msg).is_err() {
            log::debug!("dropping duplicate response for request ({id})");
        }
        true
    }

    /// Closes the table, waking every registered slot with a closed signal.
    ///
    /// Returns false when the table was closed already.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        // dropping the senders is the wakeup
        state.pending.clear();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn remove(&self, id: &RequestId) {
        self.state.lock().pending.remove(id);
    }
}

/// A registered single-slot wait for one response message.
///
/// Deregisters from the table when dropped, on every exit path.
pub struct PendingSlot {
    rx: mpsc::Receiver<Message>,
    id: RequestId,
    table: PendingTable,
}

impl PendingSlot {
    /// Waits for the response. `None` means the endpoint closed before one
    /// arrived.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// The id this slot is registered under.
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}
