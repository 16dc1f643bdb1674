//! Per-connection state shared between the pump and the service
//!
//! A [`ConnectionContext`] is created when a WebSocket is accepted and lives
//! until the pump has torn the connection down. Broker delivery callbacks hold
//! a reference to push messages into its outbound queue or to terminate it.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::websocket::OutboundQueue;

/// Unique identifier of a WebSocket connection
pub type ConnectionId = Uuid;

/// WebSocket close code and reason sent when the server ends a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY: u16 = 1008;
    pub const INTERNAL: u16 = 1011;
    pub const TRY_AGAIN_LATER: u16 = 1013;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A broker subscription of the connection was lost
    pub fn subscription_lost() -> Self {
        Self::new(Self::INTERNAL, "broker subscription lost")
    }

    /// The server is shutting down
    pub fn shutdown() -> Self {
        Self::new(Self::GOING_AWAY, "server shutting down")
    }
}

/// Shared state of one live connection
pub struct ConnectionContext {
    id: ConnectionId,
    outbound: OutboundQueue<Envelope>,
    cancel: CancellationToken,
    server: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

impl ConnectionContext {
    /// Create a context whose cancellation follows `parent`
    pub fn new(parent: &CancellationToken, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            outbound: OutboundQueue::new(queue_capacity),
            cancel: parent.child_token(),
            server: parent.clone(),
            close_reason: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Deliveries waiting to be written to the client
    pub fn outbound(&self) -> &OutboundQueue<Envelope> {
        &self.outbound
    }

    /// Resolves once the connection must close
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close without a reason, e.g. after the socket failed
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Ask the pump to close the connection; the first reason wins
    pub fn terminate(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    /// Reason recorded by [`terminate`](Self::terminate), if any
    ///
    /// Falls back to a shutdown reason once the server token is cancelled.
    pub fn close_reason(&self) -> Option<CloseReason> {
        let recorded = self.close_reason.lock().clone();
        recorded.or_else(|| self.server.is_cancelled().then(CloseReason::shutdown))
    }
}
