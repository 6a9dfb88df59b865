use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::connection::identity::IdentifiedBy;
use crate::transport::message::Frame;

/// Cloneable sending half of one client connection.
///
/// Frames are queued on an unbounded channel drained by the transport's send
/// loop, so transmitting never blocks a worker. Cancelling the token asks the
/// transport to flush what is queued and close the socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    outbound: mpsc::UnboundedSender<WsMessage>,
    closed: CancellationToken,
    identity: OnceLock<Identity>,
}

struct Identity {
    identified_by: IdentifiedBy,
    identifier: String,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::UnboundedSender<WsMessage>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                outbound,
                closed: CancellationToken::new(),
                identity: OnceLock::new(),
            }),
        }
    }

    /// Per-socket id, unique even when identities repeat.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Serializes and queues `frame`. Returns `false` once the connection is
    /// closed or the transport has gone away.
    pub fn transmit(&self, frame: impl Into<Frame>) -> bool {
        if self.is_closed() {
            return false;
        }
        let text = match serde_json::to_string(&frame.into()) {
            Ok(text) => text,
            Err(e) => {
                error!(connection = %self.inner.id, error = %e, "failed to encode frame");
                return false;
            }
        };
        if self.inner.outbound.send(WsMessage::text(text)).is_err() {
            debug!(connection = %self.inner.id, "transport gone; closing");
            self.close();
            return false;
        }
        true
    }

    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.closed.cancelled()
    }

    /// Identity fields from the connect hook; `None` before the connection
    /// is accepted.
    pub fn identified_by(&self) -> Option<&IdentifiedBy> {
        self.inner.identity.get().map(|identity| &identity.identified_by)
    }

    /// The identity fields joined with `:`, or the socket id for anonymous
    /// connections.
    pub fn identifier(&self) -> Option<&str> {
        self.inner.identity.get().map(|identity| identity.identifier.as_str())
    }

    pub(crate) fn set_identity(&self, identified_by: IdentifiedBy) -> &str {
        let identity = self.inner.identity.get_or_init(|| {
            let identifier = identified_by
                .connection_identifier()
                .unwrap_or_else(|| self.inner.id.to_string());
            Identity {
                identified_by,
                identifier,
            }
        });
        &identity.identifier
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("identifier", &self.identifier())
            .field("closed", &self.is_closed())
            .finish()
    }
}
