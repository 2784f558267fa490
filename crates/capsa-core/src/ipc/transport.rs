//! Transport boundary between the daemon link and the platform IPC.
//!
//! The real message transport (connection establishment, byte delivery,
//! process-death observation) lives outside this crate. The link only needs
//! three capabilities: reach the daemon, fire a request frame at it, and
//! consume an ordered stream of inbound events.

use crate::Result;
use async_trait::async_trait;

/// One inbound event from the daemon side.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    /// A reply frame for the single outstanding request.
    Reply(Vec<u8>),
    /// The daemon process died. The current connection is gone; `open` must
    /// be called again once the daemon restarts.
    Died,
}

/// Fire-and-forget transport to the privileged daemon.
#[async_trait]
pub trait DaemonTransport: Send + Sync {
    /// Resolve the daemon endpoint and (re)connect. Fails while the daemon
    /// is not yet reachable; callers retry.
    async fn open(&self) -> Result<()>;

    /// Send one request frame. Delivery only; the reply arrives later as a
    /// [`DaemonEvent::Reply`].
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Next inbound event, in delivery order. `None` means the transport is
    /// permanently torn down.
    async fn next_event(&self) -> Option<DaemonEvent>;
}
