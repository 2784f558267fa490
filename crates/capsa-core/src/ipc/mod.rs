//! IPC to the privileged bundle daemon.
//!
//! - [`protocol`]: wire types and length-prefixed JSON framing
//! - [`transport`]: the collaborator boundary the platform IPC plugs into
//! - [`link`]: the blocking-style RPC client with reconnect-on-death
//! - [`loopback`]: in-process daemon for tests and unprivileged deployments

pub mod link;
pub mod loopback;
pub mod protocol;
pub mod transport;

pub use link::{DaemonLink, LinkStatus};
pub use loopback::LoopbackDaemon;
pub use protocol::{DaemonReply, DaemonRequest};
pub use transport::{DaemonEvent, DaemonTransport};
