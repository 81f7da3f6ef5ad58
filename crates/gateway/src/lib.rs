//! Per-connection gateway layer.
//!
//! One [`Conn`] exists per client connection. It owns a serial work
//! queue: every mutation of its subscriptions and every event delivery
//! runs on that queue, so a connection's view of the world is always
//! consistent. Each subscribed RID is a state machine that loads the
//! resource from the cache, expands resource references into child
//! subscriptions, gates events until the initial snapshot is sent, and
//! enforces access on reaccess signals.
//!
//! The network listener is an external collaborator: it feeds client
//! operations in through [`Conn`]'s async methods and receives
//! client-bound events through the [`ClientTransport`] it supplies.

mod conn;
pub mod protocol;
mod subscription;

pub use conn::{Conn, ConnConfig};
pub use protocol::{ClientEvent, ClientTransport, Resources};
