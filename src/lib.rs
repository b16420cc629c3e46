//! Non-breaking connections: a session layer that keeps a logical, reliable, ordered byte stream
//!  alive across the loss of the physical sockets carrying it.
//!
//! Two nodes open a logical connection over a physical socket (TCP, or anything else implementing
//!  [transport::Connector] / [transport::Acceptor]). Application data is framed into numbered
//!  `Data` packets that stay buffered on the sender until the peer acks them. When a physical socket
//!  breaks, the side that opened the connection dials again and rejoins it, both sides exchange
//!  their receive cursors, and everything the peer is missing is resent. The application sees none
//!  of this, only stalled reads and writes while the rejoin is in progress.
//!
//! Closing is a handshake of its own which ensures that both sides received everything before the
//!  connection goes away, and which survives physical socket loss as well.

pub mod close;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod node;
pub mod packet_id;
pub mod reconnect;
pub mod transport;
pub mod util;
pub mod test_util;

pub use config::NonBreakingConfig;
pub use connection::stream::{NonBreakingReadHalf, NonBreakingStream, NonBreakingWriteHalf};
pub use connection::ConnectionState;
pub use error::{DisconnectReason, SessionError};
pub use identity::ConnectionIdentity;
pub use node::NonBreakingNode;
