/*!
The stream convergence layer: a bidirectional, segmented, acknowledged
framing protocol over any reliable byte stream.

Each contact starts with a header exchange (magic `dtn!`, version, option
flags, keepalive interval, local endpoint ID); after negotiation the
connection carries data segments, cumulative per-segment acknowledgements,
keepalives and a graceful shutdown handshake. The transport underneath is
anything implementing `AsyncRead + AsyncWrite` — a TCP stream, a serial
port wrapper, or an in-memory pipe in tests.
*/

pub mod codec;
pub mod config;
pub mod connection;

#[cfg(test)]
mod connection_tests;

pub use codec::{ContactHeader, Message, ShutdownReason};
pub use config::Config;
pub use connection::{Command, Connection, ConnectionEvent};

use tracing::{debug, info, warn};
