//! # Hawser
//!
//! A sans-I/O implementation of the Discord gateway protocol.
//!
//! Hawser contains no sockets, no clocks and no tasks. It is a pure state
//! machine: the caller opens the TCP/TLS connection, feeds every received
//! chunk into [`Connection::receive`], transmits every buffer the library
//! hands back, and drains decoded gateway events from
//! [`Connection::events`]. Heartbeat scheduling, reconnect sleeps and
//! timeouts are all driven by the caller, which makes the library equally
//! usable from blocking threads, async runtimes or callback loops.
//!
//! ```
//! use hawser::{Compression, Connection, Encoding};
//!
//! let mut conn = Connection::new("gateway.discord.gg", Encoding::Json, Compression::None)?;
//!
//! // Hand these bytes to the socket, then feed everything the socket
//! // returns into `conn.receive(..)` until HELLO arrives.
//! let upgrade = conn.connect()?;
//! assert!(!upgrade.is_empty());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(missing_debug_implementations, missing_docs)]
#![forbid(unsafe_code)]

pub mod close;
pub mod codec;
pub mod error;
pub mod payload;

mod connection;
mod engine;
mod session;

pub use codec::{Compression, Encoding};
pub use connection::Connection;
pub use payload::Event;
pub use session::SessionInfo;

/// Gateway API version requested during the websocket upgrade.
pub const API_VERSION: u8 = 10;
