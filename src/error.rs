//! Boundary error types.
//!
//! Every fallible public operation on a [`Connection`](crate::Connection)
//! fails with one of the enums below; none of them are raised for conditions
//! the protocol expects the caller to handle by consulting
//! [`should_reconnect`](crate::Connection::should_reconnect).

use miniz_oxide::MZError;
use snafu::prelude::*;

use crate::codec::Encoding;

/// Error when constructing a [`Connection`](crate::Connection).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ConfigError {
    /// the selected encoding has no codec in this build
    #[snafu(display("the {encoding:?} encoding is not available"))]
    UnsupportedEncoding {
        /// requested encoding
        encoding: Encoding,
    },

    /// the gateway host could not be parsed as a url
    #[snafu(display("{host} is not a valid gateway url: {source}"))]
    InvalidHost {
        /// configured host string
        host: String,
        /// source error
        source: url::ParseError,
    },

    /// the gateway url carries no host component
    #[snafu(display("the gateway url {host} has no host"))]
    NoHost {
        /// configured host string
        host: String,
    },
}

/// Local decode failure. Fatal for the current connection instance, though
/// a subsequent [`reconnect`](crate::Connection::reconnect) may still be
/// allowed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ProtocolError {
    /// payload did not match the gateway wire shape
    #[snafu(display("malformed gateway payload: {source}"))]
    MalformedPayload {
        /// source error
        source: serde_json::Error,
    },

    /// the shared inflater rejected a compressed message
    #[snafu(display("decompress gateway message failed: {status:?}"))]
    DecompressFailed {
        /// decompressor error status
        status: MZError,
    },

    /// a compressed message ended without the zlib flush suffix
    #[snafu(display("compressed message ended without the zlib flush suffix"))]
    MissingZlibSuffix,

    /// a binary frame arrived while no compression is configured
    #[snafu(display("received a binary frame with no compression configured"))]
    UnexpectedBinary,

    /// the server sent a second HELLO on the same connection
    #[snafu(display("received HELLO twice on one connection"))]
    UnexpectedHello,

    /// the embedded websocket engine reported a protocol failure
    #[snafu(display("websocket engine failure: {source}"))]
    Websocket {
        /// source error
        #[snafu(source(from(tungstenite::Error, Box::new)))]
        source: Box<tungstenite::Error>,
    },
}

/// Error surfaced from [`receive`](crate::Connection::receive).
///
/// `Rejected`, `Closed` and `Disconnected` are expected protocol outcomes
/// carried in the error sum so a single `match` drives the caller's
/// shutdown-or-reconnect decision.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ReceiveError {
    /// the server refused the websocket upgrade
    #[snafu(display("gateway rejected the upgrade with http status {status}"))]
    Rejected {
        /// http status code of the refusal
        status: u16,
        /// response body bytes
        body: Vec<u8>,
    },

    /// the close handshake resolved
    #[snafu(display("gateway connection closed (code {code:?})"))]
    Closed {
        /// reply frame the caller must transmit before dropping the
        /// socket, absent when the handshake is already complete
        reply: Option<Vec<u8>>,
        /// close code observed on the wire
        code: Option<u16>,
        /// close reason, when the peer supplied one
        reason: Option<String>,
    },

    /// the peer hung up without a close handshake
    #[snafu(display("gateway dropped the connection without a close frame"))]
    Disconnected,

    /// local decode failure
    #[snafu(display("{source}"))]
    Protocol {
        /// source error
        source: ProtocolError,
    },
}

/// An operation was called in a state that does not permit it. State is
/// left untouched.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum StateError {
    /// connect was called after the upgrade already happened
    #[snafu(display("the websocket upgrade request was already consumed"))]
    AlreadyUpgraded,

    /// a payload was requested before the server's HELLO
    #[snafu(display("no HELLO received yet"))]
    HelloNotReceived,

    /// identify was called while the session is resumable
    #[snafu(display("a resumable session exists, RESUME instead of IDENTIFY"))]
    SessionResumable,

    /// resume was called without a resumable session
    #[snafu(display("no resumable session available"))]
    NotResumable,

    /// reconnect was called after a fatal close
    #[snafu(display("the last close was fatal, reconnecting is not allowed"))]
    FatalClose,

    /// identify carried a large_threshold outside 50..=250
    #[snafu(display("large_threshold {value} is outside 50..=250"))]
    LargeThreshold {
        /// rejected value
        value: u8,
    },
}
