//! Sans-I/O drive of the embedded websocket protocol engine.
//!
//! The websocket machine believes it talks to a socket; what it really
//! talks to is [`BytePipe`], an in-memory duplex. Received bytes are pushed
//! into the pipe before the machine is stepped, and everything the machine
//! writes is drained back out and handed to the caller for transmission.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use snafu::prelude::*;
use tungstenite::client::IntoClientRequest;
use tungstenite::error::{Error as WsError, ProtocolError as WsProtocolError};
use tungstenite::handshake::client::ClientHandshake;
use tungstenite::handshake::{HandshakeError, MidHandshake};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Message, WebSocket};

/// Error when stepping the websocket machine with received bytes.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub(crate) enum FeedError {
    /// the bytestream ended without a closing handshake
    #[snafu(display("stream ended without a closing handshake"))]
    StreamReset,

    /// underlying websocket machine failure
    #[snafu(display("underlying websocket machine failure: {source}"))]
    Machine {
        /// source error
        #[snafu(source(from(tungstenite::Error, Box::new)))]
        source: Box<tungstenite::Error>,
    },
}

/// Abstract events surfaced while stepping the machine.
#[derive(Debug)]
pub(crate) enum WsEvent {
    /// the upgrade handshake finished, messages can flow
    Accepted,
    /// the server refused the upgrade
    Rejected {
        /// http status of the refusal
        status: u16,
        /// response body bytes
        body: Vec<u8>,
    },
    /// one complete, defragmented data message
    Message {
        /// message payload
        data: Bytes,
        /// whether the frame was binary (text otherwise)
        binary: bool,
    },
    /// peer ping; the pong answer is already queued for the caller
    Ping(#[allow(dead_code)] Vec<u8>),
    /// peer pong
    Pong(#[allow(dead_code)] Vec<u8>),
    /// close frame from the peer, or the echo of a close we initiated
    CloseReceived {
        /// close code on the wire
        code: Option<u16>,
        /// close reason, when non-empty
        reason: Option<String>,
    },
    /// the websocket reached its terminal state
    Terminated,
}

#[derive(Debug, Default)]
struct PipeState {
    incoming: VecDeque<u8>,
    outgoing: Vec<u8>,
    eof: bool,
}

/// In-memory duplex the websocket machine reads from and writes to.
///
/// Cloning shares the buffers; one handle lives inside the machine, the
/// other stays with the [`Engine`]. The mutex makes the engine `Send` and
/// is never contended, the whole core being single-threaded by contract.
#[derive(Debug, Clone, Default)]
pub(crate) struct BytePipe {
    state: Arc<Mutex<PipeState>>,
}

impl BytePipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().expect("byte pipe lock poisoned")
    }

    /// Queue received bytes for the machine. An empty slice marks the end
    /// of the stream.
    fn push_incoming(&self, data: &[u8]) {
        let mut state = self.lock();
        if data.is_empty() {
            state.eof = true;
        } else {
            state.incoming.extend(data);
        }
    }

    /// Take everything the machine wrote since the last drain.
    fn take_outgoing(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().outgoing)
    }
}

impl Read for BytePipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();

        if state.incoming.is_empty() {
            if state.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let mut n = 0;
        while n < buf.len() {
            match state.incoming.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for BytePipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum State {
    /// waiting for the upgrade; the handshake machine exists once
    /// [`Engine::initiate`] ran
    Connecting(Option<MidHandshake<ClientHandshake<BytePipe>>>),
    Open(Box<WebSocket<BytePipe>>),
    Closed,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            Self::Connecting(_) => "Connecting",
            Self::Open(_) => "Open",
            Self::Closed => "Closed",
        }
    }
}

/// The embedded websocket protocol engine, driven entirely through byte
/// buffers.
pub(crate) struct Engine {
    pipe: BytePipe,
    upgrade_request: Option<Vec<u8>>,
    state: State,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state.name())
            .finish()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            pipe: BytePipe::default(),
            upgrade_request: None,
            state: State::Connecting(None),
        }
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.state, State::Connecting(_))
    }

    /// Throw the current machine away for a fresh connection.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Produce the upgrade request bytes for `uri`. Re-issuing while still
    /// connecting returns the same bytes.
    ///
    /// The uri comes from the connection's normalized host and is valid by
    /// construction; a machine that fails on it is logged and the engine
    /// closed, the caller will observe `Closed`.
    pub fn initiate(&mut self, uri: &str) -> Vec<u8> {
        let State::Connecting(handshake) = &mut self.state else {
            return self.upgrade_request.clone().unwrap_or_default();
        };

        if let Some(bytes) = &self.upgrade_request {
            return bytes.clone();
        }

        let request = match uri.into_client_request() {
            Ok(request) => request,
            Err(e) => {
                log::error!("cannot build an upgrade request for {uri}: {e}");
                self.state = State::Closed;
                return Vec::new();
            }
        };

        let started = match ClientHandshake::start(self.pipe.clone(), request, None) {
            Ok(mid) => mid,
            Err(e) => {
                log::error!("cannot start the websocket handshake: {e}");
                self.state = State::Closed;
                return Vec::new();
            }
        };

        // one round writes the request and then blocks on the response
        match started.handshake() {
            Err(HandshakeError::Interrupted(mid)) => *handshake = Some(mid),
            Err(HandshakeError::Failure(e)) => {
                log::error!("websocket handshake failed before any response: {e}");
                self.state = State::Closed;
                return Vec::new();
            }
            Ok((ws, _)) => {
                // no server bytes were fed, so this cannot happen; accept
                // it anyway rather than lose the machine
                self.state = State::Open(Box::new(ws));
            }
        }

        let bytes = self.pipe.take_outgoing();
        self.upgrade_request = Some(bytes.clone());
        bytes
    }

    /// Push received bytes into the machine and collect what happened. An
    /// empty slice signals end-of-stream.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<WsEvent>, FeedError> {
        self.pipe.push_incoming(data);

        let mut events = Vec::new();

        match std::mem::replace(&mut self.state, State::Closed) {
            State::Connecting(None) => {
                // bytes before initiate(); keep them buffered
                self.state = State::Connecting(None);
                if data.is_empty() {
                    return StreamReset.fail();
                }
            }
            State::Connecting(Some(mid)) => match mid.handshake() {
                Ok((ws, response)) => {
                    log::debug!("upgrade accepted with status {}", response.status());
                    events.push(WsEvent::Accepted);
                    self.state = State::Open(Box::new(ws));
                    self.drain_open(&mut events)?;
                }
                Err(HandshakeError::Interrupted(mid)) => {
                    self.state = State::Connecting(Some(mid));
                }
                Err(HandshakeError::Failure(WsError::Http(response))) => {
                    let status = response.status().as_u16();
                    log::debug!("upgrade rejected with status {status}");
                    let body: Vec<u8> = response.into_body().map(Into::into).unwrap_or_default();
                    events.push(WsEvent::Rejected { status, body });
                }
                Err(HandshakeError::Failure(WsError::Protocol(
                    WsProtocolError::HandshakeIncomplete,
                ))) => {
                    // the stream ended mid-handshake
                    return StreamReset.fail();
                }
                Err(HandshakeError::Failure(e)) => {
                    return Err(e).context(Machine);
                }
            },
            State::Open(ws) => {
                self.state = State::Open(ws);
                self.drain_open(&mut events)?;
            }
            State::Closed => {}
        }

        Ok(events)
    }

    fn drain_open(&mut self, events: &mut Vec<WsEvent>) -> Result<(), FeedError> {
        let State::Open(ws) = &mut self.state else {
            return Ok(());
        };

        let mut terminated = false;
        let mut failure: Option<FeedError> = None;

        loop {
            match ws.read() {
                Ok(Message::Text(text)) => events.push(WsEvent::Message {
                    data: Bytes::from(text.into_bytes()),
                    binary: false,
                }),
                Ok(Message::Binary(data)) => events.push(WsEvent::Message {
                    data: Bytes::from(data),
                    binary: true,
                }),
                Ok(Message::Ping(payload)) => {
                    log::trace!("ping from peer, pong queued");
                    events.push(WsEvent::Ping(payload));
                }
                Ok(Message::Pong(payload)) => events.push(WsEvent::Pong(payload)),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(frame) => {
                            let reason = if frame.reason.is_empty() {
                                None
                            } else {
                                Some(frame.reason.into_owned())
                            };
                            (Some(u16::from(frame.code)), reason)
                        }
                        None => (None, None),
                    };
                    events.push(WsEvent::CloseReceived { code, reason });
                }
                Ok(Message::Frame(_)) => log::trace!("raw frame ignored"),
                Err(WsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                    events.push(WsEvent::Terminated);
                    terminated = true;
                    break;
                }
                Err(WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake)) => {
                    terminated = true;
                    failure = Some(FeedError::StreamReset);
                    break;
                }
                Err(e) => {
                    terminated = true;
                    failure = Some(FeedError::Machine {
                        source: Box::new(e),
                    });
                    break;
                }
            }
        }

        // push out machine-queued replies (pongs, close echo)
        match ws.flush() {
            Ok(()) => {}
            Err(WsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {}
            Err(e) => log::trace!("flush after read failed: {e}"),
        }

        if terminated {
            self.state = State::Closed;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Frame a text message and return the bytes to transmit, together
    /// with any replies the machine had queued before it. Messages that
    /// can no longer be sent (the close handshake won the race) come back
    /// empty.
    pub fn send_text(&mut self, text: String) -> Vec<u8> {
        let State::Open(ws) = &mut self.state else {
            return Vec::new();
        };

        match ws.send(Message::Text(text)) {
            Ok(()) => {}
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {}
            Err(e) => log::debug!("message not sent: {e}"),
        }

        self.pipe.take_outgoing()
    }

    /// Queue a close frame and return the bytes to transmit.
    pub fn send_close(&mut self, code: u16, reason: &str) -> Vec<u8> {
        let State::Open(ws) = &mut self.state else {
            return Vec::new();
        };

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };

        match ws.close(Some(frame)).and_then(|()| ws.flush()) {
            Ok(()) => {}
            Err(WsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {}
            Err(e) => log::debug!("queueing the close frame failed: {e}"),
        }

        self.pipe.take_outgoing()
    }

    /// Take any bytes the machine queued on its own (pong answers, close
    /// echoes).
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        self.pipe.take_outgoing()
    }
}
