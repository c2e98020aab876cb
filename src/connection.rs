//! The gateway connection facade.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use snafu::prelude::*;

use crate::close::{classify, CloseClassification, GRACEFUL_CLOSE, RECOVERABLE_CLOSE};
use crate::codec::{Codec, Compression, Encoding};
use crate::engine::{Engine, FeedError, WsEvent};
use crate::error::{self, ConfigError, ProtocolError, ReceiveError, StateError};
use crate::payload::{
    Event, Identify, Opcode, RawPayload, Ready, RequestGuildMembers, Resume, ServerMessage,
    UpdatePresence, VoiceStateUpdate,
};
use crate::session::{Session, SessionInfo};
use crate::API_VERSION;

/// backoff ceiling in seconds
const BACKOFF_CAP: u64 = 60;

/// A connection to the Discord gateway, without the connection.
///
/// The caller owns the socket and the clock; this type owns the protocol.
/// Drive it by transmitting whatever [`connect`](Self::connect) and the
/// payload methods return, feeding every received chunk into
/// [`receive`](Self::receive), and draining [`events`](Self::events).
///
/// The connection is not internally synchronized. A receive loop and a
/// heartbeat loop sharing it must serialize access themselves; the type is
/// `Send` so a caller-owned mutex is enough.
#[derive(Debug)]
pub struct Connection {
    host: String,
    encoding: Encoding,
    stream_compression: bool,
    codec: Codec,
    engine: Engine,
    session: Session,
    events: VecDeque<Event>,
    surface_internal: bool,
}

impl Connection {
    /// Create a connection to `host`.
    ///
    /// `host` is either a bare hostname (`gateway.discord.gg`) or a
    /// `ws://`/`wss://` url, whose scheme, port, path and query are
    /// dropped. The port is always 443.
    pub fn new(
        host: &str,
        encoding: Encoding,
        compression: Compression,
    ) -> Result<Self, ConfigError> {
        let host = normalize_host(host)?;
        let codec = Codec::new(encoding, compression)?;

        Ok(Self {
            host,
            encoding,
            stream_compression: compression == Compression::Stream,
            codec,
            engine: Engine::new(),
            session: Session::new(),
            events: VecDeque::new(),
            surface_internal: false,
        })
    }

    /// Also queue events for the messages the connection handles by itself
    /// (heartbeat requests and acks, reconnect requests, session
    /// invalidations), named after their op-code.
    pub fn surface_internal_events(&mut self, on: bool) {
        self.surface_internal = on;
    }

    /// Host and port for the next TCP connection: the resume endpoint when
    /// a resumable session is held, the configured gateway otherwise.
    pub fn destination(&self) -> (&str, u16) {
        let host = match &self.session.resume_gateway_url {
            Some(url) if self.session.should_resume() => url.as_str(),
            _ => self.host.as_str(),
        };
        (host, 443)
    }

    /// Whether the next HELLO must be answered with RESUME instead of
    /// IDENTIFY.
    pub fn should_resume(&self) -> bool {
        self.session.should_resume()
    }

    /// Whether another connection attempt is allowed. `false` after a
    /// fatal close code (bad token, bad intents, bad shard layout).
    pub fn should_reconnect(&self) -> bool {
        self.session
            .classification
            .is_none_or(CloseClassification::reconnectable)
    }

    /// A close frame has been sent or received.
    pub fn closing(&self) -> bool {
        self.session.closing
    }

    /// The websocket reached its terminal state.
    pub fn closed(&self) -> bool {
        self.session.closed
    }

    /// Interval between heartbeats announced by HELLO.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.session.heartbeat_interval
    }

    /// Whether the most recent heartbeat was acknowledged.
    pub fn acknowledged(&self) -> bool {
        self.session.acknowledged
    }

    /// Snapshot of the session identity.
    pub fn session(&self) -> SessionInfo {
        self.session.info()
    }

    /// Produce the websocket upgrade request. Safe to call repeatedly
    /// while the handshake has not completed; fails once it has.
    pub fn connect(&mut self) -> Result<Vec<u8>, StateError> {
        ensure!(self.engine.is_connecting(), error::AlreadyUpgraded);

        let uri = self.upgrade_uri();
        log::debug!("upgrade request for {uri}");
        Ok(self.engine.initiate(&uri))
    }

    fn upgrade_uri(&self) -> String {
        let (host, _) = self.destination();
        let mut uri = format!(
            "wss://{host}/?v={API_VERSION}&encoding={}",
            self.encoding.wire_name()
        );
        if self.stream_compression {
            uri.push_str("&compress=zlib-stream");
        }
        uri
    }

    /// Feed bytes received from the socket and collect the buffers to
    /// transmit, in order. An empty slice signals end-of-stream.
    ///
    /// Gateway events decoded along the way are queued for
    /// [`events`](Self::events).
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, ReceiveError> {
        let ws_events = match self.engine.feed(data) {
            Ok(events) => events,
            Err(FeedError::StreamReset) => {
                log::debug!("peer hung up without a close frame");
                self.session.record_classification(CloseClassification::Resumable);
                self.session.closing = true;
                self.session.closed = true;
                return error::Disconnected.fail();
            }
            Err(FeedError::Machine { source }) => {
                return Err(ReceiveError::Protocol {
                    source: ProtocolError::Websocket { source },
                });
            }
        };

        let mut replies: Vec<Vec<u8>> = Vec::new();
        let mut close: Option<(Option<u16>, Option<String>)> = None;

        for event in ws_events {
            match event {
                WsEvent::Accepted => log::debug!("gateway accepted the upgrade"),
                WsEvent::Rejected { status, body } => {
                    self.session.closing = true;
                    self.session.closed = true;
                    // 5xx refusals are worth retrying, everything else
                    // will refuse again
                    let verdict = if status >= 500 {
                        CloseClassification::NonResumable
                    } else {
                        CloseClassification::Fatal
                    };
                    self.session.record_classification(verdict);
                    return Err(ReceiveError::Rejected { status, body });
                }
                WsEvent::Ping(_) => log::trace!("ping answered"),
                WsEvent::Pong(_) => log::trace!("pong received"),
                WsEvent::Message { data, binary } => {
                    let raw = self
                        .codec
                        .decode(data, binary)
                        .map_err(|source| ReceiveError::Protocol { source })?;
                    self.handle_payload(raw, &mut replies)?;
                }
                WsEvent::CloseReceived { code, reason } => {
                    log::debug!("close frame with code {code:?}");
                    self.session.closing = true;
                    self.session.record_classification(classify(code));
                    close = Some((code, reason));
                }
                WsEvent::Terminated => {
                    log::debug!("websocket terminated");
                    self.session.closing = true;
                    self.session.closed = true;
                }
            }
        }

        let leftover = self.engine.take_outgoing();
        if !leftover.is_empty() {
            replies.push(leftover);
        }

        if let Some((code, reason)) = close {
            // both sides have acted once the echo is on its way; nothing
            // further will flow on this websocket
            self.session.closed = true;
            let reply = replies.concat();
            let reply = (!reply.is_empty()).then_some(reply);
            return Err(ReceiveError::Closed { reply, code, reason });
        }

        Ok(replies)
    }

    fn handle_payload(
        &mut self,
        raw: RawPayload,
        replies: &mut Vec<Vec<u8>>,
    ) -> Result<(), ReceiveError> {
        if let Some(sequence) = raw.s {
            self.session.observe_sequence(sequence);
        }

        let message = ServerMessage::classify(raw)
            .map_err(|source| ReceiveError::Protocol { source })?;

        match message {
            ServerMessage::Dispatch(event) => {
                log::trace!("dispatch {} (seq {:?})", event.name, event.sequence);
                if event.name == "READY" {
                    self.capture_ready(&event);
                }
                self.events.push_back(event);
            }
            ServerMessage::Hello { payload, data } => {
                if self.session.heartbeat_interval.is_some() {
                    return Err(ReceiveError::Protocol {
                        source: ProtocolError::UnexpectedHello,
                    });
                }

                let interval = Duration::from_millis(payload.heartbeat_interval);
                log::debug!("HELLO, heartbeat interval {interval:?}");

                self.session.heartbeat_interval = Some(interval);
                self.session.reconnect_attempts = 0;
                self.session.acknowledged = true;

                self.events.push_back(Event {
                    name: Opcode::Hello.name().to_string(),
                    data,
                    sequence: None,
                });
            }
            ServerMessage::HeartbeatRequest => {
                log::debug!("gateway requested an immediate heartbeat");
                // requested heartbeats take no part in the ack cycle
                let bytes = self.send_heartbeat_payload();
                if !bytes.is_empty() {
                    replies.push(bytes);
                }
                self.internal_event(Opcode::Heartbeat, Value::Null);
            }
            ServerMessage::HeartbeatAck => {
                log::trace!("heartbeat acknowledged");
                self.session.acknowledged = true;
                self.internal_event(Opcode::HeartbeatAck, Value::Null);
            }
            ServerMessage::Reconnect => {
                log::debug!("gateway requested a reconnect, closing to resume");
                let bytes = self.begin_close(RECOVERABLE_CLOSE, "reconnect requested");
                if !bytes.is_empty() {
                    replies.push(bytes);
                }
                self.internal_event(Opcode::Reconnect, Value::Null);
            }
            ServerMessage::InvalidSession { resumable } => {
                log::warn!("session invalidated (resumable: {resumable})");
                let bytes = if resumable {
                    self.begin_close(RECOVERABLE_CLOSE, "invalid session")
                } else {
                    self.session.clear_identity();
                    self.session
                        .record_classification(CloseClassification::NonResumable);
                    self.begin_close(GRACEFUL_CLOSE, "invalid session")
                };
                if !bytes.is_empty() {
                    replies.push(bytes);
                }
                self.internal_event(Opcode::InvalidSession, Value::Bool(resumable));
            }
            ServerMessage::Unknown { op } => log::warn!("ignoring unknown gateway op-code {op}"),
        }

        Ok(())
    }

    fn capture_ready(&mut self, event: &Event) {
        match serde_json::from_value::<Ready>(event.data.clone()) {
            Ok(ready) => {
                log::debug!("READY for session {}", ready.session_id);
                self.session.session_id = Some(ready.session_id);
                match normalize_host(&ready.resume_gateway_url) {
                    Ok(host) => self.session.resume_gateway_url = Some(host),
                    Err(e) => log::warn!("ignoring unusable resume gateway url: {e}"),
                }
            }
            Err(e) => log::warn!("READY dispatch without usable session fields: {e}"),
        }
    }

    fn internal_event(&mut self, op: Opcode, data: Value) {
        if self.surface_internal {
            self.events.push_back(Event {
                name: op.name().to_string(),
                data,
                sequence: None,
            });
        }
    }

    /// Drain queued gateway events, oldest first. Draining is destructive;
    /// events not consumed from the iterator stay queued.
    pub fn events(&mut self) -> impl Iterator<Item = Event> + '_ {
        std::iter::from_fn(|| self.events.pop_front())
    }

    /// Produce an IDENTIFY payload starting a fresh session.
    ///
    /// Fails before HELLO, or while a resumable session demands
    /// [`resume`](Self::resume) instead. Returns an empty buffer once the
    /// connection is closing.
    pub fn identify(&mut self, identify: Identify) -> Result<Vec<u8>, StateError> {
        ensure!(
            self.session.heartbeat_interval.is_some(),
            error::HelloNotReceived
        );
        ensure!(!self.session.should_resume(), error::SessionResumable);
        if let Some(value) = identify.large_threshold {
            ensure!((50..=250).contains(&value), error::LargeThreshold { value });
        }

        if self.session.closing || self.session.closed {
            return Ok(Vec::new());
        }

        if let Some(compress) = identify.compress {
            self.codec.set_payload_compression(compress);
        }
        self.session.clear_verdict();

        log::debug!("IDENTIFY with intents {}", identify.intents);
        Ok(self.send_command(Opcode::Identify, serde_json::to_value(&identify).unwrap()))
    }

    /// Produce a RESUME payload continuing the held session.
    ///
    /// Fails before HELLO or when no resumable session is held. Returns an
    /// empty buffer once the connection is closing.
    pub fn resume(&mut self, token: &str) -> Result<Vec<u8>, StateError> {
        ensure!(
            self.session.heartbeat_interval.is_some(),
            error::HelloNotReceived
        );
        ensure!(self.session.should_resume(), error::NotResumable);

        let Some(session_id) = self.session.session_id.clone() else {
            return error::NotResumable.fail();
        };
        let Some(seq) = self.session.sequence else {
            return error::NotResumable.fail();
        };

        if self.session.closing || self.session.closed {
            return Ok(Vec::new());
        }

        self.session.clear_verdict();

        let resume = Resume {
            token: token.to_string(),
            session_id,
            seq,
        };
        log::debug!("RESUME session {} at seq {seq}", resume.session_id);
        Ok(self.send_command(Opcode::Resume, serde_json::to_value(&resume).unwrap()))
    }

    /// Produce a heartbeat carrying the current sequence.
    ///
    /// If the previous heartbeat was never acknowledged the connection is
    /// zombied: a close with code 4000 is produced instead and the session
    /// kept for resumption. Empty once the connection is closing or before
    /// HELLO.
    pub fn heartbeat(&mut self) -> Vec<u8> {
        if self.session.closing || self.session.closed {
            return Vec::new();
        }
        if self.session.heartbeat_interval.is_none() {
            return Vec::new();
        }

        if !self.session.acknowledged {
            log::warn!("heartbeat never acknowledged, closing as zombied");
            return self.begin_close(RECOVERABLE_CLOSE, "zombied connection");
        }

        self.session.acknowledged = false;
        self.send_heartbeat_payload()
    }

    /// Start the closing handshake. Codes 1000 and 1001 end the session;
    /// keep receiving until [`receive`](Self::receive) reports
    /// [`Closed`](ReceiveError::Closed), then drop the socket.
    pub fn close(&mut self, code: u16, reason: &str) -> Vec<u8> {
        if self.session.closing || self.session.closed {
            return Vec::new();
        }

        log::debug!("closing the gateway connection with code {code}");
        self.begin_close(code, reason)
    }

    /// Request guild member chunks (op 8). The chunks arrive as
    /// GUILD_MEMBERS_CHUNK dispatches.
    pub fn request_guild_members(
        &mut self,
        request: &RequestGuildMembers,
    ) -> Result<Vec<u8>, StateError> {
        self.command(Opcode::RequestGuildMembers, request)
    }

    /// Join, move within or leave a voice channel (op 4).
    pub fn update_voice_state(&mut self, update: &VoiceStateUpdate) -> Result<Vec<u8>, StateError> {
        self.command(Opcode::VoiceStateUpdate, update)
    }

    /// Replace the client presence (op 3).
    pub fn update_presence(&mut self, presence: &UpdatePresence) -> Result<Vec<u8>, StateError> {
        self.command(Opcode::PresenceUpdate, presence)
    }

    fn command<T: serde::Serialize>(&mut self, op: Opcode, body: &T) -> Result<Vec<u8>, StateError> {
        ensure!(
            self.session.heartbeat_interval.is_some(),
            error::HelloNotReceived
        );

        if self.session.closing || self.session.closed {
            return Ok(Vec::new());
        }

        Ok(self.send_command(op, serde_json::to_value(body).unwrap()))
    }

    /// Reset for a new connection attempt and return how long to sleep
    /// before making it.
    ///
    /// What survives depends on how the last connection ended: a resumable
    /// disconnect keeps the session identity for [`resume`](Self::resume),
    /// anything else clears it, and a graceful close also restarts the
    /// backoff. Fails when the last close was fatal.
    pub fn reconnect(&mut self) -> Result<Duration, StateError> {
        let verdict = self
            .session
            .classification
            .unwrap_or(CloseClassification::NonResumable);

        match verdict {
            CloseClassification::Fatal => return error::FatalClose.fail(),
            CloseClassification::Graceful => {
                self.session.clear_identity();
                self.session.reconnect_attempts = 0;
            }
            CloseClassification::NonResumable => self.session.clear_identity(),
            CloseClassification::Resumable => {}
        }

        self.session.reconnect_attempts += 1;
        self.session.reopen();
        self.events.clear();
        self.engine.reset();
        self.codec.reset();

        let exponent = (self.session.reconnect_attempts - 1).min(6);
        let base = (1u64 << exponent).min(BACKOFF_CAP);
        let delay = base as f64 + rand::random::<f64>();

        log::debug!(
            "reconnect attempt {} ({verdict:?}), sleeping {delay:.2}s",
            self.session.reconnect_attempts
        );
        Ok(Duration::from_secs_f64(delay))
    }

    fn begin_close(&mut self, code: u16, reason: &str) -> Vec<u8> {
        self.session.record_classification(classify(Some(code)));
        self.session.closing = true;
        self.engine.send_close(code, reason)
    }

    fn send_heartbeat_payload(&mut self) -> Vec<u8> {
        let d = match self.session.sequence {
            Some(seq) => Value::from(seq),
            None => Value::Null,
        };
        self.send_command(Opcode::Heartbeat, d)
    }

    fn send_command(&mut self, op: Opcode, d: Value) -> Vec<u8> {
        let text = self.codec.encode(&RawPayload::command(op, d));
        let bytes = self.engine.send_text(text);
        if bytes.is_empty() {
            log::debug!("{} produced no bytes", op.name());
        }
        bytes
    }
}

/// Reduce a configured gateway location to a bare hostname.
fn normalize_host(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim_end_matches('/');

    let host = if trimmed.contains("://") {
        let parsed = url::Url::parse(trimmed).context(error::InvalidHost { host: raw })?;
        parsed
            .host_str()
            .map(str::to_string)
            .with_context(|| error::NoHost { host: raw })?
    } else {
        trimmed.to_string()
    };

    // catches hosts that would not survive uri construction later
    url::Url::parse(&format!("wss://{host}/"))
        .context(error::InvalidHost { host: raw })?
        .host_str()
        .map(str::to_string)
        .with_context(|| error::NoHost { host: raw })
}
