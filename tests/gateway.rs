//! End-to-end protocol scenarios against a conforming websocket server.

mod common;

use std::time::Duration;

use common::MockGateway;
use hawser::error::{ProtocolError, ReceiveError, StateError};
use hawser::payload::{
    ConnectionProperties, Identify, RequestGuildMembers, UpdatePresence, VoiceStateUpdate,
};
use hawser::{Compression, Connection, Encoding};
use serde_json::{json, Value};
use tungstenite::Message;

fn props() -> ConnectionProperties {
    ConnectionProperties {
        os: "linux".to_string(),
        browser: "x".to_string(),
        device: "x".to_string(),
    }
}

fn hello_json() -> Value {
    json!({"op": 10, "d": {"heartbeat_interval": 41250}, "s": null, "t": null})
}

fn ready_json() -> Value {
    json!({
        "op": 0,
        "s": 1,
        "t": "READY",
        "d": {
            "v": 10,
            "session_id": "sid",
            "resume_gateway_url": "wss://resume.discord.gg",
        },
    })
}

/// Upgrade, accept and deliver HELLO; the HELLO event is drained.
fn established() -> (Connection, MockGateway) {
    let mut conn =
        Connection::new("gateway.discord.gg", Encoding::Json, Compression::None).unwrap();

    let (mut gateway, response) = MockGateway::accept(&conn.connect().unwrap());
    assert!(conn.receive(&response).unwrap().is_empty());

    let hello = gateway.send_json(hello_json());
    assert!(conn.receive(&hello).unwrap().is_empty());

    let names: Vec<_> = conn.events().map(|e| e.name).collect();
    assert_eq!(names, ["HELLO"]);

    (conn, gateway)
}

fn text_payload(message: &Message) -> Value {
    serde_json::from_str(message.to_text().unwrap()).unwrap()
}

#[test]
fn test_happy_path_identify() {
    let mut conn =
        Connection::new("gateway.discord.gg", Encoding::Json, Compression::None).unwrap();

    let request = conn.connect().unwrap();
    let text = String::from_utf8_lossy(&request).to_ascii_lowercase();
    assert!(text.starts_with("get /?v=10&encoding=json http/1.1\r\n"));
    assert!(text.contains("host: gateway.discord.gg"));
    assert!(text.contains("sec-websocket-key:"));

    let (mut gateway, response) = MockGateway::accept(&request);
    conn.receive(&response).unwrap();

    conn.receive(&gateway.send_json(hello_json())).unwrap();

    let events: Vec<_> = conn.events().collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "HELLO");
    assert_eq!(events[0].sequence, None);

    assert_eq!(conn.heartbeat_interval(), Some(Duration::from_millis(41250)));
    assert!(conn.acknowledged());
    assert!(!conn.should_resume());

    let identify = conn.identify(Identify::new("T", 513, props())).unwrap();
    let sent = gateway.feed(&identify);
    assert_eq!(sent.len(), 1);

    let payload = text_payload(&sent[0]);
    assert_eq!(payload["op"], 2);
    assert_eq!(payload["d"]["token"], "T");
    assert_eq!(payload["d"]["intents"], 513);
    assert_eq!(
        payload["d"]["properties"],
        json!({"os": "linux", "browser": "x", "device": "x"})
    );
}

#[test]
fn test_connect_is_idempotent_until_upgraded() {
    let mut conn =
        Connection::new("gateway.discord.gg", Encoding::Json, Compression::None).unwrap();

    let first = conn.connect().unwrap();
    let second = conn.connect().unwrap();
    assert_eq!(first, second);

    let (_gateway, response) = MockGateway::accept(&first);
    conn.receive(&response).unwrap();

    assert!(matches!(conn.connect(), Err(StateError::AlreadyUpgraded)));
}

#[test]
fn test_heartbeat_ack_cycle() {
    let (mut conn, mut gateway) = established();

    let beat = conn.heartbeat();
    let sent = gateway.feed(&beat);
    assert_eq!(text_payload(&sent[0]), json!({"op": 1, "d": null}));
    assert!(!conn.acknowledged());

    let ack = gateway.send_json(json!({"op": 11, "d": null, "s": null, "t": null}));
    conn.receive(&ack).unwrap();
    assert!(conn.acknowledged());

    // with the sequence known, the next heartbeat carries it
    conn.receive(&gateway.send_json(ready_json())).unwrap();
    let beat = conn.heartbeat();
    let sent = gateway.feed(&beat);
    assert_eq!(text_payload(&sent[0]), json!({"op": 1, "d": 1}));
}

#[test]
fn test_zombied_connection_closes_with_4000() {
    let (mut conn, mut gateway) = established();

    let first = conn.heartbeat();
    assert!(!first.is_empty());

    // no ack in between: the second heartbeat turns into a close
    let close_frame = conn.heartbeat();
    assert!(!close_frame.is_empty());
    assert!(conn.closing());

    gateway.feed(&first);
    let messages = gateway.feed(&close_frame);
    match messages.last() {
        Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 4000),
        other => panic!("expected a close frame, got {other:?}"),
    }

    assert!(conn.heartbeat().is_empty());
}

#[test]
fn test_server_requested_heartbeat_is_immediate() {
    let (mut conn, mut gateway) = established();

    let request = gateway.send_json(json!({"op": 1, "d": null, "s": null, "t": null}));
    let replies = conn.receive(&request).unwrap();
    assert_eq!(replies.len(), 1);

    let sent = gateway.feed(&replies[0]);
    assert_eq!(text_payload(&sent[0]), json!({"op": 1, "d": null}));

    // a requested heartbeat is not part of the ack cycle
    assert!(conn.acknowledged());
}

#[test]
fn test_server_ping_is_answered() {
    let (mut conn, mut gateway) = established();

    let ping = gateway.ping(b"ts");
    let replies = conn.receive(&ping).unwrap();
    assert_eq!(replies.len(), 1);

    let messages = gateway.feed(&replies[0]);
    assert!(matches!(&messages[0], Message::Pong(p) if p.as_slice() == b"ts"));
}

#[test]
fn test_reconnect_request_leads_to_resumable_session() {
    let (mut conn, mut gateway) = established();
    conn.receive(&gateway.send_json(ready_json())).unwrap();
    assert_eq!(conn.events().count(), 1);

    let request = gateway.send_json(json!({"op": 7, "d": null, "s": null, "t": null}));
    let replies = conn.receive(&request).unwrap();
    assert_eq!(replies.len(), 1);
    assert!(conn.closing());

    // the server sees our close and echoes it back
    let messages = gateway.feed(&replies[0]);
    match messages.last() {
        Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 4000),
        other => panic!("expected a close frame, got {other:?}"),
    }

    let echo = gateway.drain();
    let err = conn.receive(&echo).unwrap_err();
    match err {
        ReceiveError::Closed { reply, code, .. } => {
            assert!(reply.is_none());
            assert_eq!(code, Some(4000));
        }
        other => panic!("expected Closed, got {other:?}"),
    }

    assert!(conn.should_reconnect());
    let delay = conn.reconnect().unwrap();
    assert!((1.0..2.0).contains(&delay.as_secs_f64()));

    assert!(conn.should_resume());
    let session = conn.session();
    assert_eq!(session.session_id.as_deref(), Some("sid"));
    assert_eq!(session.sequence, Some(1));
    assert_eq!(session.reconnect_attempts, 1);
    assert_eq!(conn.destination(), ("resume.discord.gg", 443));
}

#[test]
fn test_resume_after_reconnect() {
    let (mut conn, mut gateway) = established();
    conn.receive(&gateway.send_json(ready_json())).unwrap();

    let replies = conn
        .receive(&gateway.send_json(json!({"op": 7, "d": null, "s": null, "t": null})))
        .unwrap();
    gateway.feed(&replies[0]);
    conn.receive(&gateway.drain()).unwrap_err();
    conn.reconnect().unwrap();

    // the fresh websocket targets the resume endpoint
    let request = conn.connect().unwrap();
    assert!(String::from_utf8_lossy(&request)
        .to_ascii_lowercase()
        .contains("host: resume.discord.gg"));

    let (mut gateway, response) = MockGateway::accept(&request);
    conn.receive(&response).unwrap();
    conn.receive(&gateway.send_json(hello_json())).unwrap();

    assert_eq!(conn.session().reconnect_attempts, 0);
    assert!(conn.should_resume());

    // identifying while resumable is a misuse
    assert!(matches!(
        conn.identify(Identify::new("T", 513, props())),
        Err(StateError::SessionResumable)
    ));

    let resume = conn.resume("T").unwrap();
    let sent = gateway.feed(&resume);
    let payload = text_payload(&sent[0]);
    assert_eq!(payload["op"], 6);
    assert_eq!(payload["d"]["token"], "T");
    assert_eq!(payload["d"]["session_id"], "sid");
    assert_eq!(payload["d"]["seq"], 1);
}

#[test]
fn test_invalid_session_false_clears_the_session() {
    let (mut conn, mut gateway) = established();
    conn.receive(&gateway.send_json(ready_json())).unwrap();
    assert_eq!(conn.session().session_id.as_deref(), Some("sid"));

    let replies = conn
        .receive(&gateway.send_json(json!({"op": 9, "d": false, "s": null, "t": null})))
        .unwrap();
    assert_eq!(replies.len(), 1);

    let session = conn.session();
    assert_eq!(session.session_id, None);
    assert_eq!(session.sequence, None);

    let messages = gateway.feed(&replies[0]);
    match messages.last() {
        Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 1000),
        other => panic!("expected a close frame, got {other:?}"),
    }

    conn.receive(&gateway.drain()).unwrap_err();
    conn.reconnect().unwrap();
    assert!(!conn.should_resume());
    assert_eq!(conn.session().reconnect_attempts, 1);
}

#[test]
fn test_fatal_close_forbids_reconnecting() {
    let (mut conn, mut gateway) = established();

    let close_bytes = gateway.close(4004, "Authentication failed.");
    let err = conn.receive(&close_bytes).unwrap_err();
    match err {
        ReceiveError::Closed {
            reply,
            code,
            reason,
        } => {
            // the peer initiated, so we owe it the echo
            assert!(reply.is_some());
            assert_eq!(code, Some(4004));
            assert_eq!(reason.as_deref(), Some("Authentication failed."));
        }
        other => panic!("expected Closed, got {other:?}"),
    }

    assert!(conn.closed());
    assert!(!conn.should_reconnect());
    assert!(matches!(conn.reconnect(), Err(StateError::FatalClose)));
}

#[test]
fn test_end_of_stream_is_a_resumable_disconnect() {
    let (mut conn, mut gateway) = established();
    conn.receive(&gateway.send_json(ready_json())).unwrap();

    let err = conn.receive(&[]).unwrap_err();
    assert!(matches!(err, ReceiveError::Disconnected));
    assert!(conn.closed());

    conn.reconnect().unwrap();
    assert!(conn.should_resume());
}

#[test]
fn test_backoff_grows_until_hello() {
    let (mut conn, mut gateway) = established();
    conn.receive(&gateway.send_json(ready_json())).unwrap();
    conn.receive(&[]).unwrap_err();

    let first = conn.reconnect().unwrap();
    assert!((1.0..2.0).contains(&first.as_secs_f64()));

    // the next attempt dies before anything arrives
    conn.receive(&[]).unwrap_err();
    let second = conn.reconnect().unwrap();
    assert!((2.0..3.0).contains(&second.as_secs_f64()));
    assert!(second > first);
}

#[test]
fn test_second_hello_is_a_protocol_error() {
    let (mut conn, mut gateway) = established();

    let err = conn.receive(&gateway.send_json(hello_json())).unwrap_err();
    assert!(matches!(
        err,
        ReceiveError::Protocol {
            source: ProtocolError::UnexpectedHello
        }
    ));
}

#[test]
fn test_close_silences_payload_methods() {
    let (mut conn, _gateway) = established();

    assert!(!conn.close(1000, "done").is_empty());
    assert!(conn.closing());

    assert!(conn.heartbeat().is_empty());
    assert!(conn.close(1000, "again").is_empty());
    assert!(conn.identify(Identify::new("T", 513, props())).unwrap().is_empty());
}

#[test]
fn test_dispatch_order_and_sequence_tracking() {
    let (mut conn, mut gateway) = established();

    let mut batch = gateway.send_json(json!({
        "op": 0, "s": 5, "t": "GUILD_CREATE", "d": {"id": "1"},
    }));
    batch.extend(gateway.send_json(json!({
        "op": 0, "s": 3, "t": "MESSAGE_CREATE", "d": {"id": "2"},
    })));

    conn.receive(&batch).unwrap();

    let events: Vec<_> = conn.events().collect();
    let names: Vec<_> = events.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["GUILD_CREATE", "MESSAGE_CREATE"]);

    // a stale sequence on the wire never lowers the stored one
    assert_eq!(conn.session().sequence, Some(5));
}

#[test]
fn test_internal_events_can_be_surfaced() {
    let (mut conn, mut gateway) = established();
    conn.surface_internal_events(true);

    let ack = gateway.send_json(json!({"op": 11, "d": null, "s": null, "t": null}));
    conn.receive(&ack).unwrap();

    let events: Vec<_> = conn.events().collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "HEARTBEAT_ACK");
}

#[test]
fn test_update_presence_payload() {
    let (mut conn, mut gateway) = established();

    let bytes = conn
        .update_presence(&UpdatePresence {
            since: None,
            activities: vec![],
            status: "online".to_string(),
            afk: false,
        })
        .unwrap();

    let sent = gateway.feed(&bytes);
    let payload = text_payload(&sent[0]);
    assert_eq!(payload["op"], 3);
    assert_eq!(
        payload["d"],
        json!({"since": null, "activities": [], "status": "online", "afk": false})
    );
}

#[test]
fn test_guild_member_and_voice_commands() {
    let (mut conn, mut gateway) = established();

    let bytes = conn
        .request_guild_members(&RequestGuildMembers {
            query: Some(String::new()),
            ..RequestGuildMembers::all_of(81384788765712384)
        })
        .unwrap();
    let payload = text_payload(&gateway.feed(&bytes)[0]);
    assert_eq!(payload["op"], 8);
    assert_eq!(payload["d"], json!({"guild_id": 81384788765712384u64, "query": ""}));

    let bytes = conn
        .update_voice_state(&VoiceStateUpdate {
            guild_id: 81384788765712384,
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        })
        .unwrap();
    let payload = text_payload(&gateway.feed(&bytes)[0]);
    assert_eq!(payload["op"], 4);
    assert_eq!(payload["d"]["channel_id"], Value::Null);

    // gateway commands need a live session layer
    let mut cold =
        Connection::new("gateway.discord.gg", Encoding::Json, Compression::None).unwrap();
    assert!(matches!(
        cold.update_voice_state(&VoiceStateUpdate {
            guild_id: 1,
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        }),
        Err(StateError::HelloNotReceived)
    ));
}

#[test]
fn test_zlib_stream_transport() {
    /// a zlib stream chunk made of stored blocks, ending at a sync-flush
    /// boundary like the real gateway produces
    fn zlib_chunk(payload: &[u8], first: bool) -> Vec<u8> {
        let mut out = Vec::new();
        if first {
            out.extend([0x78, 0x01]);
        }
        out.push(0x00);
        out.extend((payload.len() as u16).to_le_bytes());
        out.extend((!(payload.len() as u16)).to_le_bytes());
        out.extend_from_slice(payload);
        out.extend([0x00, 0x00, 0x00, 0xff, 0xff]);
        out
    }

    let mut conn =
        Connection::new("gateway.discord.gg", Encoding::Json, Compression::Stream).unwrap();

    let request = conn.connect().unwrap();
    assert!(String::from_utf8_lossy(&request).contains("compress=zlib-stream"));

    let (mut gateway, response) = MockGateway::accept(&request);
    conn.receive(&response).unwrap();

    let hello = zlib_chunk(&serde_json::to_vec(&hello_json()).unwrap(), true);
    conn.receive(&gateway.send_binary(hello)).unwrap();
    assert_eq!(conn.heartbeat_interval(), Some(Duration::from_millis(41250)));

    // later messages ride the same shared inflater state
    let ready = zlib_chunk(&serde_json::to_vec(&ready_json()).unwrap(), false);
    conn.receive(&gateway.send_binary(ready)).unwrap();
    assert_eq!(conn.session().session_id.as_deref(), Some("sid"));

    let names: Vec<_> = conn.events().map(|e| e.name).collect();
    assert_eq!(names, ["HELLO", "READY"]);
}
