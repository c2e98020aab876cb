//! A conforming gateway server to drive the connection against, built from
//! tungstenite's server role over an in-memory stream.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Message, WebSocket};

#[derive(Debug, Default)]
struct PipeState {
    incoming: VecDeque<u8>,
    outgoing: Vec<u8>,
}

/// In-memory stream for the server side of the conversation.
#[derive(Debug, Clone, Default)]
pub struct TestPipe {
    state: Arc<Mutex<PipeState>>,
}

impl TestPipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap()
    }

    fn push_incoming(&self, data: &[u8]) {
        self.lock().incoming.extend(data);
    }

    fn take_outgoing(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().outgoing)
    }
}

impl Read for TestPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.incoming.is_empty() {
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

impl Write for TestPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().outgoing.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The server end of a gateway conversation.
pub struct MockGateway {
    pipe: TestPipe,
    ws: WebSocket<TestPipe>,
}

impl MockGateway {
    /// Accept a client upgrade request, returning the gateway and the
    /// http response bytes for the client.
    pub fn accept(upgrade_request: &[u8]) -> (Self, Vec<u8>) {
        let pipe = TestPipe::default();
        pipe.push_incoming(upgrade_request);

        let ws = match tungstenite::accept(pipe.clone()) {
            Ok(ws) => ws,
            Err(e) => panic!("mock gateway could not accept the upgrade: {e}"),
        };

        let response = pipe.take_outgoing();
        (Self { pipe, ws }, response)
    }

    /// Feed client bytes and return the complete messages read from them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Message> {
        self.pipe.push_incoming(data);

        let mut messages = Vec::new();
        loop {
            match self.ws.read() {
                Ok(message) => messages.push(message),
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(tungstenite::Error::ConnectionClosed) => break,
                Err(e) => panic!("mock gateway read failed: {e}"),
            }
        }
        messages
    }

    /// Send a payload to the client as a text frame.
    pub fn send_json(&mut self, value: serde_json::Value) -> Vec<u8> {
        self.ws.send(Message::Text(value.to_string())).unwrap();
        self.pipe.take_outgoing()
    }

    /// Send raw bytes to the client as a binary frame.
    pub fn send_binary(&mut self, data: Vec<u8>) -> Vec<u8> {
        self.ws.send(Message::Binary(data)).unwrap();
        self.pipe.take_outgoing()
    }

    /// Ping the client.
    pub fn ping(&mut self, payload: &[u8]) -> Vec<u8> {
        self.ws.send(Message::Ping(payload.to_vec())).unwrap();
        self.pipe.take_outgoing()
    }

    /// Close from the server side.
    pub fn close(&mut self, code: u16, reason: &str) -> Vec<u8> {
        self.ws
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            }))
            .unwrap();
        let _ = self.ws.flush();
        self.pipe.take_outgoing()
    }

    /// Bytes the server machine queued on its own, such as the echo of a
    /// client-initiated close.
    pub fn drain(&mut self) -> Vec<u8> {
        let _ = self.ws.flush();
        self.pipe.take_outgoing()
    }
}
