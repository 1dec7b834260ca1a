//! In-process scripted server for exercising the engine without a socket.
//!
//! Every request is decoded and handed to a handler closure which decides how
//! the "server" answers: a reply, raw bytes, silence until the deadline, or a
//! dropped connection.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{AbortHandle, Connector, Endpoint, Transport};
use crate::codec::{HandshakeAck, Message, Update, WireCodec};
use crate::error::{ConnectError, TransportError};

/// How the mock server answers one request
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Encode and send back, in the request's wire format
    Reply(Message),
    /// Send these bytes verbatim as the response payload
    Raw(Vec<u8>),
    /// Never answer
    Timeout,
    /// Drop the connection
    Drop,
}

type Handler = Box<dyn FnMut(&Message) -> MockResponse + Send>;

struct MockState {
    handler: Handler,
    received: Vec<Message>,
    connections: usize,
    refuse: u32,
}

/// Cloneable handle; clones share the handler and the recorded traffic
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new(handler: impl FnMut(&Message) -> MockResponse + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                handler: Box::new(handler),
                received: Vec::new(),
                connections: 0,
                refuse: 0,
            })),
        }
    }

    /// Server that accepts every declaration and answers exchanges with nothing
    pub fn accept_all() -> Self {
        Self::new(|message| MockResponse::Reply(accept(message)))
    }

    pub fn set_handler(&self, handler: impl FnMut(&Message) -> MockResponse + Send + 'static) {
        self.state.lock().handler = Box::new(handler);
    }

    /// Refuse the next `n` connection attempts
    pub fn refuse_next(&self, n: u32) {
        self.state.lock().refuse = n;
    }

    /// Every decoded request so far, oldest first
    pub fn received(&self) -> Vec<Message> {
        self.state.lock().received.clone()
    }

    /// Number of successful connections
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }
}

/// Default answer of a cooperative server: echo the handshake declaration and
/// reply to exchanges with an empty update at the client's time
pub fn accept(message: &Message) -> Message {
    match message {
        Message::Handshake(handshake) => Message::HandshakeAck(HandshakeAck {
            send: handshake.send.clone(),
            receive: handshake.receive.clone(),
            sim_time: 0.0,
            resume: Vec::new(),
        }),
        Message::Exchange(exchange) => Message::Update(Update {
            sim_time: exchange.sim_time,
            objects: Vec::new(),
            api_results: Vec::new(),
        }),
        Message::Close => Message::Close,
        other => Message::Reset {
            reason: format!("unexpected {}", other.name()),
        },
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let mut state = self.state.lock();
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(ConnectError::Unreachable {
                address: endpoint.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused by mock"),
            });
        }
        state.connections += 1;

        Ok(Box::new(MockTransport {
            state: self.state.clone(),
            pending: None,
            wake: Arc::new((Mutex::new(false), Condvar::new())),
        }))
    }
}

struct MockTransport {
    state: Arc<Mutex<MockState>>,
    pending: Option<(u64, WireCodec, MockResponse)>,
    wake: Arc<(Mutex<bool>, Condvar)>,
}

impl MockTransport {
    fn aborted(&self) -> bool {
        *self.wake.0.lock()
    }

    /// Block until `deadline` unless aborted first
    fn wait_until(&self, deadline: Instant) -> TransportError {
        let (flag, signal) = &*self.wake;
        let mut aborted = flag.lock();
        while !*aborted {
            if signal.wait_until(&mut aborted, deadline).timed_out() {
                return TransportError::Timeout;
            }
        }
        TransportError::Aborted
    }
}

impl Transport for MockTransport {
    fn send_frame(&mut self, sequence: u64, payload: &[u8]) -> Result<(), TransportError> {
        if self.aborted() {
            return Err(TransportError::Closed);
        }

        let format = crate::codec::read_header(payload)
            .map(|header| header.format)
            .unwrap_or_default();
        let codec = WireCodec::new(format);
        let message = codec
            .decode_message(payload)
            .map_err(|e| TransportError::InvalidFrame(e.to_string()))?;

        let mut state = self.state.lock();
        let response = (state.handler)(&message);
        state.received.push(message);
        self.pending = Some((sequence, codec, response));
        Ok(())
    }

    fn recv_frame(&mut self, deadline: Instant) -> Result<(u64, Vec<u8>), TransportError> {
        if self.aborted() {
            return Err(TransportError::Closed);
        }

        match self.pending.take() {
            Some((sequence, codec, MockResponse::Reply(message))) => {
                let bytes = codec
                    .encode_message(&message)
                    .map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
                Ok((sequence, bytes))
            }
            Some((sequence, _, MockResponse::Raw(bytes))) => Ok((sequence, bytes)),
            Some((_, _, MockResponse::Drop)) => Err(TransportError::Closed),
            Some((_, _, MockResponse::Timeout)) | None => Err(self.wait_until(deadline)),
        }
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let wake = self.wake.clone();
        Some(AbortHandle::new(move || {
            let (flag, signal) = &*wake;
            *flag.lock() = true;
            signal.notify_all();
        }))
    }
}
