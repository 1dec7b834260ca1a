//! Transport session: the only owner of the connection to the multiverse server.
//!
//! A [`Session`] performs one blocking request/response exchange at a time under
//! a bounded timeout. Requests carry a monotonically increasing sequence number;
//! responses that echo an older sequence (late answers to timed-out requests)
//! are discarded. Reconnecting is never automatic, the engine decides when.

pub mod frame;
pub mod mock;
pub mod tcp;
pub mod threaded;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ConnectError, TransportError};

pub use mock::{MockConnector, MockResponse};
pub use tcp::TcpConnector;
pub use threaded::ThreadedConnector;

/// A framed, bidirectional byte channel
pub trait Transport: Send {
    fn send_frame(&mut self, sequence: u64, payload: &[u8]) -> Result<(), TransportError>;

    /// Block until a frame arrives or `deadline` passes
    fn recv_frame(&mut self, deadline: Instant) -> Result<(u64, Vec<u8>), TransportError>;

    /// Handle that interrupts a blocked `recv_frame` from another thread
    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }

    fn close(&mut self) {}
}

/// Opens transports to an endpoint
pub trait Connector: Send {
    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectError>;
}

/// Thread-safe callback that cancels in-flight I/O
#[derive(Clone)]
pub struct AbortHandle(Arc<dyn Fn() + Send + Sync>);

impl AbortHandle {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn abort(&self) {
        (self.0)()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AbortHandle")
    }
}

/// Server address, `tcp://host:port` or bare `host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(address: &str) -> Result<Self, ConnectError> {
        let invalid = || ConnectError::InvalidAddress(address.to_string());

        let trimmed = address.trim();
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("tcp://{trimmed}")
        };

        let url = Url::parse(&with_scheme).map_err(|_| invalid())?;
        if url.scheme() != "tcp" || !matches!(url.path(), "" | "/") {
            return Err(invalid());
        }

        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let port = url.port().ok_or_else(invalid)?;

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Upper bound for one exchange, and for establishing the connection
    pub timeout: Duration,
    /// Consecutive failed exchanges before the session disconnects
    pub failure_threshold: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(100),
            failure_threshold: 3,
        }
    }
}

pub struct Session {
    endpoint: Endpoint,
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
    sequence: u64,
    consecutive_failures: u32,
    options: SessionOptions,
    cancelled: Arc<AtomicBool>,
    transport_abort: Option<AbortHandle>,
}

impl Session {
    /// Open a session to `address` through `connector`
    pub fn connect(
        address: &str,
        connector: &dyn Connector,
        options: SessionOptions,
    ) -> Result<Self, ConnectError> {
        let endpoint = Endpoint::parse(address)?;
        debug!(endpoint = %endpoint, "Connecting");

        let transport = connector.connect(&endpoint, options.timeout)?;
        let transport_abort = transport.abort_handle();
        info!(endpoint = %endpoint, "Connected");

        Ok(Self {
            endpoint,
            transport: Some(transport),
            state: ConnectionState::Connected,
            sequence: 0,
            consecutive_failures: 0,
            options,
            cancelled: Arc::new(AtomicBool::new(false)),
            transport_abort,
        })
    }

    /// Send `payload` and block until the matching response arrives or the
    /// timeout elapses
    pub fn send_request(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.cancelled.load(Ordering::SeqCst) {
            self.disconnect();
            return Err(TransportError::Aborted);
        }
        if self.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        self.sequence += 1;
        let sequence = self.sequence;
        let deadline = Instant::now() + self.options.timeout;

        let result = transport.send_frame(sequence, payload).and_then(|()| loop {
            let (found, response) = transport.recv_frame(deadline)?;
            if found == sequence {
                break Ok(response);
            }
            if found < sequence {
                debug!(expected = sequence, found, "Discarding stale response");
                continue;
            }
            break Err(TransportError::UnexpectedSequence {
                expected: sequence,
                found,
            });
        });

        match result {
            Ok(response) => {
                self.consecutive_failures = 0;
                Ok(response)
            }
            Err(_) if self.cancelled.load(Ordering::SeqCst) => {
                self.disconnect();
                Err(TransportError::Aborted)
            }
            Err(err) => Err(self.record_failure(err)),
        }
    }

    fn record_failure(&mut self, err: TransportError) -> TransportError {
        self.consecutive_failures += 1;

        if !err.is_timeout() {
            warn!(endpoint = %self.endpoint, error = %err, "Connection lost");
            self.disconnect();
        } else if self.consecutive_failures >= self.options.failure_threshold {
            warn!(
                endpoint = %self.endpoint,
                failures = self.consecutive_failures,
                "Too many consecutive timeouts, disconnecting"
            );
            self.disconnect();
        } else {
            debug!(
                sequence = self.sequence,
                failures = self.consecutive_failures,
                "Exchange timed out"
            );
        }
        err
    }

    fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Handle that cancels the in-flight exchange and any later one
    pub fn abort_handle(&self) -> AbortHandle {
        let cancelled = self.cancelled.clone();
        let transport_abort = self.transport_abort.clone();
        AbortHandle::new(move || {
            cancelled.store(true, Ordering::SeqCst);
            if let Some(handle) = &transport_abort {
                handle.abort();
            }
        })
    }

    pub fn close(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Closing;
        self.disconnect();
        info!(endpoint = %self.endpoint, "Session closed");
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Sequence number of the most recent request
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("sequence", &self.sequence)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}
