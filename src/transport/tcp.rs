//! Blocking TCP transport

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::trace;

use super::frame::{decode_frame, encode_frame};
use super::{AbortHandle, Connector, Endpoint, Transport};
use crate::error::{ConnectError, TransportError};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let address = endpoint.to_string();
        let unreachable = |source: io::Error| ConnectError::Unreachable {
            address: address.clone(),
            source,
        };

        let candidates: Vec<SocketAddr> = address
            .to_socket_addrs()
            .map_err(unreachable)?
            .collect();

        match connect_any(&candidates, Instant::now() + timeout) {
            Ok((stream, peer)) => {
                stream.set_nodelay(true).map_err(unreachable)?;
                trace!(%peer, "TCP connection established");
                Ok(Box::new(TcpTransport::new(stream, timeout)))
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                Err(ConnectError::Timeout(endpoint.to_string()))
            }
            Err(e) => Err(unreachable(e)),
        }
    }
}

/// Try each candidate in turn; all of them share one deadline
fn connect_any(candidates: &[SocketAddr], deadline: Instant) -> io::Result<(TcpStream, SocketAddr)> {
    let mut last_error = io::Error::new(ErrorKind::NotFound, "no addresses resolved");

    for candidate in candidates {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(ErrorKind::TimedOut, "connect deadline passed"));
        }
        match TcpStream::connect_timeout(candidate, remaining) {
            Ok(stream) => return Ok((stream, *candidate)),
            Err(e) => last_error = e,
        }
    }

    Err(last_error)
}

pub struct TcpTransport {
    stream: TcpStream,
    rx: BytesMut,
    write_timeout: Duration,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, write_timeout: Duration) -> Self {
        Self {
            stream,
            rx: BytesMut::with_capacity(READ_CHUNK),
            write_timeout,
        }
    }
}

/// Read-side mapping: running out of time is retryable
fn map_io(err: io::Error) -> TransportError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::Timeout,
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            TransportError::Closed
        }
        _ => TransportError::Io(err),
    }
}

/// Write-side mapping. Never `Timeout`: a write cut short leaves part of a
/// frame on the stream, so the connection cannot carry another request.
fn map_write_io(err: io::Error) -> TransportError {
    match err.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            TransportError::Closed
        }
        _ => TransportError::Io(err),
    }
}

impl Transport for TcpTransport {
    fn send_frame(&mut self, sequence: u64, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encode_frame(sequence, payload)?;
        self.stream
            .set_write_timeout(Some(self.write_timeout))
            .map_err(map_write_io)?;
        self.stream.write_all(&frame).map_err(map_write_io)?;
        self.stream.flush().map_err(map_write_io)
    }

    fn recv_frame(&mut self, deadline: Instant) -> Result<(u64, Vec<u8>), TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some((sequence, payload)) = decode_frame(&mut self.rx)? {
                return Ok((sequence, payload.to_vec()));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            self.stream
                .set_read_timeout(Some(deadline - now))
                .map_err(map_io)?;

            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io(e)),
            }
        }
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let stream = self.stream.try_clone().ok()?;
        Some(AbortHandle::new(move || {
            let _ = stream.shutdown(Shutdown::Both);
        }))
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionState, Session, SessionOptions};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_frames_cross_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let echo = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut server = TcpTransport::new(stream, Duration::from_secs(1));
            let (sequence, payload) = server
                .recv_frame(Instant::now() + Duration::from_secs(2))
                .unwrap();
            server.send_frame(sequence, &payload).unwrap();
        });

        let mut client = TcpConnector
            .connect(&Endpoint::new("127.0.0.1", port), Duration::from_secs(1))
            .unwrap();
        client.send_frame(42, b"ping").unwrap();
        let (sequence, payload) = client
            .recv_frame(Instant::now() + Duration::from_secs(2))
            .unwrap();

        assert_eq!(sequence, 42);
        assert_eq!(payload, b"ping");
        echo.join().unwrap();
    }

    #[test]
    fn test_silent_peer_times_out_within_bound() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = TcpConnector
            .connect(&Endpoint::new("127.0.0.1", port), Duration::from_secs(1))
            .unwrap();
        let _held = listener.accept().unwrap();

        let started = Instant::now();
        let err = client
            .recv_frame(Instant::now() + Duration::from_millis(50))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_abort_unblocks_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = TcpConnector
            .connect(&Endpoint::new("127.0.0.1", port), Duration::from_secs(1))
            .unwrap();
        let _held = listener.accept().unwrap();
        let abort = client.abort_handle().unwrap();

        let aborter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            abort.abort();
        });

        let started = Instant::now();
        let result = client.recv_frame(Instant::now() + Duration::from_secs(5));
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        aborter.join().unwrap();
    }

    #[test]
    fn test_stalled_write_is_not_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = TcpConnector
            .connect(&Endpoint::new("127.0.0.1", port), Duration::from_millis(50))
            .unwrap();
        // Accepted but never read, so the socket buffers fill up
        let _held = listener.accept().unwrap();

        let payload = vec![7u8; 8 * 1024 * 1024];
        let err = (0..16u64)
            .find_map(|sequence| client.send_frame(sequence, &payload).err())
            .expect("socket buffers never filled");
        assert!(!err.is_timeout(), "{err:?}");
    }

    #[test]
    fn test_stalled_request_disconnects_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut session = Session::connect(
            &format!("tcp://127.0.0.1:{port}"),
            &TcpConnector,
            SessionOptions {
                timeout: Duration::from_millis(50),
                failure_threshold: 100,
            },
        )
        .unwrap();
        let _held = listener.accept().unwrap();

        let payload = vec![7u8; 8 * 1024 * 1024];
        let mut stalled = None;
        for _ in 0..16 {
            match session.send_request(&payload) {
                Err(err) if !err.is_timeout() => {
                    stalled = Some(err);
                    break;
                }
                // Whole frame buffered, the reply timed out
                _ => assert_eq!(session.state(), ConnectionState::Connected),
            }
        }

        assert!(stalled.is_some(), "socket buffers never filled");
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_candidates_share_one_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let started = Instant::now();
        let err = connect_any(&[addr, addr, addr], Instant::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(50));

        let (_stream, peer) =
            connect_any(&[addr], Instant::now() + Duration::from_secs(1)).unwrap();
        assert_eq!(peer, addr);
    }

    #[test]
    fn test_refused_connection_is_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let result =
            TcpConnector.connect(&Endpoint::new("127.0.0.1", port), Duration::from_millis(200));
        assert!(matches!(result, Err(ConnectError::Unreachable { .. })));
    }
}
