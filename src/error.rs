//! Error taxonomy and retry logic
//!
//! Every failure the synchronization core can hit is one of the typed errors
//! below. The engine catches them at its boundary and turns them into state
//! transitions; nothing here is ever allowed to reach the host tick as a panic.

use std::time::Duration;
use thiserror::Error;

/// Retry policy configuration for reconnect / re-handshake attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Create an aggressive retry policy
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(50),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(3),
        }
    }

    /// Delay to wait before retry number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Whether another attempt is allowed after `attempts` failed ones
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Failures while establishing a session
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Address could not be parsed into host and port
    #[error("Invalid server address '{0}'. Expected tcp://host:port or host:port")]
    InvalidAddress(String),

    /// Nothing answered at the resolved address
    #[error("Server at {address} is unreachable: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection attempt ran out of time
    #[error("Timed out connecting to {0}")]
    Timeout(String),

    /// Server speaks a different protocol version
    #[error("Protocol mismatch: client speaks version {expected}, server answered with {found}")]
    ProtocolMismatch { expected: u16, found: u16 },
}

/// Failures of a single request/response exchange
#[derive(Debug, Error)]
pub enum TransportError {
    /// No response arrived within the exchange timeout
    #[error("Exchange timed out")]
    Timeout,

    /// The session has no live connection
    #[error("Session is not connected")]
    NotConnected,

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    Closed,

    /// In-flight exchange was cancelled by a shutdown request
    #[error("Exchange aborted by shutdown request")]
    Aborted,

    /// Frame header is inconsistent
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame length exceeded the protocol limit
    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// Response correlated to a request that was never sent
    #[error("Unexpected response sequence: expected {expected}, got {found}")]
    UnexpectedSequence { expected: u64, found: u64 },

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Timeouts leave the connection usable; everything else does not
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

/// Failures while encoding or decoding wire payloads
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Payload could not be interpreted; the exchange is discarded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Payload was produced by an incompatible protocol version
    #[error("Unsupported protocol version {found} (supported: {expected})")]
    UnsupportedVersion { expected: u16, found: u16 },

    /// Value could not be represented in the selected wire format
    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Failures of state cache operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Object was never registered (or already torn down)
    #[error("Object '{0}' is not registered for synchronization")]
    UnknownObject(String),
}

/// Failures while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config file extension '{0}'. Use .toml or .json")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Engine-level error, the union of everything the sync engine can observe
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Server acknowledged a different object set than the one declared
    #[error("Handshake mismatch: {0}")]
    HandshakeMismatch(String),

    /// Remote value has the wrong type for a well-known attribute
    #[error("Attribute '{attribute}' of '{object}' expects {expected}, got {found}")]
    InvalidAttribute {
        object: String,
        attribute: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Server replied with a message that makes no sense in the current state
    #[error("Unexpected {0} message from server")]
    UnexpectedMessage(&'static str),

    /// Runtime publish/subscribe request contradicts the current declarations
    #[error("Conflicting declaration: {0}")]
    DeclarationConflict(String),

    /// Reconnect attempts exhausted
    #[error("Gave up reconnecting after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Operation is not allowed in the engine's current state
    #[error("Operation not allowed while {0}")]
    InvalidState(&'static str),
}

impl SyncError {
    /// Fatal errors end the session and are surfaced to the host as `Failed`
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::HandshakeMismatch(_)
                | SyncError::RetriesExhausted { .. }
                | SyncError::Config(_)
                | SyncError::Connect(ConnectError::ProtocolMismatch { .. })
                | SyncError::Connect(ConnectError::InvalidAddress(_))
        )
    }

    /// Errors that discard one exchange but keep the session
    pub fn is_message_level(&self) -> bool {
        matches!(
            self,
            SyncError::Codec(CodecError::MalformedMessage(_))
                | SyncError::Codec(CodecError::Encode(_))
                | SyncError::InvalidAttribute { .. }
                | SyncError::Cache(_)
                | SyncError::UnexpectedMessage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SyncError::HandshakeMismatch("x".into()).is_fatal());
        assert!(!SyncError::Transport(TransportError::Timeout).is_fatal());

        let malformed = SyncError::Codec(CodecError::MalformedMessage("bad".into()));
        assert!(malformed.is_message_level());
        assert!(!malformed.is_fatal());

        let mismatch = SyncError::Connect(ConnectError::ProtocolMismatch {
            expected: 1,
            found: 2,
        });
        assert!(mismatch.is_fatal());
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);

        let no_retry = RetryPolicy::no_retry();
        assert!(!no_retry.allows(0));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }
}
