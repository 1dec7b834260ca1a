//! # Multiverse Connector
//!
//! Keeps a simulation host's objects in sync with a remote multiverse server.
//!
//! The host publishes some attributes of its objects and subscribes to
//! others. Once per host tick the [`SyncEngine`] reads the published
//! attributes from the scene, sends the ones that changed, and writes the
//! server's values for subscribed attributes back into the scene.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use multiverse_connector::{MemoryScene, SyncConfig, SyncEngine};
//! use multiverse_connector::transport::TcpConnector;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = SyncConfig::load("multiverse.toml")?;
//!     let mut scene = MemoryScene::from_declarations(config.send.iter().chain(&config.receive));
//!
//!     let mut engine = SyncEngine::new(config, TcpConnector)?;
//!     engine.connect()?;
//!     for _ in 0..600 {
//!         let status = engine.on_tick(&mut scene, Duration::from_millis(16));
//!         println!("{status}");
//!     }
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod scene;
pub mod server;
pub mod state;
pub mod transport;

// Re-export main types for library consumers
pub use codec::{ApiCall, Message, SessionMeta, WireCodec, WireFormat};
pub use config::SyncConfig;
pub use engine::{ShutdownHandle, SyncEngine, SyncStatus};
pub use error::{CacheError, CodecError, ConfigError, ConnectError, RetryPolicy, SyncError, TransportError};
pub use scene::{MemoryScene, SceneAdapter};
pub use state::{AttributeKind, AttributeValue, ObjectDeclaration, ObjectKind, ObjectState, StateCache};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
