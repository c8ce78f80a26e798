//! # Peerlink
//!
//! Session and message-exchange layer for devices that talk over
//! opportunistic short-range links with small MTUs, such as BLE or
//! peer-to-peer Wi-Fi.
//!
//! ## Features
//!
//! - **Wire codec**: versioned frame with a JSON header and an arbitrary body
//! - **Chunking**: ack-gated, MTU-sized chunks with per-message progress
//! - **Large bodies**: incoming bodies above a cutoff spool to temporary files
//! - **Identity handshake**: Ed25519 public keys exchanged before any data
//! - **Multi-transport routing**: one peer reachable over several transports,
//!   with a preferred route elected by MTU or by explicit upgrade
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerlink::{App, PeerlinkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PeerlinkConfig::default();
//!     let app = App::new(config).await?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: identity keys and the peer model
//! - [`transport`]: transport contract, wire codec, chunk serializer and
//!   streaming deserializer, plus an in-process loopback transport
//! - [`session`]: handshake, routing and delegate notifications
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod session;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::App;
pub use crypto::{IdentityKeyPair, LocalPeer, Peer};
pub use session::{SessionEvent, SessionManager};
pub use transport::{LoopbackNetwork, Message, MessageKind, Transport, TransportCallback};
pub use utils::{PeerlinkConfig, PeerlinkError, Result};

/// Default configuration values
pub mod defaults {
    /// Incoming bodies larger than this many bytes are spooled to disk
    pub const DEFAULT_BODY_SPOOL_CUTOFF: u64 = 2_000_000;

    /// MTU assumed when a transport cannot report one
    pub const DEFAULT_MTU: usize = 155;
}
