//! # devbridge
//!
//! Device-side endpoint of a debugging/shell bridge: a long-running
//! daemon that accepts a multiplexed, packet-based connection from a
//! host controller and exposes named services (shells, file sync, port
//! forwarding, debug attach) over logical streams carried inside that
//! single connection.
//!
//! ## Architecture
//! - [`core`]: fixed-header packet format and the framing codec
//! - [`transport`]: connection abstraction, handshake state machine,
//!   disconnect hooks, target matching
//! - [`socket`]: local/remote socket pairs with credit-based flow
//!   control and the process-wide socket registry
//! - [`service`]: service dispatcher, built-ins, and policy gate
//! - [`event_loop`]: the main-context work loop (post, delayed post,
//!   readiness watchers)
//! - [`daemon`]: the [`daemon::Bridge`] wiring object and TCP listener
//!
//! ## Example
//! ```no_run
//! use devbridge::config::BridgeConfig;
//! use devbridge::daemon::Bridge;
//!
//! #[tokio::main]
//! async fn main() -> devbridge::error::Result<()> {
//!     let config = BridgeConfig::default();
//!     devbridge::utils::logging::try_init(&config.logging);
//!     let bridge = Bridge::new(config);
//!     bridge.listen("127.0.0.1:5555").await
//! }
//! ```

pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
pub mod event_loop;
pub mod protocol;
pub mod service;
pub mod socket;
pub mod transport;
pub mod utils;

pub use self::core::{Command, Packet, PacketCodec, ProtocolVersion};
pub use config::BridgeConfig;
pub use daemon::{Bridge, DeviceInfo};
pub use error::{BridgeError, Result};
pub use event_loop::{EventLoop, EventLoopHandle, IoEvents};
pub use protocol::{ConnectionState, FeatureSet};
pub use transport::{Connection, StreamConnection, Transport, TransportKind};
