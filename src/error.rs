//! # Error Types
//!
//! Error handling for the bridge daemon.
//!
//! This module defines all error variants that can occur while driving a
//! transport, from low-level I/O failures to protocol violations and
//! service-level refusals.
//!
//! ## Error Categories
//! - **I/O Errors**: failures on the physical link
//! - **Protocol Errors**: bad framing, magic/checksum mismatch, oversize payloads
//! - **Auth Errors**: rejected signatures and keys (the transport stays unauthorized)
//! - **Service Errors**: unknown or failed-to-start services (answered with CLSE)
//! - **Policy Errors**: services refused by the active policy
//! - **State Errors**: operations on already-closed sockets (silent no-ops upstream)
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Framing and packet validation errors
    pub const ERR_BAD_MAGIC: &str = "Header magic does not match command";
    pub const ERR_UNKNOWN_COMMAND: &str = "Unknown command tag";
    pub const ERR_BAD_CHECKSUM: &str = "Payload checksum mismatch";
    pub const ERR_OVERSIZED_PAYLOAD: &str = "Payload length exceeds maximum";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CONNECTION_STOPPED: &str = "Connection already stopped";
    pub const ERR_OUTBOUND_QUEUE_FULL: &str = "Outbound queue full";
    pub const ERR_NOT_STARTED: &str = "Connection not started";

    /// Transport errors
    pub const ERR_TRANSPORT_OFFLINE: &str = "Transport is offline";
    pub const ERR_NO_CONNECTION: &str = "Transport has no connection installed";

    /// Handshake errors
    pub const ERR_NO_TOKEN_OUTSTANDING: &str = "No auth token outstanding";
    pub const ERR_SIGNATURE_REJECTED: &str = "Signature verification failed";
    pub const ERR_KEY_REJECTED: &str = "Public key rejected by policy";
    pub const ERR_TLS_UNSUPPORTED: &str = "TLS upgrade requested but not supported";

    /// Service errors
    pub const ERR_UNKNOWN_SERVICE: &str = "Unknown service";
    pub const ERR_SERVICE_REFUSED: &str = "Service refused by policy";
}

/// Primary error type for all bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Framing, magic/checksum, or oversize-payload violations. Fatal for
    /// the transport that produced them.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bad signature or rejected key; the transport stays unauthorized.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Unknown service or a service that failed to start; answered with a
    /// CLSE to the peer, no transport-level effect.
    #[error("Service error: {0}")]
    Service(String),

    /// Service start refused by the active policy.
    #[error("Policy error: {0}")]
    Policy(String),

    /// Operation on an already-closed socket or offline transport.
    #[error("State error: {0}")]
    State(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Shorthand for a [`BridgeError::Protocol`] with a static message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        BridgeError::Protocol(msg.into())
    }

    /// Shorthand for a [`BridgeError::State`] with a static message.
    pub fn state(msg: impl Into<String>) -> Self {
        BridgeError::State(msg.into())
    }

    /// True for errors that must take down the whole transport.
    pub fn is_fatal_for_transport(&self) -> bool {
        matches!(
            self,
            BridgeError::Protocol(_) | BridgeError::Io(_) | BridgeError::ConnectionClosed
        )
    }
}

/// Type alias for Results using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;
