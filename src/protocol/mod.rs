//! # Protocol Layer
//!
//! Connection-level protocol logic above the wire codec.
//!
//! ## Components
//! - **Banner**: connection states, feature sets, and the CNXN banner grammar
//! - **Handshake**: CNXN/AUTH/STLS handling and the pluggable auth step

pub mod banner;
pub mod handshake;

pub use banner::{parse_banner, ConnectionState, FeatureSet};
pub use handshake::{AuthProvider, NoAuth, SharedSecretAuth};
