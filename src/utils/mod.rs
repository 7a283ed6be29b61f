//! # Utility Modules
//!
//! Supporting utilities for logging, metrics, and timing.
//!
//! ## Components
//! - **Logging**: structured logging configuration (tracing-subscriber)
//! - **Metrics**: thread-safe observability counters
//! - **Timeout**: shared timeout constants and async wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{global_metrics, BridgeMetrics};
