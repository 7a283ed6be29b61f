//! # Service Layer
//!
//! Named services invoked by OPEN. The dispatcher is a pure lookup and
//! parse step: it resolves a service name to either an in-process
//! [`crate::socket::ServiceSocket`] or a byte stream, and owns no stream
//! state itself.
//!
//! ## Components
//! - **Dispatcher**: built-in services plus a registered-prefix factory table
//! - **Builtin**: `sink:`/`source:` test services, `reconnect`, `spin`,
//!   `dev:`/`dev-raw:` passthrough
//! - **Policy**: a gate over service names for restricted device modes

pub mod builtin;
pub mod dispatcher;

pub use dispatcher::{ServiceDispatcher, ServiceEndpoint};

/// Gate deciding whether a service may be started at all.
///
/// Restricted device modes (evaluation, lockdown) install a policy that
/// allows only a fixed set of service prefixes; everything else is
/// answered with a CLSE.
pub trait ServicePolicy: Send + Sync {
    fn allow(&self, name: &str) -> bool;
}

/// Default policy: every known service may start.
pub struct AllowAll;

impl ServicePolicy for AllowAll {
    fn allow(&self, _name: &str) -> bool {
        true
    }
}

/// Policy allowing only services matching one of the given prefixes.
pub struct PrefixAllowList {
    prefixes: Vec<String>,
}

impl PrefixAllowList {
    pub fn new(prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl ServicePolicy for PrefixAllowList {
    fn allow(&self, name: &str) -> bool {
        self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}
