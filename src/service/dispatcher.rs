//! Service dispatcher: resolve an OPEN name to an endpoint.
//!
//! Resolution order: policy gate, in-process built-ins, stream built-ins,
//! then the registered-prefix factory table through which embedders plug
//! in their services (`shell`, `exec:`, `sync:`, `reverse:`, `jdwp:`,
//! and anything else running over a byte stream).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::error::{constants, BridgeError, Result};
use crate::event_loop::EventLoopHandle;
use crate::service::builtin;
use crate::service::{AllowAll, ServicePolicy};
use crate::socket::{BoxedByteStream, ServiceSocket};
use crate::transport::Transport;

/// What an OPEN resolves to.
pub enum ServiceEndpoint {
    /// An in-process service speaking the socket contract directly.
    Socket(Box<dyn ServiceSocket>),
    /// A byte stream; the caller wraps it in a stream-backed socket.
    Stream(BoxedByteStream),
}

type StreamFactory = Box<dyn Fn(&str, &Arc<Transport>) -> Result<BoxedByteStream> + Send + Sync>;

/// Pure lookup + parse step mapping service names to endpoints.
pub struct ServiceDispatcher {
    factories: RwLock<HashMap<String, StreamFactory>>,
    policy: RwLock<Arc<dyn ServicePolicy>>,
    event_loop: EventLoopHandle,
}

impl ServiceDispatcher {
    pub fn new(event_loop: EventLoopHandle) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            policy: RwLock::new(Arc::new(AllowAll)),
            event_loop,
        }
    }

    /// Install a policy gate over service names.
    pub fn set_policy(&self, policy: Arc<dyn ServicePolicy>) {
        if let Ok(mut guard) = self.policy.write() {
            *guard = policy;
        }
    }

    /// Register a stream service under a name prefix. The factory
    /// receives the remainder of the name after the prefix.
    pub fn register<F>(&self, prefix: &str, factory: F) -> Result<()>
    where
        F: Fn(&str, &Arc<Transport>) -> Result<BoxedByteStream> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().map_err(|_| {
            BridgeError::state("Failed to acquire write lock on dispatcher")
        })?;
        factories.insert(prefix.to_string(), Box::new(factory));
        Ok(())
    }

    /// Resolve a service name. `Ok(None)` means the name is unknown;
    /// errors cover policy refusals and services that failed to start.
    pub fn open(&self, name: &str, transport: &Arc<Transport>) -> Result<Option<ServiceEndpoint>> {
        let policy = self
            .policy
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| BridgeError::state("Failed to acquire read lock on dispatcher"))?;
        if !policy.allow(name) {
            return Err(BridgeError::Policy(format!(
                "{}: {name}",
                constants::ERR_SERVICE_REFUSED
            )));
        }

        if let Some(service) = builtin::service_to_socket(name) {
            trace!(service = name, "Resolved in-process service");
            return Ok(Some(ServiceEndpoint::Socket(service)));
        }

        if let Some(byte_stream) = builtin::service_to_stream(name, transport, &self.event_loop)? {
            trace!(service = name, "Resolved built-in stream service");
            return Ok(Some(ServiceEndpoint::Stream(byte_stream)));
        }

        let factories = self.factories.read().map_err(|_| {
            BridgeError::state("Failed to acquire read lock on dispatcher")
        })?;
        for (prefix, factory) in factories.iter() {
            if let Some(rest) = name.strip_prefix(prefix.as_str()) {
                trace!(service = name, prefix = %prefix, "Resolved registered service");
                return factory(rest, transport).map(|s| Some(ServiceEndpoint::Stream(s)));
            }
        }

        Ok(None)
    }
}
