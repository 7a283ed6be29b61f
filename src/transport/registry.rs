//! Process-wide transport list.
//!
//! One lock guards the list; iteration always takes a snapshot so
//! disconnect hooks and kicks never run with the lock held.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::transport::Transport;

/// Registry of live transports.
#[derive(Default)]
pub struct TransportRegistry {
    inner: Mutex<Vec<Arc<Transport>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transport to the list.
    pub fn register(&self, transport: Arc<Transport>) {
        if let Ok(mut list) = self.inner.lock() {
            debug!(serial = %transport.serial(), id = transport.id(), "Transport registered");
            list.push(transport);
        }
    }

    /// Remove a transport by id, returning it if it was present.
    pub fn unregister(&self, id: u64) -> Option<Arc<Transport>> {
        let mut list = self.inner.lock().ok()?;
        let index = list.iter().position(|t| t.id() == id)?;
        let transport = list.swap_remove(index);
        debug!(serial = %transport.serial(), id, "Transport unregistered");
        Some(transport)
    }

    /// Snapshot of the current list.
    pub fn snapshot(&self) -> Vec<Arc<Transport>> {
        self.inner
            .lock()
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// First transport matching the given target query.
    pub fn find_target(&self, target: &str) -> Option<Arc<Transport>> {
        self.snapshot()
            .into_iter()
            .find(|t| t.matches_target(target))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|list| list.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::test_context;
    use crate::transport::TransportKind;

    fn make(id: u64, serial: &str) -> Arc<Transport> {
        Transport::new(
            id,
            TransportKind::Local,
            serial.to_string(),
            None,
            test_context(),
        )
    }

    #[test]
    fn register_find_unregister() {
        let registry = TransportRegistry::new();
        assert!(registry.is_empty());

        registry.register(make(1, "alpha:5555"));
        registry.register(make(2, "beta:5555"));
        assert_eq!(2, registry.len());

        let found = registry.find_target("alpha:5555").unwrap();
        assert_eq!(1, found.id());
        assert!(registry.find_target("missing").is_none());

        assert!(registry.unregister(1).is_some());
        assert!(registry.unregister(1).is_none());
        assert_eq!(1, registry.len());
    }

    #[test]
    fn snapshot_is_detached_from_the_list() {
        let registry = TransportRegistry::new();
        registry.register(make(1, "alpha:5555"));
        let snapshot = registry.snapshot();
        registry.unregister(1);
        assert_eq!(1, snapshot.len());
        assert!(registry.is_empty());
    }
}
