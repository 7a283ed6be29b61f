//! Process-wide socket registry.
//!
//! One lock guards the id map and the allocator. Ids are nonzero,
//! monotonically allocated, and wrap around skipping 0 and any id still
//! in use. Traversal snapshots under the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::socket::LocalSocket;

/// Process-unique identifier of a local socket. Zero is reserved for
/// unpaired OPEN targets and never allocated.
pub type SocketId = u32;

struct Inner {
    sockets: HashMap<SocketId, Arc<LocalSocket>>,
    next_id: SocketId,
}

/// Mapping of `local_id` to local socket.
pub struct SocketRegistry {
    inner: Mutex<Inner>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sockets: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Allocate a fresh id and install the socket built for it.
    pub(crate) fn install_with(
        &self,
        build: impl FnOnce(SocketId) -> Arc<LocalSocket>,
    ) -> Arc<LocalSocket> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = Self::allocate_id(&mut inner);
        let sock = build(id);
        inner.sockets.insert(id, Arc::clone(&sock));
        sock
    }

    fn allocate_id(inner: &mut Inner) -> SocketId {
        loop {
            let id = inner.next_id;
            inner.next_id = match inner.next_id.checked_add(1) {
                Some(next) => next,
                None => 1,
            };
            if id != 0 && !inner.sockets.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn lookup(&self, id: SocketId) -> Option<Arc<LocalSocket>> {
        self.inner.lock().ok()?.sockets.get(&id).cloned()
    }

    pub fn remove(&self, id: SocketId) -> Option<Arc<LocalSocket>> {
        self.inner.lock().ok()?.sockets.remove(&id)
    }

    /// Snapshot of every socket bound to the given transport.
    pub fn enumerate_for_transport(&self, transport_id: u64) -> Vec<Arc<LocalSocket>> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .sockets
                    .values()
                    .filter(|s| {
                        s.transport()
                            .map(|t| t.id() == transport_id)
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.sockets.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&self, id: SocketId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.next_id = id;
        }
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::local::tests::install_sink;

    #[test]
    fn ids_are_monotonic_and_nonzero() {
        let registry = Arc::new(SocketRegistry::new());
        let a = install_sink(&registry, 100);
        let b = install_sink(&registry, 100);
        assert_ne!(a.id(), 0);
        assert!(b.id() > a.id());
        assert_eq!(2, registry.len());
    }

    #[test]
    fn lookup_and_remove() {
        let registry = Arc::new(SocketRegistry::new());
        let sock = install_sink(&registry, 100);
        let id = sock.id();

        assert!(registry.lookup(id).is_some());
        assert!(registry.remove(id).is_some());
        assert!(registry.lookup(id).is_none());
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn allocator_wraps_and_skips_zero_and_live_ids() {
        let registry = Arc::new(SocketRegistry::new());
        let a = install_sink(&registry, 100);
        let live_id = a.id();
        assert_eq!(1, live_id);

        registry.set_next_id(SocketId::MAX);
        let b = install_sink(&registry, 100);
        assert_eq!(SocketId::MAX, b.id());

        // Wraps past 0 and past the still-live id 1.
        let c = install_sink(&registry, 100);
        assert_eq!(2, c.id());
    }

    #[test]
    fn enumerate_for_transport_filters_unbound_sockets() {
        let registry = Arc::new(SocketRegistry::new());
        let _unbound = install_sink(&registry, 100);
        assert!(registry.enumerate_for_transport(42).is_empty());
    }
}
