//! Local socket: the in-process half of one logical stream.
//!
//! The polymorphic `enqueue`/`ready`/`close` operations are dispatched
//! over tagged backends: stream-backed sockets pump a byte stream through
//! a pair of tasks, service-backed sockets call straight into a
//! [`ServiceSocket`] implementation.
//!
//! Credit is a flag, not a counter. A socket clears `ready_to_send` the
//! moment it hands a chunk to its peer and sets it again when the peer's
//! OKAY comes back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{BridgeError, Result};
use crate::event_loop::{EventLoopHandle, WatchToken};
use crate::socket::registry::{SocketId, SocketRegistry};
use crate::socket::stream::{self, BoxedByteStream};
use crate::socket::PeerLink;
use crate::transport::Transport;
use crate::utils::metrics::global_metrics;

/// Depth of the inbound queue feeding a stream-backed socket's writer.
/// Credit gating keeps at most one chunk outstanding per stream; the
/// slack absorbs peers that run slightly ahead of their credit.
const INBOUND_QUEUE_DEPTH: usize = 8;

/// Outcome of offering an inbound payload to a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueDisposition {
    /// Payload accepted; credit is returned once it is consumed.
    Accepted,
    /// The socket cannot take more until its `ready` fires; no credit
    /// was returned.
    Blocked,
    /// The socket is finished; the caller should close the pair.
    Closed,
}

/// Verdict of an in-process service after consuming a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceVerdict {
    Continue,
    Close,
}

/// What an in-process service produces when given a send turn.
#[derive(Debug)]
pub enum ServiceOutput {
    /// One chunk to forward to the peer; the turn is consumed.
    Data(Bytes),
    /// Nothing to send right now; the credit is kept.
    Idle,
    /// The service is done; close the pair.
    Close,
}

/// Contract for services implemented directly against the socket layer,
/// without a byte stream in between.
pub trait ServiceSocket: Send {
    /// Consume one inbound payload.
    fn on_payload(&mut self, data: &[u8]) -> ServiceVerdict;

    /// Produce the next outbound chunk, at most `max_chunk` bytes.
    fn on_ready(&mut self, max_chunk: usize) -> ServiceOutput;
}

pub(crate) struct StreamBackend {
    inbound_tx: mpsc::Sender<Bytes>,
    credit: Arc<Notify>,
    shutdown: CancellationToken,
    event_loop: EventLoopHandle,
    watch: Mutex<Option<WatchToken>>,
}

enum Backend {
    Stream(StreamBackend),
    Service(Mutex<Box<dyn ServiceSocket>>),
}

/// The local half of one logical stream.
pub struct LocalSocket {
    id: SocketId,
    transport: Option<Arc<Transport>>,
    max_payload: usize,
    registry: Weak<SocketRegistry>,
    peer: Mutex<Option<PeerLink>>,
    backend: Backend,
    closing: AtomicBool,
    close_sent: AtomicBool,
    ready_to_send: AtomicBool,
}

impl LocalSocket {
    /// Install a service-backed socket into the registry.
    pub fn install_service(
        registry: &Arc<SocketRegistry>,
        transport: Option<Arc<Transport>>,
        service: Box<dyn ServiceSocket>,
        max_payload: usize,
    ) -> Arc<LocalSocket> {
        let weak = Arc::downgrade(registry);
        let sock = registry.install_with(move |id| {
            Arc::new(LocalSocket {
                id,
                transport,
                max_payload: max_payload.max(1),
                registry: weak,
                peer: Mutex::new(None),
                backend: Backend::Service(Mutex::new(service)),
                closing: AtomicBool::new(false),
                close_sent: AtomicBool::new(false),
                ready_to_send: AtomicBool::new(true),
            })
        });
        global_metrics().socket_opened();
        debug!(id = sock.id, "Service socket installed");
        sock
    }

    /// Install a stream-backed socket and spawn its pump tasks. Must run
    /// on a tokio runtime.
    pub fn install_stream(
        registry: &Arc<SocketRegistry>,
        transport: Option<Arc<Transport>>,
        byte_stream: BoxedByteStream,
        max_payload: usize,
        event_loop: EventLoopHandle,
    ) -> Arc<LocalSocket> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let credit = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let backend = StreamBackend {
            inbound_tx,
            credit: Arc::clone(&credit),
            shutdown: shutdown.clone(),
            event_loop: event_loop.clone(),
            watch: Mutex::new(None),
        };

        let weak = Arc::downgrade(registry);
        let sock = registry.install_with(move |id| {
            Arc::new(LocalSocket {
                id,
                transport,
                max_payload: max_payload.max(1),
                registry: weak,
                peer: Mutex::new(None),
                backend: Backend::Stream(backend),
                closing: AtomicBool::new(false),
                close_sent: AtomicBool::new(false),
                ready_to_send: AtomicBool::new(true),
            })
        });
        global_metrics().socket_opened();
        debug!(id = sock.id, "Stream socket installed");

        stream::spawn_pumps(
            Arc::clone(&sock),
            byte_stream,
            inbound_rx,
            credit,
            shutdown,
            event_loop,
        );
        sock
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn transport(&self) -> Option<Arc<Transport>> {
        self.transport.clone()
    }

    /// Largest chunk this socket may put in one WRTE.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn has_peer(&self) -> bool {
        self.peer
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Id of an in-process peer, if paired locally.
    pub fn peer_local_id(&self) -> Option<SocketId> {
        match self.peer.lock().ok()?.as_ref()? {
            PeerLink::Local(id) => Some(*id),
            PeerLink::Remote(_) => None,
        }
    }

    /// Remote id of the peer half, if paired across a transport.
    pub fn peer_remote_id(&self) -> Option<SocketId> {
        match self.peer.lock().ok()?.as_ref()? {
            PeerLink::Remote(remote) => Some(remote.remote_id()),
            PeerLink::Local(_) => None,
        }
    }

    pub(crate) fn set_peer(&self, link: PeerLink) {
        if let Ok(mut guard) = self.peer.lock() {
            *guard = Some(link);
        }
    }

    /// Forget a local pairing, without closing. Used while the named
    /// peer is tearing the pair down so close does not echo back.
    pub(crate) fn unpair_from(&self, peer_id: SocketId) {
        if let Ok(mut guard) = self.peer.lock() {
            if matches!(*guard, Some(PeerLink::Local(id)) if id == peer_id) {
                *guard = None;
            }
        }
    }

    /// Suppress the outbound CLSE; the close is already answered (or the
    /// transport is gone).
    pub(crate) fn mark_close_sent(&self) {
        self.close_sent.store(true, Ordering::Release);
    }

    pub fn ready_to_send(&self) -> bool {
        self.ready_to_send.load(Ordering::Acquire)
    }

    /// Clear the credit flag before sending a chunk.
    pub(crate) fn consume_credit(&self) {
        self.ready_to_send.store(false, Ordering::Release);
    }

    fn lookup(&self, id: SocketId) -> Option<Arc<LocalSocket>> {
        self.registry.upgrade().and_then(|r| r.lookup(id))
    }

    /// Offer an inbound payload. Service sockets return their credit
    /// first and consume synchronously; stream sockets consume on their
    /// writer task and credit from there.
    pub fn enqueue(&self, data: Bytes) -> EnqueueDisposition {
        if self.is_closing() {
            return EnqueueDisposition::Closed;
        }
        match &self.backend {
            Backend::Stream(backend) => match backend.inbound_tx.try_send(data) {
                Ok(()) => EnqueueDisposition::Accepted,
                Err(mpsc::error::TrySendError::Full(_)) => EnqueueDisposition::Blocked,
                Err(mpsc::error::TrySendError::Closed(_)) => EnqueueDisposition::Closed,
            },
            Backend::Service(service) => {
                self.return_credit();
                let verdict = match service.lock() {
                    Ok(mut service) => service.on_payload(&data),
                    Err(_) => ServiceVerdict::Close,
                };
                match verdict {
                    ServiceVerdict::Continue => EnqueueDisposition::Accepted,
                    ServiceVerdict::Close => EnqueueDisposition::Closed,
                }
            }
        }
    }

    /// Credit returned by the peer: the socket may produce again.
    pub fn ready(&self) {
        if self.is_closing() {
            return;
        }
        self.ready_to_send.store(true, Ordering::Release);
        match &self.backend {
            Backend::Stream(backend) => backend.credit.notify_one(),
            Backend::Service(service) => {
                let output = match service.lock() {
                    Ok(mut service) => service.on_ready(self.max_payload),
                    Err(_) => ServiceOutput::Close,
                };
                match output {
                    ServiceOutput::Data(data) => {
                        self.consume_credit();
                        if self.send_to_peer(data).is_err() {
                            self.close();
                        }
                    }
                    ServiceOutput::Close => self.close(),
                    ServiceOutput::Idle => {}
                }
            }
        }
    }

    /// Forward one chunk to the peer half.
    pub(crate) fn send_to_peer(&self, data: Bytes) -> Result<()> {
        let link = self.peer.lock().ok().and_then(|guard| guard.clone());
        match link {
            Some(PeerLink::Remote(remote)) => remote.send_data(self.id, data),
            Some(PeerLink::Local(peer_id)) => {
                let Some(peer) = self.lookup(peer_id) else {
                    return Err(BridgeError::state("Paired socket vanished"));
                };
                if peer.enqueue(data) == EnqueueDisposition::Closed {
                    peer.close();
                }
                Ok(())
            }
            None => Err(BridgeError::state("Socket is unpaired")),
        }
    }

    /// Return credit for a consumed chunk to whoever sent it.
    pub(crate) fn return_credit(&self) {
        let link = self.peer.lock().ok().and_then(|guard| guard.clone());
        match link {
            Some(PeerLink::Remote(remote)) => {
                let _ = remote.send_credit(self.id);
            }
            Some(PeerLink::Local(peer_id)) => {
                if let Some(peer) = self.lookup(peer_id) {
                    peer.ready();
                }
            }
            None => {}
        }
    }

    /// Dispose of the socket: cascade the final CLSE to the peer unless
    /// one was already sent, stop any pump tasks, and leave the
    /// registry. Closing an already-closed socket is a silent no-op.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!(id = self.id, "Closing socket");

        let link = self.peer.lock().ok().and_then(|mut guard| guard.take());
        if let Some(link) = link {
            if !self.close_sent.swap(true, Ordering::SeqCst) {
                match link {
                    PeerLink::Remote(remote) => {
                        let _ = remote.send_close(self.id);
                    }
                    PeerLink::Local(peer_id) => {
                        if let Some(peer) = self.lookup(peer_id) {
                            peer.unpair_from(self.id);
                            peer.close();
                        }
                    }
                }
            }
        }

        if let Backend::Stream(backend) = &self.backend {
            backend.shutdown.cancel();
            let token = backend.watch.lock().ok().and_then(|mut guard| guard.take());
            if let Some(token) = token {
                backend.event_loop.unwatch(token);
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        global_metrics().socket_closed();
    }

    pub(crate) fn set_watch_token(&self, token: WatchToken) {
        if let Backend::Stream(backend) = &self.backend {
            if let Ok(mut guard) = backend.watch.lock() {
                *guard = Some(token);
            }
        }
    }
}

impl std::fmt::Debug for LocalSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSocket")
            .field("id", &self.id)
            .field("closing", &self.is_closing())
            .field("ready_to_send", &self.ready_to_send())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::service::builtin::{SinkService, SourceService};
    use crate::socket::pair_local;

    pub(crate) fn install_sink(registry: &Arc<SocketRegistry>, bytes: u64) -> Arc<LocalSocket> {
        LocalSocket::install_service(registry, None, Box::new(SinkService::new(bytes)), 4096)
    }

    fn install_source(registry: &Arc<SocketRegistry>, bytes: u64) -> Arc<LocalSocket> {
        LocalSocket::install_service(registry, None, Box::new(SourceService::new(bytes)), 4096)
    }

    #[test]
    fn local_pairing_is_symmetric() {
        let registry = Arc::new(SocketRegistry::new());
        let a = install_sink(&registry, 100);
        let b = install_source(&registry, 100);

        pair_local(&a, &b);

        // peer.peer == self, resolved through the registry.
        let a_peer = registry.lookup(a.peer_local_id().unwrap()).unwrap();
        assert_eq!(a_peer.peer_local_id().unwrap(), a.id());
        let b_peer = registry.lookup(b.peer_local_id().unwrap()).unwrap();
        assert_eq!(b_peer.peer_local_id().unwrap(), b.id());
    }

    #[test]
    fn sink_accepts_until_budget_then_closes() {
        let registry = Arc::new(SocketRegistry::new());
        let sink = install_sink(&registry, 1000);

        assert_eq!(
            EnqueueDisposition::Accepted,
            sink.enqueue(Bytes::from(vec![0u8; 100]))
        );
        assert_eq!(
            EnqueueDisposition::Closed,
            sink.enqueue(Bytes::from(vec![0u8; 1000]))
        );
    }

    #[test]
    fn close_is_idempotent_and_leaves_registry() {
        let registry = Arc::new(SocketRegistry::new());
        let sink = install_sink(&registry, 100);
        let id = sink.id();
        assert_eq!(1, registry.len());

        sink.close();
        assert!(sink.is_closing());
        assert!(registry.lookup(id).is_none());

        sink.close();
        assert!(registry.is_empty());
    }

    #[test]
    fn close_cascades_across_a_local_pair() {
        let registry = Arc::new(SocketRegistry::new());
        let a = install_sink(&registry, 100);
        let b = install_sink(&registry, 100);
        pair_local(&a, &b);

        a.close();
        assert!(a.is_closing());
        assert!(b.is_closing());
        assert!(registry.is_empty());
    }

    #[test]
    fn local_source_drains_into_local_sink() {
        let registry = Arc::new(SocketRegistry::new());
        // Source smaller than the sink budget: the source finishes first
        // and tears the pair down.
        let sink = install_sink(&registry, 1000);
        let source = install_source(&registry, 100);
        pair_local(&source, &sink);

        // Give the source its first turn; the transfer then runs on the
        // credit chain between the two sockets.
        source.ready();

        assert!(source.is_closing());
        assert!(sink.is_closing());
        assert!(registry.is_empty());
    }

    #[test]
    fn enqueue_after_close_is_a_noop() {
        let registry = Arc::new(SocketRegistry::new());
        let sink = install_sink(&registry, 100);
        sink.close();
        assert_eq!(
            EnqueueDisposition::Closed,
            sink.enqueue(Bytes::from_static(b"late"))
        );
        // ready after close must not panic or produce.
        sink.ready();
    }

    #[test]
    fn unpaired_send_is_a_state_error() {
        let registry = Arc::new(SocketRegistry::new());
        let sink = install_sink(&registry, 100);
        assert!(sink.send_to_peer(Bytes::from_static(b"x")).is_err());
    }
}
