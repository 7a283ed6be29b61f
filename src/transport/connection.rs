//! Connection abstraction over a physical link.
//!
//! A [`Connection`] owns one byte-oriented link and frames it into
//! packets. Starting it installs two callbacks: `on_read` receives every
//! well-formed packet in wire order, and `on_error` fires exactly once on
//! the first unrecoverable failure. After an error or a `stop()`, sends
//! always fail.
//!
//! [`StreamConnection`] is the stream variant: a reader task and a writer
//! task around `Framed` halves with a bounded outbound queue. The queue
//! stays shallow in practice because stream payloads are credit-gated to
//! one outstanding chunk per logical stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::{constants, BridgeError, Result};

/// Callback receiving every inbound packet, in wire order.
pub type PacketHandler = Box<dyn Fn(Packet) + Send + Sync + 'static>;

/// Callback fired exactly once on the first unrecoverable failure.
pub type ErrorHandler = Box<dyn FnOnce(BridgeError) + Send + 'static>;

/// One physical link carrying packets.
pub trait Connection: Send + Sync {
    /// Begin reading. Delivers each well-formed packet to `on_read`; on
    /// unrecoverable I/O or framing failure invokes `on_error` exactly
    /// once and transitions terminal.
    fn start(&self, on_read: PacketHandler, on_error: ErrorHandler) -> Result<()>;

    /// Queue a packet for sending. May briefly apply backpressure; after
    /// a prior error or `stop()`, always fails.
    fn send(&self, packet: Packet) -> Result<()>;

    /// Abort reads and writes. Idempotent.
    fn stop(&self);
}

type ErrorSlot = Arc<Mutex<Option<ErrorHandler>>>;

fn fire_error(slot: &ErrorSlot, error: BridgeError) {
    let handler = slot.lock().ok().and_then(|mut guard| guard.take());
    if let Some(handler) = handler {
        handler(error);
    }
}

/// Stream variant of [`Connection`]: wraps any async byte pipe (TCP
/// socket, USB bulk endpoint adapter, in-memory duplex).
pub struct StreamConnection<S> {
    label: String,
    codec: PacketCodec,
    queue_depth: usize,
    stream: Mutex<Option<S>>,
    outbound: Mutex<Option<mpsc::Sender<Packet>>>,
    shutdown: CancellationToken,
    failed: Arc<AtomicBool>,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a byte stream. The connection is inert until `start`.
    pub fn new(stream: S, codec: PacketCodec, label: impl Into<String>, queue_depth: usize) -> Self {
        Self {
            label: label.into(),
            codec,
            queue_depth: queue_depth.max(1),
            stream: Mutex::new(Some(stream)),
            outbound: Mutex::new(None),
            shutdown: CancellationToken::new(),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn start(&self, on_read: PacketHandler, on_error: ErrorHandler) -> Result<()> {
        let stream = self
            .stream
            .lock()
            .map_err(|_| BridgeError::state("Connection lock poisoned"))?
            .take()
            .ok_or_else(|| BridgeError::state(constants::ERR_CONNECTION_STOPPED))?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, self.codec.clone());
        let mut writer = FramedWrite::new(write_half, self.codec.clone());

        let (tx, mut rx) = mpsc::channel::<Packet>(self.queue_depth);
        if let Ok(mut guard) = self.outbound.lock() {
            *guard = Some(tx);
        }

        let error_slot: ErrorSlot = Arc::new(Mutex::new(Some(on_error)));

        // Reader task: frames in wire order until cancellation or failure.
        {
            let shutdown = self.shutdown.clone();
            let failed = Arc::clone(&self.failed);
            let error_slot = Arc::clone(&error_slot);
            let label = self.label.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        frame = reader.next() => match frame {
                            Some(Ok(packet)) => {
                                trace!(conn = %label, command = %packet.command, "Packet received");
                                on_read(packet);
                            }
                            Some(Err(e)) => {
                                warn!(conn = %label, error = %e, "Read failed");
                                failed.store(true, Ordering::Release);
                                shutdown.cancel();
                                fire_error(&error_slot, e);
                                break;
                            }
                            None => {
                                debug!(conn = %label, "Peer closed the link");
                                failed.store(true, Ordering::Release);
                                shutdown.cancel();
                                fire_error(&error_slot, BridgeError::ConnectionClosed);
                                break;
                            }
                        },
                    }
                }
                debug!(conn = %label, "Reader task exiting");
            });
        }

        // Writer task: drains the outbound queue.
        {
            let shutdown = self.shutdown.clone();
            let failed = Arc::clone(&self.failed);
            let label = self.label.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        packet = rx.recv() => match packet {
                            Some(packet) => {
                                if let Err(e) = writer.send(packet).await {
                                    warn!(conn = %label, error = %e, "Write failed");
                                    failed.store(true, Ordering::Release);
                                    shutdown.cancel();
                                    fire_error(&error_slot, e);
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
                debug!(conn = %label, "Writer task exiting");
            });
        }

        Ok(())
    }

    fn send(&self, packet: Packet) -> Result<()> {
        if self.failed.load(Ordering::Acquire) || self.shutdown.is_cancelled() {
            return Err(BridgeError::ConnectionClosed);
        }
        let guard = self
            .outbound
            .lock()
            .map_err(|_| BridgeError::state("Connection lock poisoned"))?;
        let tx = guard
            .as_ref()
            .ok_or_else(|| BridgeError::state(constants::ERR_NOT_STARTED))?;
        tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                BridgeError::state(constants::ERR_OUTBOUND_QUEUE_FULL)
            }
            mpsc::error::TrySendError::Closed(_) => BridgeError::ConnectionClosed,
        })
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::ProtocolVersion;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio_util::codec::Framed;

    fn test_codec() -> PacketCodec {
        PacketCodec::with_version(1024, ProtocolVersion::V2)
    }

    fn peer_framed(
        stream: tokio::io::DuplexStream,
    ) -> Framed<tokio::io::DuplexStream, PacketCodec> {
        Framed::new(stream, test_codec())
    }

    #[tokio::test]
    async fn delivers_packets_in_wire_order() {
        let (host, device) = tokio::io::duplex(4096);
        let conn = StreamConnection::new(device, test_codec(), "test", 8);

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.start(
            Box::new(move |p| {
                let _ = tx.send(p);
            }),
            Box::new(|_| {}),
        )
        .unwrap();

        let mut host = peer_framed(host);
        for i in 0..3u32 {
            host.send(Packet::wrte(i, 0, Bytes::from(vec![i as u8])))
                .await
                .unwrap();
        }

        for i in 0..3u32 {
            let p = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(p.arg0, i);
        }
    }

    #[tokio::test]
    async fn send_reaches_the_peer() {
        let (host, device) = tokio::io::duplex(4096);
        let conn = StreamConnection::new(device, test_codec(), "test", 8);
        conn.start(Box::new(|_| {}), Box::new(|_| {})).unwrap();

        conn.send(Packet::okay(7, 9)).unwrap();

        let mut host = peer_framed(host);
        let p = tokio::time::timeout(Duration::from_secs(1), host.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(p.arg0, 7);
        assert_eq!(p.arg1, 9);
    }

    #[tokio::test]
    async fn error_callback_fires_once_on_peer_close() {
        let (host, device) = tokio::io::duplex(4096);
        let conn = StreamConnection::new(device, test_codec(), "test", 8);

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.start(
            Box::new(|_| {}),
            Box::new(move |e| {
                let _ = tx.send(e);
            }),
        )
        .unwrap();

        drop(host);
        let err = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, BridgeError::ConnectionClosed));

        // Channel must not produce a second error.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_fails_after_stop() {
        let (_host, device) = tokio::io::duplex(4096);
        let conn = StreamConnection::new(device, test_codec(), "test", 8);
        conn.start(Box::new(|_| {}), Box::new(|_| {})).unwrap();

        conn.stop();
        conn.stop(); // idempotent
        assert!(conn.send(Packet::okay(1, 2)).is_err());
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (_host, device) = tokio::io::duplex(4096);
        let conn = StreamConnection::new(device, test_codec(), "test", 8);
        conn.start(Box::new(|_| {}), Box::new(|_| {})).unwrap();
        assert!(conn.start(Box::new(|_| {}), Box::new(|_| {})).is_err());
    }

    #[tokio::test]
    async fn framing_error_is_fatal() {
        use tokio::io::AsyncWriteExt;

        let (mut host, device) = tokio::io::duplex(4096);
        let conn = StreamConnection::new(device, test_codec(), "test", 8);

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.start(
            Box::new(|_| {}),
            Box::new(move |e| {
                let _ = tx.send(e);
            }),
        )
        .unwrap();

        // 24 bytes of garbage: magic can never match.
        host.write_all(&[0u8; 24]).await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, BridgeError::Protocol(_)));
        assert!(conn.send(Packet::okay(1, 2)).is_err());
    }
}
