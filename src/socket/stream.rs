//! Pump tasks for stream-backed local sockets.
//!
//! A stream-backed socket binds a byte stream (service pipe, device
//! node, in-memory duplex). Two tasks move bytes:
//!
//! - the writer drains inbound WRTE payloads into the stream and returns
//!   the OKAY credit once each chunk is fully written
//! - the reader turns stream bytes into outbound chunks, reading only
//!   while the socket holds credit
//!
//! I/O failures are routed through the event loop as ERROR readiness;
//! the watcher closes the pair from the loop context.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::event_loop::{EventLoopHandle, IoEvents};
use crate::socket::LocalSocket;

/// Byte stream a local socket can bind to.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Owned, type-erased byte stream.
pub type BoxedByteStream = Box<dyn ByteStream>;

pub(crate) fn spawn_pumps(
    sock: Arc<LocalSocket>,
    byte_stream: BoxedByteStream,
    mut inbound_rx: mpsc::Receiver<Bytes>,
    credit: Arc<Notify>,
    shutdown: CancellationToken,
    event_loop: EventLoopHandle,
) {
    let token = {
        let watch_sock = Arc::clone(&sock);
        event_loop.watch(
            IoEvents::ERROR,
            Box::new(move |events| {
                if events.contains(IoEvents::ERROR) {
                    watch_sock.close();
                }
            }),
        )
    };
    sock.set_watch_token(token);

    let (mut read_half, mut write_half) = tokio::io::split(byte_stream);

    // Writer: inbound payloads into the stream, credit after each one.
    {
        let sock = Arc::clone(&sock);
        let shutdown = shutdown.clone();
        let event_loop = event_loop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    chunk = inbound_rx.recv() => match chunk {
                        Some(data) => {
                            if let Err(e) = write_half.write_all(&data).await {
                                debug!(id = sock.id(), error = %e, "Stream write failed");
                                event_loop.signal(token, IoEvents::ERROR);
                                break;
                            }
                            trace!(id = sock.id(), bytes = data.len(), "Chunk written");
                            sock.return_credit();
                        }
                        None => break,
                    },
                }
            }
        });
    }

    // Reader: stream bytes out to the peer, gated on credit.
    tokio::spawn(async move {
        loop {
            if !sock.ready_to_send() {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = credit.notified() => {}
                }
                continue;
            }

            let mut buf = BytesMut::with_capacity(sock.max_payload());
            tokio::select! {
                () = shutdown.cancelled() => return,
                read = read_half.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        trace!(id = sock.id(), "Stream reached EOF");
                        sock.close();
                        return;
                    }
                    Ok(n) => {
                        sock.consume_credit();
                        trace!(id = sock.id(), bytes = n, "Chunk read");
                        if sock.send_to_peer(buf.freeze()).is_err() {
                            sock.close();
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(id = sock.id(), error = %e, "Stream read failed");
                        event_loop.signal(token, IoEvents::ERROR);
                        return;
                    }
                },
            }
        }
    });
}
