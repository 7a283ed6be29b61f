//! # Bridge Daemon
//!
//! Wires the pieces together: one event loop, one socket registry, one
//! service dispatcher, one transport list. The daemon accepts TCP
//! connections from host controllers and registers one transport per
//! connection; embedders with other physical links call
//! [`Bridge::register_stream_transport`] directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::BridgeConfig;
use crate::core::codec::PacketCodec;
use crate::error::{BridgeError, Result};
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::protocol::handshake::{AuthProvider, NoAuth};
use crate::service::ServiceDispatcher;
use crate::socket::SocketRegistry;
use crate::transport::{
    StreamConnection, Transport, TransportContext, TransportKind, TransportRegistry,
};
use crate::utils::metrics::global_metrics;

/// One row of the device-listing channel.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub transport_id: u64,
    pub serial: String,
    pub state: String,
    pub product: String,
    pub model: String,
    pub device: String,
}

/// The device-side daemon.
pub struct Bridge {
    config: Arc<BridgeConfig>,
    auth: Arc<dyn AuthProvider>,
    sockets: Arc<SocketRegistry>,
    services: Arc<ServiceDispatcher>,
    transports: Arc<TransportRegistry>,
    event_loop: EventLoopHandle,
    next_transport_id: AtomicU64,
    next_host_serial: AtomicU64,
}

impl Bridge {
    /// Build a daemon with auth handled by [`NoAuth`] (every credential
    /// rejected; only meaningful with `auth.required = false`). Must be
    /// called on a tokio runtime: the event loop task starts here.
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_auth(config, Arc::new(NoAuth))
    }

    /// Build a daemon with a concrete auth provider.
    pub fn with_auth(config: BridgeConfig, auth: Arc<dyn AuthProvider>) -> Self {
        let event_loop = EventLoop::spawn();
        Self {
            config: Arc::new(config),
            auth,
            sockets: Arc::new(SocketRegistry::new()),
            services: Arc::new(ServiceDispatcher::new(event_loop.clone())),
            transports: Arc::new(TransportRegistry::new()),
            event_loop,
            next_transport_id: AtomicU64::new(1),
            next_host_serial: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn services(&self) -> &Arc<ServiceDispatcher> {
        &self.services
    }

    pub fn sockets(&self) -> &Arc<SocketRegistry> {
        &self.sockets
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }

    pub fn event_loop(&self) -> &EventLoopHandle {
        &self.event_loop
    }

    /// The shared service objects a transport needs.
    pub fn context(&self) -> TransportContext {
        TransportContext {
            registry: Arc::clone(&self.sockets),
            services: Arc::clone(&self.services),
            event_loop: self.event_loop.clone(),
            config: Arc::clone(&self.config),
            auth: Arc::clone(&self.auth),
        }
    }

    /// Register a transport over any byte stream. Installs an
    /// auto-remove disconnect hook and starts the connection.
    #[instrument(skip(self, byte_stream), fields(serial))]
    pub fn register_stream_transport<S>(
        &self,
        byte_stream: S,
        serial: impl Into<String>,
        kind: TransportKind,
    ) -> Result<Arc<Transport>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let serial = serial.into();
        tracing::Span::current().record("serial", serial.as_str());

        if self.transports.len() >= self.config.daemon.max_transports {
            return Err(BridgeError::state("Transport limit reached"));
        }

        let id = self.next_transport_id.fetch_add(1, Ordering::Relaxed);
        let codec = PacketCodec::new(self.config.transport.max_payload);
        let connection = Arc::new(StreamConnection::new(
            byte_stream,
            codec.clone(),
            serial.clone(),
            self.config.daemon.outbound_queue,
        ));
        let transport = Transport::with_version_cell(
            id,
            kind,
            serial,
            None,
            self.context(),
            codec.shared_version(),
        );

        self.transports.register(Arc::clone(&transport));
        let registry = Arc::clone(&self.transports);
        transport.add_disconnect(move |t| {
            registry.unregister(t.id());
            global_metrics().transport_closed();
        });
        global_metrics().transport_registered();

        transport.set_connection(connection)?;
        info!(id, "Transport started");
        Ok(transport)
    }

    /// Listen for host connections until interrupted (CTRL+C).
    pub async fn listen(&self, addr: &str) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.listen_with_shutdown(addr, shutdown_rx).await
    }

    /// Listen for host connections with an external shutdown channel.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn listen_with_shutdown(
        &self,
        addr: &str,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr, "Daemon listening");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down daemon");
                    self.shutdown();
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let serial =
                            format!("host-{}", self.next_host_serial.fetch_add(1, Ordering::Relaxed));
                        debug!(peer = %peer, serial = %serial, "New host connection");
                        let _ = socket.set_nodelay(true);
                        if let Err(e) =
                            self.register_stream_transport(socket, serial, TransportKind::Local)
                        {
                            warn!(error = %e, "Failed to register transport");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                },
            }
        }
    }

    /// Serialize the current transport list for the device-listing
    /// channel.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.transports
            .snapshot()
            .into_iter()
            .map(|t| DeviceInfo {
                transport_id: t.id(),
                serial: t.serial().to_string(),
                state: t.connection_state().to_string(),
                product: t.product(),
                model: t.model(),
                device: t.device(),
            })
            .collect()
    }

    /// Kick every transport and stop the event loop.
    pub fn shutdown(&self) {
        for transport in self.transports.snapshot() {
            transport.kick();
        }
        self.event_loop.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::banner::ConnectionState;

    #[tokio::test]
    async fn transport_limit_is_enforced() {
        let config = BridgeConfig::default_with_overrides(|c| c.daemon.max_transports = 1);
        let bridge = Bridge::new(config);

        let (_a_host, a_dev) = tokio::io::duplex(1024);
        bridge
            .register_stream_transport(a_dev, "one", TransportKind::Local)
            .unwrap();

        let (_b_host, b_dev) = tokio::io::duplex(1024);
        assert!(bridge
            .register_stream_transport(b_dev, "two", TransportKind::Local)
            .is_err());
    }

    #[tokio::test]
    async fn kicked_transport_leaves_the_device_list() {
        let bridge = Bridge::new(BridgeConfig::default());
        let (_host, dev) = tokio::io::duplex(1024);
        let t = bridge
            .register_stream_transport(dev, "gone", TransportKind::Local)
            .unwrap();

        assert_eq!(1, bridge.list_devices().len());
        assert_eq!("connecting", bridge.list_devices()[0].state);

        t.kick();
        assert_eq!(ConnectionState::Offline, t.connection_state());
        assert!(bridge.list_devices().is_empty());
    }
}
