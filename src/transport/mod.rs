//! # Transport Layer
//!
//! One [`Transport`] per live connection to a host controller. The
//! transport owns the handshake state machine, the negotiated feature
//! set and payload limit, the disconnect-hook list, and the dispatch of
//! inbound packets to either the handshake or the socket layer.
//!
//! ## Lifecycle
//! A transport starts in `Connecting` with exactly one connection
//! installed. The handshake drives it to an online side state (or
//! `Unauthorized` while auth is pending). `kick` is the single teardown
//! path: state goes `Offline`, the connection stops, disconnect hooks
//! fire exactly once in registration order, and every bound local socket
//! receives a synthetic close.

pub mod connection;
pub mod registry;

pub use connection::{Connection, StreamConnection};
pub use registry::TransportRegistry;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, trace, warn};

use crate::config::{BridgeConfig, LEGACY_MAX_PAYLOAD};
use crate::core::packet::{Command, Packet, ProtocolVersion, TOKEN_SIZE, VERSION_SKIP_CHECKSUM};
use crate::error::{constants, BridgeError, Result};
use crate::event_loop::EventLoopHandle;
use crate::protocol::banner::{ConnectionState, FeatureSet};
use crate::protocol::handshake::{self, AuthProvider};
use crate::service::ServiceDispatcher;
use crate::socket::{self, SocketRegistry};
use crate::utils::metrics::global_metrics;

/// Kind of physical link behind a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// USB-attached link.
    Usb,
    /// Network link (TCP); serials carry a `host:port` form.
    Local,
}

/// Service objects every transport needs, threaded through from the
/// daemon at startup instead of living in globals.
#[derive(Clone)]
pub struct TransportContext {
    pub registry: Arc<SocketRegistry>,
    pub services: Arc<ServiceDispatcher>,
    pub event_loop: EventLoopHandle,
    pub config: Arc<BridgeConfig>,
    pub auth: Arc<dyn AuthProvider>,
}

/// Handle returned by [`Transport::add_disconnect`]; consumed by
/// [`Transport::remove_disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectHandle(u64);

type DisconnectHook = Box<dyn FnOnce(&Transport) + Send>;

#[derive(Default)]
struct Identity {
    product: String,
    model: String,
    device: String,
}

/// One live connection to a peer, with identity and state.
pub struct Transport {
    weak: Weak<Transport>,
    id: u64,
    kind: TransportKind,
    serial: String,
    devpath: Option<String>,
    ctx: TransportContext,

    connection: Mutex<Option<Arc<dyn Connection>>>,
    state: Mutex<ConnectionState>,
    banner_side: Mutex<Option<ConnectionState>>,
    identity: Mutex<Identity>,
    features: Mutex<FeatureSet>,

    /// Negotiated wire version word, shared with the connection's codec.
    version: Arc<AtomicU32>,
    /// Negotiated outbound chunk limit.
    max_payload: AtomicUsize,

    auth_required: bool,
    token: Mutex<Option<[u8; TOKEN_SIZE]>>,

    hooks: Mutex<Vec<(u64, DisconnectHook)>>,
    next_hook: AtomicU64,
    kicked: AtomicBool,
}

impl Transport {
    /// Create a transport with a private version cell. Use
    /// [`Transport::with_version_cell`] when a codec must observe
    /// negotiation.
    pub fn new(
        id: u64,
        kind: TransportKind,
        serial: String,
        devpath: Option<String>,
        ctx: TransportContext,
    ) -> Arc<Self> {
        let cell = Arc::new(AtomicU32::new(crate::core::packet::VERSION_WITH_CHECKSUM));
        Self::with_version_cell(id, kind, serial, devpath, ctx, cell)
    }

    /// Create a transport sharing `version` with the connection codec so
    /// a negotiated revision applies to framing immediately.
    pub fn with_version_cell(
        id: u64,
        kind: TransportKind,
        serial: String,
        devpath: Option<String>,
        ctx: TransportContext,
        version: Arc<AtomicU32>,
    ) -> Arc<Self> {
        let auth_required = ctx.config.auth.required;
        let max_payload = ctx.config.transport.max_payload;
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            id,
            kind,
            serial,
            devpath,
            ctx,
            connection: Mutex::new(None),
            state: Mutex::new(ConnectionState::Connecting),
            banner_side: Mutex::new(None),
            identity: Mutex::new(Identity::default()),
            features: Mutex::new(FeatureSet::new()),
            version,
            max_payload: AtomicUsize::new(max_payload),
            auth_required,
            token: Mutex::new(None),
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(1),
            kicked: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------
    // Identity and state
    // ------------------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn devpath(&self) -> Option<&str> {
        self.devpath.as_deref()
    }

    pub fn product(&self) -> String {
        self.identity
            .lock()
            .map(|i| i.product.clone())
            .unwrap_or_default()
    }

    pub fn model(&self) -> String {
        self.identity
            .lock()
            .map(|i| i.model.clone())
            .unwrap_or_default()
    }

    pub fn device(&self) -> String {
        self.identity
            .lock()
            .map(|i| i.device.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_product(&self, value: &str) {
        if let Ok(mut identity) = self.identity.lock() {
            identity.product = value.to_string();
        }
    }

    pub(crate) fn set_model(&self, value: &str) {
        if let Ok(mut identity) = self.identity.lock() {
            identity.model = value.to_string();
        }
    }

    pub(crate) fn set_device(&self, value: &str) {
        if let Ok(mut identity) = self.identity.lock() {
            identity.device = value.to_string();
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Offline)
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        if let Ok(mut guard) = self.state.lock() {
            trace!(serial = %self.serial, from = %*guard, to = %state, "State transition");
            *guard = state;
        }
    }

    /// Record the side declared by the peer banner and adopt it as the
    /// live state.
    pub(crate) fn set_banner_side(&self, state: ConnectionState) {
        if let Ok(mut side) = self.banner_side.lock() {
            *side = Some(state);
        }
        self.set_connection_state(state);
    }

    /// Adopt the banner-declared side after a successful handshake.
    pub(crate) fn go_online(&self) {
        let side = self
            .banner_side
            .lock()
            .ok()
            .and_then(|s| *s)
            .unwrap_or(ConnectionState::Device);
        self.set_connection_state(side);
    }

    pub fn is_online(&self) -> bool {
        self.connection_state().is_online()
    }

    pub fn auth_required(&self) -> bool {
        self.auth_required
    }

    pub(crate) fn context(&self) -> &TransportContext {
        &self.ctx
    }

    pub(crate) fn store_token(&self, token: [u8; TOKEN_SIZE]) {
        if let Ok(mut guard) = self.token.lock() {
            *guard = Some(token);
        }
    }

    pub(crate) fn take_token(&self) -> Option<[u8; TOKEN_SIZE]> {
        self.token.lock().ok().and_then(|mut guard| guard.take())
    }

    // ------------------------------------------------------------------
    // Features
    // ------------------------------------------------------------------

    /// Replace the negotiated feature set from a comma-separated list.
    /// The previous set is discarded, not merged.
    pub fn set_features(&self, list: &str) {
        if let Ok(mut features) = self.features.lock() {
            *features = FeatureSet::from_wire(list);
        }
    }

    pub fn features(&self) -> FeatureSet {
        self.features
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features
            .lock()
            .map(|f| f.contains(name))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Negotiated wire parameters
    // ------------------------------------------------------------------

    /// Adopt the peer's version word and payload limit from its CNXN.
    pub(crate) fn negotiate(&self, peer_version: u32, peer_max_payload: usize) {
        let agreed = peer_version.min(VERSION_SKIP_CHECKSUM);
        self.version.store(agreed, Ordering::Release);

        let peer_max = if peer_max_payload == 0 {
            LEGACY_MAX_PAYLOAD
        } else {
            peer_max_payload
        };
        let negotiated = peer_max.min(self.ctx.config.transport.max_payload);
        self.max_payload.store(negotiated, Ordering::Release);

        debug!(
            serial = %self.serial,
            version = format_args!("{agreed:#010x}"),
            max_payload = negotiated,
            "Negotiated wire parameters"
        );
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::from_word(self.version.load(Ordering::Acquire))
    }

    /// Largest payload a single outbound WRTE may carry.
    pub fn max_payload(&self) -> usize {
        self.max_payload.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Connection plumbing
    // ------------------------------------------------------------------

    /// Install and start the connection. Inbound packets are handled on
    /// the connection's reader context; connection errors cross into the
    /// event loop and kick the transport there.
    pub fn set_connection(&self, conn: Arc<dyn Connection>) -> Result<()> {
        {
            let mut guard = self
                .connection
                .lock()
                .map_err(|_| BridgeError::state("Transport lock poisoned"))?;
            if guard.is_some() {
                return Err(BridgeError::state("Connection already installed"));
            }
            *guard = Some(Arc::clone(&conn));
        }
        self.set_connection_state(ConnectionState::Connecting);

        let on_read = {
            let weak = self.weak.clone();
            Box::new(move |packet: Packet| {
                if let Some(transport) = weak.upgrade() {
                    transport.handle_packet(packet);
                }
            })
        };
        let on_error = {
            let weak = self.weak.clone();
            let event_loop = self.ctx.event_loop.clone();
            Box::new(move |error: BridgeError| {
                event_loop.post(move || {
                    if let Some(transport) = weak.upgrade() {
                        warn!(serial = %transport.serial, error = %error, "Connection failed");
                        transport.kick();
                    }
                });
            })
        };
        conn.start(on_read, on_error)
    }

    /// Queue a packet on the connection. Any failure kicks the transport.
    pub fn send_packet(&self, packet: Packet) -> Result<()> {
        if self.kicked.load(Ordering::Acquire) || self.connection_state() == ConnectionState::Offline
        {
            return Err(BridgeError::state(constants::ERR_TRANSPORT_OFFLINE));
        }
        let conn = self
            .connection
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| BridgeError::state(constants::ERR_NO_CONNECTION))?;

        let payload_bytes = packet.payload.len() as u64;
        trace!(serial = %self.serial, command = %packet.command, arg0 = packet.arg0, arg1 = packet.arg1, "Sending packet");
        match conn.send(packet) {
            Ok(()) => {
                global_metrics().packet_sent(payload_bytes);
                Ok(())
            }
            Err(e) => {
                warn!(serial = %self.serial, error = %e, "Send failed, kicking transport");
                self.kick();
                Err(e)
            }
        }
    }

    /// Forced teardown: state goes Offline, the connection stops, hooks
    /// fire exactly once, and every bound socket receives a synthetic
    /// close. Safe to call any number of times.
    pub fn kick(&self) {
        if self.kicked.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(serial = %self.serial, "Kicking transport");
        self.set_connection_state(ConnectionState::Offline);

        let conn = self.connection.lock().ok().and_then(|guard| guard.clone());
        if let Some(conn) = conn {
            conn.stop();
        }

        self.run_disconnects();

        for sock in self.ctx.registry.enumerate_for_transport(self.id) {
            sock.mark_close_sent();
            sock.close();
        }
    }

    /// Invoke and clear disconnect hooks in registration order. Hooks run
    /// without any transport lock held, so a hook may register or remove
    /// other hooks.
    pub fn run_disconnects(&self) {
        let hooks: Vec<(u64, DisconnectHook)> = self
            .hooks
            .lock()
            .map(|mut guard| guard.drain(..).collect())
            .unwrap_or_default();
        for (_, hook) in hooks {
            hook(self);
        }
    }

    /// Register a hook to run at disconnect. The returned handle removes
    /// it again while it has not fired.
    pub fn add_disconnect(
        &self,
        hook: impl FnOnce(&Transport) + Send + 'static,
    ) -> DisconnectHandle {
        let id = self.next_hook.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push((id, Box::new(hook)));
        }
        DisconnectHandle(id)
    }

    /// Remove a registered hook before it fires.
    pub fn remove_disconnect(&self, handle: DisconnectHandle) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.retain(|(id, _)| *id != handle.0);
        }
    }

    // ------------------------------------------------------------------
    // Packet dispatch
    // ------------------------------------------------------------------

    /// Handle one inbound packet: control commands drive the handshake,
    /// stream commands go to the socket layer once the transport is
    /// online. Fatal errors kick.
    pub fn handle_packet(&self, packet: Packet) {
        global_metrics().packet_received(packet.payload.len() as u64);
        trace!(
            serial = %self.serial,
            command = %packet.command,
            arg0 = packet.arg0,
            arg1 = packet.arg1,
            bytes = packet.payload.len(),
            "Handling packet"
        );

        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let result = match packet.command {
            Command::Cnxn => handshake::handle_cnxn(&this, &packet),
            Command::Auth => handshake::handle_auth(&this, &packet),
            Command::Stls => handshake::handle_stls(&this, &packet),
            Command::Sync => {
                warn!(serial = %self.serial, "Dropping reserved SYNC packet");
                Ok(())
            }
            Command::Open | Command::Wrte | Command::Okay | Command::Clse => {
                if self.is_online() {
                    socket::handle_stream_packet(&this, packet)
                } else {
                    warn!(serial = %self.serial, "Stream packet before transport online");
                    Ok(())
                }
            }
        };

        if let Err(e) = result {
            if e.is_fatal_for_transport() {
                global_metrics().protocol_error();
                warn!(serial = %self.serial, error = %e, "Fatal transport error");
                self.kick();
            } else {
                debug!(serial = %self.serial, error = %e, "Non-fatal protocol event");
            }
        }
    }

    // ------------------------------------------------------------------
    // Target matching
    // ------------------------------------------------------------------

    /// Host part and optional port of a `host:port` serial.
    fn serial_host_port(&self) -> (&str, Option<u16>) {
        match self.serial.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host, Some(port)),
                Err(_) => (self.serial.as_str(), None),
            },
            None => (self.serial.as_str(), None),
        }
    }

    /// Fuzzy match against serial, devpath, `product:`/`model:`/`device:`
    /// attributes, and (for network transports) `tcp:`/`udp:` host[:port]
    /// forms or a bare host.
    pub fn matches_target(&self, target: &str) -> bool {
        if target == self.serial || Some(target) == self.devpath.as_deref() {
            return true;
        }

        if let Some(rest) = target.strip_prefix("product:") {
            return rest == self.product();
        }
        if let Some(rest) = target.strip_prefix("model:") {
            return rest == self.model();
        }
        if let Some(rest) = target.strip_prefix("device:") {
            return rest == self.device();
        }

        if self.kind == TransportKind::Local {
            let (host, port) = self.serial_host_port();
            for prefix in ["tcp:", "udp:"] {
                if let Some(rest) = target.strip_prefix(prefix) {
                    return match rest.rsplit_once(':') {
                        Some((target_host, target_port)) => {
                            target_host == host
                                && target_port
                                    .parse::<u16>()
                                    .map(|p| Some(p) == port)
                                    .unwrap_or(false)
                        }
                        None => rest == host,
                    };
                }
            }
            if target == host {
                return true;
            }
        }

        false
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("serial", &self.serial)
            .field("state", &self.connection_state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::protocol::handshake::NoAuth;
    use crate::protocol::parse_banner;
    use std::sync::atomic::AtomicU32 as TestCounter;

    pub(crate) fn test_context() -> TransportContext {
        // The loop itself is dropped; posted work is discarded, which is
        // fine for tests that never await it.
        let (_event_loop, handle) = EventLoop::new();
        TransportContext {
            registry: Arc::new(SocketRegistry::new()),
            services: Arc::new(ServiceDispatcher::new(handle.clone())),
            event_loop: handle,
            config: Arc::new(BridgeConfig::default()),
            auth: Arc::new(NoAuth),
        }
    }

    pub(crate) fn test_transport(kind: TransportKind) -> Arc<Transport> {
        Transport::new(1, kind, "test".to_string(), None, test_context())
    }

    fn transport_with_serial(
        kind: TransportKind,
        serial: &str,
        devpath: Option<&str>,
    ) -> Arc<Transport> {
        Transport::new(
            1,
            kind,
            serial.to_string(),
            devpath.map(str::to_string),
            test_context(),
        )
    }

    #[test]
    fn run_disconnects_lifecycle() {
        let t = test_transport(TransportKind::Local);
        // Legal on a transport with no hooks registered.
        t.run_disconnects();

        let count = Arc::new(TestCounter::new(0));
        let c = Arc::clone(&count);
        t.add_disconnect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        t.run_disconnects();
        assert_eq!(1, count.load(Ordering::SeqCst));

        // The hook was cleared when it fired.
        t.run_disconnects();
        assert_eq!(1, count.load(Ordering::SeqCst));

        let count = Arc::new(TestCounter::new(0));
        let c = Arc::clone(&count);
        let handle = t.add_disconnect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        t.remove_disconnect(handle);
        t.run_disconnects();
        assert_eq!(0, count.load(Ordering::SeqCst));
    }

    #[test]
    fn hooks_fire_in_registration_order() {
        let t = test_transport(TransportKind::Local);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            t.add_disconnect(move |_| order.lock().unwrap().push(i));
        }
        t.run_disconnects();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn set_features_replaces() {
        let t = test_transport(TransportKind::Local);
        assert_eq!(0, t.features().len());

        t.set_features("foo");
        assert_eq!(1, t.features().len());
        assert!(t.has_feature("foo"));

        t.set_features("foo,bar");
        assert_eq!(2, t.features().len());
        assert!(t.has_feature("foo"));
        assert!(t.has_feature("bar"));

        t.set_features("foo,bar,foo");
        assert!(2 <= t.features().len());
        assert!(t.has_feature("foo"));
        assert!(t.has_feature("bar"));

        t.set_features("bar,baz");
        assert_eq!(2, t.features().len());
        assert!(!t.has_feature("foo"));
        assert!(t.has_feature("bar"));
        assert!(t.has_feature("baz"));

        t.set_features("");
        assert_eq!(0, t.features().len());
    }

    #[test]
    fn matches_target_usb_attributes() {
        let t = transport_with_serial(TransportKind::Usb, "foo", Some("/path/to/bar"));
        parse_banner(
            "host::ro.product.name=test_product;ro.product.model=test_model;\
             ro.product.device=test_device;",
            &t,
        );

        assert!(t.matches_target("foo"));
        assert!(t.matches_target("/path/to/bar"));
        assert!(t.matches_target("product:test_product"));
        assert!(t.matches_target("model:test_model"));
        assert!(t.matches_target("device:test_device"));

        // Product, model, and device do not match without the prefix.
        assert!(!t.matches_target("test_product"));
        assert!(!t.matches_target("test_model"));
        assert!(!t.matches_target("test_device"));
    }

    #[test]
    fn matches_target_local_network_forms() {
        let t = transport_with_serial(TransportKind::Local, "100.100.100.100:5555", None);

        assert!(t.matches_target("100.100.100.100"));
        assert!(t.matches_target("100.100.100.100:5555"));
        assert!(t.matches_target("tcp:100.100.100.100"));
        assert!(t.matches_target("tcp:100.100.100.100:5555"));
        assert!(t.matches_target("udp:100.100.100.100"));
        assert!(t.matches_target("udp:100.100.100.100:5555"));

        // Wrong protocol, hostname, or port never match.
        assert!(!t.matches_target("100.100.100"));
        assert!(!t.matches_target("100.100.100.100:"));
        assert!(!t.matches_target("100.100.100.100:-1"));
        assert!(!t.matches_target("100.100.100.100:5554"));
        assert!(!t.matches_target("abc:100.100.100.100"));
    }

    #[test]
    fn matches_target_network_forms_require_local_kind() {
        let t = transport_with_serial(TransportKind::Usb, "100.100.100.100:5555", None);

        assert!(t.matches_target("100.100.100.100:5555")); // exact serial still matches
        assert!(!t.matches_target("100.100.100.100"));
        assert!(!t.matches_target("tcp:100.100.100.100"));
        assert!(!t.matches_target("tcp:100.100.100.100:5555"));
        assert!(!t.matches_target("udp:100.100.100.100:5555"));
    }

    #[test]
    fn matches_target_is_stable_under_repetition() {
        let t = transport_with_serial(TransportKind::Local, "100.100.100.100:5555", None);
        for _ in 0..3 {
            assert!(t.matches_target("tcp:100.100.100.100:5555"));
            assert!(!t.matches_target("tcp:100.100.100.100:5554"));
        }
    }

    #[test]
    fn kick_fires_hooks_once_and_blocks_sends() {
        let t = test_transport(TransportKind::Local);
        let count = Arc::new(TestCounter::new(0));
        let c = Arc::clone(&count);
        t.add_disconnect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        t.kick();
        assert_eq!(ConnectionState::Offline, t.connection_state());
        assert_eq!(1, count.load(Ordering::SeqCst));
        assert!(t.send_packet(Packet::okay(1, 2)).is_err());

        t.kick();
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[test]
    fn negotiate_clamps_version_and_payload() {
        let t = test_transport(TransportKind::Local);
        t.negotiate(0x0100_0005, 4 * 1024 * 1024);
        assert_eq!(ProtocolVersion::V2, t.protocol_version());
        assert_eq!(
            t.context().config.transport.max_payload,
            t.max_payload()
        );

        t.negotiate(crate::core::packet::VERSION_WITH_CHECKSUM, 0);
        assert_eq!(ProtocolVersion::V1, t.protocol_version());
        assert_eq!(LEGACY_MAX_PAYLOAD, t.max_payload());

        t.negotiate(VERSION_SKIP_CHECKSUM, 4096);
        assert_eq!(ProtocolVersion::V2, t.protocol_version());
        assert_eq!(4096, t.max_payload());
    }
}
