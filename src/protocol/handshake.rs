//! Connection handshake: CNXN, AUTH, and the STLS refusal path.
//!
//! The daemon is passive. The host opens with a CNXN carrying its version
//! word, payload limit, and banner. With auth disabled the daemon parses
//! the banner, goes online, and answers with its own CNXN. With auth
//! enabled it issues a random token challenge instead and stays
//! unauthorized until the host presents a signature the [`AuthProvider`]
//! accepts, or a public key the provider's policy confirms.
//!
//! Signature and key verification are pluggable. The daemon only tracks
//! the outstanding token and the resulting authorized/unauthorized state.

use bytes::Bytes;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::packet::{
    Packet, AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN, TOKEN_SIZE,
};
use crate::error::{constants, BridgeError, Result};
use crate::protocol::banner::{self, ConnectionState, FeatureSet};
use crate::transport::Transport;
use crate::utils::metrics::global_metrics;

/// Pluggable authentication step.
///
/// Implementations hold the device's known host keys and whatever user
/// interaction policy applies. The transport only consumes the verdicts.
pub trait AuthProvider: Send + Sync {
    /// Verify a signature over the outstanding token.
    fn verify_signature(&self, token: &[u8], signature: &[u8]) -> bool;

    /// Ask policy whether a newly presented public key may be trusted.
    fn confirm_public_key(&self, key: &[u8]) -> bool;

    /// Persist a confirmed public key. Called only after
    /// `confirm_public_key` accepted it.
    fn install_public_key(&self, _key: &[u8]) {}
}

/// Provider that rejects every signature and key. Installed by default on
/// daemons that never enabled auth, so a misconfiguration fails closed.
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn verify_signature(&self, _token: &[u8], _signature: &[u8]) -> bool {
        false
    }

    fn confirm_public_key(&self, _key: &[u8]) -> bool {
        false
    }
}

/// Reference provider for tests and loopback setups: a signature is valid
/// when it equals `SHA256(token || secret)`.
pub struct SharedSecretAuth {
    secret: Vec<u8>,
}

impl SharedSecretAuth {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Produce the signature a host holding `secret` would send.
    pub fn sign(secret: &[u8], token: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(token);
        hasher.update(secret);
        hasher.finalize().to_vec()
    }
}

impl AuthProvider for SharedSecretAuth {
    fn verify_signature(&self, token: &[u8], signature: &[u8]) -> bool {
        Self::sign(&self.secret, token) == signature
    }

    fn confirm_public_key(&self, key: &[u8]) -> bool {
        key == self.secret
    }
}

/// Generate a fresh random auth token.
fn generate_token() -> [u8; TOKEN_SIZE] {
    let mut token = [0u8; TOKEN_SIZE];
    OsRng.fill_bytes(&mut token);
    token
}

/// Handle an inbound CNXN: negotiate version and payload limit, parse the
/// banner, then either go online or start the auth exchange.
pub(crate) fn handle_cnxn(transport: &Arc<Transport>, packet: &Packet) -> Result<()> {
    transport.negotiate(packet.arg0, packet.arg1 as usize);

    let text = String::from_utf8_lossy(&packet.payload);
    banner::parse_banner(&text, transport);
    if transport.connection_state() == ConnectionState::Offline {
        return Err(BridgeError::protocol("Unusable connect banner"));
    }

    if transport.auth_required() {
        transport.set_connection_state(ConnectionState::Unauthorized);
        send_auth_token(transport)?;
        schedule_auth_timeout(transport);
        Ok(())
    } else {
        go_online(transport)
    }
}

/// Handle an inbound AUTH packet according to its subtype.
pub(crate) fn handle_auth(transport: &Arc<Transport>, packet: &Packet) -> Result<()> {
    if !transport.auth_required() {
        warn!(serial = %transport.serial(), "AUTH received but auth is disabled");
        return Ok(());
    }

    match packet.arg0 {
        AUTH_SIGNATURE => {
            transport.set_connection_state(ConnectionState::Authorizing);
            let Some(token) = transport.take_token() else {
                debug!(serial = %transport.serial(), "{}", constants::ERR_NO_TOKEN_OUTSTANDING);
                transport.set_connection_state(ConnectionState::Unauthorized);
                return send_auth_token(transport);
            };
            if transport.context().auth.verify_signature(&token, &packet.payload) {
                go_online(transport)
            } else {
                global_metrics().auth_failure();
                debug!(serial = %transport.serial(), "{}", constants::ERR_SIGNATURE_REJECTED);
                transport.set_connection_state(ConnectionState::Unauthorized);
                send_auth_token(transport)
            }
        }
        AUTH_RSAPUBLICKEY => {
            transport.set_connection_state(ConnectionState::Authorizing);
            let auth = Arc::clone(&transport.context().auth);
            if auth.confirm_public_key(&packet.payload) {
                auth.install_public_key(&packet.payload);
                go_online(transport)
            } else {
                global_metrics().auth_failure();
                debug!(serial = %transport.serial(), "{}", constants::ERR_KEY_REJECTED);
                transport.set_connection_state(ConnectionState::Unauthorized);
                send_auth_token(transport)
            }
        }
        _ => Err(BridgeError::Auth(format!(
            "Unexpected AUTH subtype {}",
            packet.arg0
        ))),
    }
}

/// Handle an inbound STLS. The upgrade itself is the auth provider's
/// territory; without one the daemon refuses and tears the link down.
pub(crate) fn handle_stls(transport: &Arc<Transport>, _packet: &Packet) -> Result<()> {
    warn!(serial = %transport.serial(), "{}", constants::ERR_TLS_UNSUPPORTED);
    Err(BridgeError::protocol(constants::ERR_TLS_UNSUPPORTED))
}

/// Issue a fresh token challenge and remember it for verification.
fn send_auth_token(transport: &Arc<Transport>) -> Result<()> {
    let token = generate_token();
    transport.store_token(token);
    debug!(serial = %transport.serial(), "Sending auth token");
    transport.send_packet(Packet::auth(
        AUTH_TOKEN,
        Bytes::copy_from_slice(&token),
    ))
}

/// Kick the transport if the host never completes auth.
fn schedule_auth_timeout(transport: &Arc<Transport>) {
    let timeout = transport.context().config.auth.token_timeout;
    let weak = Arc::downgrade(transport);
    transport.context().event_loop.post_delayed(
        move || {
            if let Some(t) = weak.upgrade() {
                if !t.is_online() {
                    warn!(serial = %t.serial(), "Auth wait timed out");
                    t.kick();
                }
            }
        },
        Instant::now() + timeout,
    );
}

/// Transition to the banner-declared side and answer with our CNXN.
fn go_online(transport: &Arc<Transport>) -> Result<()> {
    transport.go_online();
    global_metrics().handshake_success();
    info!(
        serial = %transport.serial(),
        state = %transport.connection_state(),
        features = transport.features().len(),
        "Transport online"
    );
    send_connect(transport)
}

/// Send this daemon's CNXN with its banner and negotiated parameters.
pub(crate) fn send_connect(transport: &Arc<Transport>) -> Result<()> {
    let config = &transport.context().config.transport;
    let features: FeatureSet = config.features.iter().cloned().collect();
    let text = banner::format_banner(
        "device",
        &config.product,
        &config.model,
        &config.device,
        &features,
    );
    transport.send_packet(Packet::cnxn(
        transport.protocol_version().word(),
        config.max_payload,
        &text,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        let c = generate_token();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn shared_secret_round_trip() {
        let provider = SharedSecretAuth::new(b"hunter2".to_vec());
        let token = generate_token();
        let signature = SharedSecretAuth::sign(b"hunter2", &token);
        assert!(provider.verify_signature(&token, &signature));

        let wrong = SharedSecretAuth::sign(b"hunter3", &token);
        assert!(!provider.verify_signature(&token, &wrong));
    }

    #[test]
    fn no_auth_rejects_everything() {
        let provider = NoAuth;
        assert!(!provider.verify_signature(b"token", b"signature"));
        assert!(!provider.confirm_public_key(b"key"));
    }
}
