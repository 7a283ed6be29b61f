//! Connection states, feature sets, and the CNXN banner grammar.
//!
//! A banner is the ASCII payload of a CNXN packet:
//!
//! ```text
//! banner := side "::" ( key "=" value ";" )*
//! ```
//!
//! where `side` names the peer's role and the recognized keys are
//! `ro.product.name`, `ro.product.model`, `ro.product.device`, and
//! `features` (comma-separated). Unknown keys are ignored. A banner
//! without the `::` separator leaves the transport offline.

use std::collections::BTreeSet;

use tracing::warn;

use crate::transport::Transport;

/// Feature gating shell protocol v2 framing.
pub const FEATURE_SHELL_V2: &str = "shell_v2";
/// Feature gating the cmd service.
pub const FEATURE_CMD: &str = "cmd";
/// Feature gating extended stat results in file sync.
pub const FEATURE_STAT_V2: &str = "stat_v2";

/// Features this daemon advertises by default.
pub fn default_features() -> Vec<String> {
    vec![
        FEATURE_SHELL_V2.to_string(),
        FEATURE_CMD.to_string(),
        FEATURE_STAT_V2.to_string(),
    ]
}

/// State of a transport, as shown on the device-listing channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authorizing,
    Unauthorized,
    NoPermission,
    Detached,
    Offline,
    Bootloader,
    Device,
    Host,
    Recovery,
    Sideload,
    Rescue,
}

impl ConnectionState {
    /// The wire name used on the device-listing channel.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authorizing => "authorizing",
            ConnectionState::Unauthorized => "unauthorized",
            ConnectionState::NoPermission => "noperm",
            ConnectionState::Detached => "detached",
            ConnectionState::Offline => "offline",
            ConnectionState::Bootloader => "bootloader",
            ConnectionState::Device => "device",
            ConnectionState::Host => "host",
            ConnectionState::Recovery => "recovery",
            ConnectionState::Sideload => "sideload",
            ConnectionState::Rescue => "rescue",
        }
    }

    /// States in which stream packets (OPEN/WRTE/OKAY/CLSE) are admitted.
    pub fn is_online(self) -> bool {
        matches!(
            self,
            ConnectionState::Bootloader
                | ConnectionState::Device
                | ConnectionState::Host
                | ConnectionState::Recovery
                | ConnectionState::Sideload
                | ConnectionState::Rescue
        )
    }

    /// Parse a banner side string; `None` for unknown sides.
    pub fn from_banner_side(side: &str) -> Option<Self> {
        match side {
            "host" => Some(ConnectionState::Host),
            "device" => Some(ConnectionState::Device),
            "bootloader" => Some(ConnectionState::Bootloader),
            "recovery" => Some(ConnectionState::Recovery),
            "rescue" => Some(ConnectionState::Rescue),
            "sideload" => Some(ConnectionState::Sideload),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A negotiated set of feature names.
///
/// `set` replaces the whole collection; there is no merge between
/// successive banners.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet(BTreeSet<String>);

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-separated feature list. Empty tokens are dropped, so
    /// an empty string yields an empty set.
    pub fn from_wire(list: &str) -> Self {
        Self(
            list.split(',')
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Serialize as a comma-separated list for a banner.
    pub fn to_wire(&self) -> String {
        self.0.iter().cloned().collect::<Vec<_>>().join(",")
    }

    pub fn contains(&self, feature: &str) -> bool {
        self.0.contains(feature)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromIterator<String> for FeatureSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parse a CNXN banner into the transport: side becomes the connection
/// state, recognized properties update the identity, and `features`
/// replaces the negotiated set.
///
/// A banner without `::` takes the transport offline rather than failing.
pub fn parse_banner(banner: &str, transport: &Transport) {
    let Some((side, props)) = banner.split_once("::") else {
        warn!(banner, "Malformed banner, transport goes offline");
        transport.set_connection_state(ConnectionState::Offline);
        return;
    };

    for prop in props.split(';').filter(|p| !p.is_empty()) {
        let Some((key, value)) = prop.split_once('=') else {
            continue;
        };
        match key {
            "ro.product.name" => transport.set_product(value),
            "ro.product.model" => transport.set_model(value),
            "ro.product.device" => transport.set_device(value),
            "features" => transport.set_features(value),
            _ => {}
        }
    }

    let state = ConnectionState::from_banner_side(side).unwrap_or(ConnectionState::Offline);
    transport.set_banner_side(state);
}

/// Build the banner this daemon sends in its own CNXN.
pub fn format_banner(
    side: &str,
    product: &str,
    model: &str,
    device: &str,
    features: &FeatureSet,
) -> String {
    let mut banner = format!("{side}::");
    if !product.is_empty() {
        banner.push_str(&format!("ro.product.name={product};"));
    }
    if !model.is_empty() {
        banner.push_str(&format!("ro.product.model={model};"));
    }
    if !device.is_empty() {
        banner.push_str(&format!("ro.product.device={device};"));
    }
    if !features.is_empty() {
        banner.push_str(&format!("features={};", features.to_wire()));
    }
    banner
}
