//! Configuration for the multilink engine and daemon.
//!
//! This module holds:
//! - Engine tunables (weight floor, burst slack, pending-list caps)
//! - Member link definitions
//! - Daemon-level settings (peer identity, upper-layer ports, hand-off directory)

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::link::{DiscriminatorClass, EndpointDiscriminator, LinkParams, PeerId};
use crate::sequence::SeqWidth;

/// Default floor for a link's outbound weight
pub const DEFAULT_MIN_WEIGHT: u32 = 20;

/// Default number of bytes a burst may overrun a link's weight by to finish a packet
pub const DEFAULT_WEIGHT_SLACK: u32 = 20;

/// Default cap on queued, not yet reassembled fragments
pub const DEFAULT_MAX_PENDING_FRAGMENTS: usize = 1024;

/// Default cap on bytes held by queued fragments
pub const DEFAULT_MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Default maximum reconstructed receive unit
pub const DEFAULT_MRRU: u16 = 1500;

fn default_min_weight() -> u32 {
    DEFAULT_MIN_WEIGHT
}

fn default_weight_slack() -> u32 {
    DEFAULT_WEIGHT_SLACK
}

fn default_max_pending_fragments() -> usize {
    DEFAULT_MAX_PENDING_FRAGMENTS
}

fn default_max_pending_bytes() -> usize {
    DEFAULT_MAX_PENDING_BYTES
}

fn default_mrru() -> u16 {
    DEFAULT_MRRU
}

fn default_link_weight() -> u32 {
    1500
}

/// Engine tunables shared by every session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultilinkConfig {
    /// Smallest outbound weight a member link may have
    #[serde(default = "default_min_weight")]
    pub min_weight: u32,

    /// Bytes a link may take beyond its weight when that finishes the packet.
    ///
    /// Avoids cutting a tiny trailing fragment off an almost-fitting packet.
    #[serde(default = "default_weight_slack")]
    pub weight_slack: u32,

    /// Most fragments kept waiting for reassembly
    #[serde(default = "default_max_pending_fragments")]
    pub max_pending_fragments: usize,

    /// Most payload bytes kept waiting for reassembly
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
}

impl Default for MultilinkConfig {
    fn default() -> Self {
        Self {
            min_weight: DEFAULT_MIN_WEIGHT,
            weight_slack: DEFAULT_WEIGHT_SLACK,
            max_pending_fragments: DEFAULT_MAX_PENDING_FRAGMENTS,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

/// One physical link of the bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Name used in logs
    pub name: String,
    /// Local UDP address the link is bound to
    pub local_addr: String,
    /// Remote UDP address of the peer's end of the link
    pub peer_addr: String,
    /// Outbound weight (bytes per burst)
    #[serde(default = "default_link_weight")]
    pub weight: u32,

    /// Negotiated short sequence option, if it differs from the daemon default.
    ///
    /// Link negotiation reports this per link; a value that disagrees with the
    /// running session gets the link rejected.
    #[serde(default)]
    pub short_seq: Option<bool>,

    /// Negotiated MRRU, if it differs from the daemon default.
    #[serde(default)]
    pub mrru: Option<u16>,
}

/// Configuration for the multilink daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Authenticated name of the peer
    #[serde(default)]
    pub peer_authname: String,

    /// Endpoint discriminator class offered by the peer
    #[serde(default = "default_enddisc_class")]
    pub peer_enddisc_class: DiscriminatorClass,

    /// Base64-encoded endpoint discriminator address bytes.
    #[serde(default)]
    pub peer_enddisc_b64: Option<String>,

    /// Use 12-bit sequence numbers
    #[serde(default)]
    pub short_seq: bool,

    /// Maximum reconstructed receive unit
    #[serde(default = "default_mrru")]
    pub mrru: u16,

    /// UDP address the upper layer sends outbound packets to
    pub ingress_addr: String,

    /// UDP address reassembled packets are delivered to
    pub egress_addr: String,

    /// Directory holding the hand-off socket.
    ///
    /// When unset, the daemon always owns its session and never hands links over.
    #[serde(default)]
    pub handoff_dir: Option<PathBuf>,

    /// Health/logging interval
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,

    /// Engine tunables
    #[serde(default)]
    pub multilink: MultilinkConfig,

    /// Member links
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

fn default_enddisc_class() -> DiscriminatorClass {
    DiscriminatorClass::Null
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            peer_authname: String::new(),
            peer_enddisc_class: default_enddisc_class(),
            peer_enddisc_b64: None,
            short_seq: false,
            mrru: DEFAULT_MRRU,
            ingress_addr: "127.0.0.1:6000".to_string(),
            egress_addr: "127.0.0.1:6001".to_string(),
            handoff_dir: None,
            health_interval: Duration::from_secs(5),
            multilink: MultilinkConfig::default(),
            links: vec![
                LinkConfig {
                    name: "link0".to_string(),
                    local_addr: "0.0.0.0:7000".to_string(),
                    peer_addr: "127.0.0.1:7100".to_string(),
                    weight: default_link_weight(),
                    short_seq: None,
                    mrru: None,
                },
                LinkConfig {
                    name: "link1".to_string(),
                    local_addr: "0.0.0.0:7001".to_string(),
                    peer_addr: "127.0.0.1:7101".to_string(),
                    weight: default_link_weight(),
                    short_seq: None,
                    mrru: None,
                },
            ],
        }
    }
}

impl DaemonConfig {
    /// Peer identity built from the configured name and discriminator.
    pub fn peer_id(&self) -> Result<PeerId, ConfigError> {
        let address = match self.peer_enddisc_b64.as_deref() {
            Some(b64) => base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(ConfigError::InvalidDiscriminator)?,
            None => Vec::new(),
        };

        Ok(PeerId::new(
            self.peer_authname.clone(),
            EndpointDiscriminator::new(self.peer_enddisc_class, address),
        ))
    }

    /// Parameters `link` would report after negotiation.
    pub fn link_params(&self, link: &LinkConfig) -> Result<LinkParams, ConfigError> {
        Ok(LinkParams {
            seq_width: SeqWidth::from_short_seq(link.short_seq.unwrap_or(self.short_seq)),
            mrru: link.mrru.unwrap_or(self.mrru),
            peer: self.peer_id()?,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("peer_enddisc_b64 is not valid base64: {0}")]
    InvalidDiscriminator(#[source] base64::DecodeError),
}
