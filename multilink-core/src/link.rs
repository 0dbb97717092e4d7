//! Member links and the identity of the peer they lead to.
//!
//! A [`MemberLink`] is the engine's view of one physical link inside a bundle: the
//! last fragment sequence number seen on it and the number of bytes it takes per
//! outbound burst. [`LinkParams`] carries what link negotiation agreed on for a
//! candidate link and decides whether it may join an existing session.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sequence::SeqWidth;

/// Link identifier, unique within a daemon
pub type LinkId = u32;

/// Endpoint discriminator class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscriminatorClass {
    Null,
    Local,
    Ip,
    Mac,
    Magic,
    Psn,
}

impl DiscriminatorClass {
    /// Class number as carried in link negotiation
    pub fn code(self) -> u8 {
        match self {
            DiscriminatorClass::Null => 0,
            DiscriminatorClass::Local => 1,
            DiscriminatorClass::Ip => 2,
            DiscriminatorClass::Mac => 3,
            DiscriminatorClass::Magic => 4,
            DiscriminatorClass::Psn => 5,
        }
    }
}

/// Endpoint discriminator: a class plus opaque address bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDiscriminator {
    pub class: DiscriminatorClass,
    pub address: Vec<u8>,
}

impl EndpointDiscriminator {
    pub fn null() -> Self {
        Self {
            class: DiscriminatorClass::Null,
            address: Vec::new(),
        }
    }

    pub fn new(class: DiscriminatorClass, address: impl Into<Vec<u8>>) -> Self {
        Self {
            class,
            address: address.into(),
        }
    }
}

impl Default for EndpointDiscriminator {
    fn default() -> Self {
        Self::null()
    }
}

/// Identity of the peer at the far end of a bundle.
///
/// Only used to key the session and name the hand-off channel; it plays no part
/// in fragment handling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PeerId {
    /// Authenticated peer name (empty when unauthenticated)
    pub authname: String,
    /// Endpoint discriminator offered by the peer
    pub enddisc: EndpointDiscriminator,
}

impl PeerId {
    pub fn new(authname: impl Into<String>, enddisc: EndpointDiscriminator) -> Self {
        Self {
            authname: authname.into(),
            enddisc,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.authname.is_empty() {
            "<unauthenticated>"
        } else {
            &self.authname
        };
        write!(f, "{name}/{:?}", self.enddisc.class)?;
        if !self.enddisc.address.is_empty() {
            f.write_str("/")?;
            for byte in &self.enddisc.address {
                write!(f, "{byte:02x}")?;
            }
        }
        Ok(())
    }
}

/// Parameters negotiated for a candidate member link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkParams {
    /// Fragment sequence number format
    pub seq_width: SeqWidth,
    /// Maximum reconstructed receive unit
    pub mrru: u16,
    /// Peer the link leads to
    pub peer: PeerId,
}

/// Per-link multilink state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberLink {
    /// Link identifier
    pub id: LinkId,
    /// Human-readable name used in logs
    pub name: String,
    /// Sequence number of the last fragment received on this link
    pub last_in_seq: u32,
    /// Maximum bytes taken from a packet per burst on this link
    pub out_weight: u32,
}

impl MemberLink {
    /// Create a member, raising `out_weight` to `min_weight` if needed.
    pub fn new(id: LinkId, name: impl Into<String>, out_weight: u32, min_weight: u32) -> Self {
        Self {
            id,
            name: name.into(),
            last_in_seq: 0,
            out_weight: out_weight.max(min_weight).max(1),
        }
    }
}
