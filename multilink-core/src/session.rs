//! Multilink session: the bundle-wide state shared by all member links.
//!
//! A session comes alive when its first link joins. That founder fixes the
//! sequence number width, the MRRU and the peer identity for the lifetime of the
//! session; every later link must agree on all three or it is turned away. The
//! session dies when its last link leaves, and whatever was still waiting for
//! reassembly dies with it.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::control::{MultilinkConfig, DEFAULT_MRRU};
use crate::link::{LinkId, LinkParams, MemberLink, PeerId};
use crate::proto::Fragment;
use crate::reorder::{Dispatch, ReassemblyStats, Reassembler};
use crate::scheduler::Distributor;
use crate::sequence::SeqWidth;
use crate::transport::LinkTransport;

/// Result of a successful join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The link founded a new session
    Started,
    /// The link was added to the running session
    Added,
}

/// Result of removing a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The link was removed; others remain
    Removed,
    /// The last link left and the session was torn down
    Closed,
    /// The link was not a member
    NotMember,
}

/// Reasons a link may not join the running session
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("Link {0} is already a member")]
    AlreadyMember(LinkId),

    #[error("Inappropriate peer: session belongs to {session}, link leads to {link}")]
    PeerMismatch { session: PeerId, link: PeerId },

    #[error("MRRU mismatch: session uses {session}, link negotiated {link}")]
    MrruMismatch { session: u16, link: u16 },

    #[error("Sequence format mismatch: session uses {session}, link negotiated {link}")]
    SeqWidthMismatch { session: SeqWidth, link: SeqWidth },
}

/// Snapshot of session counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub members: usize,
    pub out_seq: u32,
    pub next_in_seq: u32,
    pub min_in_seq: u32,
    pub pending_fragments: usize,
    pub pending_bytes: usize,
    pub fragments_in: u64,
    pub format_errors: u64,
    pub bytes_out: u64,
    pub reassembly: ReassemblyStats,
}

/// Multilink session
pub struct MultilinkSession {
    config: MultilinkConfig,
    active: bool,
    width: SeqWidth,
    mrru: u16,
    peer: PeerId,
    members: Vec<MemberLink>,
    inbound: Reassembler,
    outbound: Distributor,
    fragments_in: u64,
    format_errors: u64,
    bytes_out: u64,
}

impl MultilinkSession {
    /// Create an inactive session; the first [`join`](Self::join) activates it.
    pub fn new(config: MultilinkConfig) -> Self {
        let width = SeqWidth::Long;
        Self {
            inbound: Reassembler::new(width, DEFAULT_MRRU, &config),
            outbound: Distributor::new(width, config.weight_slack),
            config,
            active: false,
            width,
            mrru: DEFAULT_MRRU,
            peer: PeerId::default(),
            members: Vec::new(),
            fragments_in: 0,
            format_errors: 0,
            bytes_out: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn seq_width(&self) -> SeqWidth {
        self.width
    }

    pub fn mrru(&self) -> u16 {
        self.mrru
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Member links in rotor order
    pub fn members(&self) -> &[MemberLink] {
        &self.members
    }

    pub fn member(&self, id: LinkId) -> Option<&MemberLink> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn out_seq(&self) -> u32 {
        self.outbound.out_seq()
    }

    pub fn out_link_rotor(&self) -> usize {
        self.outbound.rotor()
    }

    pub fn next_in_seq(&self) -> u32 {
        self.inbound.next_in_seq()
    }

    pub fn min_in_seq(&self) -> u32 {
        self.inbound.min_in_seq()
    }

    pub fn pending_len(&self) -> usize {
        self.inbound.pending_len()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            members: self.members.len(),
            out_seq: self.out_seq(),
            next_in_seq: self.next_in_seq(),
            min_in_seq: self.min_in_seq(),
            pending_fragments: self.inbound.pending_len(),
            pending_bytes: self.inbound.pending_bytes(),
            fragments_in: self.fragments_in,
            format_errors: self.format_errors,
            bytes_out: self.bytes_out,
            reassembly: self.inbound.stats().clone(),
        }
    }

    /// Add a link whose negotiation just completed.
    ///
    /// The first link founds the session. Later links must match the founder's
    /// peer, MRRU and sequence format exactly; a mismatch leaves the session
    /// untouched and the caller decides what to do with the link.
    pub fn join(
        &mut self,
        id: LinkId,
        name: impl Into<String>,
        params: &LinkParams,
        weight: u32,
    ) -> Result<JoinOutcome, JoinError> {
        let name = name.into();

        if !self.active {
            self.width = params.seq_width;
            self.mrru = params.mrru;
            self.peer = params.peer.clone();
            self.inbound = Reassembler::new(self.width, self.mrru, &self.config);
            self.outbound = Distributor::new(self.width, self.config.weight_slack);
            self.members = vec![MemberLink::new(id, name, weight, self.config.min_weight)];
            self.fragments_in = 0;
            self.format_errors = 0;
            self.bytes_out = 0;
            self.active = true;

            info!(
                link = id,
                peer = %self.peer,
                mrru = self.mrru,
                seq = %self.width,
                "MP: session started"
            );
            return Ok(JoinOutcome::Started);
        }

        if self.member(id).is_some() {
            return Err(JoinError::AlreadyMember(id));
        }
        if params.peer != self.peer {
            return Err(JoinError::PeerMismatch {
                session: self.peer.clone(),
                link: params.peer.clone(),
            });
        }
        if params.mrru != self.mrru {
            return Err(JoinError::MrruMismatch {
                session: self.mrru,
                link: params.mrru,
            });
        }
        if params.seq_width != self.width {
            return Err(JoinError::SeqWidthMismatch {
                session: self.width,
                link: params.seq_width,
            });
        }

        let mut member = MemberLink::new(id, name, weight, self.config.min_weight);
        // Nothing was sent on the new link before it joined.
        member.last_in_seq = self.inbound.next_in_seq();
        info!(link = id, name = %member.name, members = self.members.len() + 1, "MP: link added");
        self.members.push(member);
        self.recompute_min_in();

        Ok(JoinOutcome::Added)
    }

    /// Remove a link. Removing the last link tears the session down, discarding
    /// any partially reassembled packets.
    ///
    /// The departed link may have been holding `min_in_seq` back; call
    /// [`reassemble_pending`](Self::reassemble_pending) afterwards to release
    /// whatever that unblocks.
    pub fn leave(&mut self, id: LinkId) -> LeaveOutcome {
        let Some(pos) = self.members.iter().position(|m| m.id == id) else {
            return LeaveOutcome::NotMember;
        };

        let member = self.members.remove(pos);
        info!(link = id, name = %member.name, remaining = self.members.len(), "MP: link removed");

        if self.members.is_empty() {
            self.teardown();
            return LeaveOutcome::Closed;
        }

        self.recompute_min_in();
        LeaveOutcome::Removed
    }

    /// Change a member's outbound weight (raised to the configured floor).
    pub fn set_weight(&mut self, id: LinkId, weight: u32) -> bool {
        let floor = self.config.min_weight;
        match self.members.iter_mut().find(|m| m.id == id) {
            Some(member) => {
                member.out_weight = weight.max(floor).max(1);
                true
            }
            None => false,
        }
    }

    /// Handle one frame received on member `link`.
    ///
    /// Malformed frames and frames from non-members are dropped. Returns the
    /// number of packets this arrival completed and handed to `sink`.
    pub fn accept_fragment<D: Dispatch + ?Sized>(
        &mut self,
        link: LinkId,
        bytes: &[u8],
        sink: &mut D,
    ) -> usize {
        if !self.active {
            debug!(link, "MP: fragment for inactive session dropped");
            return 0;
        }

        let fragment = match Fragment::decode(bytes, self.width) {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!(link, "MP: {e}");
                self.format_errors += 1;
                return 0;
            }
        };

        let Some(member) = self.members.iter_mut().find(|m| m.id == link) else {
            debug!(link, "MP: fragment from non-member link dropped");
            return 0;
        };

        member.last_in_seq = fragment.header.sequence;
        self.fragments_in += 1;
        self.recompute_min_in();

        self.inbound.push(fragment, sink)
    }

    /// Re-run reassembly without a new arrival (after a membership change).
    pub fn reassemble_pending<D: Dispatch + ?Sized>(&mut self, sink: &mut D) -> usize {
        if !self.active {
            return 0;
        }
        self.inbound.process(sink)
    }

    /// Move queued packets onto idle member links.
    ///
    /// Returns the number of bytes handed to transports.
    pub fn distribute<T: LinkTransport>(
        &mut self,
        transports: &mut HashMap<LinkId, T>,
        queue: &mut VecDeque<Vec<u8>>,
    ) -> usize {
        if !self.active {
            return 0;
        }
        let sent = self.outbound.fill(&self.members, transports, queue);
        self.bytes_out += sent as u64;
        sent
    }

    fn recompute_min_in(&mut self) {
        let width = self.width;
        let floor = self
            .members
            .iter()
            .map(|m| m.last_in_seq)
            .reduce(|a, b| width.earliest(a, b));

        if let Some(floor) = floor {
            self.inbound.set_min_in_seq(floor);
        }
    }

    fn teardown(&mut self) {
        let stats = self.inbound.stats();
        info!(
            discarded = self.inbound.pending_len(),
            delivered = stats.delivered,
            "MP: session closed"
        );

        self.inbound.reset();
        self.outbound = Distributor::new(self.width, self.config.weight_slack);
        self.members.clear();
        self.peer = PeerId::default();
        self.active = false;
    }
}
