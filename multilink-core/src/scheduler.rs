//! Outbound fragment distribution.
//!
//! Whole packets are taken from the session's output queue and cut into fragments
//! sized by each member link's weight. Every call walks the member links once,
//! starting at the rotor, and gives each idle open link exactly one fragment: the
//! next piece of the packet in progress, or the start of a new one. A packet that
//! is still unfinished when the walk ends is carried over and resumed first on the
//! next call. Every fragment takes the next session-wide sequence number.
//!
//! The distributor is pure bookkeeping: it queues frames on transports and never
//! waits for them to be written.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::link::{LinkId, MemberLink};
use crate::proto::{Fragment, FragmentHeader};
use crate::sequence::SeqWidth;
use crate::transport::LinkTransport;

/// Packet whose first fragment has gone out but whose end has not
#[derive(Debug, Clone)]
struct PartialPacket {
    packet: Vec<u8>,
    offset: usize,
}

/// Outbound state of one session
#[derive(Debug, Clone)]
pub struct Distributor {
    width: SeqWidth,
    /// Sequence number of the next fragment sent
    out_seq: u32,
    /// Member index the next walk starts at
    rotor: usize,
    /// Extra bytes a link may take to finish a packet
    weight_slack: u32,
    partial: Option<PartialPacket>,
}

impl Distributor {
    pub fn new(width: SeqWidth, weight_slack: u32) -> Self {
        Self {
            width,
            out_seq: 0,
            rotor: 0,
            weight_slack,
            partial: None,
        }
    }

    pub fn out_seq(&self) -> u32 {
        self.out_seq
    }

    pub fn rotor(&self) -> usize {
        self.rotor
    }

    /// Bytes of the packet in progress still waiting for a link
    pub fn unsent_bytes(&self) -> usize {
        self.partial
            .as_ref()
            .map_or(0, |p| p.packet.len() - p.offset)
    }

    /// Walk the member links once, handing one fragment to every idle open link.
    ///
    /// Links that are closed, or still busy writing what they were given earlier,
    /// are passed over. Packets stay queued when no link can take them. Returns
    /// the number of bytes (headers included) handed to transports.
    pub fn fill<T: LinkTransport>(
        &mut self,
        members: &[MemberLink],
        transports: &mut HashMap<LinkId, T>,
        queue: &mut VecDeque<Vec<u8>>,
    ) -> usize {
        let count = members.len();
        if count == 0 || (queue.is_empty() && self.partial.is_none()) {
            return 0;
        }

        let start = self.rotor % count;
        let mut last_used = None;
        let mut total = 0;

        for step in 0..count {
            let idx = (start + step) % count;
            let member = &members[idx];
            let Some(transport) = transports
                .get_mut(&member.id)
                .filter(|t| t.is_open() && t.queue_len() == 0)
            else {
                continue;
            };

            let (packet, offset) = match self.partial.take() {
                Some(partial) => (partial.packet, partial.offset),
                None => match queue.pop_front() {
                    Some(packet) => (packet, 0),
                    None => break,
                },
            };

            let remaining = packet.len() - offset;
            let fits = remaining as u64
                <= u64::from(member.out_weight) + u64::from(self.weight_slack);
            let take = if fits {
                remaining
            } else {
                member.out_weight as usize
            };

            let header = FragmentHeader::new(self.out_seq, offset == 0, fits);
            let frame = Fragment::encode(&header, self.width, &packet[offset..offset + take]);
            debug!(
                seq = self.out_seq,
                len = frame.len(),
                link = %member.name,
                "MP: send frag"
            );
            total += frame.len();
            transport.send(frame);

            self.out_seq = self.width.increment(self.out_seq);
            last_used = Some(idx);

            if !fits {
                self.partial = Some(PartialPacket {
                    packet,
                    offset: offset + take,
                });
            }
        }

        if let Some(idx) = last_used {
            self.rotor = (idx + 1) % count;
        }
        total
    }
}
