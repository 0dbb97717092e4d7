//! Inbound fragment reassembly.
//!
//! Fragments of one packet are spread over every member link, so they arrive out
//! of order and interleaved with fragments of neighbouring packets. Each link on
//! its own delivers in sequence order, which gives the engine a floor
//! (`min_in_seq`, the oldest "last seen" sequence over all links): a missing
//! fragment older than the floor will never arrive, and the partial packet it
//! belongs to can be thrown away instead of stalling the bundle.
//!
//! Received fragments wait in a pending list sorted by [`SeqWidth::is_before`].
//! Whenever a run starting at `next_in_seq` ends in a fragment with the end flag,
//! the run is concatenated and handed to the [`Dispatch`] sink.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::control::MultilinkConfig;
use crate::proto::{Fragment, FragmentHeader};
use crate::sequence::SeqWidth;

/// Receiver of reassembled packets (the upper-layer protocol dispatcher).
pub trait Dispatch {
    fn dispatch(&mut self, packet: Vec<u8>);
}

impl Dispatch for Vec<Vec<u8>> {
    fn dispatch(&mut self, packet: Vec<u8>) {
        self.push(packet);
    }
}

/// Fragment waiting for the rest of its packet
#[derive(Debug, Clone)]
struct PendingFragment {
    header: FragmentHeader,
    payload: Vec<u8>,
}

/// Reassembly counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// Packets handed to the dispatcher
    pub delivered: u64,
    /// Fragments thrown away because part of their packet was lost
    pub dropped_fragments: u64,
    /// Packets assembled but discarded (missing begin, stray begin, over MRRU)
    pub discarded_packets: u64,
    /// Fragments that repeated a sequence number
    pub duplicates: u64,
}

/// Reassembly state of one session
pub struct Reassembler {
    width: SeqWidth,
    mrru: u16,
    /// Sequence number the next packet starts at
    next_in_seq: u32,
    /// No member link can still deliver anything before this
    min_in_seq: u32,
    /// Received fragments, oldest first
    pending: VecDeque<PendingFragment>,
    pending_bytes: usize,
    max_fragments: usize,
    max_bytes: usize,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(width: SeqWidth, mrru: u16, config: &MultilinkConfig) -> Self {
        Self {
            width,
            mrru,
            next_in_seq: 0,
            min_in_seq: 0,
            pending: VecDeque::new(),
            pending_bytes: 0,
            max_fragments: config.max_pending_fragments.max(1),
            max_bytes: config.max_pending_bytes,
            stats: ReassemblyStats::default(),
        }
    }

    pub fn next_in_seq(&self) -> u32 {
        self.next_in_seq
    }

    pub fn min_in_seq(&self) -> u32 {
        self.min_in_seq
    }

    /// Update the floor below which nothing more can arrive.
    pub fn set_min_in_seq(&mut self, seq: u32) {
        self.min_in_seq = seq;
    }

    /// Number of fragments waiting
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Payload bytes held by waiting fragments
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Sequence numbers of the waiting fragments, oldest first
    pub fn pending_sequences(&self) -> Vec<u32> {
        self.pending.iter().map(|p| p.header.sequence).collect()
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }

    /// Queue `fragment` and deliver whatever it completes.
    ///
    /// Returns the number of packets handed to `sink`.
    pub fn push<D: Dispatch + ?Sized>(&mut self, fragment: Fragment, sink: &mut D) -> usize {
        if self.insert(fragment) {
            self.enforce_limits();
        }
        self.process(sink)
    }

    /// Insert a fragment in sequence order.
    ///
    /// A fragment older than `next_in_seq` belongs to a packet that was already
    /// delivered or given up on and is dropped. A fragment repeating a pending
    /// sequence number replaces the earlier copy. Returns whether the fragment
    /// was queued.
    pub fn insert(&mut self, fragment: Fragment) -> bool {
        let width = self.width;
        let seq = fragment.header.sequence;

        if width.is_before(seq, self.next_in_seq) {
            debug!(seq, next_in = self.next_in_seq, "MP: dropping stale fragment");
            self.stats.duplicates += 1;
            return false;
        }

        let entry = PendingFragment {
            header: fragment.header,
            payload: fragment.payload,
        };
        self.pending_bytes += entry.payload.len();

        let pos = self
            .pending
            .iter()
            .position(|p| !width.is_before(p.header.sequence, seq))
            .unwrap_or(self.pending.len());

        match self.pending.get_mut(pos) {
            Some(existing) if existing.header.sequence == seq => {
                debug!(seq, "MP: duplicate fragment replaces queued copy");
                self.stats.duplicates += 1;
                self.pending_bytes -= existing.payload.len();
                *existing = entry;
            }
            _ => self.pending.insert(pos, entry),
        }

        true
    }

    /// Walk the pending list from its head, delivering complete packets and
    /// skipping over fragments that can no longer be completed.
    pub fn process<D: Dispatch + ?Sized>(&mut self, sink: &mut D) -> usize {
        let width = self.width;
        let mut delivered = 0;
        let mut expected = self.next_in_seq;
        let mut idx = 0;

        while let Some(entry) = self.pending.get(idx) {
            let header = entry.header;

            if header.sequence != expected {
                if !width.is_before(expected, self.min_in_seq) {
                    // A slower link may still deliver the missing fragment.
                    break;
                }
                self.skip_lost(idx, expected);
                expected = self.next_in_seq;
                idx = 0;
            } else if header.end {
                if let Some(packet) = self.consume_run(idx) {
                    sink.dispatch(packet);
                    delivered += 1;
                }
                expected = width.increment(header.sequence);
                self.next_in_seq = expected;
                idx = 0;
            } else {
                expected = width.increment(expected);
                idx += 1;
            }
        }

        delivered
    }

    /// Drop everything (teardown).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
        self.next_in_seq = 0;
        self.min_in_seq = 0;
    }

    fn pop_front(&mut self) -> Option<PendingFragment> {
        let fragment = self.pending.pop_front()?;
        self.pending_bytes -= fragment.payload.len();
        Some(fragment)
    }

    /// Fragment `missing` is lost for good. Drop the partial packet queued ahead of
    /// it and everything up to the next fragment that starts a packet.
    fn skip_lost(&mut self, gap_at: usize, missing: u32) {
        debug!(missing, min_in = self.min_in_seq, "MP: fragment lost on every link");

        let mut last = None;
        for _ in 0..gap_at {
            if let Some(fragment) = self.pop_front() {
                last = Some(fragment.header.sequence);
                self.stats.dropped_fragments += 1;
            }
        }
        self.drop_until_begin(&mut last);

        self.next_in_seq = match (self.pending.front(), last) {
            (Some(front), _) => front.header.sequence,
            (None, Some(last)) => self.width.increment(last),
            (None, None) => missing,
        };
    }

    fn drop_until_begin(&mut self, last: &mut Option<u32>) {
        while let Some(front) = self.pending.front() {
            if front.header.begin {
                break;
            }
            if let Some(fragment) = self.pop_front() {
                debug!(seq = fragment.header.sequence, "MP: drop frag");
                *last = Some(fragment.header.sequence);
                self.stats.dropped_fragments += 1;
            }
        }
    }

    /// Keep the pending list inside its configured bounds by giving up on the
    /// oldest fragments and resynchronising on the next packet start.
    fn enforce_limits(&mut self) {
        if self.pending.len() <= self.max_fragments && self.pending_bytes <= self.max_bytes {
            return;
        }

        warn!(
            fragments = self.pending.len(),
            bytes = self.pending_bytes,
            "MP: pending fragment limit exceeded, discarding oldest"
        );

        let mut last = None;
        while self.pending.len() > self.max_fragments || self.pending_bytes > self.max_bytes {
            match self.pop_front() {
                Some(fragment) => {
                    last = Some(fragment.header.sequence);
                    self.stats.dropped_fragments += 1;
                }
                None => break,
            }
        }
        self.drop_until_begin(&mut last);

        if let Some(front) = self.pending.front() {
            self.next_in_seq = front.header.sequence;
        } else if let Some(last) = last {
            self.next_in_seq = self.width.increment(last);
        }
    }

    /// Remove the run `0..=last` from the list and concatenate it.
    ///
    /// Returns `None` when the run does not form a valid packet.
    fn consume_run(&mut self, last: usize) -> Option<Vec<u8>> {
        let run: Vec<PendingFragment> = self.pending.drain(..=last).collect();
        self.pending_bytes -= run.iter().map(|f| f.payload.len()).sum::<usize>();

        let first = run.first()?.header;
        let end_seq = run.last()?.header.sequence;

        if !first.begin {
            warn!(seq = first.sequence, "MP: fragment should have a begin flag");
            self.stats.discarded_packets += 1;
            return None;
        }

        let mut start = first.sequence;
        let mut packet = Vec::with_capacity(run.iter().map(|f| f.payload.len()).sum());
        for (i, fragment) in run.into_iter().enumerate() {
            if i > 0 && fragment.header.begin {
                warn!(
                    seq = fragment.header.sequence,
                    "MP: begin flag inside a packet, abandoning {} assembled bytes",
                    packet.len()
                );
                self.stats.discarded_packets += 1;
                packet.clear();
                start = fragment.header.sequence;
            }
            packet.extend_from_slice(&fragment.payload);
        }

        if packet.len() > usize::from(self.mrru) {
            warn!(
                len = packet.len(),
                mrru = self.mrru,
                "MP: reassembled packet exceeds MRRU"
            );
            self.stats.discarded_packets += 1;
            return None;
        }

        debug!(
            first = start,
            last = end_seq,
            len = packet.len(),
            "MP: reassembled frags"
        );
        self.stats.delivered += 1;
        Some(packet)
    }
}
