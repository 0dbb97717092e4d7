//! Fragment sequence space arithmetic.
//!
//! Multilink fragments carry either a 12-bit (short) or 24-bit (long) sequence
//! number. Both spaces wrap, so ordering is only meaningful inside a window: the
//! comparator below treats the top `0x200` values of the space as "about to wrap"
//! and the bottom `0x200` values as "just wrapped".
//!
//! Every ordering decision in the engine goes through [`SeqWidth::is_before`].

use serde::{Deserialize, Serialize};

/// Width of the wrap window at each end of the sequence space.
pub const WRAP_WINDOW: u32 = 0x200;

/// Sequence mask in short (12-bit) mode
pub const SHORT_SEQ_MASK: u32 = 0x0000_0FFF;

/// Sequence mask in long (24-bit) mode
pub const LONG_SEQ_MASK: u32 = 0x00FF_FFFF;

/// Negotiated sequence number format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeqWidth {
    /// 12-bit sequence numbers, 2-byte header
    Short,
    /// 24-bit sequence numbers, 4-byte header
    Long,
}

impl SeqWidth {
    /// Map the negotiated "short sequence" option to a width.
    pub fn from_short_seq(short_seq: bool) -> Self {
        if short_seq {
            SeqWidth::Short
        } else {
            SeqWidth::Long
        }
    }

    /// Largest representable sequence number
    pub const fn mask(self) -> u32 {
        match self {
            SeqWidth::Short => SHORT_SEQ_MASK,
            SeqWidth::Long => LONG_SEQ_MASK,
        }
    }

    /// Number of distinct sequence numbers (2^12 or 2^24)
    pub const fn modulus(self) -> u32 {
        self.mask() + 1
    }

    /// Size of the fragment header on the wire
    pub const fn header_len(self) -> usize {
        match self {
            SeqWidth::Short => 2,
            SeqWidth::Long => 4,
        }
    }

    /// Next sequence number, wrapping at the modulus.
    pub fn increment(self, seq: u32) -> u32 {
        (seq.wrapping_add(1)) & self.mask()
    }

    /// Wrap-aware "comes before" comparison.
    ///
    /// If `a` sits in the top wrap window, `b` is after it when `b` is in the bottom
    /// wrap window or numerically greater. Otherwise plain `a < b` applies, except
    /// that a small `a` never precedes a `b` from the top wrap window (that `b` was
    /// sent before the space wrapped).
    pub fn is_before(self, a: u32, b: u32) -> bool {
        let max = self.mask() - WRAP_WINDOW;

        if a > max {
            b < WRAP_WINDOW || b > a
        } else {
            (a > WRAP_WINDOW || b <= max) && a < b
        }
    }

    /// The earlier of two sequence numbers under [`SeqWidth::is_before`].
    pub fn earliest(self, a: u32, b: u32) -> u32 {
        if self.is_before(b, a) {
            b
        } else {
            a
        }
    }
}

impl std::fmt::Display for SeqWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeqWidth::Short => write!(f, "short (12-bit)"),
            SeqWidth::Long => write!(f, "long (24-bit)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modulus() {
        assert_eq!(SeqWidth::Short.modulus(), 1 << 12);
        assert_eq!(SeqWidth::Long.modulus(), 1 << 24);
        assert_eq!(SeqWidth::Short.header_len(), 2);
        assert_eq!(SeqWidth::Long.header_len(), 4);
    }

    #[test]
    fn test_increment_wraps() {
        assert_eq!(SeqWidth::Short.increment(0), 1);
        assert_eq!(SeqWidth::Short.increment(0xFFF), 0);
        assert_eq!(SeqWidth::Long.increment(0xFF_FFFF), 0);
        assert_eq!(SeqWidth::Long.increment(0xFFF), 0x1000);
    }

    #[test]
    fn test_is_before_successor_everywhere() {
        // Exhaustive over the short space, sampled over the long one.
        for a in 0..=SHORT_SEQ_MASK {
            let b = SeqWidth::Short.increment(a);
            assert!(SeqWidth::Short.is_before(a, b), "short {a:#x} -> {b:#x}");
        }

        let long_samples = [
            0,
            1,
            WRAP_WINDOW - 1,
            WRAP_WINDOW,
            WRAP_WINDOW + 1,
            0x7F_FFFF,
            LONG_SEQ_MASK - WRAP_WINDOW - 1,
            LONG_SEQ_MASK - WRAP_WINDOW,
            LONG_SEQ_MASK - WRAP_WINDOW + 1,
            LONG_SEQ_MASK - 1,
            LONG_SEQ_MASK,
        ];
        for a in long_samples {
            let b = SeqWidth::Long.increment(a);
            assert!(SeqWidth::Long.is_before(a, b), "long {a:#x} -> {b:#x}");
        }
    }

    #[test]
    fn test_is_before_is_irreflexive() {
        for a in [0, 5, 0x200, 0xDFF, 0xE00, 0xFFF] {
            assert!(!SeqWidth::Short.is_before(a, a));
        }
    }

    #[test]
    fn test_is_before_across_wrap() {
        let w = SeqWidth::Short;
        assert!(w.is_before(0xFF0, 0x005));
        assert!(!w.is_before(0x005, 0xFF0));
        assert!(w.is_before(0xFF0, 0xFF8));
        assert!(!w.is_before(0xFF8, 0xFF0));
    }

    #[test]
    fn test_is_before_ordinary_range() {
        let w = SeqWidth::Long;
        assert!(w.is_before(100, 200));
        assert!(!w.is_before(200, 100));
        assert!(w.is_before(0x1000, 0xFF_0000));
    }

    #[test]
    fn test_earliest() {
        let w = SeqWidth::Short;
        assert_eq!(w.earliest(3, 7), 3);
        assert_eq!(w.earliest(7, 3), 3);
        assert_eq!(w.earliest(0xFFE, 0x001), 0xFFE);
    }
}
