//! 16-bit modular sequence space.
//!
//! Every DATA, ACK and EOF packet carries a `u16` sequence number, so the
//! sequence space has `M = 65536` values and wraps.  Go-Back-N needs
//! `M ≥ 2 × N` to tell a new packet from an old one after wrap-around; the
//! window is therefore capped at [`MAX_WINDOW`] = `M / 2`.
//!
//! Raw `<` on wrapped numbers is wrong (`65535 < 0` is false, but 65535 was
//! sent first), so all ordering goes through [`distance`]:
//!
//! ```text
//!   distance(a, b)         = (b - a) mod M
//!   in_range(s, start, n)  ⇔ distance(start, s) < n
//! ```

/// A sequence number.
pub type Seq = u16;

/// Largest window that keeps `M ≥ 2 × N`.
pub const MAX_WINDOW: u16 = 1 << 15;

/// Forward distance from `from` to `to`, modulo M.
#[inline]
pub fn distance(from: Seq, to: Seq) -> u16 {
    to.wrapping_sub(from)
}

/// `true` when `seq` lies in the half-open range `[start, start + len)`.
#[inline]
pub fn in_range(seq: Seq, start: Seq, len: u16) -> bool {
    distance(start, seq) < len
}

/// The sequence number after `seq`.
#[inline]
pub fn next(seq: Seq) -> Seq {
    seq.wrapping_add(1)
}

/// The sequence number before `seq`.
#[inline]
pub fn prev(seq: Seq) -> Seq {
    seq.wrapping_sub(1)
}
