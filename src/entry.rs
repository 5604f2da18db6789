//! Packed atomic entries. Every type here occupies exactly one machine
//! word so a state transition — decrementing a free-count together with
//! flipping a flag — is a single compare-and-swap, never two separate
//! atomics that could be observed half-updated.

use core::mem::{align_of, size_of};
use core::ops::RangeBounds;

use bitfield_struct::bitfield;

use crate::consts::{CHILD_SIZE, TREE_SIZE};

/// A child's occupancy summary: either "normal", with a free-frame count
/// and an associated bitmap, or "huge", meaning the entire child was
/// carved out by one `HUGE_ORDER` allocation and its bitmap is ignored.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct Child {
    /// Free base frames, or `u16::MAX` (all bits set) when huge-allocated.
    count: u16,
}

impl Child {
    pub fn new_free(free: usize) -> Self {
        debug_assert!(free <= CHILD_SIZE);
        Self::new().with_count(free as u16)
    }

    pub fn new_huge() -> Self {
        Self::new().with_count(u16::MAX)
    }

    pub fn huge(self) -> bool {
        self.count() == u16::MAX
    }

    pub fn free(self) -> usize {
        if self.huge() {
            0
        } else {
            self.count() as usize
        }
    }

    /// `free == CHILD_SIZE` and not huge, i.e. nothing in this child is allocated.
    pub fn is_empty(self) -> bool {
        !self.huge() && self.count() as usize == CHILD_SIZE
    }

    /// Marks the whole child allocated as one huge frame, iff it was fully free.
    pub fn mark_huge(self) -> Option<Self> {
        self.is_empty().then(Self::new_huge)
    }

    /// Reverses [`Child::mark_huge`], iff currently huge.
    pub fn unmark_huge(self) -> Option<Self> {
        self.huge().then(|| Self::new_free(CHILD_SIZE))
    }

    pub fn dec(self, frames: usize) -> Option<Self> {
        (!self.huge() && self.count() as usize >= frames)
            .then(|| Self::new_free(self.count() as usize - frames))
    }

    pub fn inc(self, frames: usize) -> Option<Self> {
        let next = self.count() as usize + frames;
        (!self.huge() && next <= CHILD_SIZE).then(|| Self::new_free(next))
    }
}

/// Two adjacent [`Child`] entries, updated with a single CAS. This is how
/// an order-`MAX_ORDER` request (spanning two children) commits or fails
/// atomically instead of leaving one huge allocation half-done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(align(4))]
pub struct ChildPair(pub Child, pub Child);

const _: () = assert!(size_of::<ChildPair>() == 2 * size_of::<Child>());
const _: () = assert!(align_of::<ChildPair>() == size_of::<ChildPair>());

impl ChildPair {
    pub fn map<F: Fn(Child) -> Option<Child>>(self, f: F) -> Option<ChildPair> {
        Some(ChildPair(f(self.0)?, f(self.1)?))
    }

    pub fn both<F: Fn(Child) -> bool>(self, f: F) -> bool {
        f(self.0) && f(self.1)
    }
}

impl From<u32> for ChildPair {
    fn from(v: u32) -> Self {
        Self(Child::from_bits(v as u16), Child::from_bits((v >> 16) as u16))
    }
}

impl From<ChildPair> for u32 {
    fn from(v: ChildPair) -> Self {
        v.0.into_bits() as u32 | ((v.1.into_bits() as u32) << 16)
    }
}

/// A tree's summary: free-frame counter plus the single `reserved` bit
/// that is this system's only mutual-exclusion primitive.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct Tree {
    #[bits(15)]
    pub free: usize,
    pub reserved: bool,
}

impl Tree {
    pub fn empty(span: usize) -> Self {
        debug_assert!(span <= TREE_SIZE);
        Self::new().with_free(span)
    }

    pub fn with_reserved(free: usize, reserved: bool) -> Self {
        Self::new().with_free(free).with_reserved(reserved)
    }

    pub fn inc(self, frames: usize, max: usize) -> Option<Self> {
        let next = self.free() + frames;
        (next <= max).then(|| self.with_free(next))
    }

    pub fn dec(self, frames: usize) -> Option<Self> {
        (!self.reserved() && self.free() >= frames).then(|| self.with_free(self.free() - frames))
    }

    /// Reserves this tree if unreserved and its free count lies in `range`.
    pub fn reserve<R: RangeBounds<usize>>(self, range: R) -> Option<Self> {
        (!self.reserved() && range.contains(&self.free()))
            .then(|| Self::new().with_free(0).with_reserved(true))
    }

    /// Returns `add` frames to a reserved tree and clears the flag.
    pub fn unreserve_add(self, add: usize, max: usize) -> Option<Self> {
        let frames = self.free() + add;
        (self.reserved() && frames <= max).then(|| Self::new().with_free(frames).with_reserved(false))
    }
}

/// Per-CPU reservation: which tree (if any) this CPU currently owns, how
/// many frames remain uncommitted in it, and a hint for the next
/// allocation's starting point. Packed into one word so "steal a fresh
/// tree" and "drop the old one" can each commit with a single CAS.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Reservation {
    /// Free frames remaining in the reserved tree (drained from the tree entry).
    #[bits(16)]
    pub free: usize,
    /// Whether a tree is currently held at all.
    pub held: bool,
    /// Reserved tree's start frame, divided by 64 (tree starts are always
    /// word-aligned, so this loses no information).
    #[bits(47)]
    start_raw: usize,
}

impl Reservation {
    const START_RAW_MAX: usize = (1 << Self::START_RAW_BITS) - 1;

    pub fn empty() -> Self {
        Self::new().with_start_raw(Self::START_RAW_MAX)
    }

    pub fn new_with(free: usize, start: usize) -> Self {
        Self::new()
            .with_free(free)
            .with_held(true)
            .with_start_raw(start / 64)
    }

    pub fn start(self) -> usize {
        self.start_raw() * 64
    }

    pub fn dec(self, frames: usize) -> Option<Self> {
        (self.held() && self.free() >= frames).then(|| self.with_free(self.free() - frames))
    }

    pub fn inc(self, frames: usize, max: usize) -> Option<Self> {
        let next = self.free() + frames;
        (self.held() && next <= max).then(|| self.with_free(next))
    }

    pub fn set_start(self, start: usize) -> Self {
        self.with_start_raw(start / 64)
    }
}

impl Default for Reservation {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn child_huge_roundtrip() {
        let c = Child::new_free(CHILD_SIZE);
        assert!(c.is_empty());
        let h = c.mark_huge().unwrap();
        assert!(h.huge());
        assert_eq!(h.free(), 0);
        assert!(h.mark_huge().is_none());
        let back = h.unmark_huge().unwrap();
        assert_eq!(back.free(), CHILD_SIZE);
    }

    #[test]
    fn child_pair_roundtrip() {
        let pair = ChildPair(Child::new_free(CHILD_SIZE), Child::new_free(CHILD_SIZE));
        let raw: u32 = pair.into();
        let back: ChildPair = raw.into();
        assert_eq!(pair, back);

        let allocated = pair.map(|c| c.mark_huge()).unwrap();
        assert!(allocated.both(|c| c.huge()));
    }

    #[test]
    fn tree_reserve_unreserve() {
        let t = Tree::empty(100);
        let reserved = t.reserve(50..=200).unwrap();
        assert!(reserved.reserved());
        assert_eq!(reserved.free(), 0);
        assert!(reserved.reserve(0..1000).is_none());
        let back = reserved.unreserve_add(30, 100).unwrap();
        assert!(!back.reserved());
        assert_eq!(back.free(), 30);
    }

    #[test]
    fn reservation_lifecycle() {
        let r = Reservation::empty();
        assert!(!r.held());
        let held = Reservation::new_with(64, 128 * 64);
        assert!(held.held());
        assert_eq!(held.start(), 128 * 64);
        let dec = held.dec(10).unwrap();
        assert_eq!(dec.free(), 54);
        assert!(dec.dec(100).is_none());
    }
}
