//! Upper layer: the tree array. Each [`Tree`] entry summarizes one
//! [`TREE_SIZE`]-frame region with a free-frame count and a single
//! `reserved` bit — the only mutual-exclusion primitive in the whole
//! allocator. A CPU "owns" a tree by CASing that bit on, drains it through
//! the lower layer without touching any other tree, and unreserves it
//! (or has it stolen back) when it runs dry.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;
use core::ops::Index;

use log::warn;

use crate::atom::Atom;
use crate::consts::{almost_allocated, almost_free, TREE_SIZE};
use crate::entry::Tree;
use crate::error::{Error, Result};
use crate::util::{align_down, CacheLine};

/// Owns the whole tree array for an instance. `LN` is the number of base
/// frames per tree ([`TREE_SIZE`] in the non-generic allocator built on
/// top of this); kept as a parameter here so tests can shrink it.
pub struct Trees {
    span: usize,
    entries: Box<[Atom<Tree>]>,
}

impl Index<usize> for Trees {
    type Output = Atom<Tree>;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl fmt::Debug for Trees {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut empty = 0;
        let mut partial = 0;
        for e in &*self.entries {
            let free = e.load().free();
            if free == self.span {
                empty += 1;
            } else if free > almost_allocated() {
                partial += 1;
            }
        }
        write!(
            f,
            "(total: {}, empty: {empty}, partial: {partial})",
            self.entries.len()
        )
    }
}

impl Trees {
    /// Builds `frames.div_ceil(TREE_SIZE)` tree entries, each seeded from
    /// the lower layer's free-frame count for its span via `free_of`. The
    /// last tree may be short if `frames` is not a multiple of `TREE_SIZE`.
    pub fn new(frames: usize, free_of: impl Fn(usize, usize) -> usize) -> Self {
        let len = frames.div_ceil(TREE_SIZE);
        let mut entries = Vec::with_capacity(len);
        for i in 0..len {
            let span = TREE_SIZE.min(frames - i * TREE_SIZE);
            entries.push(Atom::new(Tree::empty(free_of(i, span))));
        }
        Self {
            span: TREE_SIZE,
            entries: entries.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Frame span covered by one (non-final) tree.
    pub fn span(&self) -> usize {
        self.span
    }

    pub fn free_frames(&self) -> usize {
        self.entries.iter().map(|e| e.load().free()).sum()
    }

    /// `Memory` means either the tree is reserved or does not hold `frames`
    /// free frames right now — not a retry-budget exhaustion, since this
    /// loop has no bound.
    pub fn dec(&self, i: usize, frames: usize) -> Result<Tree> {
        self.entries[i]
            .fetch_update(|e| e.dec(frames))
            .map_err(|_| Error::Memory)
    }

    /// `Address` means `frames` more than the tree's capacity allows, i.e.
    /// the caller is returning more than it ever took: an over-free.
    pub fn inc(&self, i: usize, frames: usize, max: usize) -> Result<Tree> {
        self.entries[i]
            .fetch_update(|e| e.inc(frames, max))
            .map_err(|_| Error::Address)
    }

    /// Scans for an unreserved tree with at least `n` free frames, starting
    /// at `start`, and decrements it by `n`. Used by huge/`MAX_ORDER`
    /// requests, which bypass per-CPU reservation entirely and talk to the
    /// tree counter directly instead of through the `reserved` flag.
    pub fn dec_near(&self, start: usize, n: usize) -> Result<usize> {
        let len = self.entries.len();
        for j in 0..len {
            let i = (j + start) % len;
            if self.entries[i].fetch_update(|e| e.dec(n)).is_ok() {
                return Ok(i);
            }
        }
        Err(Error::Memory)
    }

    /// Adds `free` back to tree `i` and clears its reserved bit, the
    /// counterpart to whatever reservation handed that tree out.
    ///
    /// `Address` means the tree was not reserved, or `free` overflows its
    /// capacity: the caller is draining a reservation it does not hold.
    pub fn unreserve(&self, i: usize, free: usize, max: usize) -> Result<()> {
        self.entries[i]
            .fetch_update(|e| e.unreserve_add(free, max))
            .map(|_| ())
            .map_err(|_| Error::Address)
    }

    /// Finds and reserves a tree with free-frame count in `almost_free()..`,
    /// i.e. essentially fully free — the preference for huge/`MAX_ORDER`
    /// reservations and for the initial reservation of every CPU.
    pub fn reserve_empty(&self, start: usize) -> Result<(usize, Tree)> {
        for j in 0..self.entries.len() {
            let i = (j + start) % self.entries.len();
            if let Ok(prev) = self.entries[i].fetch_update(|e| e.reserve(almost_free()..)) {
                return Ok((i, prev));
            }
        }
        warn!("no empty tree {self:?}");
        Err(Error::Memory)
    }

    /// Finds and reserves a partially filled tree near `start`, searching a
    /// cache-line-aligned vicinity window first and falling back to a full
    /// alternating sweep of the array. `min_free` is the caller's actual
    /// requirement (`1 << order`): once both threshold-biased passes have
    /// failed, a final sweep accepts any unreserved tree holding at least
    /// `min_free` frames, so a tree drained down to its last few frames by
    /// concurrent `put`s is still reservable instead of spuriously
    /// reporting `Memory`.
    pub fn reserve_partial(&self, cores: usize, start: usize, min_free: usize) -> Result<(usize, Tree)> {
        const ENTRIES_PER_CACHELINE: usize = size_of::<CacheLine>() / size_of::<Tree>();
        let len = self.entries.len();
        let vicinity = ((len / cores.max(1)) / 4).max(1) as isize;
        let start = align_down(start + len, ENTRIES_PER_CACHELINE) as isize;

        for i in 1..vicinity {
            let off = if i % 2 == 0 { i / 2 } else { -i.div_ceil(2) };
            let idx = (start + off).rem_euclid(len as isize) as usize;
            if let Ok(prev) = self.entries[idx].fetch_update(|e| e.reserve(almost_allocated()..)) {
                return Ok((idx, prev));
            }
        }
        for i in vicinity..=len as isize {
            let off = if i % 2 == 0 { i / 2 } else { -i.div_ceil(2) };
            let idx = (start + off).rem_euclid(len as isize) as usize;
            if let Ok(prev) =
                self.entries[idx].fetch_update(|e| e.reserve(almost_allocated()..almost_free()))
            {
                return Ok((idx, prev));
            }
        }
        for i in 0..len as isize {
            let off = if i % 2 == 0 { i / 2 } else { -i.div_ceil(2) };
            let idx = (start + off).rem_euclid(len as isize) as usize;
            if let Ok(prev) = self.entries[idx].fetch_update(|e| e.reserve(min_free..)) {
                return Ok((idx, prev));
            }
        }
        Err(Error::Memory)
    }

    /// Reserves a new tree, either preferring an empty one (huge/`MAX_ORDER`
    /// requests, or a CPU's very first reservation) or a partially filled
    /// one (ordinary small-order exhaustion, so empty trees stay available
    /// for huge allocations elsewhere). `min_free` is forwarded to
    /// [`Trees::reserve_partial`]'s last-resort sweep.
    pub fn reserve(
        &self,
        cores: usize,
        start: usize,
        prioritize_empty: bool,
        min_free: usize,
    ) -> Result<(usize, Tree)> {
        if prioritize_empty {
            match self.reserve_empty(start) {
                Err(Error::Memory) => self.reserve_partial(cores, start, min_free),
                r => r,
            }
        } else {
            match self.reserve_partial(cores, start, min_free) {
                Err(Error::Memory) => self.reserve_empty(start),
                r => r,
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn reserve_empty_then_exhausted() {
        let trees = Trees::new(4 * TREE_SIZE, |_, span| span);
        let (i, prev) = trees.reserve_empty(0).unwrap();
        assert_eq!(prev.free(), TREE_SIZE);
        assert!(trees[i].load().reserved());
        trees.unreserve(i, TREE_SIZE, TREE_SIZE).unwrap();
        assert!(!trees[i].load().reserved());
    }

    #[test]
    fn reserve_partial_skips_reserved() {
        let trees = Trees::new(2 * TREE_SIZE, |_, span| span);
        let (first, _) = trees.reserve(1, 0, true, 1).unwrap();
        let (second, _) = trees.reserve(1, 0, true, 1).unwrap();
        assert_ne!(first, second);
        assert!(trees.reserve(1, 0, true, 1).is_err());
    }

    #[test]
    fn reserve_partial_falls_back_to_last_frame() {
        // Below every threshold bias (`almost_allocated`/`almost_free`), a
        // tree with a single free frame is still reservable: the final
        // sweep in `reserve_partial` accepts anything >= `min_free`.
        let trees = Trees::new(TREE_SIZE, |_, span| span);
        trees.dec(0, TREE_SIZE - 1).unwrap();
        assert_eq!(trees[0].load().free(), 1);
        let (i, prev) = trees.reserve_partial(1, 0, 1).unwrap();
        assert_eq!(i, 0);
        assert_eq!(prev.free(), 1);
        assert!(trees[0].load().reserved());
    }

    #[test]
    fn dec_inc_roundtrip() {
        let trees = Trees::new(TREE_SIZE, |_, span| span);
        trees.dec(0, 10).unwrap();
        assert_eq!(trees[0].load().free(), TREE_SIZE - 10);
        trees.inc(0, 10, TREE_SIZE).unwrap();
        assert_eq!(trees[0].load().free(), TREE_SIZE);
        assert!(trees.dec(0, TREE_SIZE + 1).is_err());
    }

    #[test]
    fn dec_under_capacity_is_memory_not_retry() {
        let trees = Trees::new(TREE_SIZE, |_, span| span);
        assert_eq!(trees.dec(0, TREE_SIZE + 1).unwrap_err(), Error::Memory);
    }

    #[test]
    fn inc_over_capacity_is_address() {
        let trees = Trees::new(TREE_SIZE, |_, span| span);
        assert_eq!(trees.inc(0, 1, TREE_SIZE).unwrap_err(), Error::Address);
    }

    #[test]
    fn unreserve_unheld_tree_is_address() {
        let trees = Trees::new(TREE_SIZE, |_, span| span);
        assert_eq!(trees.unreserve(0, 0, TREE_SIZE).unwrap_err(), Error::Address);
    }

    #[test]
    fn free_frames_sums_all_trees() {
        let trees = Trees::new(3 * TREE_SIZE, |_, span| span);
        assert_eq!(trees.free_frames(), 3 * TREE_SIZE);
        trees.dec(1, 5).unwrap();
        assert_eq!(trees.free_frames(), 3 * TREE_SIZE - 5);
    }
}
