//! Lower layer: per-child bitmaps plus a packed free-count/huge entry for
//! each child. This is where individual frames are actually carved out of
//! or returned to a child; everything above this layer only ever talks in
//! terms of whole children and trees.

use alloc::boxed::Box;
use core::ops::Range;

use crate::atom::Atom;
use crate::bitfield::Bitfield;
use crate::consts::{CHILD_SIZE, HUGE_ORDER, MAX_ORDER, WORDS_PER_CHILD};
use crate::entry::{Child, ChildPair};
use crate::error::{Error, Result};
use crate::util::Align;

/// The bitmap backing one child: `CHILD_SIZE` bits, `WORDS_PER_CHILD` words.
pub type ChildBitmap = Bitfield<WORDS_PER_CHILD>;

/// Owns the child array and the per-child bitmaps for the whole instance.
/// `begin` is the first frame this layer is responsible for; `len` is the
/// frame count, always a multiple of `2 * CHILD_SIZE`.
pub struct Lower {
    begin: usize,
    len: usize,
    /// Children stored two-at-a-time so an order-`MAX_ORDER` request can
    /// CAS both constituent huge allocations in one atomic pair update.
    pairs: Box<[Atom<ChildPair>]>,
    bitmaps: Box<[Align<ChildBitmap>]>,
}

impl Lower {
    pub fn new(begin: usize, len: usize, free: bool) -> Self {
        debug_assert!(len % (2 * CHILD_SIZE) == 0);
        let num_children = len / CHILD_SIZE;
        let child = if free {
            Child::new_free(CHILD_SIZE)
        } else {
            Child::new_free(0)
        };
        let pairs = (0..num_children / 2)
            .map(|_| Atom::new(ChildPair(child, child)))
            .collect();
        let bitmaps = (0..num_children)
            .map(|_| {
                let bf = Align(ChildBitmap::default());
                if !free {
                    bf.set_range(0..ChildBitmap::LEN, true);
                }
                bf
            })
            .collect();
        Self {
            begin,
            len,
            pairs,
            bitmaps,
        }
    }

    pub fn frames(&self) -> usize {
        self.len
    }

    pub fn num_children(&self) -> usize {
        self.bitmaps.len()
    }

    fn child_of(&self, frame: usize) -> usize {
        (frame - self.begin) / CHILD_SIZE
    }

    fn load_child(&self, c: usize) -> Child {
        let pair = self.pairs[c / 2].load();
        if c % 2 == 0 {
            pair.0
        } else {
            pair.1
        }
    }

    /// Applies `f` to child `c`, retrying the enclosing pair's CAS until it
    /// commits or `f` rejects the candidate. Returns the pre-update value
    /// of the child on success, `None` if `f` ever rejected it.
    fn update_child<F: FnMut(Child) -> Option<Child>>(&self, c: usize, mut f: F) -> Option<Child> {
        let even = c % 2 == 0;
        let mut target = None;
        let outcome = self.pairs[c / 2].fetch_update(|pair| {
            let cur = if even { pair.0 } else { pair.1 };
            let next = f(cur)?;
            target = Some(cur);
            Some(if even {
                ChildPair(next, pair.1)
            } else {
                ChildPair(pair.0, next)
            })
        });
        outcome.ok().and(target)
    }

    /// Allocates `1 << order` frames (`order < HUGE_ORDER`) from one child,
    /// scanning children starting at `hint`'s child within `range`.
    pub fn get(&self, hint: usize, order: usize, range: Range<usize>) -> Result<usize> {
        debug_assert!(order < HUGE_ORDER);
        let start_child = self.child_of(hint.max(self.begin + range.start * CHILD_SIZE));
        let lo = range.start;
        let hi = range.end;
        debug_assert!(lo < hi && hi <= self.num_children());
        let span = hi - lo;

        for j in 0..span {
            let c = lo + (start_child - lo + j) % span;
            let before = self.load_child(c);
            if before.huge() || before.free() < (1 << order) {
                continue;
            }
            let base = c * CHILD_SIZE;
            match self.bitmaps[c].alloc_run(hint.saturating_sub(self.begin + base), order) {
                Ok(off) => {
                    if self.update_child(c, |e| e.dec(1 << order)).is_some() {
                        return Ok(self.begin + base + off);
                    }
                    // Counter desynced from bitmap: undo and keep scanning.
                    let _ = self.bitmaps[c].free_at(off, order);
                }
                Err(Error::Memory) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Memory)
    }

    /// Allocates one whole free child as a huge frame.
    pub fn get_huge(&self, hint: usize, range: Range<usize>) -> Result<usize> {
        let start = self.child_of(hint.max(self.begin + range.start * CHILD_SIZE));
        let lo = range.start;
        let hi = range.end;
        let span = hi - lo;
        for j in 0..span {
            let c = lo + (start - lo + j) % span;
            if self.update_child(c, |e| e.mark_huge()).is_some() {
                return Ok(self.begin + c * CHILD_SIZE);
            }
        }
        Err(Error::Memory)
    }

    /// Allocates two adjacent huge children (`order == MAX_ORDER`) with a
    /// single CAS on the packed pair, so the request either fully commits
    /// or leaves no trace.
    pub fn get_max(&self, hint: usize, range: Range<usize>) -> Result<usize> {
        debug_assert!(range.start % 2 == 0 && range.end % 2 == 0);
        let start_pair = self.child_of(hint.max(self.begin + range.start * CHILD_SIZE)) / 2;
        let lo = range.start / 2;
        let hi = range.end / 2;
        let span = hi - lo;
        for j in 0..span {
            let p = lo + (start_pair - lo + j) % span;
            if self.pairs[p]
                .fetch_update(|pair| pair.map(|c| c.mark_huge()))
                .is_ok()
            {
                return Ok(self.begin + p * 2 * CHILD_SIZE);
            }
        }
        Err(Error::Memory)
    }

    /// Frees `1 << order` frames (`order < HUGE_ORDER`) previously returned
    /// by [`Lower::get`].
    pub fn put(&self, frame: usize, order: usize) -> Result<()> {
        debug_assert!(order < HUGE_ORDER);
        let c = self.child_of(frame);
        if self.load_child(c).huge() {
            return Err(Error::Address);
        }
        let off = frame - self.begin - c * CHILD_SIZE;
        self.bitmaps[c].free_at(off, order)?;
        self.update_child(c, |e| e.inc(1 << order))
            .map(|_| ())
            .ok_or(Error::Address)
    }

    pub fn put_huge(&self, frame: usize) -> Result<()> {
        let c = self.child_of(frame);
        debug_assert!(frame == self.begin + c * CHILD_SIZE);
        self.update_child(c, |e| e.unmark_huge())
            .map(|_| ())
            .ok_or(Error::Address)
    }

    pub fn put_max(&self, frame: usize) -> Result<()> {
        let c = self.child_of(frame);
        debug_assert!(c % 2 == 0 && frame == self.begin + c * CHILD_SIZE);
        self.pairs[c / 2]
            .fetch_update(|pair| pair.map(|e| e.unmark_huge()))
            .map(|_| ())
            .map_err(|_| Error::Address)
    }

    pub fn is_free(&self, frame: usize, order: usize) -> bool {
        let c = self.child_of(frame);
        if order < HUGE_ORDER {
            let entry = self.load_child(c);
            if entry.huge() {
                return false;
            }
            let off = frame - self.begin - c * CHILD_SIZE;
            self.bitmaps[c].is_run_free(off, order)
        } else if order == HUGE_ORDER {
            self.load_child(c).is_empty()
        } else {
            debug_assert!(order == MAX_ORDER);
            self.load_child(c).is_empty() && self.load_child(c + 1).is_empty()
        }
    }

    /// Allocates `1 << order` frames for any `order <= MAX_ORDER`,
    /// dispatching to the single-child, whole-child, or child-pair path.
    pub fn alloc(&self, hint: usize, order: usize, range: Range<usize>) -> Result<usize> {
        if order < HUGE_ORDER {
            self.get(hint, order, range)
        } else if order == HUGE_ORDER {
            self.get_huge(hint, range)
        } else {
            debug_assert!(order == MAX_ORDER);
            self.get_max(hint, range)
        }
    }

    /// Counterpart to [`Lower::alloc`].
    pub fn free(&self, frame: usize, order: usize) -> Result<()> {
        if order < HUGE_ORDER {
            self.put(frame, order)
        } else if order == HUGE_ORDER {
            self.put_huge(frame)
        } else {
            debug_assert!(order == MAX_ORDER);
            self.put_max(frame)
        }
    }

    /// Free-frame count of the child containing `frame`.
    pub fn child_free(&self, frame: usize) -> usize {
        self.load_child(self.child_of(frame)).free()
    }

    /// Sum of free frames across a whole range of children, used to seed
    /// tree entries at init and to recompute counters for debug dumps.
    pub fn free_in_range(&self, range: Range<usize>) -> usize {
        range.map(|c| self.load_child(c).free()).sum()
    }

    pub fn allocated_frames(&self) -> usize {
        self.len - (0..self.num_children()).map(|c| self.load_child(c).free()).sum::<usize>()
    }

    /// Number of children that are entirely free, i.e. available as a
    /// single `HUGE_ORDER` allocation.
    pub fn free_huge_count(&self) -> usize {
        (0..self.num_children())
            .filter(|&c| self.load_child(c).is_empty())
            .count()
    }

    /// Marks the absolute frame range `[from, to)` allocated without going
    /// through `alloc_run`. Used only during initialization, before the
    /// allocator is shared, to carve out the alignment slack below
    /// `start_frame` and the padding above it once `frames` is rounded up
    /// to a tree-size multiple.
    pub(crate) fn reserve_range(&self, from: usize, to: usize) {
        if from >= to {
            return;
        }
        debug_assert!(from >= self.begin && to <= self.begin + self.len);
        let from_c = self.child_of(from);
        let to_c = self.child_of(to - 1);
        for c in from_c..=to_c {
            let child_base = self.begin + c * CHILD_SIZE;
            let lo = from.max(child_base) - child_base;
            let hi = to.min(child_base + CHILD_SIZE) - child_base;
            self.bitmaps[c].set_range(lo..hi, true);
            let taken = hi - lo;
            let committed = self.update_child(c, |e| e.dec(taken));
            debug_assert!(committed.is_some(), "reserve_range on freshly-built lower");
        }
    }
}
