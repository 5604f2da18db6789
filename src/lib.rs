//! A page-granularity physical-frame allocator core for an OS kernel.
//!
//! The crate tracks a contiguous range of fixed-size frames and hands out
//! power-of-two groupings of them ("orders"), from a single frame up to one
//! huge-page pair (`MAX_ORDER`). It is built for many concurrent callers,
//! one per logical CPU, and never blocks: every mutation is a bounded
//! compare-and-swap retry on a naturally-aligned atomic word.
//!
//! The implementation is layered bottom-up:
//! - [`bitfield`] — atomic run alloc/free/test on 64-bit words.
//! - [`lower`] — per-child (huge-page-sized) bitmaps plus a free-count/huge entry.
//! - [`upper`] — the tree array: one packed free-count/reserved word per [`consts::TREE_SIZE`]
//!   region.
//! - [`local`] — per-CPU reservation state.
//!
//! This module is the fifth layer: the facade that ties the three shared
//! layers and the per-CPU layer together behind [`Allocator::get`]/
//! [`Allocator::put`]/[`Allocator::is_free`]/[`Allocator::drain`].
#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod atom;
pub mod bitfield;
pub mod consts;
pub mod entry;
pub mod error;
pub mod local;
pub mod lower;
pub mod provider;
#[cfg(feature = "std")]
pub mod thread;
pub mod upper;
pub mod util;

use core::fmt;
use core::mem::{align_of, size_of};

use alloc::boxed::Box;
use log::{debug, error, info, warn};

use crate::consts::{
    almost_allocated, almost_free, CAS_RETRIES, CHILDREN_PER_TREE, CHILD_SIZE, HUGE_ORDER,
    MAX_ORDER, TREE_ORDER, TREE_SIZE,
};
use crate::entry::{ChildPair, Reservation, Tree};
pub use crate::error::{Error, Result};
use crate::local::Local;
use crate::lower::Lower;
use crate::provider::MemoryProvider;
use crate::upper::Trees;
use crate::util::{align_down, align_up, Align};

cfg_if::cfg_if! {
    if #[cfg(feature = "max_level_debug")] {
        const CONFIGURED_MAX_LEVEL: &str = "debug";
    } else if #[cfg(feature = "max_level_info")] {
        const CONFIGURED_MAX_LEVEL: &str = "info";
    } else if #[cfg(feature = "max_level_error")] {
        const CONFIGURED_MAX_LEVEL: &str = "error";
    } else {
        const CONFIGURED_MAX_LEVEL: &str = "trace";
    }
}

/// How the frame range managed by a freshly [`Allocator::init`]ed instance
/// starts out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Every frame starts free.
    Free,
    /// Every frame starts allocated; callers hand frames back in piecewise
    /// via [`Allocator::put`].
    Allocated,
    /// Recover allocator state from a previously persisted metadata image.
    /// Accepted at the type level for interface compatibility with the
    /// source this core is modeled on, but not implemented: always
    /// surfaces [`Error::Init`]. See `DESIGN.md`.
    Recover,
}

/// Byte sizes of the three metadata regions an [`Allocator`] instance
/// needs, as returned by [`Allocator::metadata_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaSize {
    /// Per-CPU reservation array.
    pub local: usize,
    /// Tree free-count/reserved array.
    pub trees: usize,
    /// Child free-count/huge entries plus their base-frame bitmaps.
    pub lower: usize,
}

impl MetaSize {
    pub fn total(&self) -> usize {
        self.local + self.trees + self.lower
    }
}

/// A physical-frame allocator instance.
///
/// Owns the tree array, the child/bitmap array, and the per-CPU
/// reservation slots for one contiguous frame range. Every method takes
/// `&self`: concurrent callers coordinate purely through the atomics in
/// the layers below, never through a lock held by this struct.
pub struct Allocator {
    frame_base: usize,
    frame_count: usize,
    cores: usize,
    lower: Lower,
    trees: Trees,
    locals: Box<[Align<Local>]>,
}

// SAFETY: every shared field is either an atomic layer (`Lower`, `Trees`)
// or a boxed array of `Local`, whose only non-atomic field (`recent`) is
// documented as touched only by its owning, pinned CPU.
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("frame_base", &self.frame_base)
            .field("frames", &self.frame_count)
            .field("cores", &self.cores)
            .field("trees", &self.trees)
            .field("log_level", &CONFIGURED_MAX_LEVEL)
            .finish()
    }
}

impl Allocator {
    /// Computes the byte sizes of the three metadata regions this
    /// allocator would need for `cores` CPUs and `frames` base frames
    /// (rounded up to a [`consts::TREE_SIZE`] multiple), cache-line
    /// aligned as described in §4.5 of the design. Purely informational:
    /// [`Allocator::init`] allocates its own metadata from the ordinary
    /// global allocator and does not consult this.
    pub fn metadata_size(cores: usize, frames: usize) -> MetaSize {
        let frames = align_up(frames.max(1), TREE_SIZE);
        let num_trees = frames / TREE_SIZE;
        let num_children = frames / CHILD_SIZE;
        let local = align_up(cores * size_of::<Align<Local>>(), 64);
        let trees = align_up(num_trees * size_of::<Tree>(), 64);
        let pairs = align_up((num_children / 2).max(1) * size_of::<ChildPair>(), 64);
        let bitmaps = num_children * 64; // one cache-line-sized bitmap per child
        MetaSize {
            local,
            trees,
            lower: pairs + bitmaps,
        }
    }

    /// Builds a new allocator instance.
    ///
    /// `start_frame` is aligned down to a `1 << MAX_ORDER` boundary and the
    /// slack this introduces is added to `frame_count`; the resulting frame
    /// count is then rounded up to a [`consts::TREE_SIZE`] multiple. Both
    /// the leading alignment slack and the trailing padding this produces
    /// are pre-marked allocated, so callers never see them via `get`.
    pub fn init(cores: usize, start_frame: usize, frame_count: usize, mode: InitMode) -> Result<Self> {
        if cores == 0 {
            error!("init: cores must be > 0");
            return Err(Error::Init);
        }
        if frame_count == 0 {
            error!("init: frame_count must be > 0");
            return Err(Error::Init);
        }
        if mode == InitMode::Recover {
            error!("init: Recover is not implemented by this core");
            return Err(Error::Init);
        }

        let begin = align_down(start_frame, 1 << MAX_ORDER);
        let slack = start_frame - begin;
        let usable_end = start_frame + frame_count;
        let frames = align_up(usable_end - begin, TREE_SIZE);

        info!(
            "init: cores={cores} start_frame={start_frame} frame_count={frame_count} \
             begin={begin} frames={frames} mode={mode:?}"
        );

        let free = mode == InitMode::Free;
        let lower = Lower::new(begin, frames, free);
        if free {
            lower.reserve_range(begin, begin + slack);
            lower.reserve_range(begin + slack + frame_count, begin + frames);
        }

        let trees = Trees::new(frames, |i, span| {
            let children = span / CHILD_SIZE;
            let lo = i * CHILDREN_PER_TREE;
            lower.free_in_range(lo..lo + children)
        });

        let locals = (0..cores).map(|_| Align(Local::new())).collect();

        Ok(Self {
            frame_base: begin,
            frame_count: frames,
            cores,
            lower,
            trees,
            locals,
        })
    }

    /// Releases this instance's metadata. Equivalent to dropping it; exists
    /// as an explicit operation to match the source's `uninit`/`llfree_uninit`
    /// entry point.
    pub fn uninit(self) {
        debug!("uninit: {self:?}");
    }

    /// Total number of frames this instance manages (including any
    /// alignment/padding slack, which is permanently allocated).
    pub fn frames(&self) -> usize {
        self.frame_count
    }

    /// Number of CPUs this instance was initialized for.
    pub fn cores(&self) -> usize {
        self.cores
    }

    /// Best-effort sum of free frames: every tree's counter, plus whatever
    /// free count each CPU's currently-held reservation has drained from
    /// its tree but not yet handed out.
    pub fn free_frames(&self) -> usize {
        let mut total = self.trees.free_frames();
        for l in self.locals.iter() {
            let res = l.reservation().load();
            if res.held() {
                total += res.free();
            }
        }
        total
    }

    /// Number of children (`HUGE_ORDER`-sized groups) that are entirely free.
    pub fn free_huge(&self) -> usize {
        self.lower.free_huge_count()
    }

    /// Frames currently handed out, read straight from the bitmap layer.
    /// Unlike [`Self::free_frames`] this needs no per-CPU reservation
    /// bookkeeping, since reserving a tree never flips any bitmap bit.
    pub fn allocated_frames(&self) -> usize {
        self.lower.allocated_frames()
    }

    /// Free-frame count of the child (`order == HUGE_ORDER`) or tree
    /// (`order == TREE_ORDER`) containing `frame`. Other orders fall back
    /// to the containing child's count.
    pub fn free_at(&self, frame: usize, order: usize) -> usize {
        if order == TREE_ORDER {
            let tree_i = self.tree_of(frame);
            self.trees[tree_i].load().free()
        } else {
            self.lower.child_free(frame)
        }
    }

    fn tree_of(&self, frame: usize) -> usize {
        (frame - self.frame_base) / self.trees.span()
    }

    fn anchor(&self, cpu: usize) -> usize {
        if self.trees.is_empty() {
            0
        } else {
            (cpu * self.trees.len()) / self.cores
        }
    }

    /// Allocates `1 << order` contiguous, aligned frames for `cpu`.
    ///
    /// `order >= HUGE_ORDER` bypasses per-CPU reservation entirely and is
    /// served directly from the tree/child layers. Smaller orders are
    /// funneled through `cpu`'s private tree reservation, reserving or
    /// swapping to a fresh tree as needed.
    pub fn get(&self, cpu: usize, order: usize) -> Result<usize> {
        if cpu >= self.cores {
            error!("get: cpu {cpu} >= cores {}", self.cores);
            return Err(Error::Address);
        }
        if order > MAX_ORDER {
            error!("get: order {order} > MAX_ORDER");
            return Err(Error::Address);
        }
        if order >= HUGE_ORDER {
            self.get_huge(cpu, order)
        } else {
            self.get_small(cpu, order)
        }
    }

    fn get_huge(&self, cpu: usize, order: usize) -> Result<usize> {
        let need = if order == HUGE_ORDER { CHILD_SIZE } else { 2 * CHILD_SIZE };
        let anchor = self.anchor(cpu);
        // Bounded: a tree can only fail the lower carve this way if another
        // CPU raced it for the same child, which cannot happen more than
        // `CAS_RETRIES` times in practice before one side wins.
        for _ in 0..CAS_RETRIES {
            let i = self.trees.dec_near(anchor, need)?;
            let lo = i * CHILDREN_PER_TREE;
            let hi = lo + CHILDREN_PER_TREE;
            let hint = self.frame_base + lo * CHILD_SIZE;
            let result = if order == HUGE_ORDER {
                self.lower.get_huge(hint, lo..hi)
            } else {
                self.lower.get_max(hint, lo..hi)
            };
            match result {
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    warn!("get_huge: lower carve failed in tree {i}, returning reservation");
                    let _ = self.trees.inc(i, need, self.trees.span());
                    if e != Error::Memory {
                        return Err(e);
                    }
                    crate::util::spin_wait(4);
                }
            }
        }
        Err(Error::Retry)
    }

    fn get_small(&self, cpu: usize, order: usize) -> Result<usize> {
        let need = 1usize << order;
        let local = &self.locals[cpu].0;
        let mut res = local.reservation().load();
        if !res.held() || res.free() < need {
            res = self.swap_reservation(cpu, local, need)?;
        }
        match self.carve(res, order) {
            Ok((frame, new_res)) => {
                local.reservation().store(new_res);
                local.set_start(frame);
                Ok(frame)
            }
            Err(Error::Memory) => {
                // Fragmentation inside the reserved tree: force a fresh
                // reservation and retry exactly once, per the design's
                // "swap then retry once" rule.
                let res2 = self.swap_reservation(cpu, local, need)?;
                let (frame, new_res) = self.carve(res2, order)?;
                local.reservation().store(new_res);
                local.set_start(frame);
                Ok(frame)
            }
            Err(e) => Err(e),
        }
    }

    /// Allocates `1 << order` frames from the tree `res` currently points
    /// at, returning the frame and the locally-updated reservation.
    fn carve(&self, res: Reservation, order: usize) -> Result<(usize, Reservation)> {
        let need = 1usize << order;
        let tree_i = self.tree_of(res.start());
        let lo = tree_i * CHILDREN_PER_TREE;
        let hi = lo + CHILDREN_PER_TREE;
        let frame = self.lower.get(res.start(), order, lo..hi)?;
        let new_res = res
            .dec(need)
            .expect("local reservation free count is only ever touched by its owning cpu");
        Ok((frame, new_res))
    }

    /// Reserves a fresh tree for `cpu`, then returns its old one (if any).
    /// Reserve-before-release, so there is never a window where this CPU
    /// holds no reservation at all. `min_free` is the caller's actual
    /// requirement (`1 << order`), forwarded to the tree scan's last-resort
    /// fallback so a tree drained to just a few frames by concurrent
    /// `put`s is still a valid reservation target.
    fn swap_reservation(&self, cpu: usize, local: &Local, min_free: usize) -> Result<Reservation> {
        let anchor = self.anchor(cpu);
        let (new_idx, prev) = self.trees.reserve(self.cores, anchor, false, min_free)?;
        let new_start = self.frame_base + new_idx * self.trees.span();
        let new_res = Reservation::new_with(prev.free(), new_start);

        let old = local.reservation().load();
        local.reservation().store(new_res);

        if old.held() {
            let old_tree = self.tree_of(old.start());
            if self.trees.unreserve(old_tree, old.free(), self.trees.span()).is_err() {
                warn!("swap_reservation: unreserve of tree {old_tree} failed");
            }
        }
        Ok(new_res)
    }

    /// Frees a previously allocated run of `1 << order` frames.
    pub fn put(&self, cpu: usize, frame: usize, order: usize) -> Result<()> {
        if cpu >= self.cores {
            error!("put: cpu {cpu} >= cores {}", self.cores);
            return Err(Error::Address);
        }
        if order > MAX_ORDER {
            return Err(Error::Address);
        }
        if frame < self.frame_base || frame >= self.frame_base + self.frame_count {
            error!("put: frame {frame} out of range");
            return Err(Error::Address);
        }
        if frame % (1 << order) != 0 {
            error!("put: frame {frame} unaligned for order {order}");
            return Err(Error::Address);
        }

        let tree_i = self.tree_of(frame);
        if order >= HUGE_ORDER {
            if order == HUGE_ORDER {
                self.lower.put_huge(frame)?;
            } else {
                self.lower.put_max(frame)?;
            }
            let need = if order == HUGE_ORDER { CHILD_SIZE } else { 2 * CHILD_SIZE };
            self.trees.inc(tree_i, need, self.trees.span())?;
            return Ok(());
        }

        self.lower.put(frame, order)?;
        let need = 1usize << order;
        let local = &self.locals[cpu].0;
        let res = local.reservation().load();

        if res.held() && self.tree_of(res.start()) == tree_i {
            if let Some(new_res) = res.inc(need, self.trees.span()) {
                local.reservation().store(new_res);
            }
            return Ok(());
        }

        let prev = self.trees.inc(tree_i, need, self.trees.span())?;
        local.note_free(tree_i);

        // Heuristic: this CPU keeps freeing into a foreign tree that is now
        // mostly free, and its own reservation is running low. Steal the
        // tree it is freeing into instead of paying for a fresh scan next
        // time it needs one.
        let now_free = prev.free() + need;
        if local.frees_related(tree_i) && now_free >= almost_free() && res.free() < almost_allocated() {
            if let Ok(stolen) = self.trees[tree_i].fetch_update(|e| e.reserve(0..=self.trees.span())) {
                debug!("put: cpu {cpu} stealing tree {tree_i} it keeps freeing into");
                let new_res = Reservation::new_with(stolen.free(), self.frame_base + tree_i * self.trees.span());
                local.reservation().store(new_res);
                local.set_start(frame);
                if res.held() {
                    let old_tree = self.tree_of(res.start());
                    let _ = self.trees.unreserve(old_tree, res.free(), self.trees.span());
                }
            }
        }
        Ok(())
    }

    /// `frame` is advisory under concurrency: by the time the caller reads
    /// the result, another CPU may have already changed it.
    pub fn is_free(&self, frame: usize, order: usize) -> bool {
        if order > MAX_ORDER || frame < self.frame_base || frame >= self.frame_base + self.frame_count {
            return false;
        }
        self.lower.is_free(frame, order)
    }

    /// Releases `cpu`'s reservation, if any, back to the global pool.
    /// Idempotent: calling it again on an already-empty CPU is a no-op.
    pub fn drain(&self, cpu: usize) -> Result<()> {
        if cpu >= self.cores {
            return Err(Error::Address);
        }
        let local = &self.locals[cpu].0;
        let res = local.reservation().load();
        if res.held() {
            let tree_i = self.tree_of(res.start());
            local.reservation().store(Reservation::empty());
            self.trees.unreserve(tree_i, res.free(), self.trees.span())?;
        }
        Ok(())
    }

    /// Writes a short human-readable summary into `buf`, returning the
    /// number of bytes written. Truncates rather than panicking if `buf`
    /// is too small.
    pub fn dump(&self, buf: &mut [u8]) -> usize {
        use core::fmt::Write;

        struct Cursor<'a> {
            buf: &'a mut [u8],
            len: usize,
        }
        impl Write for Cursor<'_> {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                let bytes = s.as_bytes();
                let avail = self.buf.len() - self.len;
                let n = bytes.len().min(avail);
                self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
                self.len += n;
                Ok(())
            }
        }

        let mut c = Cursor { buf, len: 0 };
        let _ = write!(
            c,
            "frames={} cores={} free={} huge={} trees={:?}",
            self.frame_count,
            self.cores,
            self.free_frames(),
            self.free_huge(),
            self.trees,
        );
        c.len
    }

    /// Logs [`Allocator::dump`]'s summary through the `log` facade, the
    /// counterpart of the source's `llfree_printk`.
    pub fn print(&self) {
        info!("{self:?}");
    }
}

/// An [`Allocator`] instance whose handle itself (not its metadata arrays,
/// which still come from the ordinary global allocator — see `DESIGN.md`)
/// is placed by a host-supplied [`MemoryProvider`], mirroring the source's
/// `llfree_node_init`, which `memblock_alloc_node`s `sizeof(llfree_t)`
/// separately from the tables it points at.
pub struct Handle<'p, P: MemoryProvider> {
    ptr: *mut Allocator,
    provider: &'p P,
    node: usize,
}

// SAFETY: `Allocator` is `Send + Sync`; `Handle` only adds a raw pointer to
// one, exclusively owned by this `Handle` until it is dropped.
unsafe impl<'p, P: MemoryProvider + Sync> Send for Handle<'p, P> {}
unsafe impl<'p, P: MemoryProvider + Sync> Sync for Handle<'p, P> {}

impl<'p, P: MemoryProvider> Handle<'p, P> {
    /// Builds an [`Allocator`] the ordinary way, then moves it into memory
    /// obtained from `provider` on `node`.
    pub fn init(
        provider: &'p P,
        node: usize,
        cores: usize,
        start_frame: usize,
        frame_count: usize,
        mode: InitMode,
    ) -> Result<Self> {
        let inner = Allocator::init(cores, start_frame, frame_count, mode)?;
        let size = size_of::<Allocator>();
        let align = align_of::<Allocator>();
        // SAFETY: size/align come from `size_of`/`align_of` on the exact
        // type being placed.
        let raw = unsafe { provider.alloc(node, size, align) }.ok_or(Error::Init)?;
        let ptr = raw.cast::<Allocator>();
        // SAFETY: `ptr` is freshly obtained, sized and aligned for
        // `Allocator`, and not read before this write.
        unsafe { ptr.write(inner) };
        Ok(Self { ptr, provider, node })
    }

    /// NUMA node this handle's memory was obtained from.
    pub fn node(&self) -> usize {
        self.node
    }
}

impl<'p, P: MemoryProvider> core::ops::Deref for Handle<'p, P> {
    type Target = Allocator;
    fn deref(&self) -> &Allocator {
        // SAFETY: `ptr` stays valid and uniquely owned by this `Handle`
        // for its whole lifetime; see `Drop` below.
        unsafe { &*self.ptr }
    }
}

impl<'p, P: MemoryProvider> Drop for Handle<'p, P> {
    fn drop(&mut self) {
        // SAFETY: `ptr` was written by `Handle::init` and is dropped
        // exactly once, here, before the backing memory is returned.
        unsafe {
            core::ptr::drop_in_place(self.ptr);
            self.provider
                .free(self.ptr.cast::<u8>(), size_of::<Allocator>(), align_of::<Allocator>());
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::util::logging;

    const CORES: usize = 4;
    const FRAMES: usize = 4 * TREE_SIZE; // one tree's worth per core

    #[test]
    fn metadata_size_scales_with_frames() {
        let small = Allocator::metadata_size(4, TREE_SIZE);
        let big = Allocator::metadata_size(4, 4 * TREE_SIZE);
        assert!(big.trees > small.trees);
        assert!(big.lower > small.lower);
        assert_eq!(big.local, small.local);
    }

    #[test]
    fn init_rejects_bad_params() {
        assert_eq!(Allocator::init(0, 0, 4096, InitMode::Free).unwrap_err(), Error::Init);
        assert_eq!(Allocator::init(1, 0, 0, InitMode::Free).unwrap_err(), Error::Init);
        assert_eq!(
            Allocator::init(1, 0, 4096, InitMode::Recover).unwrap_err(),
            Error::Init
        );
    }

    #[test]
    fn scenario_small_alloc_free_realloc() {
        logging();
        let a = Allocator::init(CORES, 0, FRAMES, InitMode::Free).unwrap();
        assert_eq!(a.get(0, 0).unwrap(), 0);
        assert_eq!(a.get(0, 0).unwrap(), 1);
        a.put(0, 0, 0).unwrap();
        let f = a.get(0, 0).unwrap();
        assert_ne!(f, 1);
        assert_eq!(a.free_frames(), FRAMES - 2);
        assert_eq!(a.allocated_frames(), 2);
    }

    #[test]
    fn scenario_huge_alloc_free() {
        logging();
        let a = Allocator::init(CORES, 0, FRAMES, InitMode::Free).unwrap();
        assert_eq!(a.get(0, HUGE_ORDER).unwrap(), 0);
        assert_eq!(a.get(0, HUGE_ORDER).unwrap(), CHILD_SIZE);
        a.put(0, 0, HUGE_ORDER).unwrap();
        assert!(a.is_free(0, HUGE_ORDER));
        assert!(a.is_free(0, 0));
    }

    #[test]
    fn scenario_each_cpu_gets_distinct_tree() {
        logging();
        let a = Allocator::init(CORES, 0, FRAMES, InitMode::Free).unwrap();
        let mut frames = alloc::vec::Vec::new();
        for c in 0..CORES {
            frames.push(a.get(c, 0).unwrap());
        }
        for i in 0..frames.len() {
            for j in i + 1..frames.len() {
                assert_ne!(frames[i], frames[j]);
            }
        }
    }

    #[test]
    fn scenario_allocated_mode_needs_put_first() {
        logging();
        let a = Allocator::init(CORES, 0, FRAMES, InitMode::Allocated).unwrap();
        assert_eq!(a.get(0, 0).unwrap_err(), Error::Memory);
        a.put(0, 0, 0).unwrap();
        assert_eq!(a.get(0, 0).unwrap(), 0);
    }

    #[test]
    fn scenario_exhaustion_reports_memory() {
        logging();
        let a = Allocator::init(1, 0, FRAMES, InitMode::Free).unwrap();
        for _ in 0..FRAMES {
            a.get(0, 0).unwrap();
        }
        assert_eq!(a.get(0, 0).unwrap_err(), Error::Memory);
        assert_eq!(a.free_frames(), 0);
    }

    #[test]
    fn scenario_max_order_touches_two_children() {
        logging();
        let a = Allocator::init(CORES, 0, FRAMES, InitMode::Free).unwrap();
        assert_eq!(a.get(0, MAX_ORDER).unwrap(), 0);
        assert!(!a.is_free(0, HUGE_ORDER));
        assert!(!a.is_free(CHILD_SIZE, HUGE_ORDER));
        a.put(0, 0, MAX_ORDER).unwrap();
        assert!(a.is_free(0, MAX_ORDER));
    }

    #[test]
    fn put_unaligned_frame_is_address_error() {
        let a = Allocator::init(CORES, 0, FRAMES, InitMode::Free).unwrap();
        assert_eq!(a.put(0, 1, 1).unwrap_err(), Error::Address);
    }

    #[test]
    fn put_out_of_range_is_address_error() {
        let a = Allocator::init(CORES, 0, FRAMES, InitMode::Free).unwrap();
        assert_eq!(a.put(0, FRAMES, 0).unwrap_err(), Error::Address);
    }

    #[test]
    fn cpu_out_of_range_is_address_error() {
        let a = Allocator::init(CORES, 0, FRAMES, InitMode::Free).unwrap();
        assert_eq!(a.get(CORES, 0).unwrap_err(), Error::Address);
    }

    #[test]
    fn drain_is_idempotent() {
        let a = Allocator::init(CORES, 0, FRAMES, InitMode::Free).unwrap();
        a.get(0, 0).unwrap();
        a.drain(0).unwrap();
        a.drain(0).unwrap();
    }

    #[test]
    fn get_put_restores_free_count() {
        let a = Allocator::init(CORES, 0, FRAMES, InitMode::Free).unwrap();
        let before = a.free_frames();
        let f = a.get(0, 3).unwrap();
        a.put(0, f, 3).unwrap();
        assert_eq!(a.free_frames(), before);
    }

    #[test]
    fn dump_writes_into_buffer() {
        let a = Allocator::init(CORES, 0, FRAMES, InitMode::Free).unwrap();
        let mut buf = [0u8; 256];
        let n = a.dump(&mut buf);
        assert!(n > 0);
        assert!(core::str::from_utf8(&buf[..n]).is_ok());
        a.print();
    }

    #[test]
    fn init_aligns_start_and_pads_trailing_frames() {
        logging();
        // start_frame is off a MAX_ORDER boundary and frame_count isn't a
        // TREE_SIZE multiple: both the leading slack and the trailing pad
        // must come back pre-allocated.
        let a = Allocator::init(CORES, 5, FRAMES - 10, InitMode::Free).unwrap();
        assert_eq!(a.frame_base, 0);
        assert!(!a.is_free(0, 0));
        assert!(a.is_free(5, 0));
        assert!(!a.is_free(a.frame_count - 1, 0));
    }

    #[test]
    fn handle_roundtrips_through_provider() {
        use crate::provider::HeapProvider;
        let provider = HeapProvider;
        let handle = Handle::init(&provider, 0, CORES, 0, FRAMES, InitMode::Free).unwrap();
        assert_eq!(handle.get(0, 0).unwrap(), 0);
        drop(handle);
    }
}
