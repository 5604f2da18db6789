//! Compile-time layout constants. Kept as plain `pub const`s rather than a
//! runtime config struct, mirroring how the reference allocator keeps these
//! as preprocessor constants: they size arrays and mask bit-shifts on every
//! hot path, so they must be known at compile time.

/// log2(base frame size in bytes).
pub const FRAME_ORDER: usize = 12;
/// log2(frames per child), i.e. the huge-page order.
pub const HUGE_ORDER: usize = 9;
/// log2(children per tree).
pub const CHILDREN_PER_TREE_ORDER: usize = 5;
/// log2(bits per atomic word used by the bitmap).
pub const WORD_ORDER: usize = 6;

/// One past the huge order: the only order that spans two adjacent children.
pub const MAX_ORDER: usize = HUGE_ORDER + 1;
/// log2(frames per tree).
pub const TREE_ORDER: usize = HUGE_ORDER + CHILDREN_PER_TREE_ORDER;

/// Frames in one child (one huge page).
pub const CHILD_SIZE: usize = 1 << HUGE_ORDER;
/// Children in one tree.
pub const CHILDREN_PER_TREE: usize = 1 << CHILDREN_PER_TREE_ORDER;
/// Frames in one tree.
pub const TREE_SIZE: usize = 1 << TREE_ORDER;
/// Bits in one atomic bitmap word.
pub const WORD_BITS: usize = 1 << WORD_ORDER;
/// Words needed to cover one child's bitmap.
pub const WORDS_PER_CHILD: usize = CHILD_SIZE / WORD_BITS;

/// Bounded CAS-retry budget shared by every fetch-update loop in the core.
/// Exhausting it surfaces `Error::Retry` rather than spinning forever.
pub const CAS_RETRIES: usize = 4 * CHILDREN_PER_TREE;

/// Trees considered "almost allocated": below this free-frame count, a
/// reservation scan prefers looking elsewhere before picking this tree for
/// a small-order request.
pub const fn almost_allocated() -> usize {
    1 << (CHILDREN_PER_TREE_ORDER + HUGE_ORDER - 5)
}

/// Trees considered "almost free": above this free-frame count, a huge/
/// `MAX_ORDER` reservation scan is happy to carve into this tree even if
/// it is not perfectly empty.
pub const fn almost_free() -> usize {
    TREE_SIZE - almost_allocated()
}

const _: () = assert!(MAX_ORDER == HUGE_ORDER + 1);
const _: () = assert!(CHILD_SIZE % WORD_BITS == 0);
const _: () = assert!(TREE_SIZE % CHILD_SIZE == 0);
