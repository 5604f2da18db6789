//! The memory-provider collaborator boundary. The core never allocates
//! metadata memory itself; a host (kernel module, userspace harness,
//! benchmark binary) supplies it through this trait so the core stays
//! `no_std` and free of any particular allocator's API.

/// Borrows raw, page-aligned memory for the allocator's own metadata
/// regions (local array, tree array, lower region). Implementations must
/// zero-fill nothing in particular; the allocator overwrites every byte
/// it reads during `init`.
pub trait MemoryProvider {
    /// Allocates `size` bytes aligned to `align`, optionally hinting a NUMA
    /// node. Returns `None` if no such region is available.
    ///
    /// # Safety
    /// The returned pointer, if any, must be valid for reads and writes of
    /// `size` bytes for as long as the allocator instance borrowing it is
    /// alive, and must not alias any other live allocation.
    unsafe fn alloc(&self, node: usize, size: usize, align: usize) -> Option<*mut u8>;

    /// Releases a region previously returned by [`MemoryProvider::alloc`]
    /// with the same `size`/`align`.
    ///
    /// # Safety
    /// `pointer` must have been returned by this provider's `alloc` with
    /// matching `size` and `align`, and must not be used again afterwards.
    unsafe fn free(&self, pointer: *mut u8, size: usize, align: usize);
}

/// A [`MemoryProvider`] backed by the ordinary global heap allocator.
/// Convenient for tests and userspace harnesses; not part of the
/// specified contract.
#[cfg(feature = "std")]
pub struct HeapProvider;

#[cfg(feature = "std")]
impl MemoryProvider for HeapProvider {
    unsafe fn alloc(&self, _node: usize, size: usize, align: usize) -> Option<*mut u8> {
        let layout = std::alloc::Layout::from_size_align(size, align).ok()?;
        let ptr = std::alloc::alloc_zeroed(layout);
        (!ptr.is_null()).then_some(ptr)
    }

    unsafe fn free(&self, pointer: *mut u8, size: usize, align: usize) {
        if let Ok(layout) = std::alloc::Layout::from_size_align(size, align) {
            std::alloc::dealloc(pointer, layout);
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::consts::FRAME_ORDER;

    #[test]
    fn heap_provider_roundtrip() {
        let frame_size = 1usize << FRAME_ORDER;
        let provider = HeapProvider;
        unsafe {
            let ptr = provider.alloc(0, frame_size, frame_size).expect("alloc");
            assert_eq!(ptr as usize % frame_size, 0);
            core::ptr::write_bytes(ptr, 0xaa, frame_size);
            provider.free(ptr, frame_size, frame_size);
        }
    }
}
