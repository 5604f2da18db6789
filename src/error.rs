use core::fmt;

/// Failure modes surfaced by the allocator core.
///
/// `Memory` and `Address` are expected outcomes a caller must handle;
/// `Retry` means the internal CAS-retry budget was exhausted and the
/// caller should fall back to a slower path; `Init` is fatal.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No suitable region was found after a bounded search.
    Memory,
    /// Internal CAS contention limit was hit; the caller may retry.
    Retry,
    /// Frame out of range, unaligned, or not allocated at the given order.
    Address,
    /// Bad init parameters or metadata region too small.
    Init,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Memory => write!(f, "no free memory for this request"),
            Error::Retry => write!(f, "operation aborted after exhausting its retry budget"),
            Error::Address => write!(f, "invalid frame address or order"),
            Error::Init => write!(f, "invalid initialization parameters"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
