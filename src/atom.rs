//! Single-word atomic update helper.
//!
//! The allocator core never takes a lock; every state transition is
//! "load the packed word, compute a candidate successor, CAS it in,
//! retry on conflict". [`Atom::fetch_update`] is the `core`-side
//! equivalent of the reference implementation's `atom_update(ptr, old,
//! fn, ...)` macro: it loads the atom, applies `f` to produce a
//! candidate, and retries the CAS until it either commits or `f`
//! rejects the value.

use crossbeam_utils::atomic::AtomicCell;

/// Thin wrapper around [`AtomicCell`] for whole-word packed structs
/// (child/tree/reservation entries) that need compare-and-swap but are
/// not one of the native integer atomics.
#[repr(transparent)]
pub struct Atom<T: Copy>(pub AtomicCell<T>);

impl<T: Copy> Atom<T> {
    pub const fn new(v: T) -> Self {
        Self(AtomicCell::new(v))
    }

    #[inline]
    pub fn load(&self) -> T {
        self.0.load()
    }

    #[inline]
    pub fn store(&self, v: T) {
        self.0.store(v)
    }
}

impl<T: Copy + Eq> Atom<T> {
    #[inline]
    pub fn compare_exchange(&self, current: T, new: T) -> Result<T, T> {
        self.0.compare_exchange(current, new)
    }

    /// Loads, applies `f`, CASes the result in, retrying on conflict.
    /// `f` returning `None` aborts the update without retrying and the
    /// stale value observed is returned as `Err`.
    pub fn fetch_update<F: FnMut(T) -> Option<T>>(&self, mut f: F) -> Result<T, T> {
        let mut old = self.0.load();
        loop {
            let Some(new) = f(old) else {
                return Err(old);
            };
            match self.0.compare_exchange(old, new) {
                Ok(prev) => return Ok(prev),
                Err(actual) => old = actual,
            }
        }
    }

    /// Same as [`Atom::fetch_update`], but gives up after `retries`
    /// failed CAS attempts instead of retrying forever, returning
    /// [`UpdateError::Exhausted`]. This backs the `Retry` error kind:
    /// operations built on top of it surface `Retry` once their
    /// bounded budget is spent rather than spinning indefinitely.
    pub fn fetch_update_bounded<F: FnMut(T) -> Option<T>>(
        &self,
        retries: usize,
        mut f: F,
    ) -> Result<T, UpdateError> {
        let mut old = self.0.load();
        for _ in 0..retries {
            let Some(new) = f(old) else {
                return Err(UpdateError::Rejected);
            };
            match self.0.compare_exchange(old, new) {
                Ok(prev) => return Ok(prev),
                Err(actual) => old = actual,
            }
        }
        Err(UpdateError::Exhausted)
    }
}

impl<T: Copy + Default> Default for Atom<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Why a bounded [`Atom::fetch_update_bounded`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    /// `f` rejected the current value outright (e.g. not enough free frames).
    Rejected,
    /// The retry budget was spent without a successful CAS.
    Exhausted,
}
