//! Thread helpers for host harnesses: CPU pinning and a small scoped-parallel
//! runner. `std`-only, since both need an OS thread; used by the stress
//! tests in [`crate::tests`] and the integration tests under `tests/`.

use std::thread;

/// Pins the calling thread to logical `core`.
#[cfg(target_os = "linux")]
pub fn pin(core: usize) {
    use log::error;

    let mut set = unsafe { std::mem::zeroed::<libc::cpu_set_t>() };
    unsafe { libc::CPU_SET(core, &mut set) };
    let ret = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if ret != 0 {
        error!("sched_setaffinity failed for core {core}");
    }
}

/// Pins the calling thread to logical `core`.
#[cfg(target_os = "macos")]
pub fn pin(core: usize) {
    #![allow(non_camel_case_types)]
    use std::os::raw::{c_int, c_uint};

    type kern_return_t = c_int;
    type thread_t = c_uint;
    type thread_policy_flavor_t = c_int;
    type mach_msg_type_number_t = c_int;

    #[repr(C)]
    struct thread_affinity_policy_data_t {
        affinity_tag: c_int,
    }
    type thread_policy_t = *mut thread_affinity_policy_data_t;
    const THREAD_AFFINITY_POLICY: thread_policy_flavor_t = 4;

    #[link(name = "System", kind = "framework")]
    extern "C" {
        fn thread_policy_set(
            thread: thread_t,
            flavor: thread_policy_flavor_t,
            policy_info: thread_policy_t,
            count: mach_msg_type_number_t,
        ) -> kern_return_t;
    }

    let mut info = thread_affinity_policy_data_t {
        affinity_tag: core as c_int,
    };
    unsafe {
        thread_policy_set(
            libc::pthread_self() as thread_t,
            THREAD_AFFINITY_POLICY,
            &mut info as thread_policy_t,
            1,
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn pin(_core: usize) {}

/// Runs `f(0)..f(n - 1)` each on its own scoped thread and waits for all of
/// them, propagating the first panic. `f` may safely borrow from the
/// caller's stack frame.
pub fn parallel<F: Fn(usize) + Sync>(n: usize, f: F) {
    thread::scope(|scope| {
        let handles: Vec<_> = (0..n).map(|t| scope.spawn(|| f(t))).collect();
        for h in handles {
            h.join().expect("worker thread panicked");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::logging;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parallel_runs_every_index_once() {
        logging();
        const N: usize = 8;
        let seen: Vec<AtomicUsize> = (0..N).map(|_| AtomicUsize::new(0)).collect();
        parallel(N, |t| {
            pin(t % num_cpus::get());
            seen[t].fetch_add(1, Ordering::SeqCst);
        });
        for s in &seen {
            assert_eq!(s.load(Ordering::SeqCst), 1);
        }
    }
}
