//! StructZone Runtime Library
//!
//! Tracks the live redzones of an instrumented program and aborts it on any
//! access that touches one. The sanitizer pass emits calls to the C-ABI
//! surface below; this crate is linked (statically or as a shared object)
//! into the final binary.
//!
//! # Architecture
//!
//! A process-wide [`interval_tree::IntervalTree`] holds one interval per
//! live redzone. Registration (`rz_add`/`rz_rm`) and probing (`rz_check`)
//! happen at arbitrary program points, so the index lives behind a single
//! global mutex; every entry point takes it for the duration of one tree
//! operation.
//!
//! # Failure mode
//!
//! A probe that overlaps a redzone is an overflow in the instrumented
//! program. It is reported to standard error and escalated to `SIGABRT`;
//! nothing here unwinds across the C ABI.

// Runtime FFI functions take raw pointers from instrumented code. The
// safety contract is between the emitting pass (which generates the
// arguments) and this runtime, not with Rust callers.
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::missing_safety_doc)]

pub mod interval_tree;

use interval_tree::IntervalTree;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::os::raw::c_void;

lazy_static! {
    /// The process-wide redzone index.
    static ref REDZONES: Mutex<IntervalTree> = Mutex::new(IntervalTree::new());
}

/// Query whether `[addr, addr + width)` currently overlaps a registered
/// redzone, without aborting. This is the probe primitive behind
/// [`rz_check`]; it is exposed for host-side tests and tooling.
pub fn is_poisoned(addr: u64, width: u8) -> bool {
    REDZONES.lock().check(addr, width)
}

/// Number of currently registered redzones. Test/tooling helper.
pub fn live_redzone_count() -> usize {
    REDZONES.lock().len()
}

/// Link-sanity no-op.
///
/// The sanitizer emits exactly one call to this symbol in the first defined
/// function it transforms. If the runtime is missing at link time this is
/// the symbol the linker reports.
#[no_mangle]
pub extern "C" fn rt_probe() {}

/// Register the redzone `[start, start + size)`.
#[no_mangle]
pub unsafe extern "C" fn rz_add(start: *const c_void, size: u64) {
    log::trace!("rz_add {:p} +{}", start, size);
    REDZONES.lock().insert(start as u64, size);
}

/// Deregister the redzone starting exactly at `start`; no-op if absent.
#[no_mangle]
pub unsafe extern "C" fn rz_rm(start: *const c_void) {
    log::trace!("rz_rm {:p}", start);
    REDZONES.lock().remove(start as u64);
}

/// Check an access of `op_width` bytes at `probe`. Aborts the process on a
/// redzone hit.
#[no_mangle]
pub unsafe extern "C" fn rz_check(probe: *const c_void, op_width: u8) {
    if REDZONES.lock().check(probe as u64, op_width) {
        eprintln!("ILLEGAL ACCESS AT {:p}", probe);
        libc::kill(libc::getpid(), libc::SIGABRT);
    }
}

/// Deregister every redzone inside a heap block being freed.
///
/// The block extent is recovered from the allocator's usable-size query, so
/// this works for the plain `free(ptr)` signature with no size argument.
#[no_mangle]
pub unsafe extern "C" fn rz_heap_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let size = allocated_block_size(ptr);
    log::trace!("rz_heap_free {:p} +{}", ptr, size);
    if size == 0 {
        REDZONES.lock().remove(ptr as u64);
        return;
    }
    REDZONES.lock().remove_range(ptr as u64, ptr as u64 + size);
}

/// Deregister every redzone whose start lies in `[ptr, ptr + size]`.
/// Explicit-range variant of [`rz_heap_free`] for sized deallocators and
/// tests.
#[no_mangle]
pub unsafe extern "C" fn rz_rm_between(ptr: *const c_void, size: usize) {
    if size == 0 {
        REDZONES.lock().remove(ptr as u64);
        return;
    }
    REDZONES
        .lock()
        .remove_range(ptr as u64, ptr as u64 + size as u64);
}

/// Drop all registered redzones. Test utility.
#[no_mangle]
pub extern "C" fn rz_reset() {
    REDZONES.lock().reset();
}

/// Print the current index to standard output. Test utility.
#[no_mangle]
pub extern "C" fn rz_debug_print() {
    println!("{}", REDZONES.lock().render());
}

#[cfg(target_os = "linux")]
unsafe fn allocated_block_size(ptr: *mut c_void) -> u64 {
    libc::malloc_usable_size(ptr) as u64
}

#[cfg(target_os = "macos")]
unsafe fn allocated_block_size(ptr: *mut c_void) -> u64 {
    libc::malloc_size(ptr) as u64
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
unsafe fn allocated_block_size(_ptr: *mut c_void) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    lazy_static! {
        // The redzone index is process-global; tests touching it must not
        // interleave.
        static ref TEST_GUARD: Mutex<()> = Mutex::new(());
    }

    #[test]
    fn test_add_check_rm() {
        let _guard = TEST_GUARD.lock();
        rz_reset();

        unsafe {
            rz_add(0x4000 as *const c_void, 1);
            assert!(is_poisoned(0x4000, 1));
            assert!(!is_poisoned(0x4001, 1));
            // A wide read just below the redzone reaches into it
            assert!(is_poisoned(0x3ff9, 8));

            rz_rm(0x4000 as *const c_void);
            assert!(!is_poisoned(0x4000, 1));
        }
    }

    #[test]
    fn test_rm_between() {
        let _guard = TEST_GUARD.lock();
        rz_reset();

        unsafe {
            rz_add(0x400000 as *const c_void, 32);
            rz_add(0x400100 as *const c_void, 32);
            rz_add(0x400200 as *const c_void, 32);
            rz_add(0x400300 as *const c_void, 32);
            rz_add(0x400400 as *const c_void, 32);
            rz_rm_between(0x400180 as *const c_void, 0x27f);

            assert!(is_poisoned(0x400000, 1));
            assert!(!is_poisoned(0x400200, 1));
            assert!(!is_poisoned(0x400210, 1));
            assert!(!is_poisoned(0x400300, 1));
            assert!(!is_poisoned(0x400310, 1));
            assert!(is_poisoned(0x400400, 1));
            assert!(is_poisoned(0x400410, 1));
        }

        rz_reset();
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn test_heap_free_deregisters_block_redzones() {
        let _guard = TEST_GUARD.lock();
        rz_reset();

        unsafe {
            // A real allocation so the usable-size query has something to
            // measure. Redzones registered inside the block must disappear
            // when it is freed; ones outside must survive.
            let block = libc::malloc(64);
            assert!(!block.is_null());
            let base = block as u64;

            rz_add(block as *const c_void, 1);
            rz_add((base + 13) as *const c_void, 1);
            rz_add(0x700000 as *const c_void, 1);

            rz_heap_free(block);
            libc::free(block);

            assert!(!is_poisoned(base, 1));
            assert!(!is_poisoned(base + 13, 1));
            assert!(is_poisoned(0x700000, 1));
        }

        rz_reset();
    }

    #[test]
    fn test_reset_and_count() {
        let _guard = TEST_GUARD.lock();
        rz_reset();

        unsafe {
            rz_add(0x1000 as *const c_void, 1);
            rz_add(0x2000 as *const c_void, 1);
        }
        assert_eq!(live_redzone_count(), 2);
        rz_reset();
        assert_eq!(live_redzone_count(), 0);
    }
}
