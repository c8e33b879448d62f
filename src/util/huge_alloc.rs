use std::ptr;

use libc::*;

use crate::util::likely::*;

const HUGE_PAGE_SIZE: usize = 1 << 21;

/// Memory policy for mbind(2). The libc crate does not carry the
/// mempolicy constants, so the one needed here is defined locally.
const MPOL_PREFERRED: c_int = 1;

/// A raw memory reservation, hugepage-backed when the system allows it,
/// with its pages preferentially placed on the configured NUMA node.
pub(crate) struct HugeAlloc {
    pub ptr: *mut u8,
    pub len: usize,

    /// Reservations fall back to `posix_memalign` when mmap fails; those
    /// are returned with `free` instead of `munmap`.
    from_mmap: bool,
}

unsafe impl Send for HugeAlloc {}
unsafe impl Sync for HugeAlloc {}

impl Drop for HugeAlloc {
    fn drop(&mut self) {
        // SAFETY: FFI; `ptr` and `len` are exactly what allocation returned.
        unsafe {
            if likely(self.from_mmap) {
                assert!(
                    munmap(self.ptr as *mut c_void, self.len) == 0,
                    "munmap failed"
                );
            } else {
                free(self.ptr as *mut c_void);
            }
        }
    }
}

/// Map `len` bytes of anonymous read-write memory, or `None` on failure.
#[inline]
fn mmap_anonymous(len: usize, extra_flags: c_int) -> Option<*mut u8> {
    // SAFETY: FFI.
    let ptr = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };
    (ptr != MAP_FAILED).then_some(ptr as *mut u8)
}

/// Prefer `numa_node` for the pages of `[ptr, ptr + len)`. Pages are placed
/// on first touch, so the policy must be installed before the region is
/// written. Placement is best-effort: a failure costs remote memory
/// accesses, not correctness.
fn bind_to_node(ptr: *mut u8, len: usize, numa_node: usize) {
    if unlikely(numa_node >= c_ulong::BITS as usize) {
        log::warn!("NUMA node {} out of nodemask range, not binding", numa_node);
        return;
    }
    let nodemask: c_ulong = 1 << numa_node;

    // SAFETY: FFI; the region was just mapped and is not yet touched.
    // mbind has no glibc wrapper, so go through syscall(2).
    let ret = unsafe {
        syscall(
            SYS_mbind,
            ptr as *mut c_void,
            len as c_ulong,
            MPOL_PREFERRED,
            &nodemask as *const c_ulong,
            c_ulong::BITS as c_ulong,
            0 as c_uint,
        )
    };
    if unlikely(ret != 0) {
        log::warn!(
            "failed to bind {}MB to NUMA node {}; performance can be low",
            len >> 20,
            numa_node
        );
    }
}

/// Allocate raw memory rounded up to hugepage granularity, preferring
/// hugepages on the given NUMA node. Falls back to normal pages, then to
/// `posix_memalign`, warning at each step down.
pub(crate) fn alloc_raw(len: usize, numa_node: usize) -> HugeAlloc {
    let len = (len + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1);

    if let Some(ptr) = mmap_anonymous(len, MAP_HUGETLB) {
        bind_to_node(ptr, len, numa_node);
        return HugeAlloc {
            ptr,
            len,
            from_mmap: true,
        };
    }
    log::warn!(
        "failed to mmap {}MB of hugepages, trying normal pages; performance can be low",
        len >> 20
    );

    if let Some(ptr) = mmap_anonymous(len, 0) {
        bind_to_node(ptr, len, numa_node);
        return HugeAlloc {
            ptr,
            len,
            from_mmap: true,
        };
    }
    log::warn!("failed to mmap {}MB of normal pages, trying posix_memalign", len >> 20);

    let mut ptr = ptr::null_mut();
    // SAFETY: FFI.
    let ret = unsafe { posix_memalign(&mut ptr, 1 << 12, len) };
    assert!(ret == 0, "failed to allocate {}MB of memory", len >> 20);
    HugeAlloc {
        ptr: ptr as _,
        len,
        from_mmap: false,
    }
}
