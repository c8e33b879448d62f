use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::transport::{LKey, MemRegistrar};
use crate::util::{buffer::*, huge_alloc::*};

/// A buffer that represents a piece of unallocated memory in the buddy allocator.
///
/// This type does not contain any length information, as the place it resides in
/// should contain such information.
struct InBuddyBuffer {
    /// Start address of the buffer.
    buf: NonNull<u8>,

    /// Local key.
    lkey: LKey,
}

unsafe impl Send for InBuddyBuffer {}

impl InBuddyBuffer {
    /// Create a new buffer.
    #[inline(always)]
    fn new(buf: NonNull<u8>, lkey: LKey) -> Self {
        Self { buf, lkey }
    }

    /// Return a new buffer that starts at an offset to the current one.
    ///
    /// # Safety
    ///
    /// Same as [`pointer::add()`](https://doc.rust-lang.org/std/primitive.pointer.html#method.add).
    #[inline(always)]
    unsafe fn offset(&self, offset: usize) -> InBuddyBuffer {
        InBuddyBuffer {
            buf: NonNull::new_unchecked(self.buf.as_ptr().add(offset)),
            lkey: self.lkey,
        }
    }
}

/// The true buddy allocator, kept behind a mutex since background threads
/// may call allocation helpers.
struct BuddyAllocatorInner {
    /// Buddy system.
    buddy: [Vec<InBuddyBuffer>; BuddyAllocator::NUM_CLASSES],

    /// Allocated memory registry.
    #[allow(dead_code)]
    mem_registry: Vec<HugeAlloc>,

    /// Next allocation size.
    next_alloc: usize,

    /// NUMA node hint for raw reservations.
    numa_node: usize,

    /// Registers newly reserved memory with the transport.
    reg_fn: MemRegistrar,
}

impl BuddyAllocatorInner {
    /// Current buffer exhausted (for some size class allocation), so allocate new memory.
    #[cold]
    fn reserve_memory(&mut self) {
        let len = self.next_alloc;
        self.next_alloc *= 2;
        debug_assert!(len % BuddyAllocator::MAX_ALLOC_SIZE == 0);

        let mem = alloc_raw(len, self.numa_node);
        let lkey = (self.reg_fn)(mem.ptr, len);

        for i in 0..(len / BuddyAllocator::MAX_ALLOC_SIZE) {
            self.buddy[BuddyAllocator::NUM_CLASSES - 1].push(InBuddyBuffer::new(
                // SAFETY: guaranteed not null, within the same allocated memory buffer.
                unsafe { NonNull::new_unchecked(mem.ptr.add(i * BuddyAllocator::MAX_ALLOC_SIZE)) },
                lkey,
            ));
        }
        self.mem_registry.push(mem);
    }

    /// Return the size of a given class.
    #[inline]
    const fn size_of_class(class: usize) -> usize {
        BuddyAllocator::MIN_ALLOC_SIZE << class
    }

    /// Return the smallest class that can accommodate a given size.
    #[inline]
    const fn class_of(len: usize) -> usize {
        let len = len.next_power_of_two();
        if len < BuddyAllocator::MIN_ALLOC_SIZE {
            0
        } else {
            (len / BuddyAllocator::MIN_ALLOC_SIZE).trailing_zeros() as usize
        }
    }

    /// Split a buffer of the given class into two buffers of the next lower class.
    #[inline]
    fn split(&mut self, class: usize) {
        debug_assert!((1..BuddyAllocator::NUM_CLASSES).contains(&class));
        debug_assert!(!self.buddy[class].is_empty());

        let size_after_split = Self::size_of_class(class - 1);
        let buf1 = self.buddy[class].pop().unwrap();

        // SAFETY: guaranteed not null, within the same allocated memory buffer.
        let buf2 = unsafe { buf1.offset(size_after_split) };

        self.buddy[class - 1].push(buf1);
        self.buddy[class - 1].push(buf2);
    }

    /// Allocate a new buffer with at least the given length.
    fn alloc(&mut self, len: usize, owner: &Arc<BuddyAllocator>) -> Buffer {
        let class = Self::class_of(len);
        if self.buddy[class].is_empty() {
            let higher_class = ((class + 1)..BuddyAllocator::NUM_CLASSES)
                .find(|&c| !self.buddy[c].is_empty());
            let higher_class = higher_class.unwrap_or_else(|| {
                self.reserve_memory();
                BuddyAllocator::NUM_CLASSES - 1
            });

            debug_assert!(!self.buddy[higher_class].is_empty());
            for i in ((class + 1)..=higher_class).rev() {
                self.split(i);
            }
            debug_assert!(!self.buddy[class].is_empty());
        }
        let buf = self.buddy[class].pop().unwrap();
        Buffer::real(owner.clone(), buf.buf, Self::size_of_class(class), buf.lkey)
    }

    /// Free a buffer.
    /// This does not actually free the memory, but returns it to the buddy allocator.
    fn free(&mut self, buf: &Buffer) {
        let class = Self::class_of(buf.len());
        self.buddy[class].push(InBuddyBuffer::new(
            // SAFETY: `buf.as_ptr()` returns the raw pointer stored in `NonNull`.
            unsafe { NonNull::new_unchecked(buf.as_ptr()) },
            buf.lkey(),
        ));
    }
}

/// A buddy allocator that never combines buddies.
pub(crate) struct BuddyAllocator {
    inner: Mutex<BuddyAllocatorInner>,
}

impl BuddyAllocator {
    const MIN_ALLOC_SIZE: usize = 1 << 6;

    /// The maximum allocation size, 16MB.
    pub const MAX_ALLOC_SIZE: usize = 1 << 24;

    const NUM_CLASSES: usize =
        (Self::MAX_ALLOC_SIZE / Self::MIN_ALLOC_SIZE).trailing_zeros() as usize + 1;

    /// Create a new buddy allocator with no pre-allocation.
    /// Reserved memory is registered with the transport through `reg_fn`.
    pub fn new(numa_node: usize, reg_fn: MemRegistrar) -> Self {
        Self {
            inner: Mutex::new(BuddyAllocatorInner {
                buddy: Default::default(),
                mem_registry: Vec::new(),
                next_alloc: Self::MAX_ALLOC_SIZE,
                numa_node,
                reg_fn,
            }),
        }
    }

    /// Allocate a new buffer with at least the given length.
    /// Return `None` if the request exceeds the maximum allocation size.
    pub fn alloc(self: &Arc<Self>, len: usize) -> Option<Buffer> {
        if len > Self::MAX_ALLOC_SIZE {
            return None;
        }
        Some(self.inner.lock().unwrap().alloc(len, self))
    }

    /// Free a buffer.
    /// This does not actually free the memory, but returns it to the buddy allocator.
    pub fn free(&self, buf: &Buffer) {
        self.inner.lock().unwrap().free(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator() -> Arc<BuddyAllocator> {
        Arc::new(BuddyAllocator::new(0, Box::new(|_, _| 0)))
    }

    #[test]
    fn alloc_free_realloc() {
        let alloc = test_allocator();
        let buf = alloc.alloc(100).unwrap();
        assert!(buf.len() >= 100);

        let addr = buf.as_ptr();
        drop(buf);

        // The freed block is reused for an allocation of the same class.
        let buf = alloc.alloc(100).unwrap();
        assert_eq!(buf.as_ptr(), addr);
    }

    #[test]
    fn alloc_too_large() {
        let alloc = test_allocator();
        assert!(alloc.alloc(BuddyAllocator::MAX_ALLOC_SIZE + 1).is_none());
    }
}
