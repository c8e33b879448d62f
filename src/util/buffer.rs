use std::ptr::NonNull;
use std::sync::Arc;

use crate::transport::LKey;
use crate::util::buddy::BuddyAllocator;

/// A piece of transport-registered memory handed out by the buddy allocator.
pub(crate) struct Buffer {
    /// Start address of the buffer.
    buf: NonNull<u8>,

    /// Length of the buffer.
    len: usize,

    /// Memory handle.
    lkey: LKey,

    /// Allocator that owns this buffer, if any.
    owner: Option<Arc<BuddyAllocator>>,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// A real buffer that will be returned to its allocator when dropped.
    #[inline]
    pub fn real(owner: Arc<BuddyAllocator>, buf: NonNull<u8>, len: usize, lkey: LKey) -> Self {
        Self {
            buf,
            len,
            lkey,
            owner: Some(owner),
        }
    }

    /// A fake buffer that only serves to record a LKey, and does nothing when dropped.
    #[inline]
    pub fn fake(lkey: LKey) -> Self {
        Self {
            buf: NonNull::dangling(),
            len: 0,
            lkey,
            owner: None,
        }
    }

    /// Get the start address of the buffer.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// Get the length of the buffer.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the memory handle of the buffer.
    #[inline(always)]
    pub fn lkey(&self) -> LKey {
        self.lkey
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            // Return the buffer to the allocator.
            owner.free(self);
        }
    }
}
