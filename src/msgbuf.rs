use std::ptr::NonNull;
use std::{cmp, mem, slice};

use crate::pkthdr::*;
use crate::transport::LKey;
use crate::util::{buffer::*, likely::*, math::*};

/// A message buffer: a contiguous region whose payload is surrounded by one
/// packet header per MTU's worth of data.
///
/// Layout: the zeroth packet header sits immediately before the payload;
/// headers for packets `1..max_pkts` follow the (8-byte-rounded) payload.
pub struct MsgBuf {
    /// Pointer to the first *application data* byte.
    data: NonNull<u8>,

    /// Max data bytes in the MsgBuf.
    max_len: usize,

    /// Valid data bytes in the MsgBuf.
    len: usize,

    /// Max number of packets in the MsgBuf.
    max_pkts: usize,

    /// Number of packets covering the current `len`.
    num_pkts: usize,

    /// Max data bytes in one packet of the owning transport.
    max_data_per_pkt: usize,

    /// Backing buffer.
    buffer: Buffer,
}

unsafe impl Send for MsgBuf {}
unsafe impl Sync for MsgBuf {}

/// Return the number of packets required for `data_size` bytes of data.
/// Zero-sized messages still occupy one packet.
#[inline(always)]
pub(crate) const fn data_size_to_num_pkts(data_size: usize, max_data_per_pkt: usize) -> usize {
    if data_size <= max_data_per_pkt {
        1
    } else {
        (data_size + max_data_per_pkt - 1) / max_data_per_pkt
    }
}

/// Protected methods.
impl MsgBuf {
    /// Create a new MsgBuf on an owned buffer.
    pub(crate) fn owned(buf: Buffer, data_len: usize, max_data_per_pkt: usize) -> Self {
        let max_pkts = data_size_to_num_pkts(data_len, max_data_per_pkt);

        let overall_len = mem::size_of::<PacketHeader>()
            + roundup(data_len, 8)
            + (max_pkts - 1) * mem::size_of::<PacketHeader>();
        assert!(
            overall_len <= buf.len(),
            "buffer too small: {} < {}",
            buf.len(),
            overall_len
        );

        Self {
            // SAFETY: guaranteed not null; the zeroth header precedes the data.
            data: unsafe { NonNull::new_unchecked(buf.as_ptr().add(mem::size_of::<PacketHeader>())) },
            max_pkts,
            max_len: data_len,
            len: data_len,
            num_pkts: max_pkts,
            max_data_per_pkt,
            buffer: buf,
        }
    }

    /// Create a new MsgBuf aliasing a not-owned region (e.g., RX ring bytes).
    ///
    /// # Safety
    ///
    /// The pointer must reference a valid `PacketHeader` placed right before
    /// `len` bytes of application data.
    pub(crate) unsafe fn borrowed(hdr: NonNull<u8>, len: usize, lkey: LKey) -> Self {
        Self {
            data: NonNull::new_unchecked(hdr.as_ptr().add(mem::size_of::<PacketHeader>())),
            max_pkts: 1,
            max_len: len,
            len,
            num_pkts: 1,
            max_data_per_pkt: len.max(1),
            buffer: Buffer::fake(lkey),
        }
    }

    /// Create an invalid MsgBuf, returned when the allocator is exhausted.
    pub(crate) fn invalid() -> Self {
        Self {
            data: NonNull::dangling(),
            max_pkts: 0,
            max_len: 0,
            len: 0,
            num_pkts: 0,
            max_data_per_pkt: 1,
            buffer: Buffer::fake(0),
        }
    }

    /// Get a pointer to a packet header.
    #[inline]
    pub(crate) fn pkt_hdr(&self, pkt_idx: usize) -> *mut PacketHeader {
        debug_assert!(
            pkt_idx < self.max_pkts,
            "invalid packet index: max {}, got {}",
            self.max_pkts - 1,
            pkt_idx
        );

        // SAFETY: header & application data must be within the same allocated buffer.
        let hdr = unsafe {
            if likely(pkt_idx == 0) {
                self.data.as_ptr().sub(mem::size_of::<PacketHeader>())
            } else {
                self.data
                    .as_ptr()
                    .add(roundup(self.max_len, 8) + (pkt_idx - 1) * mem::size_of::<PacketHeader>())
            }
        };
        debug_assert!(
            (hdr as usize) % mem::align_of::<PacketHeader>() == 0,
            "misaligned header"
        );
        hdr as _
    }

    /// Get a pointer to the first data byte of a packet.
    #[inline(always)]
    pub(crate) fn pkt_data(&self, pkt_idx: usize) -> *mut u8 {
        // SAFETY: within the same allocated buffer.
        unsafe { self.data.as_ptr().add(pkt_idx * self.max_data_per_pkt) }
    }

    /// Get the data size of a packet at the current length.
    #[inline]
    pub(crate) fn pkt_data_size(&self, pkt_idx: usize) -> usize {
        debug_assert!(
            pkt_idx < self.num_pkts,
            "invalid packet index: max {}, got {}",
            self.num_pkts - 1,
            pkt_idx
        );

        let offset = pkt_idx * self.max_data_per_pkt;
        cmp::min(self.max_data_per_pkt, self.len - offset)
    }

    /// Get the wire size of a packet (header plus data).
    #[inline]
    pub(crate) fn pkt_size(&self, pkt_idx: usize) -> usize {
        mem::size_of::<PacketHeader>() + self.pkt_data_size(pkt_idx)
    }

    /// Get the memory handle of the packet buffer.
    #[inline(always)]
    pub(crate) fn lkey(&self) -> LKey {
        self.buffer.lkey()
    }
}

/// Public methods.
impl MsgBuf {
    /// Return `false` iff allocation failed for this MsgBuf.
    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.max_pkts != 0
    }

    /// Return a pointer to the first *application data* byte.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Return the length of application data.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return `true` iff the application data is empty.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the capacity of application data.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.max_len
    }

    /// Return the number of packets covering the current data length.
    #[inline(always)]
    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    /// Set the application data length of this message buffer.
    /// Packet headers are not modified.
    ///
    /// # Panics
    ///
    /// Panic if `len` is larger than the capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.max_len,
            "len {} > MsgBuf capacity {}",
            len,
            self.max_len
        );
        self.len = len;
        self.num_pkts = data_size_to_num_pkts(len, self.max_data_per_pkt);
    }

    /// View the application data as a `[u8]` slice.
    ///
    /// # Safety
    ///
    /// This method has the same safety requirements as [`std::slice::from_raw_parts()`].
    #[inline(always)]
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.data.as_ptr(), self.len)
    }

    /// View the application data as a mutable `[u8]` slice.
    ///
    /// # Safety
    ///
    /// This method has the same safety requirements as [`std::slice::from_raw_parts_mut()`].
    #[inline(always)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.data.as_ptr(), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_pkts_math() {
        assert_eq!(data_size_to_num_pkts(0, 4096), 1);
        assert_eq!(data_size_to_num_pkts(1, 4096), 1);
        assert_eq!(data_size_to_num_pkts(4096, 4096), 1);
        assert_eq!(data_size_to_num_pkts(4097, 4096), 2);
        assert_eq!(data_size_to_num_pkts(16384, 4096), 4);
    }
}
