use std::collections::VecDeque;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::ptr::NonNull;

use super::{MemRegistrar, TxItem, UnreliableTransport};
use crate::msgbuf::MsgBuf;
use crate::pkthdr::PacketHeader;
use crate::util::{huge_alloc::*, likely::*};

/// Received but unreturned packet metadata.
struct RxItem {
    /// Receive ring index.
    idx: u16,

    /// Wire length in bytes, including the packet header.
    len: u16,
}

/// Kernel-UDP transport.
///
/// Stands in for a polled NIC transport: unreliable, unordered under loss,
/// datagram-per-packet. The receive ring is a preallocated hugepage-backed
/// array of MTU-sized units recycled through `rx_release`, mirroring how a
/// NIC transport reposts RECVs.
pub struct UdpTransport {
    /// The non-blocking datapath socket.
    socket: UdpSocket,

    /// Advertised endpoint address.
    local_ep: SocketAddr,

    /// Receive ring memory.
    rx_buf: HugeAlloc,

    /// Ring entries available for incoming packets.
    rx_free: VecDeque<u16>,

    /// Received packets not yet fetched by `rx_next`.
    rx_ready: VecDeque<RxItem>,

    /// Scratch space for assembling one outgoing datagram.
    tx_scratch: Vec<u8>,
}

const CACHELINE_SIZE: usize = 64;

impl UdpTransport {
    /// Allocation size of one receive ring unit, cacheline-aligned.
    const RX_UNIT_ALLOC_SIZE: usize =
        (Self::MTU + CACHELINE_SIZE - 1) & !(CACHELINE_SIZE - 1);

    const RQ_POLL_BATCH: usize = 16;

    /// Nominal loopback/link bandwidth: 10 Gbps.
    const LINK_BANDWIDTH: usize = 10_000_000_000 / 8;

    /// Get the offset of the `i`-th receive unit in the ring buffer.
    #[inline(always)]
    const fn rx_offset(i: usize) -> usize {
        i * Self::RX_UNIT_ALLOC_SIZE
    }

    /// Detect the address this host is reachable at. Falls back to loopback
    /// when no route is available (e.g., offline test machines).
    fn detect_local_ip() -> IpAddr {
        let probe = match UdpSocket::bind("0.0.0.0:0") {
            Ok(s) => s,
            Err(_) => return IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        match probe
            .connect("8.8.8.8:53")
            .and_then(|_| probe.local_addr())
        {
            Ok(addr) if !addr.ip().is_unspecified() => addr.ip(),
            _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl UnreliableTransport for UdpTransport {
    type Endpoint = SocketAddr;
    type Peer = SocketAddr;

    const MTU: usize = 4096 + mem::size_of::<PacketHeader>();
    const MAX_DATA_PER_PKT: usize = 4096;
    const NUM_RX_RING_ENTRIES: usize = 2048;
    const POSTLIST: usize = 16;
    const UNSIG_BATCH: usize = 32;

    /// Create a new transport instance. The physical port index is accepted
    /// for interface parity with NIC transports and ignored by kernel UDP.
    fn new(_phy_port: u8) -> Self {
        let socket = UdpSocket::bind("0.0.0.0:0").expect("failed to bind datapath socket");
        socket
            .set_nonblocking(true)
            .expect("failed to make datapath socket non-blocking");

        let port = socket.local_addr().unwrap().port();
        let local_ep = SocketAddr::new(Self::detect_local_ip(), port);

        let rx_buf = alloc_raw(Self::NUM_RX_RING_ENTRIES * Self::RX_UNIT_ALLOC_SIZE, 0);
        let rx_free = (0..Self::NUM_RX_RING_ENTRIES as u16).collect();

        Self {
            socket,
            local_ep,
            rx_buf,
            rx_free,
            rx_ready: VecDeque::with_capacity(Self::RQ_POLL_BATCH),
            tx_scratch: vec![0u8; Self::MTU],
        }
    }

    #[inline]
    fn endpoint(&self) -> SocketAddr {
        self.local_ep
    }

    #[inline]
    fn resolve_peer(&mut self, ep: SocketAddr) -> Option<SocketAddr> {
        Some(ep)
    }

    fn mem_registrar(&self) -> MemRegistrar {
        // Kernel UDP needs no memory registration.
        Box::new(|_, _| 0)
    }

    #[inline]
    fn bandwidth(&self) -> usize {
        Self::LINK_BANDWIDTH
    }

    unsafe fn tx_burst(&mut self, items: &[TxItem<Self>]) {
        for item in items {
            if unlikely(item.drop) {
                continue;
            }

            // SAFETY: the caller ensures the item points to a valid MsgBuf.
            let msgbuf = &*item.msgbuf;
            let hdr_size = mem::size_of::<PacketHeader>();
            let data_size = msgbuf.pkt_data_size(item.pkt_idx);
            let wire_size = hdr_size + data_size;

            // The header and its payload are not contiguous for non-zero
            // packet indices, so gather them into the scratch datagram.
            std::ptr::copy_nonoverlapping(
                msgbuf.pkt_hdr(item.pkt_idx) as *const u8,
                self.tx_scratch.as_mut_ptr(),
                hdr_size,
            );
            std::ptr::copy_nonoverlapping(
                msgbuf.pkt_data(item.pkt_idx),
                self.tx_scratch.as_mut_ptr().add(hdr_size),
                data_size,
            );

            let peer = &*item.peer;
            // Socket-buffer overflow and peer-gone errors are packet loss to
            // the layer above, which retransmits.
            if let Err(e) = self.socket.send_to(&self.tx_scratch[..wire_size], peer) {
                log::trace!("UdpTransport: TX to {} dropped: {}", peer, e);
            }
        }
    }

    fn tx_flush(&mut self) {
        // Kernel UDP transmits synchronously; nothing is in flight here.
    }

    fn rx_burst(&mut self) -> usize {
        let mut n = 0;
        while n < Self::RQ_POLL_BATCH {
            let Some(&idx) = self.rx_free.front() else {
                // Ring exhausted; back-pressure until entries are released.
                break;
            };

            let offset = Self::rx_offset(idx as usize);
            // SAFETY: ring units are disjoint and within the allocation.
            let unit = unsafe {
                std::slice::from_raw_parts_mut(self.rx_buf.ptr.add(offset), Self::MTU)
            };

            match self.socket.recv_from(unit) {
                Ok((len, _src)) => {
                    if unlikely(len < mem::size_of::<PacketHeader>()) {
                        // Runt datagram; the ring unit stays free.
                        continue;
                    }
                    self.rx_free.pop_front();
                    self.rx_ready.push_back(RxItem {
                        idx,
                        len: len as u16,
                    });
                    n += 1;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("failed to receive datapath packet: {}", e),
            }
        }
        n
    }

    #[inline]
    fn rx_next(&mut self) -> Option<MsgBuf> {
        let RxItem { idx, len } = self.rx_ready.pop_front()?;
        let offset = Self::rx_offset(idx as usize);

        // SAFETY: pointer guaranteed not-null, within the ring allocation.
        let hdr = unsafe { NonNull::new_unchecked(self.rx_buf.ptr.add(offset)) };

        // Embed the ring index into the unused `lkey` so that release does
        // not need to recover it from the pointer.
        let data_len = len as usize - mem::size_of::<PacketHeader>();
        // SAFETY: the ring layout guarantees header-then-payload.
        Some(unsafe { MsgBuf::borrowed(hdr, data_len, idx as _) })
    }

    unsafe fn rx_release(&mut self, items: &[MsgBuf]) {
        for item in items {
            self.rx_free.push_back(item.lkey() as u16);
        }
    }
}
