mod udp;

use serde::{de::DeserializeOwned, Serialize};

use crate::msgbuf::MsgBuf;

/// Memory region handle type.
pub type LKey = u32;

/// Registers raw memory with a transport so its buffers become usable for
/// TX/RX. Handed to the buddy allocator so that background threads can
/// allocate without touching the transport instance.
pub type MemRegistrar = Box<dyn Fn(*mut u8, usize) -> LKey + Send + Sync>;

/// An item to transmit.
pub struct TxItem<Tp: UnreliableTransport> {
    /// Peer for this packet.
    pub peer: *const Tp::Peer,

    /// Message buffer.
    pub msgbuf: *const MsgBuf,

    /// Index of this packet in the entire message.
    pub pkt_idx: usize,

    /// Where to record the TX timestamp for RTT measurement, or null.
    pub tx_ts: *mut u64,

    /// Silently discard this packet instead of sending it (fault injection).
    pub drop: bool,
}

/// Trait for generalized possibly-unreliable packet transports.
///
/// This trait is not fault-tolerant: datapath methods return success types
/// instead of `Result`s, and a transport that hits an unrecoverable error is
/// expected to panic. Recoverable packet loss is invisible here and handled
/// by the RPC layer's retransmission machinery.
pub trait UnreliableTransport: Sized + 'static {
    /// Endpoint information type, exchanged over the session-management
    /// channel as an opaque routing-info blob.
    /// Must not contain any data dependent on local resources.
    type Endpoint: Sized + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Peer information type, used for sending data.
    /// Can contain data dependent on local resources.
    type Peer: Sized + 'static;

    /// Maximum wire size of one packet, including the packet header.
    const MTU: usize;

    /// Maximum amount of application data in one packet.
    const MAX_DATA_PER_PKT: usize;

    /// Number of entries in the receive ring.
    const NUM_RX_RING_ENTRIES: usize;

    /// Maximum number of packets in one TX burst.
    const POSTLIST: usize;

    /// Packets per TX-completion signal; sizes the control-packet buffer ring.
    const UNSIG_BATCH: usize;

    /// Create a new transport instance bound to the given physical port.
    fn new(phy_port: u8) -> Self;

    /// Return the endpoint information representing this transport instance.
    fn endpoint(&self) -> Self::Endpoint;

    /// Construct a peer from the given endpoint information.
    /// Return `None` if the routing information cannot be resolved.
    fn resolve_peer(&mut self, ep: Self::Endpoint) -> Option<Self::Peer>;

    /// Return a closure that registers memory with this transport.
    fn mem_registrar(&self) -> MemRegistrar;

    /// Return the physical link bandwidth in bytes per second.
    fn bandwidth(&self) -> usize;

    /// Transmit a batch of packets.
    ///
    /// # Safety
    ///
    /// Every peer and message buffer pointed to by the items must be valid.
    unsafe fn tx_burst(&mut self, items: &[TxItem<Self>]);

    /// Block until all previously posted transmissions have left the NIC.
    fn tx_flush(&mut self);

    /// Receive a batch of packets.
    /// Return the number of packets received.
    fn rx_burst(&mut self) -> usize;

    /// Return the next received packet.
    fn rx_next(&mut self) -> Option<MsgBuf>;

    /// Mark received packets as released so their ring entries can be reused.
    ///
    /// # Safety
    ///
    /// - Only `MsgBuf`s returned by `rx_next` can be released.
    /// - Every `MsgBuf` must not be used after it is released.
    /// - Every `MsgBuf` must not be released more than once.
    unsafe fn rx_release(&mut self, items: &[MsgBuf]);
}

pub use udp::UdpTransport;
