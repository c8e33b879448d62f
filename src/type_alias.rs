//! Type aliases used in this library.

/// [`u8`]: Rpc endpoint identifier.
/// Note that this type distinguishes `Rpc` instances (control-plane), not RPC requests (data-plane).
pub type RpcId = u8;

/// [`u16`]: Session identifier.
pub type SessId = u16;

/// [`u8`]: Request type identifier.
pub type ReqType = u8;

/// [`u64`] (40 bits valid on the wire): Request number within a session slot.
pub(crate) type ReqNum = u64;

/// [`u16`] (13 bits valid on the wire): Packet number within an RPC's wire sequence.
pub(crate) type PktNum = u16;

/// [`usize`]: Endpoint thread ID assigned by the Nexus's thread registry.
pub type ETid = usize;

/// The endpoint thread ID that means "no background thread": run inline on dispatch.
pub const INVALID_BG_ETID: ETid = usize::MAX;
