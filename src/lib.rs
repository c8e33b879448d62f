//! An RPC runtime datapath over unreliable packet transports.
//!
//! One [`Rpc`] endpoint per dispatch thread owns a polling event loop that
//! drains the receive ring, runs per-session credit-based flow control,
//! paces transmissions through a timing wheel, reassembles multi-packet
//! messages in place, detects packet loss, and hands work to background
//! threads. Session management runs over a UDP side channel owned by the
//! process-wide [`Nexus`].

mod cc;
mod handler;
mod msgbuf;
mod nexus;
mod pkthdr;
mod rpc;
mod session;
mod transport;
pub mod type_alias;
mod util;

pub use self::handler::{ReqFuncKind, ReqHandle, RespHandle};
pub use self::msgbuf::MsgBuf;
pub use self::nexus::{Nexus, SmErr, SmEventKind, SmHandler};
pub use self::rpc::{DpathStats, Error, PktLossStats, Rpc};
pub use self::transport::{LKey, TxItem, UdpTransport, UnreliableTransport};

#[cfg(test)]
mod tests;
