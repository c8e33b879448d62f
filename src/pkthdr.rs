use std::{fmt, mem};

use bitvec::{field::BitField, prelude as bv};
use paste::paste;

use crate::type_alias::*;

macro_rules! impl_accessor {
    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr, $setter:tt, $getter:tt) => {
        #[inline(always)]
        pub fn $setter(&mut self, val: $field_ty) {
            self.bits[$lsb..=$msb].store_le::<$integral_ty>(val as $integral_ty);
        }

        #[inline(always)]
        pub fn $getter(&self) -> $field_ty {
            self.bits[$lsb..=$msb].load_le::<$integral_ty>().into()
        }
    };

    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            impl_accessor!(
                $field,
                $field_ty,
                $integral_ty,
                $lsb,
                $msb,
                [< set_ $field >],
                $field
            );
        }
    };

    ($field:ident, $field_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            impl_accessor!(
                $field,
                $field_ty,
                $field_ty,
                $lsb,
                $msb,
                [< set_ $field >],
                $field
            );
        }
    };
}

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PktType {
    /// Request data.
    Req = 0,

    /// Request for response.
    Rfr = 1,

    /// Explicit credit return.
    ExplCR = 2,

    /// Response data.
    Resp = 3,

    /// Session management payload carried on the datapath.
    Sm = 4,
}

impl From<u8> for PktType {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Req,
            1 => Self::Rfr,
            2 => Self::ExplCR,
            3 => Self::Resp,
            4 => Self::Sm,

            // Only reachable for headers that passed `check_magic()`; the
            // receive path drops everything else before decoding.
            _ => unreachable!("invalid packet type {}", val),
        }
    }
}

/// Wire-stable magic marking a valid packet header.
pub(crate) const PKTHDR_MAGIC: u8 = 0xA7;

/// Packet header, 16-bytes.
///
/// # Layout
///
/// | Lsb | Msb |     Name     |
/// | --: | --: | ------------ |
/// |   0 |   7 | req_type     |
/// |   8 |  31 | msg_size     |
/// |  32 |  47 | dst_sess_id  |
/// |  48 |  50 | pkt_type     |
/// |  51 |  63 | pkt_num      |
/// |  64 | 103 | req_num      |
/// | 104 | 111 | src_rpc_id   |
/// | 112 | 119 | dst_rpc_id   |
/// | 120 | 127 | magic        |
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct PacketHeader {
    bits: bv::BitArr!(for 128),
}

impl PacketHeader {
    impl_accessor!(req_type, ReqType, 0, 7);
    impl_accessor!(msg_size, u32, 8, 31);
    impl_accessor!(dst_sess_id, SessId, 32, 47);
    impl_accessor!(pkt_type, PktType, u8, 48, 50);
    impl_accessor!(pkt_num, PktNum, 51, 63);
    impl_accessor!(req_num, ReqNum, 64, 103);
    impl_accessor!(src_rpc_id, RpcId, 104, 111);
    impl_accessor!(dst_rpc_id, RpcId, 112, 119);
    impl_accessor!(magic, u8, 120, 127);

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        req_type: ReqType,
        msg_size: u32,
        dst_sess_id: SessId,
        pkt_type: PktType,
        pkt_num: PktNum,
        req_num: ReqNum,
        src_rpc_id: RpcId,
        dst_rpc_id: RpcId,
    ) -> Self {
        let mut this = Self::default();
        this.set_req_type(req_type);
        this.set_msg_size(msg_size);
        this.set_dst_sess_id(dst_sess_id);
        this.set_pkt_type(pkt_type);
        this.set_pkt_num(pkt_num);
        this.set_req_num(req_num);
        this.set_src_rpc_id(src_rpc_id);
        this.set_dst_rpc_id(dst_rpc_id);
        this.set_magic(PKTHDR_MAGIC);
        this
    }

    /// Return `true` iff the header carries the wire magic and a decodable
    /// packet type. Headers failing this check are dropped undecoded.
    #[inline(always)]
    pub fn check_magic(&self) -> bool {
        self.magic() == PKTHDR_MAGIC && self.bits[48..=50].load_le::<u8>() <= PktType::Sm as u8
    }
}

impl fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketHeader")
            .field("req_type", &self.req_type())
            .field("msg_size", &self.msg_size())
            .field("dst_sess_id", &self.dst_sess_id())
            .field("pkt_type", &self.pkt_type())
            .field("pkt_num", &self.pkt_num())
            .field("req_num", &self.req_num())
            .field("src_rpc_id", &self.src_rpc_id())
            .field("dst_rpc_id", &self.dst_rpc_id())
            .finish()
    }
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self {
            bits: bv::bitarr![0u8; mem::size_of::<PacketHeader>() * 8],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkthdr_layout() {
        assert_eq!(mem::size_of::<PacketHeader>(), 16);
    }

    #[test]
    fn test_pkthdr_roundtrip() {
        let hdr = PacketHeader::new(42, (1 << 24) - 1, 0xBEEF, PktType::Resp, 8191, 77, 3, 250);
        assert_eq!(hdr.req_type(), 42);
        assert_eq!(hdr.msg_size(), (1 << 24) - 1);
        assert_eq!(hdr.dst_sess_id(), 0xBEEF);
        assert_eq!(hdr.pkt_type(), PktType::Resp);
        assert_eq!(hdr.pkt_num(), 8191);
        assert_eq!(hdr.req_num(), 77);
        assert_eq!(hdr.src_rpc_id(), 3);
        assert_eq!(hdr.dst_rpc_id(), 250);
        assert!(hdr.check_magic());
    }

    #[test]
    fn test_pkthdr_rejects_garbage() {
        let hdr = PacketHeader::default();
        assert!(!hdr.check_magic());
    }
}
