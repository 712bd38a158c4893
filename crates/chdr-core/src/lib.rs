//! chdr-core: CHDR packet codec, side-protocol wire types, register map
//! and configuration. Pure and I/O free; every transport crate depends on it.

pub mod chdr;
pub mod config;
pub mod payload;
pub mod regs;
pub mod wire;

pub use chdr::{
    ChdrCodec, ChdrError, ChdrHeader, ChdrPacket, ChdrPayload, ChdrWidth, Endianness, PacketType,
};
pub use payload::{
    CtrlOpCode, CtrlPayload, CtrlStatus, MgmtHop, MgmtOp, MgmtOpCode, MgmtPayload, NodeInfo,
    StrcOpCode, StrcPayload, StrsPayload, StrsStatus,
};
