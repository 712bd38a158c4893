//! Typed CHDR payloads: CONTROL, STREAM_STATUS, STREAM_COMMAND, MANAGEMENT.
//!
//! Each payload serializes to a sequence of 64-bit words. The codec decides
//! how those words land in the frame (contiguous for CTRL/STRS/STRC, padded
//! to the word width for MGMT) and which byte order each lane uses.

use std::fmt;

use crate::chdr::{ChdrError, ChdrWidth};

// ── Bit helpers ───────────────────────────────────────────────────────────────

#[inline]
fn get(word: u64, offset: u32, width: u32) -> u64 {
    (word >> offset) & mask(width)
}

#[inline]
fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[inline]
fn put(value: u64, offset: u32) -> u64 {
    value << offset
}

/// Reject `value` if it does not fit in `width` bits.
fn fits(field: &'static str, value: u64, width: u32) -> Result<u64, ChdrError> {
    let max = mask(width);
    if value > max {
        return Err(ChdrError::FieldOutOfRange { field, value, max });
    }
    Ok(value)
}

fn short(kind: &'static str, need: usize, have: usize) -> ChdrError {
    ChdrError::MalformedPayload {
        kind,
        reason: format!("need {need} words, have {have}"),
    }
}

// ── CONTROL ───────────────────────────────────────────────────────────────────

/// Maximum number of 32-bit data words a control transaction may carry.
pub const CTRL_MAX_DATA_WORDS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtrlOpCode {
    Sleep,
    Write,
    Read,
    ReadWrite,
    BlockWrite,
    BlockRead,
    Poll,
    /// Vendor-defined opcodes 0xA..=0xF.
    User(u8),
}

impl From<CtrlOpCode> for u8 {
    fn from(op: CtrlOpCode) -> u8 {
        match op {
            CtrlOpCode::Sleep => 0,
            CtrlOpCode::Write => 1,
            CtrlOpCode::Read => 2,
            CtrlOpCode::ReadWrite => 3,
            CtrlOpCode::BlockWrite => 4,
            CtrlOpCode::BlockRead => 5,
            CtrlOpCode::Poll => 6,
            CtrlOpCode::User(code) => code,
        }
    }
}

impl TryFrom<u8> for CtrlOpCode {
    type Error = ChdrError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CtrlOpCode::Sleep),
            1 => Ok(CtrlOpCode::Write),
            2 => Ok(CtrlOpCode::Read),
            3 => Ok(CtrlOpCode::ReadWrite),
            4 => Ok(CtrlOpCode::BlockWrite),
            5 => Ok(CtrlOpCode::BlockRead),
            6 => Ok(CtrlOpCode::Poll),
            0xA..=0xF => Ok(CtrlOpCode::User(value)),
            other => Err(ChdrError::UnknownOpcode {
                kind: "control",
                value: other,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CtrlStatus {
    #[default]
    Okay,
    CommandError,
    TimestampError,
    Warning,
}

impl CtrlStatus {
    fn from_bits(bits: u64) -> Self {
        match bits & 0x3 {
            0 => CtrlStatus::Okay,
            1 => CtrlStatus::CommandError,
            2 => CtrlStatus::TimestampError,
            _ => CtrlStatus::Warning,
        }
    }

    fn bits(self) -> u64 {
        match self {
            CtrlStatus::Okay => 0,
            CtrlStatus::CommandError => 1,
            CtrlStatus::TimestampError => 2,
            CtrlStatus::Warning => 3,
        }
    }
}

/// Register-access transaction carried in a CONTROL packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlPayload {
    /// Sub-address within the destination endpoint (10 bits).
    pub dst_port: u16,
    /// Sub-address within the source endpoint (10 bits).
    pub src_port: u16,
    /// Transaction sequence number (6 bits).
    pub seq_num: u8,
    pub timestamp: Option<u64>,
    pub is_ack: bool,
    pub src_epid: u16,
    /// Register address (20 bits).
    pub address: u32,
    /// 1..=15 data words.
    pub data: Vec<u32>,
    /// Byte-enable mask (4 bits).
    pub byte_enable: u8,
    pub op_code: CtrlOpCode,
    pub status: CtrlStatus,
}

impl Default for CtrlPayload {
    fn default() -> Self {
        Self {
            dst_port: 0,
            src_port: 0,
            seq_num: 0,
            timestamp: None,
            is_ack: false,
            src_epid: 0,
            address: 0,
            data: vec![0],
            byte_enable: 0xF,
            op_code: CtrlOpCode::Sleep,
            status: CtrlStatus::Okay,
        }
    }
}

impl CtrlPayload {
    /// Number of 64-bit words this payload occupies on the wire.
    pub fn word_count(&self) -> usize {
        let data_words = self.data.len().saturating_sub(1).div_ceil(2);
        2 + usize::from(self.timestamp.is_some()) + data_words
    }

    pub fn serialize(&self) -> Result<Vec<u64>, ChdrError> {
        if self.data.is_empty() || self.data.len() > CTRL_MAX_DATA_WORDS {
            return Err(ChdrError::FieldOutOfRange {
                field: "ctrl.num_data",
                value: self.data.len() as u64,
                max: CTRL_MAX_DATA_WORDS as u64,
            });
        }

        let mut words = Vec::with_capacity(self.word_count());
        let header = put(fits("ctrl.dst_port", self.dst_port.into(), 10)?, 0)
            | put(fits("ctrl.src_port", self.src_port.into(), 10)?, 10)
            | put(self.data.len() as u64, 20)
            | put(fits("ctrl.seq_num", self.seq_num.into(), 6)?, 24)
            | put(u64::from(self.timestamp.is_some()), 30)
            | put(u64::from(self.is_ack), 31)
            | put(self.src_epid.into(), 32);
        words.push(header);

        if let Some(ts) = self.timestamp {
            words.push(ts);
        }

        let op_word = put(fits("ctrl.address", self.address.into(), 20)?, 0)
            | put(fits("ctrl.byte_enable", self.byte_enable.into(), 4)?, 20)
            | put(u64::from(u8::from(self.op_code)), 24)
            | put(self.status.bits(), 30)
            | put(self.data[0].into(), 32);
        words.push(op_word);

        for pair in self.data[1..].chunks(2) {
            let lo = u64::from(pair[0]);
            let hi = pair.get(1).copied().map(u64::from).unwrap_or(0);
            words.push(lo | (hi << 32));
        }

        Ok(words)
    }

    pub fn deserialize(words: &[u64]) -> Result<Self, ChdrError> {
        let header = *words.first().ok_or_else(|| short("control", 2, 0))?;

        let num_data = get(header, 20, 4) as usize;
        if num_data == 0 {
            return Err(ChdrError::MalformedPayload {
                kind: "control",
                reason: "zero data words".into(),
            });
        }
        let has_time = get(header, 30, 1) == 1;

        let mut idx = 1;
        let timestamp = if has_time {
            let ts = *words.get(idx).ok_or_else(|| short("control", 3, words.len()))?;
            idx += 1;
            Some(ts)
        } else {
            None
        };

        let expected = idx + 1 + (num_data - 1).div_ceil(2);
        if words.len() < expected {
            return Err(short("control", expected, words.len()));
        }

        let op_word = words[idx];
        idx += 1;

        let mut data = Vec::with_capacity(num_data);
        data.push(get(op_word, 32, 32) as u32);
        while data.len() < num_data {
            let word = words[idx];
            idx += 1;
            data.push(word as u32);
            if data.len() < num_data {
                data.push((word >> 32) as u32);
            }
        }

        Ok(Self {
            dst_port: get(header, 0, 10) as u16,
            src_port: get(header, 10, 10) as u16,
            seq_num: get(header, 24, 6) as u8,
            timestamp,
            is_ack: get(header, 31, 1) == 1,
            src_epid: get(header, 32, 16) as u16,
            address: get(op_word, 0, 20) as u32,
            data,
            byte_enable: get(op_word, 20, 4) as u8,
            op_code: CtrlOpCode::try_from(get(op_word, 24, 4) as u8)?,
            status: CtrlStatus::from_bits(get(op_word, 30, 2)),
        })
    }
}

impl fmt::Display for CtrlPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ctrl {:?} addr=0x{:05x} data={:x?} seq={} ack={} src_epid={} status={:?}",
            self.op_code, self.address, self.data, self.seq_num, self.is_ack, self.src_epid, self.status
        )
    }
}

// ── STREAM_STATUS ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum StrsStatus {
    #[default]
    Okay = 0,
    CommandError = 1,
    SequenceError = 2,
    DataError = 3,
    RoutingError = 4,
}

impl TryFrom<u8> for StrsStatus {
    type Error = ChdrError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StrsStatus::Okay),
            1 => Ok(StrsStatus::CommandError),
            2 => Ok(StrsStatus::SequenceError),
            3 => Ok(StrsStatus::DataError),
            4 => Ok(StrsStatus::RoutingError),
            other => Err(ChdrError::UnknownOpcode {
                kind: "stream status",
                value: other,
            }),
        }
    }
}

/// Flow-control feedback from a stream consumer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StrsPayload {
    pub src_epid: u16,
    pub status: StrsStatus,
    /// 40 bits.
    pub capacity_bytes: u64,
    /// 24 bits.
    pub capacity_pkts: u32,
    /// 40 bits.
    pub xfer_count_pkts: u64,
    pub xfer_count_bytes: u64,
    pub buff_info: u16,
    /// 48 bits.
    pub status_info: u64,
}

impl StrsPayload {
    pub const WORDS: usize = 4;

    pub fn serialize(&self) -> Result<Vec<u64>, ChdrError> {
        Ok(vec![
            put(self.src_epid.into(), 0)
                | put(self.status as u64, 16)
                | put(fits("strs.capacity_bytes", self.capacity_bytes, 40)?, 24),
            put(fits("strs.capacity_pkts", self.capacity_pkts.into(), 24)?, 0)
                | put(fits("strs.xfer_count_pkts", self.xfer_count_pkts, 40)?, 24),
            self.xfer_count_bytes,
            put(self.buff_info.into(), 0) | put(fits("strs.status_info", self.status_info, 48)?, 16),
        ])
    }

    pub fn deserialize(words: &[u64]) -> Result<Self, ChdrError> {
        if words.len() < Self::WORDS {
            return Err(short("stream status", Self::WORDS, words.len()));
        }
        Ok(Self {
            src_epid: get(words[0], 0, 16) as u16,
            status: StrsStatus::try_from(get(words[0], 16, 4) as u8)?,
            capacity_bytes: get(words[0], 24, 40),
            capacity_pkts: get(words[1], 0, 24) as u32,
            xfer_count_pkts: get(words[1], 24, 40),
            xfer_count_bytes: words[2],
            buff_info: get(words[3], 0, 16) as u16,
            status_info: get(words[3], 16, 48),
        })
    }
}

impl fmt::Display for StrsPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "strs {:?} src_epid={} cap={}B/{}pkt xfer={}B/{}pkt",
            self.status,
            self.src_epid,
            self.capacity_bytes,
            self.capacity_pkts,
            self.xfer_count_bytes,
            self.xfer_count_pkts
        )
    }
}

// ── STREAM_COMMAND ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum StrcOpCode {
    #[default]
    Init = 0,
    Ping = 1,
    Resync = 2,
}

impl TryFrom<u8> for StrcOpCode {
    type Error = ChdrError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StrcOpCode::Init),
            1 => Ok(StrcOpCode::Ping),
            2 => Ok(StrcOpCode::Resync),
            other => Err(ChdrError::UnknownOpcode {
                kind: "stream command",
                value: other,
            }),
        }
    }
}

/// Stream (re)initialisation, ping or resync request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StrcPayload {
    pub src_epid: u16,
    pub op_code: StrcOpCode,
    /// 4 bits.
    pub op_data: u8,
    /// 40 bits.
    pub num_pkts: u64,
    pub num_bytes: u64,
}

impl StrcPayload {
    pub const WORDS: usize = 2;

    pub fn serialize(&self) -> Result<Vec<u64>, ChdrError> {
        Ok(vec![
            put(self.src_epid.into(), 0)
                | put(self.op_code as u64, 16)
                | put(fits("strc.op_data", self.op_data.into(), 4)?, 20)
                | put(fits("strc.num_pkts", self.num_pkts, 40)?, 24),
            self.num_bytes,
        ])
    }

    pub fn deserialize(words: &[u64]) -> Result<Self, ChdrError> {
        if words.len() < Self::WORDS {
            return Err(short("stream command", Self::WORDS, words.len()));
        }
        Ok(Self {
            src_epid: get(words[0], 0, 16) as u16,
            op_code: StrcOpCode::try_from(get(words[0], 16, 4) as u8)?,
            op_data: get(words[0], 20, 4) as u8,
            num_pkts: get(words[0], 24, 40),
            num_bytes: words[1],
        })
    }
}

impl fmt::Display for StrcPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "strc {:?} src_epid={} pkts={} bytes={}",
            self.op_code, self.src_epid, self.num_pkts, self.num_bytes
        )
    }
}

// ── MANAGEMENT ────────────────────────────────────────────────────────────────

/// Management protocol version carried in every MANAGEMENT header word.
pub const MGMT_PROTOCOL_VERSION: u16 = 0x0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MgmtOpCode {
    Nop = 0,
    Advertise = 1,
    SelectDest = 2,
    Return = 3,
    InfoRequest = 4,
    InfoResponse = 5,
    CfgWriteRequest = 6,
    CfgReadRequest = 7,
    CfgReadResponse = 8,
}

impl TryFrom<u8> for MgmtOpCode {
    type Error = ChdrError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MgmtOpCode::Nop),
            1 => Ok(MgmtOpCode::Advertise),
            2 => Ok(MgmtOpCode::SelectDest),
            3 => Ok(MgmtOpCode::Return),
            4 => Ok(MgmtOpCode::InfoRequest),
            5 => Ok(MgmtOpCode::InfoResponse),
            6 => Ok(MgmtOpCode::CfgWriteRequest),
            7 => Ok(MgmtOpCode::CfgReadRequest),
            8 => Ok(MgmtOpCode::CfgReadResponse),
            other => Err(ChdrError::UnknownOpcode {
                kind: "management",
                value: other,
            }),
        }
    }
}

/// Node identity returned in an INFO_RESPONSE op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeInfo {
    pub device_id: u16,
    /// 4 bits.
    pub node_type: u8,
    /// 10 bits.
    pub node_inst: u16,
    /// 18 bits.
    pub ext_info: u32,
}

/// One operation within a hop. The 48-bit payload is interpreted by opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtOp {
    pub op_code: MgmtOpCode,
    pub payload: u64,
}

impl MgmtOp {
    pub fn new(op_code: MgmtOpCode) -> Self {
        Self { op_code, payload: 0 }
    }

    pub fn select_dest(dest: u16) -> Self {
        Self {
            op_code: MgmtOpCode::SelectDest,
            payload: dest.into(),
        }
    }

    pub fn cfg_write(addr: u16, data: u32) -> Self {
        Self {
            op_code: MgmtOpCode::CfgWriteRequest,
            payload: u64::from(addr) | (u64::from(data) << 16),
        }
    }

    pub fn cfg_read(addr: u16) -> Self {
        Self {
            op_code: MgmtOpCode::CfgReadRequest,
            payload: addr.into(),
        }
    }

    pub fn info_response(info: NodeInfo) -> Result<Self, ChdrError> {
        let payload = put(info.device_id.into(), 0)
            | put(fits("mgmt.node_type", info.node_type.into(), 4)?, 16)
            | put(fits("mgmt.node_inst", info.node_inst.into(), 10)?, 20)
            | put(fits("mgmt.ext_info", info.ext_info.into(), 18)?, 30);
        Ok(Self {
            op_code: MgmtOpCode::InfoResponse,
            payload,
        })
    }

    pub fn dest(&self) -> u16 {
        get(self.payload, 0, 16) as u16
    }

    /// `(addr, data)` of a config read/write op.
    pub fn cfg(&self) -> (u16, u32) {
        (get(self.payload, 0, 16) as u16, get(self.payload, 16, 32) as u32)
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            device_id: get(self.payload, 0, 16) as u16,
            node_type: get(self.payload, 16, 4) as u8,
            node_inst: get(self.payload, 20, 10) as u16,
            ext_info: get(self.payload, 30, 18) as u32,
        }
    }
}

/// Ordered operations executed by one node of the route.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MgmtHop {
    pub ops: Vec<MgmtOp>,
}

impl MgmtHop {
    pub fn new(ops: Vec<MgmtOp>) -> Self {
        Self { ops }
    }
}

/// Route-discovery and configuration transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtPayload {
    pub src_epid: u16,
    pub chdr_w: ChdrWidth,
    pub protover: u16,
    pub hops: Vec<MgmtHop>,
}

impl MgmtPayload {
    pub fn new(src_epid: u16, chdr_w: ChdrWidth) -> Self {
        Self {
            src_epid,
            chdr_w,
            protover: MGMT_PROTOCOL_VERSION,
            hops: Vec::new(),
        }
    }

    pub fn add_hop(&mut self, hop: MgmtHop) {
        self.hops.push(hop);
    }

    pub fn word_count(&self) -> usize {
        1 + self.hops.iter().map(|h| h.ops.len()).sum::<usize>()
    }

    pub fn serialize(&self) -> Result<Vec<u64>, ChdrError> {
        let mut words = Vec::with_capacity(self.word_count());
        words.push(
            put(self.src_epid.into(), 0)
                | put(fits("mgmt.num_hops", self.hops.len() as u64, 10)?, 16)
                | put(self.chdr_w.wire().into(), 45)
                | put(self.protover.into(), 48),
        );

        for (hop_idx, hop) in self.hops.iter().enumerate() {
            if hop.ops.is_empty() {
                return Err(ChdrError::MalformedPayload {
                    kind: "management",
                    reason: format!("hop {hop_idx} has no operations"),
                });
            }
            let count = hop.ops.len();
            for (i, op) in hop.ops.iter().enumerate() {
                let pending = fits("mgmt.ops_pending", (count - i - 1) as u64, 8)?;
                words.push(
                    put(pending, 0)
                        | put(u64::from(op.op_code as u8), 8)
                        | put(fits("mgmt.op_payload", op.payload, 48)?, 16),
                );
            }
        }

        Ok(words)
    }

    pub fn deserialize(words: &[u64]) -> Result<Self, ChdrError> {
        let header = *words.first().ok_or_else(|| short("management", 1, 0))?;
        let num_hops = get(header, 16, 10) as usize;

        let mut idx = 1;
        let mut hops = Vec::with_capacity(num_hops);
        for _ in 0..num_hops {
            let mut ops = Vec::new();
            loop {
                let word = *words
                    .get(idx)
                    .ok_or_else(|| short("management", idx + 1, words.len()))?;
                idx += 1;
                ops.push(MgmtOp {
                    op_code: MgmtOpCode::try_from(get(word, 8, 8) as u8)?,
                    payload: get(word, 16, 48),
                });
                if get(word, 0, 8) == 0 {
                    break;
                }
            }
            hops.push(MgmtHop { ops });
        }

        Ok(Self {
            src_epid: get(header, 0, 16) as u16,
            chdr_w: ChdrWidth::from_wire(get(header, 45, 3) as u8)?,
            protover: get(header, 48, 16) as u16,
            hops,
        })
    }
}

impl fmt::Display for MgmtPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mgmt src_epid={} hops={} proto=0x{:04x}",
            self.src_epid,
            self.hops.len(),
            self.protover
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
