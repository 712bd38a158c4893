//! CHDR packet codec.
//!
//! A CHDR packet is laid out as:
//!
//! ```text
//! [ header word ][ timestamp ]?[ metadata × num_mdata ][ payload ]
//! ```
//!
//! The header is always one 64-bit lane. At 64-bit word width a timestamp
//! occupies a second word; at wider widths header and timestamp share the
//! first word (lanes 0 and 1) and the rest of that word is zero padding.
//! Every 64-bit lane is byte-swapped independently according to the
//! session endianness.
//!
//! The codec is pure: no I/O, no allocation beyond the output buffer.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::payload::{CtrlPayload, MgmtPayload, StrcPayload, StrsPayload};

// ── Word width ────────────────────────────────────────────────────────────────

/// Session-wide CHDR word width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChdrWidth {
    #[default]
    W64,
    W128,
    W256,
    W512,
}

impl ChdrWidth {
    pub const fn bits(self) -> usize {
        match self {
            ChdrWidth::W64 => 64,
            ChdrWidth::W128 => 128,
            ChdrWidth::W256 => 256,
            ChdrWidth::W512 => 512,
        }
    }

    pub const fn bytes(self) -> usize {
        self.bits() / 8
    }

    /// 3-bit encoding carried in MANAGEMENT headers.
    pub const fn wire(self) -> u8 {
        match self {
            ChdrWidth::W64 => 0,
            ChdrWidth::W128 => 1,
            ChdrWidth::W256 => 2,
            ChdrWidth::W512 => 3,
        }
    }

    pub fn from_wire(value: u8) -> Result<Self, ChdrError> {
        match value {
            0 => Ok(ChdrWidth::W64),
            1 => Ok(ChdrWidth::W128),
            2 => Ok(ChdrWidth::W256),
            3 => Ok(ChdrWidth::W512),
            other => Err(ChdrError::UnsupportedWidth(other as usize)),
        }
    }

    pub fn from_bits(bits: usize) -> Result<Self, ChdrError> {
        match bits {
            64 => Ok(ChdrWidth::W64),
            128 => Ok(ChdrWidth::W128),
            256 => Ok(ChdrWidth::W256),
            512 => Ok(ChdrWidth::W512),
            other => Err(ChdrError::UnsupportedWidth(other)),
        }
    }
}

/// Byte order applied to each 64-bit lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

// ── Packet type ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Management = 0x0,
    StreamStatus = 0x1,
    StreamCommand = 0x2,
    Control = 0x4,
    Data = 0x6,
    DataWithTimestamp = 0x7,
}

impl PacketType {
    pub fn is_data(self) -> bool {
        matches!(self, PacketType::Data | PacketType::DataWithTimestamp)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ChdrError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(PacketType::Management),
            0x1 => Ok(PacketType::StreamStatus),
            0x2 => Ok(PacketType::StreamCommand),
            0x4 => Ok(PacketType::Control),
            0x6 => Ok(PacketType::Data),
            0x7 => Ok(PacketType::DataWithTimestamp),
            other => Err(ChdrError::UnknownPacketType(other)),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Management => "MGMT",
            PacketType::StreamStatus => "STRS",
            PacketType::StreamCommand => "STRC",
            PacketType::Control => "CTRL",
            PacketType::Data => "DATA",
            PacketType::DataWithTimestamp => "DATA_TS",
        };
        f.write_str(name)
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Maximum metadata words expressible in the 5-bit `num_mdata` field.
pub const MAX_METADATA_WORDS: usize = 31;

/// The first 64-bit lane of every CHDR packet.
///
/// ```text
/// 63    58 57  56  55  53 52  48 47        32 31        16 15         0
/// [  vc  ][eob][eov][type][mdata][  seq_num  ][  length   ][  dst_epid ]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChdrHeader {
    /// Virtual channel (6 bits).
    pub vc: u8,
    pub eob: bool,
    pub eov: bool,
    pub pkt_type: PacketType,
    /// Metadata word count (5 bits).
    pub num_mdata: u8,
    pub seq_num: u16,
    /// Total encoded length in bytes, including header.
    pub length: u16,
    pub dst_epid: u16,
}

impl ChdrHeader {
    pub fn new(pkt_type: PacketType, dst_epid: u16) -> Self {
        Self {
            vc: 0,
            eob: false,
            eov: false,
            pkt_type,
            num_mdata: 0,
            seq_num: 0,
            length: 0,
            dst_epid,
        }
    }

    pub fn pack(&self) -> Result<u64, ChdrError> {
        if self.vc > 0x3F {
            return Err(ChdrError::FieldOutOfRange {
                field: "header.vc",
                value: self.vc.into(),
                max: 0x3F,
            });
        }
        if self.num_mdata as usize > MAX_METADATA_WORDS {
            return Err(ChdrError::FieldOutOfRange {
                field: "header.num_mdata",
                value: self.num_mdata.into(),
                max: MAX_METADATA_WORDS as u64,
            });
        }
        Ok((u64::from(self.vc) << 58)
            | (u64::from(self.eob) << 57)
            | (u64::from(self.eov) << 56)
            | (u64::from(self.pkt_type as u8) << 53)
            | (u64::from(self.num_mdata) << 48)
            | (u64::from(self.seq_num) << 32)
            | (u64::from(self.length) << 16)
            | u64::from(self.dst_epid))
    }

    pub fn unpack(word: u64) -> Result<Self, ChdrError> {
        Ok(Self {
            vc: ((word >> 58) & 0x3F) as u8,
            eob: (word >> 57) & 1 == 1,
            eov: (word >> 56) & 1 == 1,
            pkt_type: PacketType::try_from(((word >> 53) & 0x7) as u8)?,
            num_mdata: ((word >> 48) & 0x1F) as u8,
            seq_num: (word >> 32) as u16,
            length: (word >> 16) as u16,
            dst_epid: word as u16,
        })
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChdrPayload {
    Management(MgmtPayload),
    StreamStatus(StrsPayload),
    StreamCommand(StrcPayload),
    Control(CtrlPayload),
    /// Raw samples for DATA and DATA_WITH_TIMESTAMP.
    Data(Bytes),
}

impl ChdrPayload {
    fn matches(&self, pkt_type: PacketType) -> bool {
        matches!(
            (self, pkt_type),
            (ChdrPayload::Management(_), PacketType::Management)
                | (ChdrPayload::StreamStatus(_), PacketType::StreamStatus)
                | (ChdrPayload::StreamCommand(_), PacketType::StreamCommand)
                | (ChdrPayload::Control(_), PacketType::Control)
                | (ChdrPayload::Data(_), PacketType::Data)
                | (ChdrPayload::Data(_), PacketType::DataWithTimestamp)
        )
    }
}

/// A decoded (or to-be-encoded) CHDR packet.
///
/// `header.length` and `header.num_mdata` are derived from the contents on
/// encode; call [`ChdrCodec::seal`] to make them consistent in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChdrPacket {
    pub header: ChdrHeader,
    /// Present only for DATA_WITH_TIMESTAMP.
    pub timestamp: Option<u64>,
    /// Raw metadata, a whole number of CHDR words.
    pub metadata: Bytes,
    pub payload: ChdrPayload,
}

impl ChdrPacket {
    pub fn data(dst_epid: u16, seq_num: u16, samples: Bytes) -> Self {
        let mut header = ChdrHeader::new(PacketType::Data, dst_epid);
        header.seq_num = seq_num;
        Self {
            header,
            timestamp: None,
            metadata: Bytes::new(),
            payload: ChdrPayload::Data(samples),
        }
    }

    pub fn data_with_timestamp(dst_epid: u16, seq_num: u16, timestamp: u64, samples: Bytes) -> Self {
        let mut pkt = Self::data(dst_epid, seq_num, samples);
        pkt.header.pkt_type = PacketType::DataWithTimestamp;
        pkt.timestamp = Some(timestamp);
        pkt
    }

    pub fn control(dst_epid: u16, seq_num: u16, ctrl: CtrlPayload) -> Self {
        Self::typed(PacketType::Control, dst_epid, seq_num, ChdrPayload::Control(ctrl))
    }

    pub fn stream_status(dst_epid: u16, seq_num: u16, strs: StrsPayload) -> Self {
        Self::typed(PacketType::StreamStatus, dst_epid, seq_num, ChdrPayload::StreamStatus(strs))
    }

    pub fn stream_command(dst_epid: u16, seq_num: u16, strc: StrcPayload) -> Self {
        Self::typed(PacketType::StreamCommand, dst_epid, seq_num, ChdrPayload::StreamCommand(strc))
    }

    pub fn management(dst_epid: u16, seq_num: u16, mgmt: MgmtPayload) -> Self {
        Self::typed(PacketType::Management, dst_epid, seq_num, ChdrPayload::Management(mgmt))
    }

    fn typed(pkt_type: PacketType, dst_epid: u16, seq_num: u16, payload: ChdrPayload) -> Self {
        let mut header = ChdrHeader::new(pkt_type, dst_epid);
        header.seq_num = seq_num;
        Self {
            header,
            timestamp: None,
            metadata: Bytes::new(),
            payload,
        }
    }

    pub fn pkt_type(&self) -> PacketType {
        self.header.pkt_type
    }
}

impl fmt::Display for ChdrPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        write!(
            f,
            "CHDR {} vc={} seq={} len={} dst_epid={} mdata={}",
            h.pkt_type, h.vc, h.seq_num, h.length, h.dst_epid, h.num_mdata
        )?;
        if h.eob {
            f.write_str(" eob")?;
        }
        if h.eov {
            f.write_str(" eov")?;
        }
        if let Some(ts) = self.timestamp {
            write!(f, " ts=0x{ts:016x}")?;
        }
        match &self.payload {
            ChdrPayload::Management(p) => write!(f, " [{p}]"),
            ChdrPayload::StreamStatus(p) => write!(f, " [{p}]"),
            ChdrPayload::StreamCommand(p) => write!(f, " [{p}]"),
            ChdrPayload::Control(p) => write!(f, " [{p}]"),
            ChdrPayload::Data(d) => write!(f, " [{} bytes]", d.len()),
        }
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Encoder/decoder for one session's width, byte order and frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChdrCodec {
    pub width: ChdrWidth,
    pub endianness: Endianness,
    /// Largest encoding accepted by `encode`. Never above 65535.
    pub max_frame_size: usize,
}

impl Default for ChdrCodec {
    fn default() -> Self {
        Self::new(ChdrWidth::W64, Endianness::Big)
    }
}

impl ChdrCodec {
    pub fn new(width: ChdrWidth, endianness: Endianness) -> Self {
        Self {
            width,
            endianness,
            max_frame_size: u16::MAX as usize,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size.min(u16::MAX as usize);
        self
    }

    /// Bytes taken by the header (and timestamp, where present).
    pub fn header_len(&self, pkt_type: PacketType) -> usize {
        match self.width {
            ChdrWidth::W64 if pkt_type == PacketType::DataWithTimestamp => 16,
            ChdrWidth::W64 => 8,
            w => w.bytes(),
        }
    }

    fn body_len(&self, payload: &ChdrPayload) -> usize {
        match payload {
            ChdrPayload::Data(d) => d.len(),
            ChdrPayload::Control(c) => c.word_count() * 8,
            ChdrPayload::StreamStatus(_) => StrsPayload::WORDS * 8,
            ChdrPayload::StreamCommand(_) => StrcPayload::WORDS * 8,
            ChdrPayload::Management(m) => m.word_count() * self.width.bytes(),
        }
    }

    /// Number of whole metadata words in `metadata`.
    fn metadata_words(&self, metadata: &[u8]) -> Result<usize, ChdrError> {
        let w = self.width.bytes();
        if metadata.len() % w != 0 {
            return Err(ChdrError::MalformedPayload {
                kind: "metadata",
                reason: format!("{} bytes is not a multiple of {w}-byte words", metadata.len()),
            });
        }
        let words = metadata.len() / w;
        if words > MAX_METADATA_WORDS {
            return Err(ChdrError::FieldOutOfRange {
                field: "header.num_mdata",
                value: words as u64,
                max: MAX_METADATA_WORDS as u64,
            });
        }
        Ok(words)
    }

    fn validate(&self, pkt: &ChdrPacket) -> Result<(), ChdrError> {
        let pkt_type = pkt.header.pkt_type;
        if !pkt.payload.matches(pkt_type) {
            return Err(ChdrError::PayloadMismatch(pkt_type));
        }
        if pkt.timestamp.is_some() != (pkt_type == PacketType::DataWithTimestamp) {
            return Err(ChdrError::PayloadMismatch(pkt_type));
        }
        if let ChdrPayload::Management(m) = &pkt.payload {
            if m.chdr_w != self.width {
                return Err(ChdrError::WidthMismatch {
                    codec: self.width.bits(),
                    packet: m.chdr_w.bits(),
                });
            }
        }
        Ok(())
    }

    /// Exact encoded size of `pkt`, checked against the frame size.
    pub fn encoded_len(&self, pkt: &ChdrPacket) -> Result<usize, ChdrError> {
        self.validate(pkt)?;
        let mdata = self.metadata_words(&pkt.metadata)? * self.width.bytes();
        let length = self.header_len(pkt.header.pkt_type) + mdata + self.body_len(&pkt.payload);
        if length > self.max_frame_size {
            return Err(ChdrError::FrameOverflow {
                length,
                max: self.max_frame_size,
            });
        }
        Ok(length)
    }

    /// Fill in `header.length` and `header.num_mdata` from the contents.
    pub fn seal(&self, pkt: &mut ChdrPacket) -> Result<usize, ChdrError> {
        let length = self.encoded_len(pkt)?;
        pkt.header.length = length as u16;
        pkt.header.num_mdata = self.metadata_words(&pkt.metadata)? as u8;
        Ok(length)
    }

    pub fn encode(&self, pkt: &ChdrPacket) -> Result<Bytes, ChdrError> {
        let length = self.encoded_len(pkt)?;
        let mut buf = BytesMut::with_capacity(length);
        self.write(pkt, length, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode directly into a frame. Returns bytes written.
    pub fn encode_into(&self, pkt: &ChdrPacket, frame: &mut [u8]) -> Result<usize, ChdrError> {
        let length = self.encoded_len(pkt)?;
        if length > frame.len() {
            return Err(ChdrError::FrameOverflow {
                length,
                max: frame.len(),
            });
        }
        let mut out = &mut frame[..length];
        self.write(pkt, length, &mut out)?;
        Ok(length)
    }

    fn write<B: BufMut>(&self, pkt: &ChdrPacket, length: usize, out: &mut B) -> Result<(), ChdrError> {
        let width = self.width.bytes();
        let mut header = pkt.header;
        header.length = length as u16;
        header.num_mdata = self.metadata_words(&pkt.metadata)? as u8;

        self.put_lane(out, header.pack()?);
        match self.width {
            ChdrWidth::W64 => {
                if let Some(ts) = pkt.timestamp {
                    self.put_lane(out, ts);
                }
            }
            _ => {
                self.put_lane(out, pkt.timestamp.unwrap_or(0));
                out.put_bytes(0, width - 16);
            }
        }

        out.put_slice(&pkt.metadata);

        match &pkt.payload {
            ChdrPayload::Data(d) => out.put_slice(d),
            ChdrPayload::Control(c) => self.put_words(out, &c.serialize()?),
            ChdrPayload::StreamStatus(s) => self.put_words(out, &s.serialize()?),
            ChdrPayload::StreamCommand(s) => self.put_words(out, &s.serialize()?),
            ChdrPayload::Management(m) => {
                for word in m.serialize()? {
                    self.put_lane(out, word);
                    out.put_bytes(0, width - 8);
                }
            }
        }
        Ok(())
    }

    fn put_lane<B: BufMut>(&self, out: &mut B, value: u64) {
        match self.endianness {
            Endianness::Big => out.put_u64(value),
            Endianness::Little => out.put_u64_le(value),
        }
    }

    fn put_words<B: BufMut>(&self, out: &mut B, words: &[u64]) {
        for &w in words {
            self.put_lane(out, w);
        }
    }

    fn lane(&self, buf: &[u8], offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[offset..offset + 8]);
        match self.endianness {
            Endianness::Big => u64::from_be_bytes(raw),
            Endianness::Little => u64::from_le_bytes(raw),
        }
    }

    /// Decode only the first header lane.
    pub fn peek_header(&self, buf: &[u8]) -> Result<ChdrHeader, ChdrError> {
        if buf.len() < 8 {
            return Err(ChdrError::Truncated {
                declared: 8,
                actual: buf.len(),
            });
        }
        ChdrHeader::unpack(self.lane(buf, 0))
    }

    pub fn decode(&self, buf: &[u8]) -> Result<ChdrPacket, ChdrError> {
        let header = self.peek_header(buf)?;
        let length = header.length as usize;
        if length > buf.len() {
            return Err(ChdrError::Truncated {
                declared: length,
                actual: buf.len(),
            });
        }

        let hdr_len = self.header_len(header.pkt_type);
        let mdata_len = header.num_mdata as usize * self.width.bytes();
        if length < hdr_len + mdata_len {
            return Err(ChdrError::LengthTooShort {
                length,
                minimum: hdr_len + mdata_len,
            });
        }

        let timestamp = match header.pkt_type {
            PacketType::DataWithTimestamp => Some(self.lane(buf, 8)),
            _ => None,
        };
        let metadata = Bytes::copy_from_slice(&buf[hdr_len..hdr_len + mdata_len]);
        let body = &buf[hdr_len + mdata_len..length];

        let payload = match header.pkt_type {
            PacketType::Data | PacketType::DataWithTimestamp => {
                ChdrPayload::Data(Bytes::copy_from_slice(body))
            }
            PacketType::Control => {
                ChdrPayload::Control(CtrlPayload::deserialize(&self.words(body, 8, "control")?)?)
            }
            PacketType::StreamStatus => ChdrPayload::StreamStatus(StrsPayload::deserialize(
                &self.words(body, 8, "stream status")?,
            )?),
            PacketType::StreamCommand => ChdrPayload::StreamCommand(StrcPayload::deserialize(
                &self.words(body, 8, "stream command")?,
            )?),
            PacketType::Management => {
                let words = self.words(body, self.width.bytes(), "management")?;
                let mgmt = MgmtPayload::deserialize(&words)?;
                if mgmt.chdr_w != self.width {
                    return Err(ChdrError::WidthMismatch {
                        codec: self.width.bits(),
                        packet: mgmt.chdr_w.bits(),
                    });
                }
                ChdrPayload::Management(mgmt)
            }
        };

        Ok(ChdrPacket {
            header,
            timestamp,
            metadata,
            payload,
        })
    }

    /// Split `body` into `stride`-byte words and read lane 0 of each.
    fn words(&self, body: &[u8], stride: usize, kind: &'static str) -> Result<Vec<u64>, ChdrError> {
        if body.len() % stride != 0 {
            return Err(ChdrError::MalformedPayload {
                kind,
                reason: format!("{} bytes is not a multiple of {stride}", body.len()),
            });
        }
        Ok((0..body.len() / stride)
            .map(|i| self.lane(body, i * stride))
            .collect())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Codec failures. All of them mean the packet is malformed and should be
/// dropped (decode) or never sent (encode).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChdrError {
    #[error("truncated packet: header declares {declared} bytes, buffer holds {actual}")]
    Truncated { declared: usize, actual: usize },

    #[error("declared length {length} is shorter than header and metadata ({minimum})")]
    LengthTooShort { length: usize, minimum: usize },

    #[error("unknown packet type: 0x{0:x}")]
    UnknownPacketType(u8),

    #[error("unknown {kind} opcode: 0x{value:x}")]
    UnknownOpcode { kind: &'static str, value: u8 },

    #[error("encoded length {length} exceeds frame size {max}")]
    FrameOverflow { length: usize, max: usize },

    #[error("{field} = {value} exceeds maximum {max}")]
    FieldOutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },

    #[error("payload or timestamp does not match packet type {0}")]
    PayloadMismatch(PacketType),

    #[error("unsupported CHDR width: {0}")]
    UnsupportedWidth(usize),

    #[error("management packet built for {packet}-bit words, codec is {codec}-bit")]
    WidthMismatch { codec: usize, packet: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
