//! The link abstraction shared by DMA and datagram transports.
//!
//! A link moves whole frames. Callers borrow a buffer from the link, fill
//! or read it, and hand it back; the link owns both pools for its lifetime.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::buffer::FrameBuffer;
use crate::error::TransportResult;

// ── Parameters ────────────────────────────────────────────────────────────────

/// Frame geometry for one link. All sizes in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkParams {
    pub recv_frame_size: usize,
    pub send_frame_size: usize,
    pub num_recv_frames: usize,
    pub num_send_frames: usize,
}

const DMA_DATA_FRAME_SIZE: usize = 4096;
const DMA_DATA_NUM_FRAMES: usize = 4096;
const DMA_MSG_FRAME_SIZE: usize = 256;
const DMA_MSG_NUM_FRAMES: usize = 64;

const UDP_CTRL_FRAME_SIZE: usize = 1472;
const UDP_CTRL_NUM_FRAMES: usize = 32;
const UDP_DATA_FRAME_SIZE: usize = 8000;
const UDP_DATA_NUM_FRAMES: usize = 128;

impl LinkParams {
    pub fn recv_buff_size(&self) -> usize {
        self.recv_frame_size * self.num_recv_frames
    }

    pub fn send_buff_size(&self) -> usize {
        self.send_frame_size * self.num_send_frames
    }

    /// Defaults for a DMA link. Data directions get large frames, the
    /// opposite direction only carries flow-control messages.
    pub fn dma_default(purpose: LinkPurpose) -> Self {
        let data = (DMA_DATA_FRAME_SIZE, DMA_DATA_NUM_FRAMES);
        let msg = (DMA_MSG_FRAME_SIZE, DMA_MSG_NUM_FRAMES);
        Self::from_directions(purpose, data, msg)
    }

    /// Defaults for a datagram link, before MTU clamping.
    pub fn udp_default(purpose: LinkPurpose) -> Self {
        let data = (UDP_DATA_FRAME_SIZE, UDP_DATA_NUM_FRAMES);
        let msg = (UDP_CTRL_FRAME_SIZE, UDP_CTRL_NUM_FRAMES);
        Self::from_directions(purpose, data, msg)
    }

    fn from_directions(purpose: LinkPurpose, data: (usize, usize), msg: (usize, usize)) -> Self {
        let (send, recv) = match purpose {
            LinkPurpose::Control => (msg, msg),
            LinkPurpose::TxData => (data, msg),
            LinkPurpose::RxData => (msg, data),
        };
        Self {
            send_frame_size: send.0,
            num_send_frames: send.1,
            recv_frame_size: recv.0,
            num_recv_frames: recv.1,
        }
    }
}

/// What a link will carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkPurpose {
    Control,
    /// Host → device samples.
    TxData,
    /// Device → host samples.
    RxData,
}

impl fmt::Display for LinkPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkPurpose::Control => "ctrl",
            LinkPurpose::TxData => "tx_data",
            LinkPurpose::RxData => "rx_data",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Dma,
    Datagram,
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// A bidirectional frame link.
///
/// Timeouts of zero never block. `Ok(None)` from a getter means nothing was
/// available in time; errors are reserved for a broken link.
#[async_trait]
pub trait Link: Send + Sync {
    fn kind(&self) -> LinkKind;

    fn params(&self) -> LinkParams;

    /// Borrow an empty send frame.
    async fn get_send_buffer(&self, timeout: Duration) -> TransportResult<Option<FrameBuffer>>;

    /// Transmit the first `buf.len()` bytes and return the frame to the pool.
    /// An empty buffer is returned without sending anything.
    async fn release_send_buffer(&self, buf: FrameBuffer) -> TransportResult<()>;

    /// Wait for a received frame.
    async fn get_recv_buffer(&self, timeout: Duration) -> TransportResult<Option<FrameBuffer>>;

    /// Hand a received frame back for reuse.
    async fn release_recv_buffer(&self, buf: FrameBuffer);

    /// Discard everything already queued for receive. Returns frames dropped.
    async fn flush(&self) -> TransportResult<usize>;

    /// Tear the link down. Idempotent.
    async fn close(&self) -> TransportResult<()>;
}
