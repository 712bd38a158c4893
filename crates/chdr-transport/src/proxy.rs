//! Kernel proxy interface for DMA-attached devices.
//!
//! The proxy is the only path to the device's register file and DMA FIFOs.
//! The real driver binding lives outside this crate; [`crate::sim`] has an
//! in-process implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::ctrl::RegisterIface;
use crate::error::TransportResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FifoDirection {
    /// Device → host.
    Rx,
    /// Host → device.
    Tx,
}

/// Requested FIFO geometry, in 64-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoConfig {
    pub channel: u32,
    pub direction: FifoDirection,
    pub depth_words: usize,
    pub frame_words: usize,
}

/// What the driver actually granted. May differ from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoGrant {
    pub depth_words: usize,
    pub frame_words: usize,
}

impl FifoGrant {
    pub fn frame_bytes(&self) -> usize {
        self.frame_words * 8
    }

    pub fn num_frames(&self) -> usize {
        if self.frame_words == 0 {
            0
        } else {
            self.depth_words / self.frame_words
        }
    }
}

#[async_trait]
pub trait KernelProxy: Send + Sync {
    async fn open(&self, resource: &str) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;

    async fn peek32(&self, addr: u32) -> TransportResult<u32>;

    async fn poke32(&self, addr: u32, data: u32) -> TransportResult<()>;

    async fn start_fifo(&self, cfg: FifoConfig) -> TransportResult<FifoGrant>;

    async fn stop_fifo(&self, channel: u32, direction: FifoDirection) -> TransportResult<()>;

    /// Read one frame into `buf`. `None` when nothing arrived in time.
    async fn fifo_read(&self, channel: u32, buf: &mut [u8], timeout: Duration) -> TransportResult<Option<usize>>;

    /// Queue one frame. `false` when the FIFO stayed full for `timeout`.
    async fn fifo_write(&self, channel: u32, frame: &[u8], timeout: Duration) -> TransportResult<bool>;
}

/// Register access through a kernel proxy.
#[derive(Clone)]
pub struct ProxyRegisters {
    proxy: Arc<dyn KernelProxy>,
}

impl ProxyRegisters {
    pub fn new(proxy: Arc<dyn KernelProxy>) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl RegisterIface for ProxyRegisters {
    async fn peek32(&self, addr: u32) -> TransportResult<u32> {
        self.proxy.peek32(addr).await
    }

    async fn poke32(&self, addr: u32, data: u32) -> TransportResult<()> {
        self.proxy.poke32(addr, data).await
    }
}
