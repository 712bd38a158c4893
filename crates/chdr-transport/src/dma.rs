//! DMA link over a kernel proxy, and the channel allocator that hands out
//! DMA channels to links.
//!
//! Opening a channel follows the engine's bring-up order: disable both
//! directions, wait for the engines to go idle, program the frame size,
//! enable, then start the host-side FIFOs. Teardown is the reverse, with
//! the RX FIFO drained before it is stopped so the next user of the channel
//! does not see stale frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chdr_core::regs::{
    dma_rx_reg, dma_tx_reg, DMA_CTRL_DISABLED, DMA_CTRL_ENABLED, DMA_CTRL_STATUS_REG,
    DMA_CTRL_SW_BUF_U64, DMA_FRAME_SIZE_REG, DMA_STATUS_BUSY,
};
use tokio::time::Instant;

use crate::buffer::{FrameBuffer, FramePool};
use crate::error::{TransportError, TransportResult};
use crate::link::{Link, LinkKind, LinkParams, LinkPurpose};
use crate::proxy::{FifoConfig, FifoDirection, FifoGrant, KernelProxy};

/// How long a disabled engine may stay busy before the channel is declared
/// faulty.
const DMA_IDLE_TIMEOUT: Duration = Duration::from_millis(100);
/// Status poll interval while waiting for idle.
const DMA_IDLE_POLL: Duration = Duration::from_micros(50);
/// How long a send waits for room in the TX FIFO.
const DMA_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct DmaLink {
    proxy: Arc<dyn KernelProxy>,
    channel: u32,
    params: LinkParams,
    send_pool: FramePool,
    recv_pool: FramePool,
    closed: AtomicBool,
}

impl DmaLink {
    /// Bring up `channel` and size the frame pools to what the driver
    /// granted, which may differ from `params`.
    pub async fn open(proxy: Arc<dyn KernelProxy>, channel: u32, params: LinkParams) -> TransportResult<Self> {
        let tx_status = dma_tx_reg(channel, DMA_CTRL_STATUS_REG);
        let rx_status = dma_rx_reg(channel, DMA_CTRL_STATUS_REG);

        proxy.poke32(tx_status, DMA_CTRL_DISABLED).await?;
        proxy.poke32(rx_status, DMA_CTRL_DISABLED).await?;
        wait_idle(proxy.as_ref(), channel).await?;

        proxy
            .poke32(dma_tx_reg(channel, DMA_FRAME_SIZE_REG), (params.send_frame_size / 8) as u32)
            .await?;
        proxy
            .poke32(dma_rx_reg(channel, DMA_FRAME_SIZE_REG), (params.recv_frame_size / 8) as u32)
            .await?;
        proxy.poke32(tx_status, DMA_CTRL_SW_BUF_U64 | DMA_CTRL_ENABLED).await?;
        proxy.poke32(rx_status, DMA_CTRL_SW_BUF_U64 | DMA_CTRL_ENABLED).await?;

        let rx = proxy
            .start_fifo(FifoConfig {
                channel,
                direction: FifoDirection::Rx,
                depth_words: params.recv_buff_size() / 8,
                frame_words: params.recv_frame_size / 8,
            })
            .await?;
        let tx = match proxy
            .start_fifo(FifoConfig {
                channel,
                direction: FifoDirection::Tx,
                depth_words: params.send_buff_size() / 8,
                frame_words: params.send_frame_size / 8,
            })
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                let _ = proxy.stop_fifo(channel, FifoDirection::Rx).await;
                return Err(e);
            }
        };

        let granted = granted_params(rx, tx);
        if granted != params {
            tracing::info!(channel, requested = ?params, ?granted, "DMA FIFO geometry adjusted by driver");
        }
        tracing::info!(
            channel,
            recv_frame_size = granted.recv_frame_size,
            num_recv_frames = granted.num_recv_frames,
            send_frame_size = granted.send_frame_size,
            num_send_frames = granted.num_send_frames,
            "DMA link open"
        );

        Ok(Self {
            proxy,
            channel,
            params: granted,
            send_pool: FramePool::new(granted.send_frame_size, granted.num_send_frames),
            recv_pool: FramePool::new(granted.recv_frame_size, granted.num_recv_frames),
            closed: AtomicBool::new(false),
        })
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn drain_rx(&self) -> TransportResult<usize> {
        let mut scratch = vec![0u8; self.params.recv_frame_size.max(8)];
        let mut dropped = 0;
        while self
            .proxy
            .fifo_read(self.channel, &mut scratch, Duration::ZERO)
            .await?
            .is_some()
        {
            dropped += 1;
        }
        Ok(dropped)
    }

    async fn teardown(&self) -> TransportResult<()> {
        let ch = self.channel;
        let mut first_err = None;
        let mut note = |r: TransportResult<()>| {
            if let Err(e) = r {
                tracing::warn!(channel = ch, error = %e, "DMA teardown step failed");
                first_err.get_or_insert(e);
            }
        };

        note(self.proxy.poke32(dma_tx_reg(ch, DMA_CTRL_STATUS_REG), DMA_CTRL_DISABLED).await);
        note(self.proxy.poke32(dma_rx_reg(ch, DMA_CTRL_STATUS_REG), DMA_CTRL_DISABLED).await);
        match self.drain_rx().await {
            Ok(0) => {}
            Ok(dropped) => tracing::debug!(channel = ch, dropped, "drained RX FIFO"),
            Err(e) => note(Err(e)),
        }
        note(self.proxy.stop_fifo(ch, FifoDirection::Rx).await);
        note(self.proxy.stop_fifo(ch, FifoDirection::Tx).await);

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

fn granted_params(rx: FifoGrant, tx: FifoGrant) -> LinkParams {
    LinkParams {
        recv_frame_size: rx.frame_bytes(),
        send_frame_size: tx.frame_bytes(),
        num_recv_frames: rx.num_frames(),
        num_send_frames: tx.num_frames(),
    }
}

/// Poll both engines of `channel` until neither reports busy.
async fn wait_idle(proxy: &dyn KernelProxy, channel: u32) -> TransportResult<()> {
    let deadline = Instant::now() + DMA_IDLE_TIMEOUT;
    loop {
        let tx = proxy.peek32(dma_tx_reg(channel, DMA_CTRL_STATUS_REG)).await?;
        let rx = proxy.peek32(dma_rx_reg(channel, DMA_CTRL_STATUS_REG)).await?;
        if (tx | rx) & DMA_STATUS_BUSY == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TransportError::HardwareFault(format!(
                "DMA channel {channel} still busy {}ms after disable",
                DMA_IDLE_TIMEOUT.as_millis()
            )));
        }
        tokio::time::sleep(DMA_IDLE_POLL).await;
    }
}

#[async_trait]
impl Link for DmaLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Dma
    }

    fn params(&self) -> LinkParams {
        self.params
    }

    async fn get_send_buffer(&self, timeout: Duration) -> TransportResult<Option<FrameBuffer>> {
        self.check_open()?;
        Ok(self.send_pool.acquire(timeout).await)
    }

    async fn release_send_buffer(&self, buf: FrameBuffer) -> TransportResult<()> {
        let result = if buf.is_empty() {
            Ok(())
        } else if let Err(e) = self.check_open() {
            Err(e)
        } else {
            match self.proxy.fifo_write(self.channel, buf.as_slice(), DMA_WRITE_TIMEOUT).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(TransportError::Timeout {
                    what: "DMA TX FIFO space",
                    after: DMA_WRITE_TIMEOUT,
                }),
                Err(e) => Err(e),
            }
        };
        self.send_pool.release(buf);
        result
    }

    async fn get_recv_buffer(&self, timeout: Duration) -> TransportResult<Option<FrameBuffer>> {
        self.check_open()?;
        let deadline = Instant::now() + timeout;
        let Some(mut buf) = self.recv_pool.acquire(timeout).await else {
            return Ok(None);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.proxy.fifo_read(self.channel, buf.frame_mut(), remaining).await {
            Ok(Some(n)) => {
                buf.set_len(n);
                Ok(Some(buf))
            }
            Ok(None) => {
                self.recv_pool.release(buf);
                Ok(None)
            }
            Err(e) => {
                self.recv_pool.release(buf);
                Err(e)
            }
        }
    }

    async fn release_recv_buffer(&self, buf: FrameBuffer) {
        self.recv_pool.release(buf);
    }

    async fn flush(&self) -> TransportResult<usize> {
        self.check_open()?;
        self.drain_rx().await
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.teardown().await;
        tracing::info!(channel = self.channel, ok = result.is_ok(), "DMA link closed");
        result
    }
}

impl Drop for DmaLink {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            tracing::warn!(channel = self.channel, "DMA link dropped without close, channel left running");
        }
    }
}

// ── Channel allocation ────────────────────────────────────────────────────────

/// Hands out DMA channels. Channel 0 is reserved for the control link;
/// data links take the lowest free channel above it.
#[derive(Debug)]
pub struct ChannelAllocator {
    in_use: Mutex<Vec<bool>>,
}

impl ChannelAllocator {
    pub fn new(max_channels: u32) -> Self {
        Self {
            in_use: Mutex::new(vec![false; max_channels as usize]),
        }
    }

    pub fn allocate(&self, purpose: LinkPurpose) -> TransportResult<u32> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let candidates = match purpose {
            LinkPurpose::Control => 0..in_use.len().min(1),
            LinkPurpose::TxData | LinkPurpose::RxData => 1.min(in_use.len())..in_use.len(),
        };
        for ch in candidates {
            if !in_use[ch] {
                in_use[ch] = true;
                tracing::debug!(channel = ch, %purpose, "DMA channel allocated");
                return Ok(ch as u32);
            }
        }
        Err(TransportError::ResourceExhausted(match purpose {
            LinkPurpose::Control => "DMA control channel",
            _ => "DMA data channel",
        }))
    }

    pub fn release(&self, channel: u32) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        match in_use.get_mut(channel as usize) {
            Some(slot) if *slot => *slot = false,
            _ => tracing::warn!(channel, "release of a DMA channel that was not allocated"),
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|b| **b)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::sim::{BusyMode, ProxyCall, SimulatedProxy};

    fn small() -> LinkParams {
        LinkParams {
            recv_frame_size: 256,
            send_frame_size: 256,
            num_recv_frames: 64,
            num_send_frames: 64,
        }
    }

    async fn proxy() -> Arc<SimulatedProxy> {
        let proxy = Arc::new(SimulatedProxy::new());
        proxy.open("RIO0").await.unwrap();
        proxy
    }

    #[tokio::test]
    async fn open_follows_bring_up_order() {
        let sim = proxy().await;
        let link = DmaLink::open(sim.clone(), 2, small()).await.unwrap();
        let calls = sim.calls();
        let expected = vec![
            ProxyCall::Open("RIO0".into()),
            ProxyCall::Poke { addr: dma_tx_reg(2, DMA_CTRL_STATUS_REG), data: DMA_CTRL_DISABLED },
            ProxyCall::Poke { addr: dma_rx_reg(2, DMA_CTRL_STATUS_REG), data: DMA_CTRL_DISABLED },
            ProxyCall::Poke { addr: dma_tx_reg(2, DMA_FRAME_SIZE_REG), data: 32 },
            ProxyCall::Poke { addr: dma_rx_reg(2, DMA_FRAME_SIZE_REG), data: 32 },
            ProxyCall::Poke {
                addr: dma_tx_reg(2, DMA_CTRL_STATUS_REG),
                data: DMA_CTRL_SW_BUF_U64 | DMA_CTRL_ENABLED,
            },
            ProxyCall::Poke {
                addr: dma_rx_reg(2, DMA_CTRL_STATUS_REG),
                data: DMA_CTRL_SW_BUF_U64 | DMA_CTRL_ENABLED,
            },
            ProxyCall::StartFifo(FifoConfig {
                channel: 2,
                direction: FifoDirection::Rx,
                depth_words: 2048,
                frame_words: 32,
            }),
            ProxyCall::StartFifo(FifoConfig {
                channel: 2,
                direction: FifoDirection::Tx,
                depth_words: 2048,
                frame_words: 32,
            }),
        ];
        assert_eq!(calls, expected);
        assert_eq!(link.params(), small());
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn pools_follow_granted_depth() {
        let sim = proxy().await;
        let params = LinkParams {
            recv_frame_size: 1000,
            num_recv_frames: 3,
            ..small()
        };
        let link = DmaLink::open(sim, 1, params).await.unwrap();
        assert_eq!(link.params().recv_frame_size, 1000);
        // 375 words rounded up to 512
        assert_eq!(link.params().num_recv_frames, 4);
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn busy_engine_settles() {
        let sim = proxy().await;
        sim.set_busy(BusyMode::For(4));
        let link = DmaLink::open(sim, 1, small()).await.unwrap();
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn stuck_engine_is_a_hardware_fault() {
        let sim = proxy().await;
        sim.set_busy(BusyMode::Stuck);
        let err = DmaLink::open(sim.clone(), 1, small()).await.err().unwrap();
        assert_eq!(err.class(), ErrorClass::HardwareFault);
        assert!(!sim.fifo_running(1, FifoDirection::Rx));
    }

    #[tokio::test]
    async fn frames_move_through_fifos() {
        let sim = proxy().await;
        let link = DmaLink::open(sim.clone(), 1, small()).await.unwrap();

        let mut buf = link.get_send_buffer(Duration::ZERO).await.unwrap().unwrap();
        buf.fill_from(&[9u8; 24]);
        link.release_send_buffer(buf).await.unwrap();
        assert_eq!(sim.take_tx(1), vec![vec![9u8; 24]]);

        assert!(link.get_recv_buffer(Duration::ZERO).await.unwrap().is_none());
        sim.inject_rx(1, vec![3u8; 40]);
        let buf = link.get_recv_buffer(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(buf.as_slice(), &[3u8; 40]);
        link.release_recv_buffer(buf).await;
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_disables_drains_then_stops() {
        let sim = proxy().await;
        let link = DmaLink::open(sim.clone(), 3, small()).await.unwrap();
        sim.inject_rx(3, vec![1u8; 16]);
        sim.inject_rx(3, vec![2u8; 16]);
        let before = sim.calls().len();

        link.close().await.unwrap();
        link.close().await.unwrap();

        let teardown: Vec<_> = sim.calls().into_iter().skip(before).collect();
        assert_eq!(
            teardown,
            vec![
                ProxyCall::Poke { addr: dma_tx_reg(3, DMA_CTRL_STATUS_REG), data: DMA_CTRL_DISABLED },
                ProxyCall::Poke { addr: dma_rx_reg(3, DMA_CTRL_STATUS_REG), data: DMA_CTRL_DISABLED },
                ProxyCall::FifoRead { channel: 3, delivered: true },
                ProxyCall::FifoRead { channel: 3, delivered: true },
                ProxyCall::FifoRead { channel: 3, delivered: false },
                ProxyCall::StopFifo { channel: 3, direction: FifoDirection::Rx },
                ProxyCall::StopFifo { channel: 3, direction: FifoDirection::Tx },
            ]
        );
        assert_eq!(sim.pending_rx(3), 0);
        assert!(matches!(
            link.get_send_buffer(Duration::ZERO).await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn control_gets_channel_zero() {
        let alloc = ChannelAllocator::new(6);
        assert_eq!(alloc.allocate(LinkPurpose::Control).unwrap(), 0);
        let err = alloc.allocate(LinkPurpose::Control).unwrap_err();
        assert_eq!(err.class(), ErrorClass::ResourceExhausted);
    }

    #[test]
    fn data_channels_fill_from_one_and_reuse() {
        let alloc = ChannelAllocator::new(6);
        let got: Vec<u32> = (0..5)
            .map(|i| {
                let purpose = if i % 2 == 0 { LinkPurpose::RxData } else { LinkPurpose::TxData };
                alloc.allocate(purpose).unwrap()
            })
            .collect();
        assert_eq!(got, vec![1, 2, 3, 4, 5]);
        assert!(alloc.allocate(LinkPurpose::RxData).is_err());

        alloc.release(3);
        assert_eq!(alloc.allocate(LinkPurpose::TxData).unwrap(), 3);
        assert_eq!(alloc.in_use(), 5);
        assert_eq!(alloc.allocate(LinkPurpose::Control).unwrap(), 0);
    }
}
