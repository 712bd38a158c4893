//! In-memory kernel proxy.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chdr_core::regs::{dma_rx_reg, dma_tx_reg, DMA_CTRL_STATUS_REG, DMA_MAX_CHANNELS, DMA_STATUS_BUSY};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::registers::SimulatedRegisters;
use crate::error::{TransportError, TransportResult};
use crate::proxy::{FifoConfig, FifoDirection, FifoGrant, KernelProxy};

/// How the DMA engines answer status reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyMode {
    Idle,
    /// Report busy for this many more status reads.
    For(u32),
    Stuck,
}

/// Calls recorded by [`SimulatedProxy`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyCall {
    Open(String),
    Close,
    Poke { addr: u32, data: u32 },
    StartFifo(FifoConfig),
    StopFifo { channel: u32, direction: FifoDirection },
    FifoRead { channel: u32, delivered: bool },
    FifoWrite { channel: u32 },
}

#[derive(Default)]
struct Channel {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    rx_grant: Option<FifoGrant>,
    tx_grant: Option<FifoGrant>,
    rx_ready: Arc<Notify>,
    tx_space: Arc<Notify>,
}

#[derive(Default)]
struct State {
    open: Option<String>,
    busy: Option<BusyMode>,
    channels: HashMap<u32, Channel>,
    calls: Vec<ProxyCall>,
}

/// A kernel proxy backed by memory: a register file, per-channel frame
/// queues and a programmable DMA busy flag.
#[derive(Default)]
pub struct SimulatedProxy {
    regs: Arc<SimulatedRegisters>,
    state: Mutex<State>,
}

fn is_dma_status(addr: u32) -> bool {
    (0..DMA_MAX_CHANNELS).any(|ch| {
        addr == dma_tx_reg(ch, DMA_CTRL_STATUS_REG) || addr == dma_rx_reg(ch, DMA_CTRL_STATUS_REG)
    })
}

impl SimulatedProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registers(&self) -> Arc<SimulatedRegisters> {
        self.regs.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_busy(&self, mode: BusyMode) {
        self.state().busy = Some(mode);
    }

    /// Queue a frame as if the device had sent it on `channel`.
    pub fn inject_rx(&self, channel: u32, frame: impl Into<Vec<u8>>) {
        let mut state = self.state();
        let ch = state.channels.entry(channel).or_default();
        ch.rx.push_back(frame.into());
        ch.rx_ready.notify_one();
    }

    /// Drain frames the host wrote on `channel`.
    pub fn take_tx(&self, channel: u32) -> Vec<Vec<u8>> {
        let mut state = self.state();
        let ch = state.channels.entry(channel).or_default();
        let frames: Vec<_> = ch.tx.drain(..).collect();
        ch.tx_space.notify_one();
        frames
    }

    pub fn pending_rx(&self, channel: u32) -> usize {
        self.state().channels.get(&channel).map_or(0, |ch| ch.rx.len())
    }

    pub fn fifo_running(&self, channel: u32, direction: FifoDirection) -> bool {
        self.state().channels.get(&channel).is_some_and(|ch| match direction {
            FifoDirection::Rx => ch.rx_grant.is_some(),
            FifoDirection::Tx => ch.tx_grant.is_some(),
        })
    }

    pub fn calls(&self) -> Vec<ProxyCall> {
        self.state().calls.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state().open.is_some()
    }

    fn check_open(state: &State) -> TransportResult<()> {
        if state.open.is_some() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl KernelProxy for SimulatedProxy {
    async fn open(&self, resource: &str) -> TransportResult<()> {
        let mut state = self.state();
        state.calls.push(ProxyCall::Open(resource.to_string()));
        state.open = Some(resource.to_string());
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let mut state = self.state();
        state.calls.push(ProxyCall::Close);
        state.open = None;
        Ok(())
    }

    async fn peek32(&self, addr: u32) -> TransportResult<u32> {
        let mut state = self.state();
        Self::check_open(&state)?;
        if is_dma_status(addr) {
            let busy = match state.busy.unwrap_or(BusyMode::Idle) {
                BusyMode::Idle => false,
                BusyMode::Stuck => true,
                BusyMode::For(0) => {
                    state.busy = Some(BusyMode::Idle);
                    false
                }
                BusyMode::For(n) => {
                    state.busy = Some(BusyMode::For(n - 1));
                    true
                }
            };
            return Ok(if busy { DMA_STATUS_BUSY } else { 0 });
        }
        Ok(self.regs.read(addr))
    }

    async fn poke32(&self, addr: u32, data: u32) -> TransportResult<()> {
        let mut state = self.state();
        Self::check_open(&state)?;
        state.calls.push(ProxyCall::Poke { addr, data });
        self.regs.write(addr, data);
        Ok(())
    }

    async fn start_fifo(&self, cfg: FifoConfig) -> TransportResult<FifoGrant> {
        let mut state = self.state();
        Self::check_open(&state)?;
        state.calls.push(ProxyCall::StartFifo(cfg));
        let grant = FifoGrant {
            depth_words: cfg.depth_words.next_power_of_two(),
            frame_words: cfg.frame_words,
        };
        let ch = state.channels.entry(cfg.channel).or_default();
        match cfg.direction {
            FifoDirection::Rx => ch.rx_grant = Some(grant),
            FifoDirection::Tx => ch.tx_grant = Some(grant),
        }
        Ok(grant)
    }

    async fn stop_fifo(&self, channel: u32, direction: FifoDirection) -> TransportResult<()> {
        let mut state = self.state();
        state.calls.push(ProxyCall::StopFifo { channel, direction });
        if let Some(ch) = state.channels.get_mut(&channel) {
            match direction {
                FifoDirection::Rx => ch.rx_grant = None,
                FifoDirection::Tx => ch.tx_grant = None,
            }
        }
        Ok(())
    }

    async fn fifo_read(&self, channel: u32, buf: &mut [u8], timeout: Duration) -> TransportResult<Option<usize>> {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = {
                let mut guard = self.state();
                let state = &mut *guard;
                Self::check_open(state)?;
                let ch = state.channels.entry(channel).or_default();
                if let Some(frame) = ch.rx.pop_front() {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    state.calls.push(ProxyCall::FifoRead { channel, delivered: true });
                    return Ok(Some(n));
                }
                ch.rx_ready.clone()
            };
            if Instant::now() >= deadline
                || tokio::time::timeout_at(deadline, ready.notified()).await.is_err()
            {
                self.state().calls.push(ProxyCall::FifoRead { channel, delivered: false });
                return Ok(None);
            }
        }
    }

    async fn fifo_write(&self, channel: u32, frame: &[u8], timeout: Duration) -> TransportResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let space = {
                let mut guard = self.state();
                let state = &mut *guard;
                Self::check_open(state)?;
                let ch = state.channels.entry(channel).or_default();
                let limit = ch.tx_grant.map_or(usize::MAX, |g| g.num_frames().max(1));
                if ch.tx.len() < limit {
                    ch.tx.push_back(frame.to_vec());
                    state.calls.push(ProxyCall::FifoWrite { channel });
                    return Ok(true);
                }
                ch.tx_space.clone()
            };
            if Instant::now() >= deadline
                || tokio::time::timeout_at(deadline, space.notified()).await.is_err()
            {
                return Ok(false);
            }
        }
    }
}
