//! Register access to the device.
//!
//! Three implementations of [`RegisterIface`]:
//! - [`FwCtrl`]: firmware peek/poke over UDP (networked devices).
//! - [`ChdrCtrl`]: CHDR CONTROL packets over a transport.
//! - [`crate::proxy::ProxyRegisters`]: the kernel proxy (DMA devices).
//!
//! Every implementation runs one transaction at a time and retries a
//! failed exchange a bounded number of times.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chdr_core::wire::{
    FwCommsPacket, FW_COMMS_FLAGS_ACK, FW_COMMS_FLAGS_ERROR, FW_COMMS_FLAGS_PEEK32,
    FW_COMMS_FLAGS_POKE32,
};
use chdr_core::{ChdrPacket, ChdrPayload, CtrlOpCode, CtrlPayload, CtrlStatus};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use zerocopy::AsBytes;

use crate::claim::{self, ClaimStatus};
use crate::error::{TransportError, TransportResult};
use crate::stream::ChdrTransport;

/// Attempts per transaction before giving up.
pub const CTRL_ATTEMPTS: u32 = 3;

/// Per-attempt reply timeout for firmware peek/poke.
pub const FW_CTRL_TIMEOUT: Duration = Duration::from_millis(100);

#[async_trait]
pub trait RegisterIface: Send + Sync {
    async fn peek32(&self, addr: u32) -> TransportResult<u32>;

    async fn poke32(&self, addr: u32, data: u32) -> TransportResult<()>;
}

/// Run `f` up to `attempts` times while it fails with a retryable error.
/// Each failure is logged; the last one is returned inside
/// `RetriesExhausted`. Non-retryable errors return immediately.
pub async fn with_retries<T, F, Fut>(op: &str, attempts: u32, mut f: F) -> TransportResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = TransportResult<T>>,
{
    let mut last = TransportError::Closed;
    for attempt in 1..=attempts.max(1) {
        match f(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() => {
                tracing::warn!(op, attempt, attempts, error = %e, "control transaction failed");
                last = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(TransportError::RetriesExhausted {
        op: op.to_string(),
        attempts: attempts.max(1),
        last: Box::new(last),
    })
}

// ── Firmware peek/poke ────────────────────────────────────────────────────────

pub struct FwCtrl {
    socket: UdpSocket,
    peer: SocketAddr,
    /// Serialises transactions; one request may be outstanding.
    lock: Mutex<()>,
    seq: AtomicU32,
    timeout: Duration,
    attempts: u32,
}

impl FwCtrl {
    pub async fn connect(peer: SocketAddr) -> TransportResult<Self> {
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;
        tracing::debug!(%peer, "firmware control connected");
        Ok(Self {
            socket,
            peer,
            lock: Mutex::new(()),
            seq: AtomicU32::new(rand::random()),
            timeout: FW_CTRL_TIMEOUT,
            attempts: CTRL_ATTEMPTS,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn transact(&self, op: &str, flags: u32, addr: u32, data: u32) -> TransportResult<u32> {
        let _guard = self.lock.lock().await;
        with_retries(op, self.attempts, |_| {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            self.exchange(seq, flags, addr, data)
        })
        .await
    }

    async fn exchange(&self, seq: u32, flags: u32, addr: u32, data: u32) -> TransportResult<u32> {
        let request = FwCommsPacket::new(flags, seq, addr, data);
        self.socket.send(request.as_bytes()).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 64];
        loop {
            let n = match tokio::time::timeout_at(deadline, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    return Err(TransportError::ReplyMismatch(format!("{} refused the request", self.peer)));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(TransportError::Timeout {
                        what: "firmware reply",
                        after: self.timeout,
                    })
                }
            };
            let reply = match FwCommsPacket::parse(&buf[..n]) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "dropping malformed firmware reply");
                    continue;
                }
            };
            if reply.sequence() != seq {
                tracing::trace!(expected = seq, got = reply.sequence(), "skipping stale firmware reply");
                continue;
            }
            if reply.flags() & FW_COMMS_FLAGS_ERROR != 0 {
                return Err(TransportError::DeviceError(format!("register 0x{addr:08x}")));
            }
            if reply.flags() & FW_COMMS_FLAGS_ACK == 0 || reply.addr() != addr {
                return Err(TransportError::ReplyMismatch(format!(
                    "flags 0x{:x} addr 0x{:08x} for request to 0x{addr:08x}",
                    reply.flags(),
                    reply.addr()
                )));
            }
            return Ok(reply.data());
        }
    }
}

#[async_trait]
impl RegisterIface for FwCtrl {
    async fn peek32(&self, addr: u32) -> TransportResult<u32> {
        self.transact("peek32", FW_COMMS_FLAGS_ACK | FW_COMMS_FLAGS_PEEK32, addr, 0)
            .await
    }

    async fn poke32(&self, addr: u32, data: u32) -> TransportResult<()> {
        self.transact("poke32", FW_COMMS_FLAGS_ACK | FW_COMMS_FLAGS_POKE32, addr, data)
            .await
            .map(|_| ())
    }
}

// ── CHDR control ──────────────────────────────────────────────────────────────

/// Register access through CHDR CONTROL packets to one endpoint port.
pub struct ChdrCtrl {
    transport: Arc<ChdrTransport>,
    dst_port: u16,
    src_port: u16,
    lock: Mutex<u8>,
    timeout: Duration,
    attempts: u32,
}

impl ChdrCtrl {
    pub fn new(transport: Arc<ChdrTransport>, dst_port: u16) -> Self {
        Self {
            transport,
            dst_port,
            src_port: 0,
            lock: Mutex::new(0),
            timeout: FW_CTRL_TIMEOUT,
            attempts: CTRL_ATTEMPTS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn transact(&self, op_code: CtrlOpCode, addr: u32, data: u32) -> TransportResult<u32> {
        let mut seq = self.lock.lock().await;
        let op = format!("ctrl {op_code:?} 0x{addr:05x}");
        let mut attempt_seq = *seq;
        let result = with_retries(&op, self.attempts, |_| {
            attempt_seq = (attempt_seq + 1) & 0x3F;
            self.exchange(attempt_seq, op_code, addr, data)
        })
        .await;
        *seq = attempt_seq;
        result
    }

    async fn exchange(&self, seq_num: u8, op_code: CtrlOpCode, address: u32, data: u32) -> TransportResult<u32> {
        let request = CtrlPayload {
            dst_port: self.dst_port,
            src_port: self.src_port,
            seq_num,
            src_epid: self.transport.src_epid(),
            address,
            data: vec![data],
            op_code,
            ..CtrlPayload::default()
        };
        let pkt = ChdrPacket::control(self.transport.dst_epid(), 0, request);
        if !self.transport.send(pkt, self.timeout).await? {
            return Err(TransportError::Timeout {
                what: "control send buffer",
                after: self.timeout,
            });
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(pkt) = self.transport.recv(remaining).await? else {
                return Err(TransportError::Timeout {
                    what: "control response",
                    after: self.timeout,
                });
            };
            let ChdrPayload::Control(reply) = pkt.payload else {
                tracing::debug!(pkt_type = %pkt.header.pkt_type, "ignoring non-control packet on control transport");
                continue;
            };
            if !reply.is_ack || reply.seq_num != seq_num {
                tracing::trace!(expected = seq_num, got = reply.seq_num, "skipping stale control response");
                continue;
            }
            if reply.status != CtrlStatus::Okay {
                return Err(TransportError::DeviceError(format!(
                    "register 0x{address:05x} ({:?})",
                    reply.status
                )));
            }
            if reply.address != address || reply.op_code != op_code {
                return Err(TransportError::ReplyMismatch(format!(
                    "{:?} 0x{:05x} for {op_code:?} 0x{address:05x}",
                    reply.op_code, reply.address
                )));
            }
            return Ok(reply.data.first().copied().unwrap_or(0));
        }
    }
}

#[async_trait]
impl RegisterIface for ChdrCtrl {
    async fn peek32(&self, addr: u32) -> TransportResult<u32> {
        self.transact(CtrlOpCode::Read, addr, 0).await
    }

    async fn poke32(&self, addr: u32, data: u32) -> TransportResult<()> {
        self.transact(CtrlOpCode::Write, addr, data).await.map(|_| ())
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Firmware control address of the responder.
    pub addr: SocketAddr,
    /// `None` when the claim registers could not be read.
    pub claim: Option<ClaimStatus>,
}

impl DiscoveredDevice {
    pub fn available(&self) -> bool {
        self.claim != Some(ClaimStatus::ClaimedByOther)
    }
}

/// Quiet period that ends reply collection.
pub const DISCOVERY_SILENCE: Duration = Duration::from_millis(50);

/// Broadcast a discovery request to `target` and collect responders until
/// `silence` passes without a reply. Each responder's claim state is read
/// over firmware control.
pub async fn discover(target: SocketAddr, ours: u32, silence: Duration) -> TransportResult<Vec<DiscoveredDevice>> {
    let sock = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_broadcast(true)?;
    sock.set_nonblocking(true)?;
    let bind: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    sock.bind(&bind.into())?;
    let socket = UdpSocket::from_std(sock.into())?;

    let seq: u32 = rand::random();
    let request = FwCommsPacket::new(FW_COMMS_FLAGS_ACK, seq, 0, 0);
    socket.send_to(request.as_bytes(), target).await?;
    tracing::debug!(%target, seq, "discovery request sent");

    let mut responders: Vec<SocketAddr> = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let (n, from) = match tokio::time::timeout(silence, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(r) => r?,
        };
        let Ok(reply) = FwCommsPacket::parse(&buf[..n]) else {
            continue;
        };
        if reply.sequence() != seq || reply.flags() & FW_COMMS_FLAGS_ACK == 0 {
            continue;
        }
        if !responders.contains(&from) {
            responders.push(from);
        }
    }

    let mut found = Vec::with_capacity(responders.len());
    for addr in responders {
        let claim = match FwCtrl::connect(addr).await {
            Ok(ctrl) => match claim::claim_status(&ctrl, ours).await {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!(%addr, error = %e, "could not read claim state");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(%addr, error = %e, "could not connect to responder");
                None
            }
        };
        tracing::info!(%addr, claim = ?claim, "discovered device");
        found.push(DiscoveredDevice { addr, claim });
    }
    Ok(found)
}

/// [`discover`] without devices held by another process.
pub async fn discover_available(target: SocketAddr, ours: u32, silence: Duration) -> TransportResult<Vec<DiscoveredDevice>> {
    let mut found = discover(target, ours, silence).await?;
    found.retain(DiscoveredDevice::available);
    Ok(found)
}
