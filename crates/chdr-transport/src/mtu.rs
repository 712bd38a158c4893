//! Path MTU measurement for datagram links.
//!
//! The device runs an echo responder on [`MTU_PROBE_UDP_PORT`]. Each
//! direction is measured separately with a binary search over datagram
//! sizes, and the smaller result is used both ways: some NICs accept
//! oversized frames in one direction only.
//!
//! [`MTU_PROBE_UDP_PORT`]: chdr_core::wire::MTU_PROBE_UDP_PORT

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use chdr_core::config::{MtuConfig, MtuFallbackConfig};
use chdr_core::wire::{MtuProbe, MAX_PROBE_SIZE, MIN_UDP_PAYLOAD};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use zerocopy::AsBytes;

use crate::error::{TransportError, TransportResult};

const PROBE_HEADER: usize = std::mem::size_of::<MtuProbe>();

/// Both directions of an echo exchange. `Ok(false)` means the size did not
/// make it through in time.
#[async_trait]
pub trait EchoChannel: Send + Sync {
    /// Ask the responder for a `size`-byte datagram.
    async fn echo_recv(&self, size: usize, timeout: Duration) -> TransportResult<bool>;

    /// Send a `size`-byte datagram and wait for the responder to confirm it.
    async fn echo_send(&self, size: usize, timeout: Duration) -> TransportResult<bool>;

    fn describe(&self) -> String {
        "echo responder".to_string()
    }
}

/// Echo channel over a connected UDP socket.
pub struct UdpEcho {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpEcho {
    pub async fn connect(peer: SocketAddr) -> TransportResult<Self> {
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;
        Ok(Self { socket, peer })
    }

    /// Wait for a reply whose size field equals `size`. Returns the
    /// datagram length, or `None` on timeout.
    async fn await_reply(&self, size: usize, timeout: Duration) -> TransportResult<Option<usize>> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_PROBE_SIZE + PROBE_HEADER];
        loop {
            let n = match tokio::time::timeout_at(deadline, self.socket.recv(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(r) => r?,
            };
            match MtuProbe::parse(&buf[..n]) {
                Ok(reply) if reply.is_reply() && reply.size() as usize == size => return Ok(Some(n)),
                Ok(reply) => {
                    tracing::trace!(expected = size, got = reply.size(), "skipping stale echo");
                }
                Err(_) => {}
            }
        }
    }
}

#[async_trait]
impl EchoChannel for UdpEcho {
    async fn echo_recv(&self, size: usize, timeout: Duration) -> TransportResult<bool> {
        let request = MtuProbe::request(size as u32);
        self.socket.send(request.as_bytes()).await?;
        Ok(self.await_reply(size, timeout).await?.is_some_and(|n| n >= size))
    }

    async fn echo_send(&self, size: usize, timeout: Duration) -> TransportResult<bool> {
        let mut datagram = vec![0u8; size.max(PROBE_HEADER)];
        datagram[..PROBE_HEADER].copy_from_slice(MtuProbe::request(PROBE_HEADER as u32).as_bytes());
        self.socket.send(&datagram).await?;
        Ok(self.await_reply(datagram.len(), timeout).await?.is_some())
    }

    fn describe(&self) -> String {
        self.peer.to_string()
    }
}

// ── Search ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuFallback {
    /// No responder is an error.
    Fail,
    /// No responder: use this frame size, capped by the ceilings.
    UseDefault(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuProbeConfig {
    pub recv_ceiling: usize,
    pub send_ceiling: usize,
    pub echo_timeout: Duration,
    pub fallback: MtuFallback,
}

impl MtuProbeConfig {
    pub fn from_config(cfg: &MtuConfig, recv_ceiling: usize, send_ceiling: usize) -> Self {
        Self {
            recv_ceiling,
            send_ceiling,
            echo_timeout: Duration::from_millis(cfg.echo_timeout_ms),
            fallback: match cfg.fallback {
                MtuFallbackConfig::Fail => MtuFallback::Fail,
                MtuFallbackConfig::UseDefault => MtuFallback::UseDefault(cfg.default_frame_size),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuResult {
    pub recv: usize,
    pub send: usize,
    /// `min(recv, send)`; use this for both directions.
    pub negotiated: usize,
    /// False when the fallback size was used.
    pub probed: bool,
}

/// Binary search for the largest size `test` accepts, between 8 bytes and
/// `ceiling` (at most 8000, rounded down to a multiple of 4). Returns the
/// size and the number of probes sent.
pub async fn search<F, Fut>(ceiling: usize, mut test: F) -> (usize, u32)
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = TransportResult<bool>>,
{
    let mut min = PROBE_HEADER;
    let mut max = ceiling.min(MAX_PROBE_SIZE) & !3;
    let mut rounds = 0;
    while min < max {
        let size = (max / 2 + min / 2 + 3) & !3;
        rounds += 1;
        let ok = match test(size).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(size, error = %e, "echo probe failed");
                false
            }
        };
        tracing::debug!(size, ok, "echo probe");
        if ok {
            min = size;
        } else {
            max = size - 4;
        }
    }
    (min, rounds)
}

/// Measure the path MTU to an echo responder.
pub async fn probe_mtu(chan: &dyn EchoChannel, cfg: &MtuProbeConfig) -> TransportResult<MtuResult> {
    let timeout = cfg.echo_timeout;
    let supported = match chan.echo_recv(PROBE_HEADER, timeout).await {
        Ok(ok) => ok,
        Err(e) => {
            tracing::debug!(error = %e, "echo holler failed");
            false
        }
    };
    if !supported {
        return match cfg.fallback {
            MtuFallback::Fail => Err(TransportError::ProbeUnsupported(chan.describe())),
            MtuFallback::UseDefault(size) => {
                let size = size.min(cfg.recv_ceiling).min(cfg.send_ceiling);
                tracing::warn!(peer = %chan.describe(), frame_size = size, "no MTU echo responder, using default frame size");
                Ok(MtuResult {
                    recv: size,
                    send: size,
                    negotiated: size,
                    probed: false,
                })
            }
        };
    }

    let (recv, recv_rounds) = search(cfg.recv_ceiling, |size| chan.echo_recv(size, timeout)).await;
    if recv < MIN_UDP_PAYLOAD {
        return Err(TransportError::MtuTooSmall {
            found: recv,
            minimum: MIN_UDP_PAYLOAD,
        });
    }
    let (send, send_rounds) = search(cfg.send_ceiling, |size| chan.echo_send(size, timeout)).await;
    if send < MIN_UDP_PAYLOAD {
        return Err(TransportError::MtuTooSmall {
            found: send,
            minimum: MIN_UDP_PAYLOAD,
        });
    }

    let negotiated = recv.min(send);
    tracing::info!(
        peer = %chan.describe(),
        recv,
        send,
        negotiated,
        rounds = recv_rounds + send_rounds,
        "path MTU measured"
    );
    Ok(MtuResult {
        recv,
        send,
        negotiated,
        probed: true,
    })
}
