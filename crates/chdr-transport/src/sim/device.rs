//! Networked device on loopback UDP.
//!
//! Three sockets, one task each: firmware peek/poke (and discovery), the
//! MTU echo responder, and a CHDR endpoint that consumes data streams and
//! answers control packets against the shared register bank.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chdr_core::wire::{
    FwCommsPacket, MtuProbe, FW_COMMS_FLAGS_ACK, FW_COMMS_FLAGS_PEEK32, FW_COMMS_FLAGS_POKE32,
    MTU_PROBE_FLAGS_ECHO_REQUEST,
};
use chdr_core::{
    ChdrCodec, ChdrPacket, ChdrPayload, CtrlOpCode, CtrlPayload, CtrlStatus, StrcOpCode, StrsStatus,
};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use zerocopy::AsBytes;

use super::registers::{SimulatedRegisters, FW_CLAIM_EXPIRY};
use crate::error::TransportResult;
use crate::flow::{FlowControlUnits, RxFlowControl, StreamBuffParams, XferCounts};
use crate::session::{UdpDeviceAddr, DEFAULT_DEVICE_EPID};

const PROBE_LEN: usize = std::mem::size_of::<MtuProbe>();

#[derive(Debug, Clone)]
pub struct SimulatedDeviceConfig {
    /// Largest datagram the path carries, in either direction.
    pub path_mtu: usize,
    /// When false the echo port stays open but never answers.
    pub mtu_responder: bool,
    /// Firmware claim expiry. `None` never expires.
    pub claim_expiry: Option<Duration>,
    /// Endpoint id of the device's stream endpoint.
    pub epid: u16,
    pub stream_capacity: StreamBuffParams,
    pub codec: ChdrCodec,
    /// Firmware requests silently ignored before the responder starts
    /// answering.
    pub drop_fw_requests: usize,
}

impl Default for SimulatedDeviceConfig {
    fn default() -> Self {
        Self {
            path_mtu: 8000,
            mtu_responder: true,
            claim_expiry: Some(FW_CLAIM_EXPIRY),
            epid: DEFAULT_DEVICE_EPID,
            stream_capacity: StreamBuffParams {
                bytes: 1 << 20,
                packets: 1 << 16,
            },
            codec: ChdrCodec::default(),
            drop_fw_requests: 0,
        }
    }
}

pub struct SimulatedDevice {
    addr: UdpDeviceAddr,
    epid: u16,
    regs: Arc<SimulatedRegisters>,
    data_packets: Arc<AtomicU64>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl SimulatedDevice {
    pub async fn spawn(cfg: SimulatedDeviceConfig) -> TransportResult<Self> {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let fw = UdpSocket::bind((loopback, 0)).await?;
        let mtu = UdpSocket::bind((loopback, 0)).await?;
        let chdr = UdpSocket::bind((loopback, 0)).await?;
        let addr = UdpDeviceAddr {
            ip: loopback,
            ctrl_port: fw.local_addr()?.port(),
            mtu_port: mtu.local_addr()?.port(),
            chdr_port: chdr.local_addr()?.port(),
        };

        let regs = Arc::new(SimulatedRegisters::with_expiry(cfg.claim_expiry));
        let data_packets = Arc::new(AtomicU64::new(0));
        let (shutdown, _) = broadcast::channel::<()>(1);
        let tasks = vec![
            tokio::spawn(serve_fw(fw, regs.clone(), cfg.drop_fw_requests, shutdown.subscribe())),
            tokio::spawn(serve_mtu(mtu, cfg.path_mtu, cfg.mtu_responder, shutdown.subscribe())),
            tokio::spawn(serve_chdr(chdr, regs.clone(), cfg.clone(), data_packets.clone(), shutdown.subscribe())),
        ];
        tracing::info!(?addr, path_mtu = cfg.path_mtu, epid = cfg.epid, "simulated device up");
        Ok(Self {
            addr,
            epid: cfg.epid,
            regs,
            data_packets,
            shutdown,
            tasks,
        })
    }

    pub fn addr(&self) -> UdpDeviceAddr {
        self.addr
    }

    pub fn epid(&self) -> u16 {
        self.epid
    }

    pub fn registers(&self) -> Arc<SimulatedRegisters> {
        self.regs.clone()
    }

    /// DATA packets consumed by the stream endpoint.
    pub fn data_packets(&self) -> u64 {
        self.data_packets.load(Ordering::Relaxed)
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown.send(());
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!(addr = ?self.addr, "simulated device stopped");
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn next_datagram(
    socket: &UdpSocket,
    buf: &mut [u8],
    shutdown: &mut broadcast::Receiver<()>,
) -> Option<(usize, SocketAddr)> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return None,
            r = socket.recv_from(buf) => match r {
                Ok(got) => return Some(got),
                Err(e) => tracing::debug!(error = %e, "simulated device receive failed"),
            },
        }
    }
}

// ── Firmware control ──────────────────────────────────────────────────────────

async fn serve_fw(
    socket: UdpSocket,
    regs: Arc<SimulatedRegisters>,
    mut ignore: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = [0u8; 64];
    while let Some((n, from)) = next_datagram(&socket, &mut buf, &mut shutdown).await {
        let Ok(req) = FwCommsPacket::parse(&buf[..n]) else {
            continue;
        };
        if ignore > 0 {
            ignore -= 1;
            tracing::trace!(seq = req.sequence(), "simulated firmware ignoring request");
            continue;
        }
        let flags = req.flags();
        let mut data = req.data();
        if flags & FW_COMMS_FLAGS_POKE32 != 0 {
            regs.write(req.addr(), req.data());
        }
        if flags & FW_COMMS_FLAGS_PEEK32 != 0 {
            data = regs.read(req.addr());
        }
        if flags & FW_COMMS_FLAGS_ACK == 0 {
            continue;
        }
        let reply = FwCommsPacket::new(flags, req.sequence(), req.addr(), data);
        if let Err(e) = socket.send_to(reply.as_bytes(), from).await {
            tracing::debug!(%from, error = %e, "simulated firmware reply failed");
        }
    }
}

// ── MTU echo ──────────────────────────────────────────────────────────────────

async fn serve_mtu(socket: UdpSocket, path_mtu: usize, answer: bool, mut shutdown: broadcast::Receiver<()>) {
    let mut buf = vec![0u8; 65536];
    while let Some((n, from)) = next_datagram(&socket, &mut buf, &mut shutdown).await {
        if !answer || n > path_mtu {
            continue;
        }
        let Ok(probe) = MtuProbe::parse(&buf[..n]) else {
            continue;
        };
        if probe.flags() & MTU_PROBE_FLAGS_ECHO_REQUEST == 0 {
            continue;
        }
        let reply = if n == PROBE_LEN {
            let size = (probe.size() as usize).max(PROBE_LEN);
            if size > path_mtu {
                continue;
            }
            let mut out = vec![0u8; size];
            out[..PROBE_LEN].copy_from_slice(MtuProbe::reply(size as u32).as_bytes());
            out
        } else {
            MtuProbe::reply(n as u32).as_bytes().to_vec()
        };
        let _ = socket.send_to(&reply, from).await;
    }
}

// ── CHDR endpoint ─────────────────────────────────────────────────────────────

struct Peer {
    fc: RxFlowControl,
    host_epid: u16,
    seq: u16,
}

async fn serve_chdr(
    socket: UdpSocket,
    regs: Arc<SimulatedRegisters>,
    cfg: SimulatedDeviceConfig,
    data_packets: Arc<AtomicU64>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let codec = cfg.codec;
    let mut peers: HashMap<SocketAddr, Peer> = HashMap::new();
    let mut buf = vec![0u8; 65536];
    while let Some((n, from)) = next_datagram(&socket, &mut buf, &mut shutdown).await {
        let pkt = match codec.decode(&buf[..n]) {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::debug!(%from, error = %e, "simulated endpoint dropping frame");
                continue;
            }
        };
        let peer = peers.entry(from).or_insert_with(|| Peer {
            fc: RxFlowControl::new(cfg.stream_capacity, FlowControlUnits::BytesAndPackets),
            host_epid: 0,
            seq: 0,
        });

        let reply = match pkt.payload {
            ChdrPayload::StreamCommand(strc) => {
                peer.host_epid = strc.src_epid;
                match strc.op_code {
                    StrcOpCode::Init => {
                        if strc.num_bytes > 0 || strc.num_pkts > 0 {
                            peer.fc.set_freq(StreamBuffParams {
                                bytes: strc.num_bytes,
                                packets: strc.num_pkts.min(u32::MAX as u64) as u32,
                            });
                        }
                    }
                    StrcOpCode::Resync => peer.fc.resynchronize(XferCounts {
                        bytes: strc.num_bytes,
                        packets: strc.num_pkts,
                    }),
                    StrcOpCode::Ping => {}
                }
                let strs = peer.fc.status_payload(cfg.epid, StrsStatus::Okay);
                Some(ChdrPacket::stream_status(peer.host_epid, 0, strs))
            }
            ChdrPayload::Data(_) => {
                let size = pkt.header.length as usize;
                peer.fc.data_received(size);
                peer.fc.xfer_done(size);
                data_packets.fetch_add(1, Ordering::Relaxed);
                peer.fc.should_report().then(|| {
                    let strs = peer.fc.status_payload(cfg.epid, StrsStatus::Okay);
                    ChdrPacket::stream_status(peer.host_epid, 0, strs)
                })
            }
            ChdrPayload::Control(req) if !req.is_ack => {
                let host = req.src_epid;
                Some(ChdrPacket::control(host, 0, answer_ctrl(&regs, req, cfg.epid)))
            }
            _ => None,
        };

        if let Some(mut reply) = reply {
            reply.header.seq_num = peer.seq;
            peer.seq = peer.seq.wrapping_add(1);
            match codec.encode(&reply) {
                Ok(wire) => {
                    let _ = socket.send_to(&wire, from).await;
                }
                Err(e) => tracing::warn!(error = %e, "simulated endpoint could not encode reply"),
            }
        }
    }
}

fn answer_ctrl(regs: &SimulatedRegisters, req: CtrlPayload, epid: u16) -> CtrlPayload {
    let value = req.data.first().copied().unwrap_or(0);
    let mut reply = CtrlPayload {
        dst_port: req.src_port,
        src_port: req.dst_port,
        seq_num: req.seq_num,
        timestamp: None,
        is_ack: true,
        src_epid: epid,
        address: req.address,
        data: req.data,
        byte_enable: req.byte_enable,
        op_code: req.op_code,
        status: CtrlStatus::Okay,
    };
    match req.op_code {
        CtrlOpCode::Write => regs.write(req.address, value),
        CtrlOpCode::Read => reply.data = vec![regs.read(req.address)],
        CtrlOpCode::ReadWrite => {
            reply.data = vec![regs.read(req.address)];
            regs.write(req.address, value);
        }
        CtrlOpCode::Sleep => {}
        _ => reply.status = CtrlStatus::CommandError,
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::{FwCtrl, RegisterIface};
    use crate::mtu::{probe_mtu, MtuFallback, MtuProbeConfig, UdpEcho};

    #[tokio::test]
    async fn firmware_peek_poke() {
        let device = SimulatedDevice::spawn(SimulatedDeviceConfig::default()).await.unwrap();
        let ctrl = FwCtrl::connect(device.addr().ctrl()).await.unwrap();
        ctrl.poke32(0x1234, 0xDEAD_BEEF).await.unwrap();
        assert_eq!(ctrl.peek32(0x1234).await.unwrap(), 0xDEAD_BEEF);
        assert_eq!(device.registers().read(0x1234), 0xDEAD_BEEF);
        device.stop().await;
    }

    #[tokio::test]
    async fn echo_respects_path_mtu() {
        let device = SimulatedDevice::spawn(SimulatedDeviceConfig {
            path_mtu: 1500,
            ..SimulatedDeviceConfig::default()
        })
        .await
        .unwrap();
        let echo = UdpEcho::connect(device.addr().mtu()).await.unwrap();
        let cfg = MtuProbeConfig {
            recv_ceiling: 8000,
            send_ceiling: 8000,
            echo_timeout: Duration::from_millis(50),
            fallback: MtuFallback::Fail,
        };
        let result = probe_mtu(&echo, &cfg).await.unwrap();
        assert_eq!(result.negotiated, 1500);
        device.stop().await;
    }

    #[test]
    fn ctrl_answers_swap_ports_and_ack() {
        let regs = SimulatedRegisters::with_expiry(None);
        regs.write(0x40, 7);
        let req = CtrlPayload {
            dst_port: 3,
            src_port: 9,
            seq_num: 5,
            src_epid: 1,
            address: 0x40,
            op_code: CtrlOpCode::Read,
            ..CtrlPayload::default()
        };
        let reply = answer_ctrl(&regs, req, 0x100);
        assert!(reply.is_ack);
        assert_eq!((reply.dst_port, reply.src_port, reply.seq_num), (9, 3, 5));
        assert_eq!(reply.data, vec![7]);

        let bad = CtrlPayload {
            op_code: CtrlOpCode::Poll,
            ..CtrlPayload::default()
        };
        assert_eq!(answer_ctrl(&regs, bad, 0x100).status, CtrlStatus::CommandError);
    }
}
