//! Transport session: one per opened device.
//!
//! Opening a session measures (UDP) or page-checks (DMA) the frame
//! geometry, sets up register access, claims the device and starts the
//! claim heartbeat. The session then hands out control transports and data
//! streams, each with its own endpoint id and link. `close` undoes all of
//! it in order.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chdr_core::config::ChdrConfig;
use chdr_core::regs::{CLAIM_SRC_REG, DMA_MAX_CHANNELS};
use chdr_core::wire::{CHDR_UDP_PORT, FW_COMMS_UDP_PORT, MTU_PROBE_UDP_PORT};
use chdr_core::ChdrCodec;
use dashmap::DashSet;

use crate::claim::{self, ClaimHeartbeat, ClaimPolicy};
use crate::ctrl::{FwCtrl, RegisterIface};
use crate::dma::{ChannelAllocator, DmaLink};
use crate::error::{TransportError, TransportResult};
use crate::flow::{FlowControlPolicy, StreamBuffParams};
use crate::link::{Link, LinkKind, LinkParams, LinkPurpose};
use crate::mtu::{probe_mtu, MtuFallback, MtuProbeConfig, MtuResult, UdpEcho};
use crate::negotiate::{negotiate_dma_params, negotiate_udp_params, page_size, LinkHints};
use crate::proxy::{KernelProxy, ProxyRegisters};
use crate::stream::{ChdrTransport, RxStream, TxStream};
use crate::udp::DatagramLink;

/// Endpoint id of the device's stream endpoint unless configured otherwise.
pub const DEFAULT_DEVICE_EPID: u16 = 0x100;

/// UDP ports of a networked device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDeviceAddr {
    pub ip: IpAddr,
    pub ctrl_port: u16,
    pub mtu_port: u16,
    pub chdr_port: u16,
}

impl UdpDeviceAddr {
    /// The standard ports on `ip`.
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            ctrl_port: FW_COMMS_UDP_PORT,
            mtu_port: MTU_PROBE_UDP_PORT,
            chdr_port: CHDR_UDP_PORT,
        }
    }

    pub fn ctrl(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.ctrl_port)
    }

    pub fn mtu(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.mtu_port)
    }

    pub fn chdr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.chdr_port)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub codec: ChdrCodec,
    /// User overrides for data links.
    pub hints: LinkHints,
    pub probe_mtu: bool,
    pub echo_timeout: Duration,
    pub mtu_fallback: MtuFallback,
    pub flow_control: FlowControlPolicy,
    /// `None` opens without claiming.
    pub claim: Option<ClaimPolicy>,
    /// Continue unclaimed when another process holds the device.
    pub allow_unclaimed: bool,
    pub device_epid: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            codec: ChdrCodec::default(),
            hints: LinkHints::default(),
            probe_mtu: true,
            echo_timeout: Duration::from_millis(20),
            mtu_fallback: MtuFallback::UseDefault(1472),
            flow_control: FlowControlPolicy::default(),
            claim: Some(ClaimPolicy::default()),
            allow_unclaimed: false,
            device_epid: DEFAULT_DEVICE_EPID,
        }
    }
}

impl SessionOptions {
    pub fn from_config(cfg: &ChdrConfig) -> TransportResult<Self> {
        let probe = MtuProbeConfig::from_config(&cfg.mtu, 0, 0);
        Ok(Self {
            codec: cfg.codec.codec()?,
            hints: LinkHints::from(&cfg.link),
            probe_mtu: cfg.mtu.probe,
            echo_timeout: probe.echo_timeout,
            mtu_fallback: probe.fallback,
            flow_control: FlowControlPolicy::from(&cfg.flow_control),
            claim: cfg.claim.enabled.then(|| ClaimPolicy::from(&cfg.claim)),
            allow_unclaimed: cfg.claim.allow_unclaimed,
            device_epid: DEFAULT_DEVICE_EPID,
        })
    }
}

// ── Endpoint ids ──────────────────────────────────────────────────────────────

/// Hands out 16-bit endpoint ids. 0 is never allocated.
#[derive(Debug, Default)]
pub struct EpidAllocator {
    in_use: DashSet<u16>,
}

impl EpidAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `epid` taken, e.g. by the device. False if it already was.
    pub fn reserve(&self, epid: u16) -> bool {
        self.in_use.insert(epid)
    }

    pub fn allocate(&self) -> TransportResult<u16> {
        (1..=u16::MAX)
            .find(|epid| self.in_use.insert(*epid))
            .ok_or(TransportError::ResourceExhausted("endpoint id"))
    }

    pub fn release(&self, epid: u16) {
        self.in_use.remove(&epid);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

enum Backend {
    Udp {
        addr: UdpDeviceAddr,
        mtu: Option<MtuResult>,
    },
    Dma {
        proxy: Arc<dyn KernelProxy>,
        channels: ChannelAllocator,
        page: usize,
    },
}

struct OpenLink {
    link: Arc<dyn Link>,
    channel: Option<u32>,
}

/// A data stream's link, DMA channel and endpoint id.
#[derive(Clone)]
struct StreamResources {
    link: Arc<dyn Link>,
    channel: Option<u32>,
    epid: u16,
}

type Retired = Arc<Mutex<Vec<StreamResources>>>;

/// Owned by a stream. On drop its resources go back to the session, which
/// closes the link and frees the channel and endpoint id before the next
/// stream opens (or in `close`).
pub(crate) struct StreamLease {
    held: StreamResources,
    retired: Retired,
}

impl StreamLease {
    fn transport(&self, opts: &SessionOptions) -> Arc<ChdrTransport> {
        Arc::new(ChdrTransport::new(
            self.held.link.clone(),
            opts.codec,
            self.held.epid,
            opts.device_epid,
        ))
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        tracing::debug!(epid = self.held.epid, channel = ?self.held.channel, "stream dropped, retiring its link");
        self.retired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(self.held.clone());
    }
}

pub struct TransportSession {
    backend: Backend,
    opts: SessionOptions,
    regs: Arc<dyn RegisterIface>,
    ours: u32,
    claimed: bool,
    heartbeat: Option<ClaimHeartbeat>,
    epids: EpidAllocator,
    ctrl_link: Arc<dyn Link>,
    links: Mutex<Vec<OpenLink>>,
    retired: Retired,
    closed: bool,
}

impl TransportSession {
    /// Open a networked device.
    pub async fn open_udp(addr: UdpDeviceAddr, opts: SessionOptions) -> TransportResult<Self> {
        let rx_defaults = LinkParams::udp_default(LinkPurpose::RxData);
        let tx_defaults = LinkParams::udp_default(LinkPurpose::TxData);
        let mtu = if opts.probe_mtu {
            let echo = UdpEcho::connect(addr.mtu()).await?;
            let cfg = MtuProbeConfig {
                recv_ceiling: opts.hints.recv_frame_size.unwrap_or(rx_defaults.recv_frame_size),
                send_ceiling: opts.hints.send_frame_size.unwrap_or(tx_defaults.send_frame_size),
                echo_timeout: opts.echo_timeout,
                fallback: opts.mtu_fallback,
            };
            Some(probe_mtu(&echo, &cfg).await?)
        } else {
            None
        };
        let frame_limit = mtu.map(|m| m.negotiated);
        negotiate_udp_params(rx_defaults, &opts.hints, frame_limit)?;
        negotiate_udp_params(tx_defaults, &opts.hints, frame_limit)?;

        let regs: Arc<dyn RegisterIface> = Arc::new(FwCtrl::connect(addr.ctrl()).await?);
        let ours = claim::process_hash();
        let (claimed, heartbeat) = acquire_claim(&regs, ours, &opts).await?;

        let ctrl_params = negotiate_udp_params(
            LinkParams::udp_default(LinkPurpose::Control),
            &LinkHints::default(),
            frame_limit,
        )?;
        let ctrl_link: Arc<dyn Link> = match DatagramLink::connect(addr.chdr(), ctrl_params).await {
            Ok(link) => Arc::new(link),
            Err(e) => {
                abandon_claim(regs.as_ref(), claimed, heartbeat).await;
                return Err(e);
            }
        };

        tracing::info!(
            device = %addr.ip,
            mtu = ?frame_limit,
            claimed,
            "transport session open"
        );
        Ok(Self::assemble(Backend::Udp { addr, mtu }, opts, regs, ours, claimed, heartbeat, ctrl_link))
    }

    /// Open a bus-attached device through a kernel proxy.
    pub async fn open_dma(proxy: Arc<dyn KernelProxy>, resource: &str, opts: SessionOptions) -> TransportResult<Self> {
        let page = page_size();
        for purpose in [LinkPurpose::TxData, LinkPurpose::RxData] {
            negotiate_dma_params(LinkParams::dma_default(purpose), &opts.hints, page)?;
        }
        let ctrl_params = negotiate_dma_params(LinkParams::dma_default(LinkPurpose::Control), &LinkHints::default(), page)?;

        proxy.open(resource).await?;
        let channels = ChannelAllocator::new(DMA_MAX_CHANNELS);
        let ctrl_channel = match channels.allocate(LinkPurpose::Control) {
            Ok(channel) => channel,
            Err(e) => {
                abandon_proxy(proxy.as_ref()).await;
                return Err(e);
            }
        };
        let ctrl_link: Arc<dyn Link> = match DmaLink::open(proxy.clone(), ctrl_channel, ctrl_params).await {
            Ok(link) => Arc::new(link),
            Err(e) => {
                channels.release(ctrl_channel);
                abandon_proxy(proxy.as_ref()).await;
                return Err(e);
            }
        };

        let regs: Arc<dyn RegisterIface> = Arc::new(ProxyRegisters::new(proxy.clone()));
        let ours = claim::process_hash();
        let (claimed, heartbeat) = match acquire_claim(&regs, ours, &opts).await {
            Ok(claim) => claim,
            Err(e) => {
                if let Err(close_err) = ctrl_link.close().await {
                    tracing::warn!(error = %close_err, channel = ctrl_channel, "control link close failed");
                }
                channels.release(ctrl_channel);
                abandon_proxy(proxy.as_ref()).await;
                return Err(e);
            }
        };

        tracing::info!(resource, page, claimed, "transport session open");
        let mut session = Self::assemble(
            Backend::Dma { proxy, channels, page },
            opts,
            regs,
            ours,
            claimed,
            heartbeat,
            ctrl_link.clone(),
        );
        session.links.get_mut().unwrap_or_else(|e| e.into_inner()).push(OpenLink {
            link: ctrl_link,
            channel: Some(ctrl_channel),
        });
        Ok(session)
    }

    fn assemble(
        backend: Backend,
        opts: SessionOptions,
        regs: Arc<dyn RegisterIface>,
        ours: u32,
        claimed: bool,
        heartbeat: Option<ClaimHeartbeat>,
        ctrl_link: Arc<dyn Link>,
    ) -> Self {
        let epids = EpidAllocator::new();
        epids.reserve(opts.device_epid);
        let links = match backend {
            Backend::Udp { .. } => vec![OpenLink {
                link: ctrl_link.clone(),
                channel: None,
            }],
            Backend::Dma { .. } => Vec::new(),
        };
        Self {
            backend,
            opts,
            regs,
            ours,
            claimed,
            heartbeat,
            epids,
            ctrl_link,
            links: Mutex::new(links),
            retired: Retired::default(),
            closed: false,
        }
    }

    pub fn kind(&self) -> LinkKind {
        match self.backend {
            Backend::Udp { .. } => LinkKind::Datagram,
            Backend::Dma { .. } => LinkKind::Dma,
        }
    }

    /// Register access to the device, shared with the claim heartbeat.
    pub fn registers(&self) -> Arc<dyn RegisterIface> {
        self.regs.clone()
    }

    pub fn claimed(&self) -> bool {
        self.claimed
    }

    pub fn process_hash(&self) -> u32 {
        self.ours
    }

    /// Path MTU measured at open, if probed.
    pub fn mtu(&self) -> Option<MtuResult> {
        match self.backend {
            Backend::Udp { mtu, .. } => mtu,
            Backend::Dma { .. } => None,
        }
    }

    pub fn epids(&self) -> &EpidAllocator {
        &self.epids
    }

    pub fn options(&self) -> &SessionOptions {
        &self.opts
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn open_link(&self, purpose: LinkPurpose) -> TransportResult<(Arc<dyn Link>, Option<u32>)> {
        let (link, channel): (Arc<dyn Link>, Option<u32>) = match &self.backend {
            Backend::Udp { addr, mtu } => {
                let params = negotiate_udp_params(
                    LinkParams::udp_default(purpose),
                    &self.opts.hints,
                    mtu.map(|m| m.negotiated),
                )?;
                (Arc::new(DatagramLink::connect(addr.chdr(), params).await?), None)
            }
            Backend::Dma { proxy, channels, page } => {
                let params = negotiate_dma_params(LinkParams::dma_default(purpose), &self.opts.hints, *page)?;
                let channel = channels.allocate(purpose)?;
                match DmaLink::open(proxy.clone(), channel, params).await {
                    Ok(link) => (Arc::new(link), Some(channel)),
                    Err(e) => {
                        channels.release(channel);
                        return Err(e);
                    }
                }
            }
        };
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(OpenLink {
                link: link.clone(),
                channel,
            });
        Ok((link, channel))
    }

    /// Endpoint id and link for a new data stream. Resources of streams
    /// dropped since the last call are reclaimed first.
    async fn lease_stream(&self, purpose: LinkPurpose) -> TransportResult<StreamLease> {
        self.reap_streams().await;
        let epid = self.epids.allocate()?;
        let (link, channel) = match self.open_link(purpose).await {
            Ok(opened) => opened,
            Err(e) => {
                self.epids.release(epid);
                return Err(e);
            }
        };
        Ok(StreamLease {
            held: StreamResources { link, channel, epid },
            retired: self.retired.clone(),
        })
    }

    /// Close the links of dropped streams and free their channels and
    /// endpoint ids. Returns the first link close error.
    async fn reap_streams(&self) -> Option<TransportError> {
        let retired = std::mem::take(&mut *self.retired.lock().unwrap_or_else(|e| e.into_inner()));
        let mut first_err = None;
        for held in retired {
            self.links
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|open| !Arc::ptr_eq(&open.link, &held.link));
            if let Err(e) = held.link.close().await {
                tracing::warn!(error = %e, epid = held.epid, channel = ?held.channel, "stream link close failed");
                first_err.get_or_insert(e);
            }
            if let (Some(channel), Backend::Dma { channels, .. }) = (held.channel, &self.backend) {
                channels.release(channel);
            }
            self.epids.release(held.epid);
            tracing::debug!(epid = held.epid, channel = ?held.channel, "stream resources reclaimed");
        }
        first_err
    }

    /// A CHDR transport to the device endpoint over the control link.
    pub fn make_ctrl_transport(&self) -> TransportResult<Arc<ChdrTransport>> {
        self.check_open()?;
        let epid = self.epids.allocate()?;
        tracing::debug!(epid, dst_epid = self.opts.device_epid, "control transport");
        Ok(Arc::new(ChdrTransport::new(
            self.ctrl_link.clone(),
            self.opts.codec,
            epid,
            self.opts.device_epid,
        )))
    }

    /// An initialised producer stream to the device endpoint on a new link.
    pub async fn make_tx_stream(&self) -> TransportResult<TxStream> {
        self.check_open()?;
        let lease = self.lease_stream(LinkPurpose::TxData).await?;
        let transport = lease.transport(&self.opts);
        let mut stream = TxStream::new(transport, self.opts.flow_control).with_lease(lease);
        let init = stream.initialize().await;
        if let Err(e) = init {
            drop(stream);
            self.reap_streams().await;
            return Err(e);
        }
        Ok(stream)
    }

    /// A consumer stream on a new link. The device, as producer, drives
    /// initialisation through [`RxStream::accept_init`].
    pub async fn make_rx_stream(&self, capacity: StreamBuffParams) -> TransportResult<RxStream> {
        self.check_open()?;
        let lease = self.lease_stream(LinkPurpose::RxData).await?;
        let transport = lease.transport(&self.opts);
        Ok(RxStream::new(transport, capacity, self.opts.flow_control.units).with_lease(lease))
    }

    /// Stop the heartbeat, release the claim, tear down every link and
    /// give back DMA channels. Safe to call twice.
    pub async fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err: Option<TransportError> = None;

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        if self.claimed {
            match claim::release(self.regs.as_ref()).await {
                Ok(()) => tracing::info!("device claim released"),
                Err(e) => {
                    tracing::warn!(error = %e, "could not release device claim");
                    first_err.get_or_insert(e);
                }
            }
            self.claimed = false;
        }

        if let Some(e) = self.reap_streams().await {
            first_err.get_or_insert(e);
        }
        let links: Vec<OpenLink> = std::mem::take(self.links.get_mut().unwrap_or_else(|e| e.into_inner()));
        // Data links first, control link last.
        for open in links.into_iter().rev() {
            if let Err(e) = open.link.close().await {
                tracing::warn!(error = %e, channel = ?open.channel, "link close failed");
                first_err.get_or_insert(e);
            }
            if let (Some(channel), Backend::Dma { channels, .. }) = (open.channel, &self.backend) {
                channels.release(channel);
            }
        }

        if let Backend::Dma { proxy, .. } = &self.backend {
            if let Err(e) = proxy.close().await {
                first_err.get_or_insert(e);
            }
        }
        tracing::info!(kind = ?self.kind(), "transport session closed");
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(kind = ?self.kind(), "transport session dropped without close");
        }
    }
}

/// Claim the device if the options ask for it. Returns whether we hold the
/// claim and the heartbeat keeping it.
async fn acquire_claim(
    regs: &Arc<dyn RegisterIface>,
    ours: u32,
    opts: &SessionOptions,
) -> TransportResult<(bool, Option<ClaimHeartbeat>)> {
    let Some(policy) = opts.claim else {
        return Ok((false, None));
    };
    if claim::try_to_claim(regs.as_ref(), ours, &policy).await? {
        tracing::info!(ours = %format!("{ours:08x}"), "device claimed");
        let heartbeat = ClaimHeartbeat::spawn(regs.clone(), ours, policy.heartbeat_period);
        return Ok((true, Some(heartbeat)));
    }
    let owner = regs.peek32(CLAIM_SRC_REG).await.unwrap_or(0);
    if opts.allow_unclaimed {
        tracing::warn!(
            owner = %format!("{owner:08x}"),
            "device claimed by another process, continuing unclaimed"
        );
        Ok((false, None))
    } else {
        Err(TransportError::DeviceClaimed(owner))
    }
}

/// Undo [`acquire_claim`] when the open fails after it.
async fn abandon_claim(regs: &dyn RegisterIface, claimed: bool, heartbeat: Option<ClaimHeartbeat>) {
    if let Some(heartbeat) = heartbeat {
        heartbeat.stop().await;
    }
    if claimed {
        if let Err(e) = claim::release(regs).await {
            tracing::warn!(error = %e, "could not release device claim");
        }
    }
}

/// Close the proxy after a failed DMA open.
async fn abandon_proxy(proxy: &dyn KernelProxy) {
    if let Err(e) = proxy.close().await {
        tracing::warn!(error = %e, "could not close kernel proxy");
    }
}
