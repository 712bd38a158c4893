//! Packet transports and flow-controlled streams.
//!
//! [`ChdrTransport`] turns a link's frames into [`ChdrPacket`]s: it stamps
//! sequence numbers, encodes into send buffers and drops frames that do not
//! decode. [`TxStream`] and [`RxStream`] run the stream handshake and the
//! credit loop on top of one transport each.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chdr_core::{
    ChdrCodec, ChdrPacket, ChdrPayload, StrcOpCode, StrcPayload, StrsPayload, StrsStatus,
};
use tokio::time::Instant;

use crate::error::{TransportError, TransportResult};
use crate::flow::{
    fc_freq, FlowControlPolicy, FlowControlUnits, RxFlowControl, StreamBuffParams, TxFlowControl,
    XferCounts,
};
use crate::link::Link;
use crate::session::StreamLease;

/// How long a STREAM_STATUS report may wait for a send buffer.
const STATUS_SEND_TIMEOUT: Duration = Duration::from_millis(100);

// ── Transport ─────────────────────────────────────────────────────────────────

/// CHDR packets over one link, between two endpoints.
pub struct ChdrTransport {
    link: Arc<dyn Link>,
    codec: ChdrCodec,
    src_epid: u16,
    dst_epid: u16,
    seq: AtomicU16,
    dropped: AtomicU64,
}

impl ChdrTransport {
    /// The codec's frame limit is tightened to the link's send frame size.
    pub fn new(link: Arc<dyn Link>, codec: ChdrCodec, src_epid: u16, dst_epid: u16) -> Self {
        let codec = codec.with_max_frame_size(link.params().send_frame_size.min(codec.max_frame_size));
        Self {
            link,
            codec,
            src_epid,
            dst_epid,
            seq: AtomicU16::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn src_epid(&self) -> u16 {
        self.src_epid
    }

    pub fn dst_epid(&self) -> u16 {
        self.dst_epid
    }

    pub fn codec(&self) -> &ChdrCodec {
        &self.codec
    }

    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    /// Received frames discarded because they did not decode.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Encode and send `pkt` with the next sequence number. `Ok(false)` when
    /// no send buffer freed up within `timeout`.
    pub async fn send(&self, mut pkt: ChdrPacket, timeout: Duration) -> TransportResult<bool> {
        let Some(mut buf) = self.link.get_send_buffer(timeout).await? else {
            return Ok(false);
        };
        pkt.header.seq_num = self.seq.fetch_add(1, Ordering::Relaxed);
        match self.codec.encode_into(&pkt, buf.frame_mut()) {
            Ok(n) => {
                buf.set_len(n);
                self.link.release_send_buffer(buf).await?;
                Ok(true)
            }
            Err(e) => {
                // Returns the buffer unsent.
                self.link.release_send_buffer(buf).await?;
                Err(e.into())
            }
        }
    }

    /// Next packet that decodes. Malformed frames are counted, logged and
    /// skipped. `Ok(None)` on timeout.
    pub async fn recv(&self, timeout: Duration) -> TransportResult<Option<ChdrPacket>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(buf) = self.link.get_recv_buffer(remaining).await? else {
                return Ok(None);
            };
            let decoded = self.codec.decode(buf.as_slice());
            let len = buf.len();
            self.link.release_recv_buffer(buf).await;
            match decoded {
                Ok(pkt) => return Ok(Some(pkt)),
                Err(e) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(error = %e, len, dropped, "dropping malformed CHDR frame");
                }
            }
        }
    }

    pub async fn close(&self) -> TransportResult<()> {
        self.link.close().await
    }
}

fn counts_of(strs: &StrsPayload) -> XferCounts {
    XferCounts {
        bytes: strs.xfer_count_bytes,
        packets: strs.xfer_count_pkts,
    }
}

// ── Producer ──────────────────────────────────────────────────────────────────

pub struct TxStream {
    transport: Arc<ChdrTransport>,
    policy: FlowControlPolicy,
    fc: TxFlowControl,
    initialized: bool,
    _lease: Option<StreamLease>,
}

impl TxStream {
    pub fn new(transport: Arc<ChdrTransport>, policy: FlowControlPolicy) -> Self {
        Self {
            transport,
            fc: TxFlowControl::new(policy.units),
            policy,
            initialized: false,
            _lease: None,
        }
    }

    /// Hand the stream's link and endpoint id back to `lease`'s session on drop.
    pub(crate) fn with_lease(mut self, lease: StreamLease) -> Self {
        self._lease = Some(lease);
        self
    }

    pub fn transport(&self) -> &Arc<ChdrTransport> {
        &self.transport
    }

    pub fn flow_control(&self) -> &TxFlowControl {
        &self.fc
    }

    /// Two-step handshake with the consumer: learn its capacity, then tell
    /// it how often to report. Returns the consumer's capacity.
    pub async fn initialize(&mut self) -> TransportResult<StreamBuffParams> {
        let src_epid = self.transport.src_epid();
        self.send_command(StrcPayload {
            src_epid,
            op_code: StrcOpCode::Init,
            ..StrcPayload::default()
        })
        .await?;
        let status = self.await_status().await?;
        let capacity = StreamBuffParams {
            bytes: status.capacity_bytes,
            packets: status.capacity_pkts,
        };

        let freq = fc_freq(capacity, &self.policy);
        self.send_command(StrcPayload {
            src_epid,
            op_code: StrcOpCode::Init,
            num_pkts: freq.packets as u64,
            num_bytes: freq.bytes,
            ..StrcPayload::default()
        })
        .await?;
        let ack = self.await_status().await?;
        if ack.status != StrsStatus::Okay {
            return Err(TransportError::DeviceError(format!(
                "stream init rejected by endpoint {}: {:?}",
                self.transport.dst_epid(),
                ack.status
            )));
        }

        self.fc.set_dest_capacity(capacity);
        self.fc.update_dest_recv_count(counts_of(&ack));
        self.initialized = true;
        tracing::info!(
            dst_epid = self.transport.dst_epid(),
            capacity_bytes = capacity.bytes,
            capacity_pkts = capacity.packets,
            freq_bytes = freq.bytes,
            freq_pkts = freq.packets,
            "tx stream initialized"
        );
        Ok(capacity)
    }

    async fn send_command(&self, strc: StrcPayload) -> TransportResult<()> {
        let pkt = ChdrPacket::stream_command(self.transport.dst_epid(), 0, strc);
        if self.transport.send(pkt, self.policy.init_timeout).await? {
            Ok(())
        } else {
            Err(TransportError::Timeout {
                what: "stream command send buffer",
                after: self.policy.init_timeout,
            })
        }
    }

    async fn await_status(&self) -> TransportResult<StrsPayload> {
        let deadline = Instant::now() + self.policy.init_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.transport.recv(remaining).await? {
                None => {
                    return Err(TransportError::Timeout {
                        what: "stream status",
                        after: self.policy.init_timeout,
                    })
                }
                Some(ChdrPacket {
                    payload: ChdrPayload::StreamStatus(strs),
                    ..
                }) => return Ok(strs),
                Some(other) => {
                    tracing::debug!(pkt_type = %other.header.pkt_type, "ignoring packet during stream init");
                }
            }
        }
    }

    fn absorb(&mut self, pkt: ChdrPacket) {
        match pkt.payload {
            ChdrPayload::StreamStatus(strs) => {
                if strs.status != StrsStatus::Okay {
                    tracing::warn!(status = ?strs.status, "consumer reported stream error, resyncing");
                    self.fc.request_resync();
                }
                self.fc.update_dest_recv_count(counts_of(&strs));
            }
            _ => {
                tracing::debug!(pkt_type = %pkt.header.pkt_type, "ignoring packet on tx stream");
            }
        }
    }

    /// Send one packet of samples once the consumer has room for it.
    /// `Ok(false)` means the window stayed closed (or no buffer freed up)
    /// for `timeout`.
    pub async fn send(
        &mut self,
        samples: Bytes,
        timestamp: Option<u64>,
        eob: bool,
        timeout: Duration,
    ) -> TransportResult<bool> {
        if !self.initialized {
            return Err(TransportError::config("tx stream used before initialize"));
        }
        let dst = self.transport.dst_epid();
        let mut pkt = match timestamp {
            Some(ts) => ChdrPacket::data_with_timestamp(dst, 0, ts, samples),
            None => ChdrPacket::data(dst, 0, samples),
        };
        pkt.header.eob = eob;
        let size = self.transport.codec().encoded_len(&pkt)?;

        let deadline = Instant::now() + timeout;
        while let Some(status) = self.transport.recv(Duration::ZERO).await? {
            self.absorb(status);
        }
        while !self.fc.dest_has_space(size) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.transport.recv(remaining).await? {
                Some(status) => self.absorb(status),
                None => {
                    tracing::trace!(size, outstanding = ?self.fc.outstanding(), "tx window closed");
                    return Ok(false);
                }
            }
        }

        if self.fc.resync_pending() {
            self.resync().await?;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.transport.send(pkt, remaining).await? {
            return Ok(false);
        }
        self.fc.data_sent(size);
        Ok(true)
    }

    /// Ask the consumer to adopt our transfer counts.
    pub async fn resync(&mut self) -> TransportResult<()> {
        let strc = self.fc.resync_payload(self.transport.src_epid());
        tracing::debug!(num_pkts = strc.num_pkts, num_bytes = strc.num_bytes, "sending stream resync");
        self.send_command(strc).await
    }
}

// ── Consumer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStats {
    pub packets: u64,
    pub bytes: u64,
    /// Gaps in the producer's sequence numbers.
    pub seq_errors: u64,
    /// Packets of a type a stream consumer does not handle.
    pub unexpected: u64,
}

pub struct RxStream {
    transport: Arc<ChdrTransport>,
    fc: RxFlowControl,
    expected_seq: Option<u16>,
    stats: StreamStats,
    _lease: Option<StreamLease>,
}

impl RxStream {
    pub fn new(transport: Arc<ChdrTransport>, capacity: StreamBuffParams, units: FlowControlUnits) -> Self {
        Self {
            transport,
            fc: RxFlowControl::new(capacity, units),
            expected_seq: None,
            stats: StreamStats::default(),
            _lease: None,
        }
    }

    pub(crate) fn with_lease(mut self, lease: StreamLease) -> Self {
        self._lease = Some(lease);
        self
    }

    pub fn transport(&self) -> &Arc<ChdrTransport> {
        &self.transport
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn flow_control(&self) -> &RxFlowControl {
        &self.fc
    }

    /// Returns false on a gap.
    fn track_seq(&mut self, seq: u16) -> bool {
        let in_order = self.expected_seq.map_or(true, |expected| expected == seq);
        if !in_order {
            self.stats.seq_errors += 1;
            tracing::warn!(expected = ?self.expected_seq, got = seq, "stream sequence gap");
        }
        self.expected_seq = Some(seq.wrapping_add(1));
        in_order
    }

    async fn report(&mut self, status: StrsStatus) -> TransportResult<()> {
        let strs = self.fc.status_payload(self.transport.src_epid(), status);
        let pkt = ChdrPacket::stream_status(self.transport.dst_epid(), 0, strs);
        if !self.transport.send(pkt, STATUS_SEND_TIMEOUT).await? {
            tracing::warn!(dst_epid = self.transport.dst_epid(), "no buffer for stream status, report skipped");
        }
        Ok(())
    }

    /// Answer STRC commands until the producer sends a report frequency.
    /// Returns that frequency.
    pub async fn accept_init(&mut self, timeout: Duration) -> TransportResult<StreamBuffParams> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(pkt) = self.transport.recv(remaining).await? else {
                return Err(TransportError::Timeout {
                    what: "stream init command",
                    after: timeout,
                });
            };
            self.track_seq(pkt.header.seq_num);
            match pkt.payload {
                ChdrPayload::StreamCommand(strc) if strc.op_code == StrcOpCode::Init => {
                    let freq = StreamBuffParams {
                        bytes: strc.num_bytes,
                        packets: strc.num_pkts.min(u32::MAX as u64) as u32,
                    };
                    self.fc.set_freq(freq);
                    self.report(StrsStatus::Okay).await?;
                    if freq != StreamBuffParams::default() {
                        tracing::info!(
                            src_epid = strc.src_epid,
                            freq_bytes = freq.bytes,
                            freq_pkts = freq.packets,
                            "rx stream initialized"
                        );
                        return Ok(freq);
                    }
                }
                _ => {
                    self.stats.unexpected += 1;
                    tracing::debug!(pkt_type = %pkt.header.pkt_type, "ignoring packet before stream init");
                }
            }
        }
    }

    /// Next data packet. Stream commands are answered in passing and
    /// status reports go out as the consumed count crosses the report
    /// frequency.
    pub async fn recv(&mut self, timeout: Duration) -> TransportResult<Option<ChdrPacket>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(pkt) = self.transport.recv(remaining).await? else {
                return Ok(None);
            };
            let in_order = self.track_seq(pkt.header.seq_num);
            match &pkt.payload {
                ChdrPayload::Data(samples) => {
                    let size = pkt.header.length as usize;
                    self.fc.data_received(size);
                    self.fc.xfer_done(size);
                    self.stats.packets += 1;
                    self.stats.bytes += samples.len() as u64;
                    if !in_order {
                        self.report(StrsStatus::SequenceError).await?;
                    } else if self.fc.should_report() {
                        self.report(StrsStatus::Okay).await?;
                    }
                    return Ok(Some(pkt));
                }
                ChdrPayload::StreamCommand(strc) => match strc.op_code {
                    StrcOpCode::Init => {
                        self.fc.set_freq(StreamBuffParams {
                            bytes: strc.num_bytes,
                            packets: strc.num_pkts.min(u32::MAX as u64) as u32,
                        });
                        self.report(StrsStatus::Okay).await?;
                    }
                    StrcOpCode::Ping => self.report(StrsStatus::Okay).await?,
                    StrcOpCode::Resync => {
                        self.fc.resynchronize(XferCounts {
                            bytes: strc.num_bytes,
                            packets: strc.num_pkts,
                        });
                        self.report(StrsStatus::Okay).await?;
                    }
                },
                _ => {
                    self.stats.unexpected += 1;
                    tracing::debug!(pkt_type = %pkt.header.pkt_type, "ignoring packet on rx stream");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkParams;
    use crate::udp::DatagramLink;
    use tokio::net::UdpSocket;

    fn params() -> LinkParams {
        LinkParams {
            recv_frame_size: 1472,
            send_frame_size: 1472,
            num_recv_frames: 32,
            num_send_frames: 32,
        }
    }

    async fn transport_pair() -> (Arc<ChdrTransport>, Arc<ChdrTransport>) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        let a = DatagramLink::with_socket(a, params()).unwrap();
        let b = DatagramLink::with_socket(b, params()).unwrap();
        (
            Arc::new(ChdrTransport::new(Arc::new(a), ChdrCodec::default(), 1, 2)),
            Arc::new(ChdrTransport::new(Arc::new(b), ChdrCodec::default(), 2, 1)),
        )
    }

    fn policy() -> FlowControlPolicy {
        FlowControlPolicy {
            units: FlowControlUnits::Bytes,
            freq_ratio: 0.5,
            headroom_ratio: 0.0,
            init_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn transport_numbers_packets_and_drops_garbage() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(raw.local_addr().unwrap()).await.unwrap();
        raw.connect(a.local_addr().unwrap()).await.unwrap();
        let transport = ChdrTransport::new(
            Arc::new(DatagramLink::with_socket(a, params()).unwrap()),
            ChdrCodec::default(),
            1,
            2,
        );

        for _ in 0..2 {
            assert!(transport
                .send(ChdrPacket::data(2, 0, Bytes::from_static(&[0u8; 8])), Duration::ZERO)
                .await
                .unwrap());
        }
        let codec = ChdrCodec::default();
        let mut buf = [0u8; 64];
        for expected in 0..2u16 {
            let n = raw.recv(&mut buf).await.unwrap();
            assert_eq!(codec.decode(&buf[..n]).unwrap().header.seq_num, expected);
        }

        raw.send(&[0xFFu8; 3]).await.unwrap();
        let good = codec.encode(&ChdrPacket::data(1, 9, Bytes::from_static(&[1u8; 16]))).unwrap();
        raw.send(&good).await.unwrap();
        let pkt = transport.recv(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(pkt.header.seq_num, 9);
        assert_eq!(transport.dropped(), 1);
    }

    #[tokio::test]
    async fn oversized_packet_is_refused_and_buffer_returned() {
        let (a, _b) = transport_pair().await;
        let big = ChdrPacket::data(2, 0, Bytes::from(vec![0u8; 2000]));
        assert!(a.send(big, Duration::ZERO).await.is_err());
        let mut held = Vec::new();
        for _ in 0..params().num_send_frames {
            held.push(a.link().get_send_buffer(Duration::ZERO).await.unwrap().unwrap());
        }
        assert_eq!(held.len(), 32);
    }

    #[tokio::test]
    async fn send_before_initialize_is_an_error() {
        let (a, _b) = transport_pair().await;
        let mut tx = TxStream::new(a, policy());
        assert!(tx.send(Bytes::from_static(&[0u8; 8]), None, false, Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn window_blocks_until_consumer_reports() {
        let (a, b) = transport_pair().await;
        let mut tx = TxStream::new(a, policy());
        // Three 64-byte packets fit.
        let mut rx = RxStream::new(b, StreamBuffParams { bytes: 192, packets: 100 }, FlowControlUnits::Bytes);

        let (capacity, freq) = tokio::join!(tx.initialize(), rx.accept_init(Duration::from_secs(1)));
        assert_eq!(capacity.unwrap().bytes, 192);
        assert_eq!(freq.unwrap().bytes, 96);

        let samples = Bytes::from(vec![7u8; 56]);
        for _ in 0..3 {
            assert!(tx.send(samples.clone(), None, false, Duration::ZERO).await.unwrap());
        }
        assert!(!tx.send(samples.clone(), None, false, Duration::from_millis(50)).await.unwrap());

        for _ in 0..2 {
            let pkt = rx.recv(Duration::from_secs(1)).await.unwrap().unwrap();
            assert_eq!(pkt.header.length, 64);
        }
        assert!(tx.send(samples.clone(), None, true, Duration::from_secs(1)).await.unwrap());
        assert_eq!(tx.flow_control().outstanding().bytes, 128);

        let stats = rx.stats();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.bytes, 112);
        assert_eq!(stats.seq_errors, 0);
    }

    #[tokio::test]
    async fn consumer_counts_sequence_gaps() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(raw.local_addr().unwrap()).await.unwrap();
        raw.connect(a.local_addr().unwrap()).await.unwrap();
        let transport = Arc::new(ChdrTransport::new(
            Arc::new(DatagramLink::with_socket(a, params()).unwrap()),
            ChdrCodec::default(),
            2,
            1,
        ));
        let mut rx = RxStream::new(transport, StreamBuffParams { bytes: 1 << 20, packets: 1000 }, FlowControlUnits::Bytes);

        let codec = ChdrCodec::default();
        for seq in [0u16, 1, 3, 4] {
            let wire = codec.encode(&ChdrPacket::data(2, seq, Bytes::from_static(&[0u8; 8]))).unwrap();
            raw.send(&wire).await.unwrap();
        }
        for _ in 0..4 {
            rx.recv(Duration::from_secs(1)).await.unwrap().unwrap();
        }
        assert_eq!(rx.stats().seq_errors, 1);
        assert_eq!(rx.stats().packets, 4);
    }

    #[tokio::test]
    async fn init_times_out_without_consumer() {
        let (a, _b) = transport_pair().await;
        let mut tx = TxStream::new(
            a,
            FlowControlPolicy {
                init_timeout: Duration::from_millis(30),
                ..policy()
            },
        );
        match tx.initialize().await {
            Err(TransportError::Timeout { what, .. }) => assert_eq!(what, "stream status"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
