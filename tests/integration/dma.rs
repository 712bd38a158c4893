use bytes::Bytes;
use chdr_core::{ChdrCodec, ChdrPacket, ChdrPayload, StrcOpCode, StrcPayload, StrsPayload, StrsStatus};
use chdr_transport::proxy::FifoDirection;
use chdr_transport::sim::{BusyMode, ProxyCall, SimulatedProxy};
use chdr_transport::{ErrorClass, LinkKind, StreamBuffParams, TransportSession};

use crate::*;

const DATA_CHANNEL: u32 = 1;
const DEVICE_EPID: u16 = chdr_transport::session::DEFAULT_DEVICE_EPID;

fn dma_opts() -> SessionOptions {
    SessionOptions {
        claim: Some(quick_claim()),
        ..SessionOptions::default()
    }
}

/// Plays the device end of a DMA channel: frames in through `inject_rx`,
/// the host's replies out through `take_tx`.
struct DeviceSide {
    proxy: Arc<SimulatedProxy>,
    codec: ChdrCodec,
    host_epid: u16,
    seq: u16,
}

impl DeviceSide {
    fn push(&mut self, mut pkt: ChdrPacket) {
        pkt.header.seq_num = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let wire = self.codec.encode(&pkt).expect("device packet should encode");
        self.proxy.inject_rx(DATA_CHANNEL, wire.to_vec());
    }

    fn init(&mut self, freq: StreamBuffParams) {
        let strc = StrcPayload {
            src_epid: DEVICE_EPID,
            op_code: StrcOpCode::Init,
            num_pkts: freq.packets as u64,
            num_bytes: freq.bytes,
            ..StrcPayload::default()
        };
        self.push(ChdrPacket::stream_command(self.host_epid, 0, strc));
    }

    fn data(&mut self, len: usize) {
        self.push(ChdrPacket::data(self.host_epid, 0, Bytes::from(vec![0x3Cu8; len])));
    }

    fn skip(&mut self, n: u16) {
        self.seq = self.seq.wrapping_add(n);
    }

    /// Status reports the host has written since the last call.
    fn reports(&self) -> Vec<StrsPayload> {
        self.proxy
            .take_tx(DATA_CHANNEL)
            .iter()
            .filter_map(|frame| match self.codec.decode(frame) {
                Ok(ChdrPacket {
                    payload: ChdrPayload::StreamStatus(strs),
                    ..
                }) => Some(strs),
                _ => None,
            })
            .collect()
    }
}

#[tokio::test]
async fn test_dma_rx_stream_handshake_and_reports() {
    init_tracing();
    let proxy = Arc::new(SimulatedProxy::new());
    let mut session = TransportSession::open_dma(proxy.clone(), "RIO0", dma_opts()).await.unwrap();
    assert_eq!(session.kind(), LinkKind::Dma);
    assert!(session.claimed());

    let capacity = StreamBuffParams {
        bytes: 1 << 16,
        packets: 64,
    };
    let mut rx = session.make_rx_stream(capacity).await.unwrap();
    assert!(proxy.fifo_running(DATA_CHANNEL, FifoDirection::Rx));
    assert!(proxy.fifo_running(DATA_CHANNEL, FifoDirection::Tx));

    let mut device = DeviceSide {
        proxy: proxy.clone(),
        codec: ChdrCodec::default(),
        host_epid: rx.transport().src_epid(),
        seq: 0,
    };

    // Capacity query, then the real init with a report frequency.
    device.init(StreamBuffParams::default());
    let freq = StreamBuffParams {
        bytes: 1024,
        packets: 4,
    };
    device.init(freq);
    assert_eq!(rx.accept_init(Duration::from_secs(1)).await.unwrap(), freq);

    let reports = device.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].capacity_bytes, capacity.bytes);
    assert_eq!(reports[0].capacity_pkts, capacity.packets);
    assert!(reports.iter().all(|r| r.src_epid == rx.transport().src_epid()));

    for _ in 0..8 {
        device.data(256);
    }
    for _ in 0..8 {
        let pkt = rx.recv(Duration::from_secs(1)).await.unwrap().expect("data packet");
        assert!(matches!(&pkt.payload, ChdrPayload::Data(samples) if samples.len() == 256));
    }
    let stats = rx.stats();
    assert_eq!((stats.packets, stats.bytes, stats.seq_errors), (8, 8 * 256, 0));

    let reports = device.reports();
    let last = reports.last().expect("consumer should have reported");
    assert_eq!(last.status, StrsStatus::Okay);
    assert_eq!(last.xfer_count_pkts, 8);

    // A lost packet shows up as a sequence error report.
    device.skip(1);
    device.data(256);
    assert!(rx.recv(Duration::from_secs(1)).await.unwrap().is_some());
    assert_eq!(rx.stats().seq_errors, 1);
    let reports = device.reports();
    assert_eq!(reports.last().map(|r| r.status), Some(StrsStatus::SequenceError));

    session.close().await.unwrap();
    assert!(!proxy.is_open());
    assert!(!proxy.fifo_running(DATA_CHANNEL, FifoDirection::Rx));
}

#[tokio::test]
async fn test_dma_stuck_engine_releases_channel() {
    init_tracing();
    let proxy = Arc::new(SimulatedProxy::new());
    let mut session = TransportSession::open_dma(proxy.clone(), "RIO0", dma_opts()).await.unwrap();

    proxy.set_busy(BusyMode::Stuck);
    let err = session
        .make_rx_stream(StreamBuffParams {
            bytes: 1 << 16,
            packets: 64,
        })
        .await
        .err()
        .expect("stuck engine should fail link bring-up");
    assert_eq!(err.class(), ErrorClass::HardwareFault);
    assert!(!proxy.fifo_running(DATA_CHANNEL, FifoDirection::Rx));

    // The failed channel went back to the pool.
    proxy.set_busy(BusyMode::Idle);
    let _rx = session
        .make_rx_stream(StreamBuffParams {
            bytes: 1 << 16,
            packets: 64,
        })
        .await
        .unwrap();
    assert!(proxy.fifo_running(DATA_CHANNEL, FifoDirection::Rx));

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_dma_channels_run_out() {
    init_tracing();
    let proxy = Arc::new(SimulatedProxy::new());
    let mut session = TransportSession::open_dma(proxy.clone(), "RIO0", dma_opts()).await.unwrap();
    let capacity = StreamBuffParams {
        bytes: 1 << 16,
        packets: 64,
    };

    // Channel 0 carries control, leaving five for data.
    let mut streams = Vec::new();
    for _ in 0..5 {
        streams.push(session.make_rx_stream(capacity).await.unwrap());
    }
    let err = session.make_rx_stream(capacity).await.err().unwrap();
    assert_eq!(err.class(), ErrorClass::ResourceExhausted);

    session.close().await.unwrap();
    let stops = proxy
        .calls()
        .iter()
        .filter(|c| matches!(c, ProxyCall::StopFifo { .. }))
        .count();
    assert_eq!(stops, 12);
}
