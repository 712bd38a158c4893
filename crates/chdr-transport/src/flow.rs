//! Credit-based flow control for CHDR data streams.
//!
//! The consumer advertises a buffer capacity; the producer may only have
//! that much data outstanding. Outstanding means sent minus what the
//! consumer last reported as received (STREAM_STATUS). Neither side
//! touches the link here: these are the bookkeeping halves, driven by
//! [`crate::stream`].

use std::time::Duration;

use chdr_core::config::{FlowControlConfig, FlowControlUnitsConfig};
use chdr_core::{StrcOpCode, StrcPayload, StrsPayload, StrsStatus};

/// Capacity or report frequency, per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamBuffParams {
    pub bytes: u64,
    pub packets: u32,
}

/// Cumulative transfer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XferCounts {
    pub bytes: u64,
    pub packets: u64,
}

/// Largest value of the 40-bit packet counters in STRS/STRC payloads.
const PKT_COUNT_MASK: u64 = (1 << 40) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControlUnits {
    #[default]
    Bytes,
    Packets,
    BytesAndPackets,
}

impl FlowControlUnits {
    fn bytes(self) -> bool {
        matches!(self, FlowControlUnits::Bytes | FlowControlUnits::BytesAndPackets)
    }

    fn packets(self) -> bool {
        matches!(self, FlowControlUnits::Packets | FlowControlUnits::BytesAndPackets)
    }
}

/// Runtime flow-control settings for one stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowControlPolicy {
    pub units: FlowControlUnits,
    /// Fraction of capacity between consumer reports.
    pub freq_ratio: f64,
    /// Fraction of capacity subtracted from the report interval so reports
    /// arrive before the producer runs dry.
    pub headroom_ratio: f64,
    /// How long stream initialisation waits for each STREAM_STATUS.
    pub init_timeout: Duration,
}

impl Default for FlowControlPolicy {
    fn default() -> Self {
        Self::from(&FlowControlConfig::default())
    }
}

impl From<&FlowControlConfig> for FlowControlPolicy {
    fn from(cfg: &FlowControlConfig) -> Self {
        Self {
            units: match cfg.units {
                FlowControlUnitsConfig::Bytes => FlowControlUnits::Bytes,
                FlowControlUnitsConfig::Packets => FlowControlUnits::Packets,
                FlowControlUnitsConfig::BytesAndPackets => FlowControlUnits::BytesAndPackets,
            },
            freq_ratio: cfg.freq_ratio,
            headroom_ratio: cfg.headroom_ratio,
            init_timeout: Duration::from_millis(cfg.init_timeout_ms),
        }
    }
}

/// Report frequency requested from the consumer for a given capacity.
pub fn fc_freq(capacity: StreamBuffParams, policy: &FlowControlPolicy) -> StreamBuffParams {
    let scaled = |cap: f64, ratio: f64| (cap * ratio).ceil() as u64;
    let bytes = scaled(capacity.bytes as f64, policy.freq_ratio)
        .saturating_sub(scaled(capacity.bytes as f64, policy.headroom_ratio));
    let packets = scaled(capacity.packets as f64, policy.freq_ratio)
        .saturating_sub(scaled(capacity.packets as f64, policy.headroom_ratio));
    StreamBuffParams {
        bytes: bytes.max(1),
        packets: packets.clamp(1, u32::MAX as u64) as u32,
    }
}

// ── Producer side ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TxFlowControl {
    units: FlowControlUnits,
    capacity: StreamBuffParams,
    sent: XferCounts,
    reported: XferCounts,
    resync_pending: bool,
}

impl TxFlowControl {
    pub fn new(units: FlowControlUnits) -> Self {
        Self {
            units,
            capacity: StreamBuffParams::default(),
            sent: XferCounts::default(),
            reported: XferCounts::default(),
            resync_pending: false,
        }
    }

    pub fn set_dest_capacity(&mut self, capacity: StreamBuffParams) {
        self.capacity = capacity;
    }

    pub fn dest_capacity(&self) -> StreamBuffParams {
        self.capacity
    }

    /// Data sent but not yet reported received.
    pub fn outstanding(&self) -> XferCounts {
        XferCounts {
            bytes: self.sent.bytes.saturating_sub(self.reported.bytes),
            packets: self.sent.packets.saturating_sub(self.reported.packets),
        }
    }

    /// Whether one more packet of `size` bytes fits the consumer's window.
    pub fn dest_has_space(&self, size: usize) -> bool {
        let out = self.outstanding();
        let bytes_ok = !self.units.bytes() || out.bytes + size as u64 <= self.capacity.bytes;
        let pkts_ok = !self.units.packets() || out.packets + 1 <= self.capacity.packets as u64;
        bytes_ok && pkts_ok
    }

    pub fn data_sent(&mut self, size: usize) {
        self.sent.bytes += size as u64;
        self.sent.packets += 1;
    }

    pub fn xfer_counts(&self) -> XferCounts {
        self.sent
    }

    /// Apply a consumer report. Reports older than the current baseline
    /// are ignored per unit.
    pub fn update_dest_recv_count(&mut self, counts: XferCounts) {
        self.reported.bytes = self.reported.bytes.max(counts.bytes);
        self.reported.packets = self.reported.packets.max(counts.packets);
    }

    pub fn request_resync(&mut self) {
        self.resync_pending = true;
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_pending
    }

    /// STREAM_COMMAND asking the consumer to adopt our transfer counts.
    /// Clears the pending flag.
    pub fn resync_payload(&mut self, src_epid: u16) -> StrcPayload {
        self.resync_pending = false;
        StrcPayload {
            src_epid,
            op_code: StrcOpCode::Resync,
            op_data: 0,
            num_pkts: self.sent.packets & PKT_COUNT_MASK,
            num_bytes: self.sent.bytes,
        }
    }
}

// ── Consumer side ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RxFlowControl {
    units: FlowControlUnits,
    capacity: StreamBuffParams,
    freq: StreamBuffParams,
    recv: XferCounts,
    done: XferCounts,
    last_report: XferCounts,
}

impl RxFlowControl {
    pub fn new(capacity: StreamBuffParams, units: FlowControlUnits) -> Self {
        Self {
            units,
            capacity,
            freq: StreamBuffParams::default(),
            recv: XferCounts::default(),
            done: XferCounts::default(),
            last_report: XferCounts::default(),
        }
    }

    pub fn capacity(&self) -> StreamBuffParams {
        self.capacity
    }

    /// Report interval requested by the producer. Zero disables a unit.
    pub fn set_freq(&mut self, freq: StreamBuffParams) {
        self.freq = freq;
    }

    pub fn freq(&self) -> StreamBuffParams {
        self.freq
    }

    pub fn data_received(&mut self, size: usize) {
        self.recv.bytes += size as u64;
        self.recv.packets += 1;
    }

    /// The consumer has freed `size` bytes of buffer.
    pub fn xfer_done(&mut self, size: usize) {
        self.done.bytes += size as u64;
        self.done.packets += 1;
    }

    pub fn recv_counts(&self) -> XferCounts {
        self.recv
    }

    pub fn xfer_counts(&self) -> XferCounts {
        self.done
    }

    /// Adopt the producer's counts after a resync request.
    pub fn resynchronize(&mut self, counts: XferCounts) {
        self.recv = counts;
        self.done = counts;
        self.last_report = counts;
    }

    pub fn should_report(&self) -> bool {
        let bytes = self.units.bytes()
            && self.freq.bytes > 0
            && self.done.bytes.saturating_sub(self.last_report.bytes) >= self.freq.bytes;
        let packets = self.units.packets()
            && self.freq.packets > 0
            && self.done.packets.saturating_sub(self.last_report.packets) >= self.freq.packets as u64;
        bytes || packets
    }

    /// Build a STREAM_STATUS for the current counts and mark it reported.
    pub fn status_payload(&mut self, src_epid: u16, status: StrsStatus) -> StrsPayload {
        self.last_report = self.done;
        StrsPayload {
            src_epid,
            status,
            capacity_bytes: self.capacity.bytes,
            capacity_pkts: self.capacity.packets,
            xfer_count_pkts: self.done.packets & PKT_COUNT_MASK,
            xfer_count_bytes: self.done.bytes,
            buff_info: 0,
            status_info: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cap(bytes: u64, packets: u32) -> StreamBuffParams {
        StreamBuffParams { bytes, packets }
    }

    #[test]
    fn freq_subtracts_headroom() {
        let policy = FlowControlPolicy::default();
        let freq = fc_freq(cap(1_000_000, 1000), &policy);
        assert_eq!(freq.bytes, 125_000 - 62_500);
        assert_eq!(freq.packets, 125 - 63);
    }

    #[test]
    fn freq_never_zero() {
        let policy = FlowControlPolicy {
            headroom_ratio: 0.5,
            ..FlowControlPolicy::default()
        };
        assert_eq!(fc_freq(cap(8, 0), &policy), cap(1, 1));
    }

    #[test]
    fn window_blocks_then_reopens() {
        let mut tx = TxFlowControl::new(FlowControlUnits::Bytes);
        tx.set_dest_capacity(cap(1000, 0));
        assert!(tx.dest_has_space(600));
        tx.data_sent(600);
        assert!(!tx.dest_has_space(600));
        assert!(tx.dest_has_space(400));

        tx.update_dest_recv_count(XferCounts { bytes: 600, packets: 1 });
        assert!(tx.dest_has_space(1000));
    }

    #[test]
    fn stale_reports_do_not_move_baseline_back() {
        let mut tx = TxFlowControl::new(FlowControlUnits::Bytes);
        tx.set_dest_capacity(cap(100, 0));
        tx.data_sent(100);
        tx.update_dest_recv_count(XferCounts { bytes: 80, packets: 1 });
        tx.update_dest_recv_count(XferCounts { bytes: 20, packets: 1 });
        assert_eq!(tx.outstanding().bytes, 20);
    }

    #[test]
    fn packet_units_ignore_bytes() {
        let mut tx = TxFlowControl::new(FlowControlUnits::Packets);
        tx.set_dest_capacity(cap(0, 2));
        assert!(tx.dest_has_space(10_000));
        tx.data_sent(10_000);
        tx.data_sent(10_000);
        assert!(!tx.dest_has_space(1));
    }

    #[test]
    fn resync_carries_sent_counts() {
        let mut tx = TxFlowControl::new(FlowControlUnits::Bytes);
        tx.data_sent(100);
        tx.data_sent(50);
        tx.request_resync();
        assert!(tx.resync_pending());
        let strc = tx.resync_payload(7);
        assert!(!tx.resync_pending());
        assert_eq!(strc.op_code, StrcOpCode::Resync);
        assert_eq!((strc.num_bytes, strc.num_pkts), (150, 2));
    }

    #[test]
    fn receiver_reports_at_frequency() {
        let mut rx = RxFlowControl::new(cap(4096, 32), FlowControlUnits::Bytes);
        rx.set_freq(cap(1000, 0));
        for _ in 0..9 {
            rx.data_received(100);
            rx.xfer_done(100);
        }
        assert!(!rx.should_report());
        rx.data_received(100);
        rx.xfer_done(100);
        assert!(rx.should_report());

        let strs = rx.status_payload(3, StrsStatus::Okay);
        assert_eq!(strs.capacity_bytes, 4096);
        assert_eq!(strs.xfer_count_bytes, 1000);
        assert_eq!(strs.xfer_count_pkts, 10);
        assert!(!rx.should_report());
    }

    #[test]
    fn resynchronize_adopts_counts() {
        let mut rx = RxFlowControl::new(cap(4096, 32), FlowControlUnits::Bytes);
        rx.set_freq(cap(10, 0));
        rx.resynchronize(XferCounts { bytes: 500, packets: 5 });
        assert_eq!(rx.xfer_counts().bytes, 500);
        assert!(!rx.should_report());
    }

    proptest! {
        #[test]
        fn sender_never_overdraws(
            capacity in 64u64..100_000,
            steps in prop::collection::vec((1usize..4096, any::<bool>()), 1..200),
        ) {
            let mut tx = TxFlowControl::new(FlowControlUnits::Bytes);
            tx.set_dest_capacity(cap(capacity, 0));
            let mut consumed = XferCounts::default();

            for (size, report) in steps {
                if tx.dest_has_space(size) {
                    tx.data_sent(size);
                }
                prop_assert!(tx.outstanding().bytes <= capacity);
                if report {
                    consumed = tx.xfer_counts();
                    tx.update_dest_recv_count(consumed);
                }
                prop_assert!(tx.outstanding().bytes <= capacity);
            }
            prop_assert!(tx.xfer_counts().bytes >= consumed.bytes);
        }
    }
}
