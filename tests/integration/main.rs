//! CHDR transport integration test harness.
//!
//! Scenarios run in-process: networked sessions talk loopback UDP to a
//! `SimulatedDevice`, DMA sessions go through a `SimulatedProxy`. No
//! hardware or privileges are needed.
//!
//!   cargo test --test integration
//!
//! `RUST_LOG=chdr_transport=debug` shows protocol traffic.
//!
//! Each test owns the devices it spawns and stops them before returning.

use std::sync::{Arc, Once};
use std::time::Duration;

use chdr_transport::claim::ClaimPolicy;
use chdr_transport::ctrl::FwCtrl;
use chdr_transport::sim::{SimulatedDevice, SimulatedDeviceConfig};
use chdr_transport::{ClaimHeartbeat, SessionOptions};

mod claims;
mod discovery;
mod dma;
mod mtu;
mod sessions;
mod streams;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Owner hash used when a test plays another process.
pub const FOREIGN_OWNER: u32 = 0x00AB_CDEF;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Claim settings scaled down so refusals resolve in well under a second.
pub fn quick_claim() -> ClaimPolicy {
    ClaimPolicy {
        timeout: Duration::from_millis(400),
        heartbeat_period: Duration::from_millis(50),
        stale_after: None,
        takeover_stale: false,
    }
}

pub fn udp_opts() -> SessionOptions {
    SessionOptions {
        claim: Some(quick_claim()),
        echo_timeout: Duration::from_millis(50),
        ..SessionOptions::default()
    }
}

pub async fn spawn_device(cfg: SimulatedDeviceConfig) -> SimulatedDevice {
    init_tracing();
    SimulatedDevice::spawn(cfg).await.expect("simulated device should start")
}

/// Another process holding the device: claims over firmware control and
/// keeps the claim fresh until stopped.
pub struct ForeignOwner {
    regs: Arc<FwCtrl>,
    heartbeat: Option<ClaimHeartbeat>,
}

impl ForeignOwner {
    pub async fn claim(device: &SimulatedDevice, keep_alive: bool) -> Self {
        let regs = Arc::new(
            FwCtrl::connect(device.addr().ctrl())
                .await
                .expect("firmware control should connect"),
        );
        chdr_transport::claim::claim(regs.as_ref(), FOREIGN_OWNER)
            .await
            .expect("foreign claim should be written");
        let heartbeat = keep_alive
            .then(|| ClaimHeartbeat::spawn(regs.clone(), FOREIGN_OWNER, Duration::from_millis(50)));
        Self { regs, heartbeat }
    }

    /// Stop the heartbeat and clear the claim.
    pub async fn release(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        chdr_transport::claim::release(self.regs.as_ref())
            .await
            .expect("foreign claim should be released");
    }
}
