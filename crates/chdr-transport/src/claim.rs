//! Device claim: an advisory lock kept in the device's shared memory.
//!
//! The record is three registers. The host writes a claim time and its
//! identity hash; firmware raises the status word while the time keeps
//! changing and drops it once the writes stop. Everything here is a
//! function over an injected [`RegisterIface`], so the same code runs
//! against firmware control, CHDR control, the kernel proxy or a simulated
//! register bank.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chdr_core::config::ClaimConfig;
use chdr_core::regs::{CLAIM_SRC_REG, CLAIM_STATUS_REG, CLAIM_TIME_REG};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::ctrl::RegisterIface;
use crate::error::TransportResult;

/// How long `claim_status` waits for a half-released record to settle.
const STATUS_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause between reads of a half-released record.
const STATUS_POLL: Duration = Duration::from_millis(10);
/// Time for the device to reflect a fresh claim.
const CLAIM_SETTLE: Duration = Duration::from_millis(20);
/// Pause between checks of a device claimed by someone else.
const CLAIM_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    Unclaimed,
    ClaimedByUs,
    ClaimedByOther,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    /// How long `try_to_claim` keeps trying.
    pub timeout: Duration,
    pub heartbeat_period: Duration,
    /// A foreign claim whose owner and time have not changed for this long
    /// is considered abandoned. `None` never ages a claim.
    pub stale_after: Option<Duration>,
    /// Claim over abandoned claims instead of waiting them out.
    pub takeover_stale: bool,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self::from(&ClaimConfig::default())
    }
}

impl From<&ClaimConfig> for ClaimPolicy {
    fn from(cfg: &ClaimConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.timeout_ms),
            heartbeat_period: Duration::from_millis(cfg.heartbeat_ms),
            stale_after: (cfg.stale_after_ms > 0).then(|| Duration::from_millis(cfg.stale_after_ms)),
            takeover_stale: cfg.takeover_stale,
        }
    }
}

/// Identity of this process: BLAKE3 over hostname, pid and start time,
/// truncated to 32 bits. Never zero; stable for the life of the process.
pub fn process_hash() -> u32 {
    static HASH: OnceLock<u32> = OnceLock::new();
    *HASH.get_or_init(|| {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(hostname().as_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(&started.to_le_bytes());
        let digest = hasher.finalize();
        let mut word = [0u8; 4];
        word.copy_from_slice(&digest.as_bytes()[..4]);
        match u32::from_le_bytes(word) {
            0 => 1,
            h => h,
        }
    })
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for its full length; gethostname NUL-terminates
    // on success when the name fits.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return String::new();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Claim time written to the device: wall-clock milliseconds, wrapped to
/// 32 bits. Zero means "no claim" to firmware, so it is skipped.
fn claim_time() -> u32 {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    (ms as u32).max(1)
}

pub async fn claim_status(regs: &dyn RegisterIface, ours: u32) -> TransportResult<ClaimStatus> {
    let deadline = Instant::now() + STATUS_TIMEOUT;
    loop {
        if regs.peek32(CLAIM_STATUS_REG).await? == 0 {
            return Ok(ClaimStatus::Unclaimed);
        }
        let owner = regs.peek32(CLAIM_SRC_REG).await?;
        if owner == ours {
            return Ok(ClaimStatus::ClaimedByUs);
        }
        if owner != 0 {
            return Ok(ClaimStatus::ClaimedByOther);
        }
        // Status set but owner cleared: a release in progress.
        if Instant::now() >= deadline {
            return Ok(ClaimStatus::ClaimedByOther);
        }
        sleep(STATUS_POLL).await;
    }
}

/// Write a fresh claim unconditionally.
pub async fn claim(regs: &dyn RegisterIface, ours: u32) -> TransportResult<()> {
    regs.poke32(CLAIM_TIME_REG, claim_time()).await?;
    regs.poke32(CLAIM_SRC_REG, ours).await
}

/// Try to become the owner within `policy.timeout`. `Ok(false)` when the
/// device stayed claimed by someone else.
pub async fn try_to_claim(regs: &dyn RegisterIface, ours: u32, policy: &ClaimPolicy) -> TransportResult<bool> {
    let deadline = Instant::now() + policy.timeout;
    // (owner, claim time, first seen) of the foreign claim we are waiting on
    let mut foreign: Option<(u32, u32, Instant)> = None;

    while Instant::now() < deadline {
        match claim_status(regs, ours).await? {
            ClaimStatus::ClaimedByUs => return Ok(true),
            ClaimStatus::Unclaimed => {
                claim(regs, ours).await?;
                sleep(CLAIM_SETTLE).await;
            }
            ClaimStatus::ClaimedByOther => {
                if let (true, Some(stale_after)) = (policy.takeover_stale, policy.stale_after) {
                    let owner = regs.peek32(CLAIM_SRC_REG).await?;
                    let time = regs.peek32(CLAIM_TIME_REG).await?;
                    match foreign {
                        Some((o, t, since)) if o == owner && t == time => {
                            if since.elapsed() >= stale_after {
                                tracing::warn!(
                                    owner,
                                    idle_ms = since.elapsed().as_millis() as u64,
                                    "taking over stale device claim"
                                );
                                claim(regs, ours).await?;
                                sleep(CLAIM_SETTLE).await;
                                continue;
                            }
                        }
                        _ => foreign = Some((owner, time, Instant::now())),
                    }
                }
                sleep(CLAIM_RETRY).await;
            }
        }
    }
    Ok(claim_status(regs, ours).await? == ClaimStatus::ClaimedByUs)
}

/// Clear the claim record.
pub async fn release(regs: &dyn RegisterIface) -> TransportResult<()> {
    regs.poke32(CLAIM_TIME_REG, 0).await?;
    regs.poke32(CLAIM_SRC_REG, 0).await
}

// ── Heartbeat ─────────────────────────────────────────────────────────────────

/// Background task re-asserting our claim once per period.
pub struct ClaimHeartbeat {
    shutdown: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ClaimHeartbeat {
    pub fn spawn(regs: Arc<dyn RegisterIface>, ours: u32, period: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("claim heartbeat stopping");
                        return;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = claim(regs.as_ref(), ours).await {
                            tracing::warn!(error = %e, "claim heartbeat failed");
                        }
                    }
                }
            }
        });
        tracing::debug!(period_ms = period.as_millis() as u64, "claim heartbeat started");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Signal the task and wait for it to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "claim heartbeat task failed");
            }
        }
    }
}

impl Drop for ClaimHeartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
