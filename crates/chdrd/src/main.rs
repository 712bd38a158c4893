//! chdrd: holds a CHDR transport session to one device.
//!
//! Opens the device named in the config (or the first unclaimed one found
//! by broadcast discovery), keeps the claim alive and closes cleanly on
//! Ctrl-C.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use chdr_core::config::{ChdrConfig, TransportKind};
use chdr_core::wire::FW_COMMS_UDP_PORT;
use chdr_transport::claim::{self, ClaimStatus};
use chdr_transport::ctrl::{discover_available, DISCOVERY_SILENCE};
use chdr_transport::sim::{SimulatedDevice, SimulatedDeviceConfig, SimulatedProxy};
use chdr_transport::{SessionOptions, TransportSession, UdpDeviceAddr};

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

struct Args {
    /// Run against an in-process simulated device.
    sim: bool,
    addr: Option<IpAddr>,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = Args { sim: false, addr: None };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--sim" => args.sim = true,
            "--addr" => {
                let value = it.next().context("--addr requires a value")?;
                args.addr = Some(value.parse().with_context(|| format!("invalid address {value}"))?);
            }
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            other => anyhow::bail!("unknown argument {other}"),
        }
    }
    Ok(Some(args))
}

fn print_usage() {
    println!("Usage: chdrd [--addr <ip>] [--sim]");
    println!();
    println!("Options:");
    println!("  --addr <ip>   Device address (overrides device.addr; default: discover)");
    println!("  --sim         Use an in-process simulated device");
    println!();
    println!("Config: {}", ChdrConfig::file_path().display());
}

// ── Device selection ──────────────────────────────────────────────────────────

async fn resolve_udp_device(config: &ChdrConfig, args: &Args) -> Result<UdpDeviceAddr> {
    if let Some(ip) = args.addr {
        return Ok(UdpDeviceAddr::new(ip));
    }
    if !config.device.addr.is_empty() {
        let ip: IpAddr = config
            .device
            .addr
            .parse()
            .with_context(|| format!("invalid device.addr {}", config.device.addr))?;
        return Ok(UdpDeviceAddr::new(ip));
    }

    let broadcast: IpAddr = config
        .device
        .broadcast_addr
        .parse()
        .with_context(|| format!("invalid device.broadcast_addr {}", config.device.broadcast_addr))?;
    let target = SocketAddr::new(broadcast, FW_COMMS_UDP_PORT);
    tracing::info!(%target, "no device address configured, discovering");
    let found = discover_available(target, claim::process_hash(), DISCOVERY_SILENCE)
        .await
        .context("device discovery failed")?;
    let first = found.first().context("no unclaimed device answered discovery")?;
    if found.len() > 1 {
        tracing::warn!(count = found.len(), chosen = %first.addr, "several devices found, using the first");
    }
    Ok(UdpDeviceAddr::new(first.addr.ip()))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Some(args) = parse_args()? else {
        return Ok(());
    };

    if let Err(e) = ChdrConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ChdrConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ChdrConfig::default()
    });
    let opts = SessionOptions::from_config(&config).context("invalid transport configuration")?;
    tracing::info!(transport = ?config.device.transport, sim = args.sim, "chdrd starting");

    let mut sim_device = None;
    let mut session = match config.device.transport {
        TransportKind::Udp => {
            let addr = if args.sim {
                let device = SimulatedDevice::spawn(SimulatedDeviceConfig::default())
                    .await
                    .context("failed to start simulated device")?;
                let addr = device.addr();
                sim_device = Some(device);
                addr
            } else {
                resolve_udp_device(&config, &args).await?
            };
            TransportSession::open_udp(addr, opts)
                .await
                .with_context(|| format!("failed to open device at {}", addr.ip))?
        }
        TransportKind::Dma => {
            anyhow::ensure!(args.sim, "no kernel proxy available for DMA transport, run with --sim");
            let proxy = Arc::new(SimulatedProxy::new());
            TransportSession::open_dma(proxy, &config.device.resource, opts)
                .await
                .with_context(|| format!("failed to open resource {}", config.device.resource))?
        }
    };

    if let Some(mtu) = session.mtu() {
        tracing::info!(recv = mtu.recv, send = mtu.send, probed = mtu.probed, "path MTU");
    }
    tracing::info!(claimed = session.claimed(), "session ready");

    // Shutdown broadcast
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let regs = session.registers();
    let ours = session.process_hash();
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                match claim::claim_status(regs.as_ref(), ours).await {
                    Ok(ClaimStatus::ClaimedByUs) => tracing::debug!("claim held"),
                    Ok(status) if session.claimed() => tracing::warn!(?status, "claim lost"),
                    Ok(status) => tracing::debug!(?status, "running unclaimed"),
                    Err(e) => tracing::warn!(error = %e, "claim status read failed"),
                }
            }
        }
    }

    session.close().await.context("session close failed")?;
    if let Some(device) = sim_device {
        device.stop().await;
    }
    tracing::info!("chdrd stopped");
    Ok(())
}
