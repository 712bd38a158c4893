use chdr_core::regs::CLAIM_SRC_REG;
use chdr_transport::claim;
use chdr_transport::sim::SimulatedDeviceConfig;
use chdr_transport::{ErrorClass, TransportError, TransportSession};

use crate::*;

#[tokio::test]
async fn test_claimed_device_is_refused() {
    let device = spawn_device(SimulatedDeviceConfig::default()).await;
    let foreign = ForeignOwner::claim(&device, true).await;

    let err = TransportSession::open_udp(device.addr(), udp_opts())
        .await
        .err()
        .expect("a held claim should refuse the session");
    assert_eq!(err.class(), ErrorClass::ClaimConflict);
    assert!(matches!(err, TransportError::DeviceClaimed(owner) if owner == FOREIGN_OWNER));

    // Once the other process lets go the device is ours.
    foreign.release().await;
    let mut session = TransportSession::open_udp(device.addr(), udp_opts()).await.unwrap();
    assert!(session.claimed());
    assert_eq!(device.registers().read(CLAIM_SRC_REG), claim::process_hash());

    session.close().await.unwrap();
    device.stop().await;
}

#[tokio::test]
async fn test_unclaimed_session_leaves_foreign_claim() {
    let device = spawn_device(SimulatedDeviceConfig::default()).await;
    let foreign = ForeignOwner::claim(&device, true).await;

    let opts = SessionOptions {
        allow_unclaimed: true,
        ..udp_opts()
    };
    let mut session = TransportSession::open_udp(device.addr(), opts).await.unwrap();
    assert!(!session.claimed());

    session.close().await.unwrap();
    assert_eq!(device.registers().read(CLAIM_SRC_REG), FOREIGN_OWNER);

    foreign.release().await;
    device.stop().await;
}

#[tokio::test]
async fn test_stale_claim_needs_takeover_policy() {
    // Firmware that never expires claims, so only takeover can clear one.
    let device = spawn_device(SimulatedDeviceConfig {
        claim_expiry: None,
        ..SimulatedDeviceConfig::default()
    })
    .await;
    let _abandoned = ForeignOwner::claim(&device, false).await;

    let err = TransportSession::open_udp(device.addr(), udp_opts()).await.err().unwrap();
    assert_eq!(err.class(), ErrorClass::ClaimConflict);

    let opts = SessionOptions {
        claim: Some(claim::ClaimPolicy {
            timeout: Duration::from_secs(2),
            stale_after: Some(Duration::from_millis(200)),
            takeover_stale: true,
            ..quick_claim()
        }),
        ..udp_opts()
    };
    let mut session = TransportSession::open_udp(device.addr(), opts).await.unwrap();
    assert!(session.claimed());
    assert_eq!(device.registers().read(CLAIM_SRC_REG), claim::process_hash());

    session.close().await.unwrap();
    device.stop().await;
}

#[tokio::test]
async fn test_claim_disabled_skips_registers() {
    let device = spawn_device(SimulatedDeviceConfig::default()).await;
    let opts = SessionOptions {
        claim: None,
        ..udp_opts()
    };
    let mut session = TransportSession::open_udp(device.addr(), opts).await.unwrap();
    assert!(!session.claimed());
    assert_eq!(device.registers().read(CLAIM_SRC_REG), 0);

    session.close().await.unwrap();
    device.stop().await;
}
