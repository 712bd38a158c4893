use chdr_core::regs::{CLAIM_SRC_REG, CLAIM_STATUS_REG, CLAIM_TIME_REG};
use chdr_transport::claim;
use chdr_transport::ctrl::ChdrCtrl;
use chdr_transport::sim::SimulatedDeviceConfig;
use chdr_transport::{ErrorClass, LinkKind, RegisterIface, TransportSession};

use crate::*;

#[tokio::test]
async fn test_udp_session_open_and_close() {
    let device = spawn_device(SimulatedDeviceConfig::default()).await;

    let mut session = TransportSession::open_udp(device.addr(), udp_opts())
        .await
        .expect("session should open");
    assert_eq!(session.kind(), LinkKind::Datagram);
    assert!(session.claimed());

    let mtu = session.mtu().expect("MTU should be probed");
    assert!(mtu.probed);
    assert_eq!(mtu.negotiated, 8000);

    let regs = device.registers();
    assert_eq!(regs.read(CLAIM_SRC_REG), claim::process_hash());
    assert_eq!(regs.read(CLAIM_STATUS_REG), 1);

    session.close().await.expect("close should succeed");
    assert_eq!(regs.read(CLAIM_TIME_REG), 0);
    assert_eq!(regs.read(CLAIM_SRC_REG), 0);
    assert_eq!(regs.read(CLAIM_STATUS_REG), 0);

    // Closed sessions hand out nothing.
    assert!(session.make_ctrl_transport().is_err());
    device.stop().await;
}

#[tokio::test]
async fn test_heartbeat_keeps_claim_past_expiry() {
    let device = spawn_device(SimulatedDeviceConfig {
        claim_expiry: Some(Duration::from_millis(200)),
        ..SimulatedDeviceConfig::default()
    })
    .await;

    let mut session = TransportSession::open_udp(device.addr(), udp_opts()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let status = claim::claim_status(session.registers().as_ref(), claim::process_hash())
        .await
        .unwrap();
    assert_eq!(status, claim::ClaimStatus::ClaimedByUs);

    session.close().await.unwrap();
    device.stop().await;
}

#[tokio::test]
async fn test_register_access_over_chdr_control() {
    let device = spawn_device(SimulatedDeviceConfig::default()).await;
    let mut session = TransportSession::open_udp(device.addr(), udp_opts()).await.unwrap();

    let transport = session.make_ctrl_transport().unwrap();
    assert_eq!(transport.dst_epid(), device.epid());
    let ctrl = ChdrCtrl::new(transport.clone(), 0).with_timeout(Duration::from_millis(200));

    ctrl.poke32(0x1_0010, 0xFEED_F00D).await.unwrap();
    assert_eq!(device.registers().read(0x1_0010), 0xFEED_F00D);

    device.registers().write(0x1_0014, 42);
    assert_eq!(ctrl.peek32(0x1_0014).await.unwrap(), 42);

    // A second control transport gets its own endpoint id.
    let other = session.make_ctrl_transport().unwrap();
    assert_ne!(other.src_epid(), transport.src_epid());
    assert_ne!(other.src_epid(), device.epid());

    session.close().await.unwrap();
    device.stop().await;
}

#[tokio::test]
async fn test_firmware_retries_absorb_lost_requests() {
    let device = spawn_device(SimulatedDeviceConfig {
        drop_fw_requests: 2,
        ..SimulatedDeviceConfig::default()
    })
    .await;

    let mut session = TransportSession::open_udp(device.addr(), udp_opts())
        .await
        .expect("two lost requests are within the retry budget");
    assert!(session.claimed());

    session.close().await.unwrap();
    device.stop().await;
}

#[tokio::test]
async fn test_silent_firmware_fails_open() {
    let device = spawn_device(SimulatedDeviceConfig {
        drop_fw_requests: usize::MAX,
        ..SimulatedDeviceConfig::default()
    })
    .await;

    let err = TransportSession::open_udp(device.addr(), udp_opts())
        .await
        .err()
        .expect("open should fail when firmware never answers");
    assert_eq!(err.class(), ErrorClass::TransientIo);
    assert!(!err.is_retryable());

    device.stop().await;
}
