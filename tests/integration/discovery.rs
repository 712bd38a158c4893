use chdr_transport::claim::{self, ClaimStatus};
use chdr_transport::ctrl::{discover, discover_available, DISCOVERY_SILENCE};
use chdr_transport::sim::SimulatedDeviceConfig;
use chdr_transport::{TransportSession, UdpDeviceAddr};

use crate::*;

#[tokio::test]
async fn test_discovery_reports_claim_state() {
    let device = spawn_device(SimulatedDeviceConfig::default()).await;
    let target = device.addr().ctrl();

    let found = discover(target, claim::process_hash(), DISCOVERY_SILENCE).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].addr, target);
    assert_eq!(found[0].claim, Some(ClaimStatus::Unclaimed));
    assert!(found[0].available());

    let mut session = TransportSession::open_udp(device.addr(), udp_opts()).await.unwrap();

    // We see our own claim; another process would see the device as taken.
    let ours = discover(target, claim::process_hash(), DISCOVERY_SILENCE).await.unwrap();
    assert_eq!(ours[0].claim, Some(ClaimStatus::ClaimedByUs));

    let theirs = discover(target, FOREIGN_OWNER, DISCOVERY_SILENCE).await.unwrap();
    assert_eq!(theirs[0].claim, Some(ClaimStatus::ClaimedByOther));
    assert!(discover_available(target, FOREIGN_OWNER, DISCOVERY_SILENCE)
        .await
        .unwrap()
        .is_empty());

    session.close().await.unwrap();
    device.stop().await;
}

#[tokio::test]
async fn test_discovered_address_opens_session() {
    let device = spawn_device(SimulatedDeviceConfig::default()).await;
    let found = discover_available(device.addr().ctrl(), claim::process_hash(), DISCOVERY_SILENCE)
        .await
        .unwrap();
    let first = found.first().expect("device should answer");

    // The simulated device listens on ephemeral ports, so keep those and
    // take only the address from discovery.
    let addr = UdpDeviceAddr {
        ip: first.addr.ip(),
        ..device.addr()
    };
    let mut session = TransportSession::open_udp(addr, udp_opts()).await.unwrap();
    assert!(session.claimed());

    session.close().await.unwrap();
    device.stop().await;
}

#[tokio::test]
async fn test_discovery_with_no_device_is_empty() {
    init_tracing();
    // Nothing listens on this port.
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = socket.local_addr().unwrap();
    drop(socket);

    let found = discover(target, claim::process_hash(), DISCOVERY_SILENCE).await;
    assert!(found.map(|f| f.is_empty()).unwrap_or(true));
}
