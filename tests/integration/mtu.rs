use chdr_transport::mtu::MtuFallback;
use chdr_transport::sim::SimulatedDeviceConfig;
use chdr_transport::{ErrorClass, LinkHints, StreamBuffParams, TransportSession};

use crate::*;

#[tokio::test]
async fn test_links_follow_measured_path_mtu() {
    let device = spawn_device(SimulatedDeviceConfig {
        path_mtu: 1500,
        ..SimulatedDeviceConfig::default()
    })
    .await;

    let mut session = TransportSession::open_udp(device.addr(), udp_opts()).await.unwrap();
    let mtu = session.mtu().unwrap();
    assert_eq!((mtu.recv, mtu.send, mtu.negotiated), (1500, 1500, 1500));

    let rx = session
        .make_rx_stream(StreamBuffParams {
            bytes: 1 << 20,
            packets: 1024,
        })
        .await
        .unwrap();
    let params = rx.transport().link().params();
    assert_eq!(params.recv_frame_size, 1500);
    assert!(params.send_frame_size <= 1500);

    let tx = session.make_tx_stream().await.unwrap();
    assert_eq!(tx.transport().link().params().send_frame_size, 1500);

    session.close().await.unwrap();
    device.stop().await;
}

#[tokio::test]
async fn test_frame_hint_caps_the_probe() {
    let device = spawn_device(SimulatedDeviceConfig::default()).await;
    let opts = SessionOptions {
        hints: LinkHints {
            recv_frame_size: Some(2000),
            ..LinkHints::default()
        },
        ..udp_opts()
    };

    let mut session = TransportSession::open_udp(device.addr(), opts).await.unwrap();
    let mtu = session.mtu().unwrap();
    assert_eq!(mtu.recv, 2000);
    assert_eq!(mtu.send, 8000);
    assert_eq!(mtu.negotiated, 2000);

    session.close().await.unwrap();
    device.stop().await;
}

#[tokio::test]
async fn test_silent_responder_uses_fallback() {
    let device = spawn_device(SimulatedDeviceConfig {
        mtu_responder: false,
        ..SimulatedDeviceConfig::default()
    })
    .await;

    let mut session = TransportSession::open_udp(device.addr(), udp_opts()).await.unwrap();
    let mtu = session.mtu().unwrap();
    assert!(!mtu.probed);
    assert_eq!(mtu.negotiated, 1472);
    session.close().await.unwrap();

    let strict = SessionOptions {
        mtu_fallback: MtuFallback::Fail,
        ..udp_opts()
    };
    let err = TransportSession::open_udp(device.addr(), strict).await.err().unwrap();
    assert_eq!(err.class(), ErrorClass::Configuration);

    device.stop().await;
}

#[tokio::test]
async fn test_probe_can_be_disabled() {
    let device = spawn_device(SimulatedDeviceConfig::default()).await;
    let opts = SessionOptions {
        probe_mtu: false,
        ..udp_opts()
    };
    let mut session = TransportSession::open_udp(device.addr(), opts).await.unwrap();
    assert!(session.mtu().is_none());

    let tx = session.make_tx_stream().await.unwrap();
    assert_eq!(tx.transport().link().params().send_frame_size, 8000);

    session.close().await.unwrap();
    device.stop().await;
}
