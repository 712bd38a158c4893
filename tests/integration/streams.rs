use bytes::Bytes;
use chdr_transport::sim::SimulatedDeviceConfig;
use chdr_transport::{FlowControlPolicy, FlowControlUnits, StreamBuffParams, TransportSession};

use crate::*;

#[tokio::test(flavor = "multi_thread")]
async fn test_tx_stream_paced_by_device_window() {
    let capacity = StreamBuffParams {
        bytes: 4096,
        packets: 64,
    };
    let device = spawn_device(SimulatedDeviceConfig {
        stream_capacity: capacity,
        ..SimulatedDeviceConfig::default()
    })
    .await;
    let mut session = TransportSession::open_udp(device.addr(), udp_opts()).await.unwrap();

    let mut tx = session.make_tx_stream().await.unwrap();
    assert_eq!(tx.flow_control().dest_capacity(), capacity);

    // 50 KiB through a 4 KiB window.
    for i in 0..100u64 {
        let sent = tx
            .send(Bytes::from(vec![0x5Au8; 512]), Some(i * 128), false, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(sent, "packet {i} should fit once the device reports");
        assert!(tx.flow_control().outstanding().bytes <= capacity.bytes);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(device.data_packets(), 100);

    session.close().await.unwrap();
    device.stop().await;
}

#[tokio::test]
async fn test_packet_units_window() {
    let device = spawn_device(SimulatedDeviceConfig {
        stream_capacity: StreamBuffParams {
            bytes: 1 << 20,
            packets: 16,
        },
        ..SimulatedDeviceConfig::default()
    })
    .await;
    let opts = SessionOptions {
        flow_control: FlowControlPolicy {
            units: FlowControlUnits::Packets,
            ..FlowControlPolicy::default()
        },
        ..udp_opts()
    };
    let mut session = TransportSession::open_udp(device.addr(), opts).await.unwrap();

    let mut tx = session.make_tx_stream().await.unwrap();
    for _ in 0..64 {
        assert!(tx
            .send(Bytes::from_static(&[1u8; 64]), None, false, Duration::from_secs(1))
            .await
            .unwrap());
        assert!(tx.flow_control().outstanding().packets <= 16);
    }
    assert!(tx
        .send(Bytes::from_static(&[1u8; 64]), None, true, Duration::from_secs(1))
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(device.data_packets(), 65);

    session.close().await.unwrap();
    device.stop().await;
}

#[tokio::test]
async fn test_streams_get_distinct_endpoints() {
    let device = spawn_device(SimulatedDeviceConfig::default()).await;
    let mut session = TransportSession::open_udp(device.addr(), udp_opts()).await.unwrap();

    let tx_a = session.make_tx_stream().await.unwrap();
    let tx_b = session.make_tx_stream().await.unwrap();
    let rx = session
        .make_rx_stream(StreamBuffParams {
            bytes: 1 << 16,
            packets: 64,
        })
        .await
        .unwrap();

    let mut epids = vec![
        tx_a.transport().src_epid(),
        tx_b.transport().src_epid(),
        rx.transport().src_epid(),
    ];
    epids.sort_unstable();
    epids.dedup();
    assert_eq!(epids.len(), 3);
    assert!(!epids.contains(&0));
    assert!(!epids.contains(&device.epid()));

    session.close().await.unwrap();
    device.stop().await;
}
