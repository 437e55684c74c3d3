//! Integration tests for [`ServerServices`] across listener kinds.
//!
//! A plain-TCP and a WebSocket listener run side by side on loopback.  The
//! tests check that endpoint routing, pool lookup, fan-out sends and
//! connection accounting all agree on which listener owns a connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use devlink_core::{Endpoint, InstructionContext, InstructionDescription};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::Message;

use devlink_server::application::{ContextConsumer, LinkStatus};
use devlink_server::infrastructure::network::{
    ListenerConfig, PoolSettings, ServerEvent, ServerKind, ServerMask, ServerServices,
};

fn loopback(kind: ServerKind) -> ListenerConfig {
    ListenerConfig::new(kind, "127.0.0.1:0".parse().unwrap())
        .with_timeout(Duration::from_millis(500))
        .with_grace_period(Duration::from_millis(50))
        .with_sweep_interval(Duration::from_millis(20))
}

async fn started(consumer: Option<ContextConsumer>) -> ServerServices {
    let mut services = ServerServices::new().with_pool_settings(PoolSettings {
        capacity: 8,
        detection_threshold: 2,
    });
    services
        .configure(loopback(ServerKind::Tcp))
        .configure(loopback(ServerKind::WebSocket));
    let report = services.initialize(ServerMask::PLAIN, consumer).await;
    assert!(report.is_complete(), "{:?}", report.failed);
    services
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn test_endpoint_lookup_agrees_with_pool_lookup() {
    // Arrange
    let services = started(None).await;
    let tcp_addr = services.get_service(ServerKind::Tcp).unwrap().local_addr().unwrap();
    let ws_addr = services.get_service(ServerKind::WebSocket).unwrap().local_addr().unwrap();

    // Act
    let tcp_device = assert_ok!(TcpStream::connect(tcp_addr).await);
    let tcp_endpoint = Endpoint::from(tcp_device.local_addr().unwrap());
    let (_ws_device, _) = assert_ok!(tokio_tungstenite::connect_async(format!("ws://{ws_addr}")).await);
    assert!(wait_until(|| services.client_count(ServerMask::ALL) == 2).await);

    // Assert
    let owner = services.get_service_by_endpoint(&tcp_endpoint).unwrap();
    assert_eq!(owner.kind(), ServerKind::Tcp);
    let via_services = services.get_client_pool(&tcp_endpoint).unwrap();
    let via_listener = owner.get_client_pool(&tcp_endpoint).unwrap();
    assert_eq!(via_services.name(), via_listener.name());
    assert_eq!(via_services.capacity(), 8);

    assert_eq!(services.client_count(ServerMask::TCP), 1);
    assert_eq!(services.client_count(ServerMask::WEB), 1);
    assert_eq!(services.endpoints(ServerMask::ALL).len(), 2);
    assert_eq!(services.active_mask(), ServerMask::PLAIN);

    services.close().await;
    assert!(services.get_service_by_endpoint(&tcp_endpoint).is_none());
}

#[tokio::test]
async fn test_broadcast_reaches_every_listener_kind() {
    // Arrange
    let services = started(None).await;
    let tcp_addr = services.get_service(ServerKind::Tcp).unwrap().local_addr().unwrap();
    let ws_addr = services.get_service(ServerKind::WebSocket).unwrap().local_addr().unwrap();
    let mut tcp_device = assert_ok!(TcpStream::connect(tcp_addr).await);
    let (mut ws_device, _) = assert_ok!(tokio_tungstenite::connect_async(format!("ws://{ws_addr}")).await);
    assert!(wait_until(|| services.client_count(ServerMask::ALL) == 2).await);

    // Act
    assert!(services.broadcast_sync(ServerMask::ALL, b"sync").await);
    assert!(services.broadcast_async(ServerMask::TCP, b"async".to_vec()).await.unwrap());

    // Assert
    let mut buf = [0u8; 9];
    tcp_device.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"syncasync");
    match ws_device.next().await.unwrap().unwrap() {
        Message::Binary(bytes) => assert_eq!(bytes, b"sync".to_vec()),
        other => panic!("unexpected message {other:?}"),
    }
    services.close().await;
}

#[tokio::test]
async fn test_websocket_device_answers_instruction_and_consumer_sees_it() {
    // Arrange
    let seen: Arc<Mutex<Vec<InstructionContext>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let consumer: ContextConsumer = Arc::new(move |ctx: &InstructionContext| {
        sink.lock().unwrap().push(ctx.clone());
    });
    let services = started(Some(consumer)).await;
    let ws_addr = services.get_service(ServerKind::WebSocket).unwrap().local_addr().unwrap();
    let (mut ws_device, _) = assert_ok!(tokio_tungstenite::connect_async(format!("ws://{ws_addr}")).await);
    assert!(wait_until(|| services.client_count(ServerMask::WEB) == 1).await);
    let endpoint = services.endpoints(ServerMask::WEB).remove(0);
    let pool = services.get_client_pool(&endpoint).unwrap();

    // The device echoes every request back with a 0xAA marker.
    let device = tokio::spawn(async move {
        if let Some(Ok(Message::Binary(mut request))) = ws_device.next().await {
            request.insert(0, 0xAA);
            ws_device.send(Message::Binary(request)).await.unwrap();
        }
        ws_device
    });

    // Act
    let context = pool
        .execute_instruction_sync(InstructionDescription::fixed("status", vec![0x01]))
        .await;

    // Assert
    assert!(context.success, "{:?}", context.message);
    assert_eq!(context.value("response"), Some(&serde_json::json!([170, 1])));
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(seen.lock().unwrap()[0].success);

    let _ws_device = device.await.unwrap();
    services.close().await;
}

#[tokio::test]
async fn test_send_to_endpoint_routes_to_owning_listener() {
    let services = started(None).await;
    let tcp_addr = services.get_service(ServerKind::Tcp).unwrap().local_addr().unwrap();
    let mut device = assert_ok!(TcpStream::connect(tcp_addr).await);
    let endpoint = Endpoint::from(device.local_addr().unwrap());
    assert!(wait_until(|| services.contains(&endpoint)).await);

    assert!(services.send_sync(&endpoint, b"one").await);
    assert!(services.send_async(&endpoint, b"two".to_vec()).await.unwrap());

    let mut buf = [0u8; 6];
    device.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"onetwo");

    device.write_all(b"bye").await.unwrap();
    drop(device);
    assert!(wait_until(|| !services.contains(&endpoint)).await);
    assert!(!services.send_sync(&endpoint, b"late").await);
    services.close().await;
}

#[tokio::test]
async fn test_silent_device_health_transition_is_published() {
    // Arrange: detection threshold 2 and a device that never answers.
    let services = started(None).await;
    let mut events = services.subscribe();
    let tcp_addr = services.get_service(ServerKind::Tcp).unwrap().local_addr().unwrap();
    let _device = assert_ok!(TcpStream::connect(tcp_addr).await);
    assert!(wait_until(|| services.client_count(ServerMask::TCP) == 1).await);
    let endpoint = services.endpoints(ServerMask::TCP).remove(0);
    let pool = services.get_client_pool(&endpoint).unwrap();

    // Act
    for _ in 0..2 {
        let context = pool
            .execute_instruction_sync(
                InstructionDescription::fixed("status", vec![0x01]).with_timeout(Duration::from_millis(50)),
            )
            .await;
        assert!(!context.success);
    }

    // Assert
    let change = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let ServerEvent::StatusChanged { kind, endpoint: from, change } = events.recv().await.unwrap() {
                assert_eq!(kind, ServerKind::Tcp);
                assert_eq!(from, endpoint);
                return change;
            }
        }
    })
    .await
    .expect("no status change published");
    assert_eq!(change.from, LinkStatus::Unknown);
    assert_eq!(change.to, LinkStatus::Offline);
    assert_eq!(pool.status(), LinkStatus::Offline);
    services.close().await;
}
