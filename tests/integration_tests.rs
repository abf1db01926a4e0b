use rc_link::sim::{EspNowAir, Nrf24Air, WifiAir};
use rc_link::transport::espnow::EspNowTransport;
use rc_link::transport::nrf24::{Nrf24Transport, Pipe};
use rc_link::transport::wifi::{Role, WifiTransport};
use rc_link::{
    ConnectionState, EspNowConfig, LinkConfig, Message, MessageType, Nrf24Config, NodeAddress,
    Payload, RemoteControl, Transport, WifiConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

mod harness {
    use super::*;
    use rc_link::sim::{SimNrf24Radio, SimWifiDevice};

    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    pub fn espnow_node(air: &EspNowAir) -> (NodeAddress, RemoteControl) {
        let transport = EspNowTransport::new(air.radio(), EspNowConfig::default()).unwrap();
        let addr = transport.local_address();
        let rc = RemoteControl::new(Arc::new(transport), LinkConfig::default()).unwrap();
        (addr, rc)
    }

    pub fn nrf24_node(
        air: &Nrf24Air,
        chip_id: u64,
    ) -> (Arc<Nrf24Transport<SimNrf24Radio>>, RemoteControl) {
        let transport =
            Arc::new(Nrf24Transport::new(air.radio(chip_id), Nrf24Config::default()).unwrap());
        let rc = RemoteControl::new(transport.clone(), LinkConfig::default()).unwrap();
        (transport, rc)
    }

    pub fn wifi_node(
        air: &WifiAir,
        mac: NodeAddress,
    ) -> (Arc<WifiTransport<SimWifiDevice>>, RemoteControl) {
        let transport =
            Arc::new(WifiTransport::new(air.device_with_mac(mac), WifiConfig::default()).unwrap());
        let rc = RemoteControl::new(transport.clone(), LinkConfig::default()).unwrap();
        (transport, rc)
    }

    /// Poll `condition` every 10 ms until it holds or `limit` passes
    pub async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    pub async fn next_payload(rc: &RemoteControl, limit: Duration) -> Option<Payload> {
        timeout(limit, async {
            loop {
                if let Some(payload) = rc.recv_data().await {
                    return payload;
                }
            }
        })
        .await
        .ok()
    }

    pub fn both_connected(a: &RemoteControl, b: &RemoteControl) -> bool {
        a.connection_state() == ConnectionState::Connected
            && b.connection_state() == ConnectionState::Connected
    }
}

use harness::*;

#[allow(clippy::approx_constant)]
fn sample_payload() -> Payload {
    Payload::new([1, 0, 0, 0], [3.14, 0.0, 0.0, 0.0, 0.0], 0x05)
}

#[tokio::test(start_paused = true)]
async fn test_espnow_end_to_end_payload() {
    init_tracing();
    let air = EspNowAir::new();
    let (x_addr, x) = espnow_node(&air);
    let (y_addr, y) = espnow_node(&air);

    x.connect().await.unwrap();
    y.connect().await.unwrap();

    let first_frame = wait_until(Duration::from_millis(500), || {
        x.connection_state() == ConnectionState::Connected
            || y.connection_state() == ConnectionState::Connected
    });
    assert!(first_frame.await);
    let heartbeat = Duration::from_millis(LinkConfig::default().heartbeat_interval_ms);
    assert!(
        wait_until(heartbeat, || both_connected(&x, &y)).await,
        "both sides connected within one heartbeat of the first frame"
    );
    assert_eq!(x.peer_address(), Some(y_addr));
    assert_eq!(y.peer_address(), Some(x_addr));

    assert!(x.send_data(&sample_payload()));
    let received = next_payload(&y, Duration::from_secs(1))
        .await
        .expect("payload delivered");
    assert_eq!(received, sample_payload());
    assert_eq!(received.id1, 1);
    assert_eq!(received.values(), sample_payload().values());
    assert_eq!(received.flags, 0x05);

    assert_eq!(x.send_metrics().successful, 1);
    assert_eq!(y.receive_metrics().successful, 1);
    println!("\n✓ ESP-NOW pair exchanged payload, both CONNECTED");
}

#[tokio::test(start_paused = true)]
async fn test_espnow_rejects_malformed_frames() {
    init_tracing();
    let air = EspNowAir::new();
    let (y_addr, y) = espnow_node(&air);
    let stranger = NodeAddress::new([0x02, 9, 9, 9, 9, 9]);

    air.inject(stranger, y_addr, &[0u8; 10]);

    let mut unknown = Message::system(MessageType::Heartbeat, stranger).to_bytes();
    unknown[0] = 9;
    air.inject(stranger, y_addr, &unknown);

    let discovery = Message::system(MessageType::IpDiscovery, stranger).to_bytes();
    air.inject(stranger, y_addr, &discovery);

    assert_eq!(y.connection_state(), ConnectionState::Disconnected);
    assert_eq!(y.receive_metrics().total(), 0);

    let heartbeat = Message::system(MessageType::Heartbeat, stranger).to_bytes();
    air.inject(stranger, y_addr, &heartbeat);
    assert_eq!(y.connection_state(), ConnectionState::Connected);
    assert_eq!(y.peer_address(), Some(stranger));
}

#[tokio::test(start_paused = true)]
async fn test_espnow_reconnects_after_power_loss() {
    init_tracing();
    let air = EspNowAir::new();
    let (_, x) = espnow_node(&air);
    let (y_addr, y) = espnow_node(&air);
    x.connect().await.unwrap();
    y.connect().await.unwrap();
    assert!(wait_until(Duration::from_millis(500), || both_connected(&x, &y)).await);

    air.set_powered(y_addr, false);
    assert!(
        wait_until(Duration::from_secs(1), || {
            x.connection_state() == ConnectionState::Disconnected
                && y.connection_state() == ConnectionState::Disconnected
        })
        .await
    );
    assert_eq!(x.peer_address(), None);

    air.set_powered(y_addr, true);
    assert!(wait_until(Duration::from_secs(1), || both_connected(&x, &y)).await);
    assert_eq!(x.peer_address(), Some(y_addr));

    assert!(x.send_data(&sample_payload()));
    assert!(next_payload(&y, Duration::from_secs(1)).await.is_some());
    println!("\n✓ ESP-NOW link recovered after power cycle");
}

#[tokio::test(start_paused = true)]
async fn test_espnow_send_retries_and_metrics() {
    init_tracing();
    let air = EspNowAir::new();
    let (x_addr, x) = espnow_node(&air);

    air.fail_next_sends(x_addr, 2);
    assert!(x.send_data(&sample_payload()));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(x.send_metrics().successful, 1);
    assert_eq!(x.send_metrics().failed, 0);
    assert_eq!(air.frames_sent(x_addr), 1);

    air.fail_next_sends(x_addr, 3);
    assert!(x.send_data(&sample_payload()));
    sleep(Duration::from_millis(100)).await;
    let metrics = x.send_metrics();
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.total(), 2);
    assert!((metrics.success_rate - 50.0).abs() < 0.01);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_data_alone_keeps_link_alive() {
    init_tracing();
    let air = EspNowAir::new();
    let (y_addr, y) = espnow_node(&air);
    y.connect().await.unwrap();
    let stranger = NodeAddress::new([0x02, 7, 7, 7, 7, 7]);
    let frame = Message::data(stranger, &sample_payload()).to_bytes();

    for _ in 0..20 {
        air.inject(stranger, y_addr, &frame);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(y.connection_state(), ConnectionState::Connected);
    }
    assert_eq!(y.peer_address(), Some(stranger));

    assert!(
        wait_until(Duration::from_secs(1), || {
            y.connection_state() == ConnectionState::Disconnected
        })
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_nrf24_pipes_follow_connection() {
    init_tracing();
    let air = Nrf24Air::new();
    let (x_radio, x) = nrf24_node(&air, 0x1111_2222_33);
    let (y_radio, y) = nrf24_node(&air, 0x4444_5555_66);
    assert_eq!(x_radio.active_pipe(), Pipe::Broadcast);

    x.connect().await.unwrap();
    y.connect().await.unwrap();
    assert!(wait_until(Duration::from_millis(500), || both_connected(&x, &y)).await);
    assert!(
        wait_until(Duration::from_millis(100), || {
            x_radio.active_pipe() == Pipe::Peer(y.local_address())
                && y_radio.active_pipe() == Pipe::Peer(x.local_address())
        })
        .await
    );

    assert!(y.send_data(&sample_payload()));
    let received = next_payload(&x, Duration::from_secs(1)).await.unwrap();
    assert_eq!(received, sample_payload());

    air.set_powered(0x4444_5555_66, false);
    assert!(
        wait_until(Duration::from_secs(1), || {
            x.connection_state() == ConnectionState::Disconnected
        })
        .await
    );
    assert!(
        wait_until(Duration::from_millis(200), || {
            x_radio.active_pipe() == Pipe::Broadcast
        })
        .await
    );
    println!("\n✓ nRF24 switched to peer pipe and back to broadcast");
}

#[tokio::test(start_paused = true)]
async fn test_nrf24_discards_data_before_heartbeat() {
    init_tracing();
    let air = Nrf24Air::new();
    let (_, y) = nrf24_node(&air, 0x0A0B_0C0D_0E);
    let stranger = NodeAddress::new([0xD2, 1, 2, 3, 4, 5]);

    air.inject(0x0A0B_0C0D_0E, &Message::data(stranger, &sample_payload()).to_bytes());
    sleep(Duration::from_millis(50)).await;
    assert_eq!(y.connection_state(), ConnectionState::Disconnected);
    assert_eq!(y.receive_metrics().total(), 0);

    air.inject(
        0x0A0B_0C0D_0E,
        &Message::system(MessageType::Heartbeat, stranger).to_bytes(),
    );
    air.inject(0x0A0B_0C0D_0E, &Message::data(stranger, &sample_payload()).to_bytes());
    sleep(Duration::from_millis(50)).await;

    assert_eq!(y.connection_state(), ConnectionState::Connected);
    assert_eq!(y.peer_address(), Some(stranger));
    assert_eq!(y.receive_metrics().successful, 1);
}

#[tokio::test(start_paused = true)]
async fn test_wifi_bootstrap_and_exchange() {
    init_tracing();
    let air = WifiAir::new();
    let high_mac = NodeAddress::new([0x02, 0, 0, 0, 0xBB, 0x02]);
    let low_mac = NodeAddress::new([0x02, 0, 0, 0, 0xAA, 0x01]);
    let (high_wifi, high) = wifi_node(&air, high_mac);
    let (low_wifi, low) = wifi_node(&air, low_mac);

    let (a, b) = tokio::join!(high.connect(), low.connect());
    a.unwrap();
    b.unwrap();

    assert_eq!(high_wifi.role(), Some(Role::Host));
    assert_eq!(low_wifi.role(), Some(Role::Join));
    assert_eq!(air.hosted_network(high_mac).as_deref(), Some("rc-00bb02"));
    assert_eq!(high_wifi.peer_ip(), low_wifi.local_ip());
    assert_eq!(low_wifi.peer_ip(), high_wifi.local_ip());

    let found = low.discovery_result();
    assert!(found.discovered);
    assert_eq!(found.peer_addr, high_mac);
    assert_eq!(found.info, "192.168.4.1");

    assert!(wait_until(Duration::from_secs(1), || both_connected(&high, &low)).await);
    assert!(high.send_data(&sample_payload()));
    assert_eq!(
        next_payload(&low, Duration::from_secs(1)).await,
        Some(sample_payload())
    );
    println!("\n✓ Wi-Fi roles negotiated, IPs exchanged, payload delivered");
}

#[tokio::test(start_paused = true)]
async fn test_wifi_rebootstraps_after_peer_power_cycle() {
    init_tracing();
    let air = WifiAir::new();
    let high_mac = NodeAddress::new([0x02, 0, 0, 0, 0xBB, 0x02]);
    let low_mac = NodeAddress::new([0x02, 0, 0, 0, 0xAA, 0x01]);
    let (_, high) = wifi_node(&air, high_mac);
    let (low_wifi, low) = wifi_node(&air, low_mac);

    let (a, b) = tokio::join!(high.connect(), low.connect());
    a.unwrap();
    b.unwrap();
    assert!(wait_until(Duration::from_secs(1), || both_connected(&high, &low)).await);

    air.set_powered(low_mac, false);
    assert!(
        wait_until(Duration::from_secs(1), || {
            high.connection_state() == ConnectionState::Disconnected
        })
        .await
    );

    sleep(Duration::from_secs(4)).await;
    air.set_powered(low_mac, true);

    assert!(wait_until(Duration::from_secs(60), || both_connected(&high, &low)).await);
    assert_eq!(air.member_ip(low_mac), low_wifi.local_ip());

    assert!(low.send_data(&sample_payload()));
    assert!(next_payload(&high, Duration::from_secs(1)).await.is_some());
    println!("\n✓ Wi-Fi link re-bootstrapped after peer power cycle");
}
