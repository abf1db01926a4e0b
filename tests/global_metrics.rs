//! The metrics kill-switch is process-wide, so it gets its own test binary
use rc_link::sim::EspNowAir;
use rc_link::transport::espnow::EspNowTransport;
use rc_link::{EspNowConfig, LinkConfig, NodeAddress, Payload, RemoteControl, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn node(air: &EspNowAir) -> (NodeAddress, RemoteControl) {
    let transport = EspNowTransport::new(air.radio(), EspNowConfig::default()).unwrap();
    let addr = transport.local_address();
    let rc = RemoteControl::new(Arc::new(transport), LinkConfig::default()).unwrap();
    (addr, rc)
}

async fn delivered(rc: &RemoteControl) -> bool {
    timeout(Duration::from_millis(200), async {
        loop {
            if rc.recv_data().await.is_some() {
                return;
            }
        }
    })
    .await
    .is_ok()
}

#[tokio::test(start_paused = true)]
async fn test_global_metrics_kill_switch() {
    let air = EspNowAir::new();
    let (x_addr, x) = node(&air);
    let (_, y) = node(&air);
    let payload = Payload::new([2, 0, 0, 0], [1.0, 0.0, 0.0, 0.0, 0.0], 0);

    RemoteControl::disable_global_metrics();
    assert!(!RemoteControl::is_global_metrics_enabled());

    assert!(x.send_data(&payload));
    assert!(delivered(&y).await, "traffic still flows while counting is off");

    air.fail_next_sends(x_addr, 3);
    assert!(x.send_data(&payload));
    sleep(Duration::from_millis(100)).await;
    assert!(!delivered(&y).await);

    assert_eq!(x.send_metrics().total(), 0, "send success and failure suspended");
    assert_eq!(y.receive_metrics().total(), 0, "receive success suspended");
    assert_eq!(x.receive_metrics().total(), 0);
    assert_eq!(y.send_metrics().total(), 0);

    let lines = x.print_metrics(true);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("METRICS DISABLED"));
    assert!(x.print_metrics(true).is_empty(), "warning is rate limited");

    RemoteControl::enable_global_metrics(true);
    assert!(x.send_data(&payload));
    assert!(delivered(&y).await);
    let send = x.send_metrics();
    assert_eq!((send.successful, send.failed), (1, 0));
    let recv = y.receive_metrics();
    assert_eq!((recv.successful, recv.failed), (1, 0));

    air.fail_next_sends(x_addr, 3);
    assert!(x.send_data(&payload));
    sleep(Duration::from_millis(100)).await;
    let send = x.send_metrics();
    assert_eq!((send.successful, send.failed), (1, 1));
    assert_eq!(y.receive_metrics().total(), 1);

    let lines = x.print_metrics(true);
    assert_eq!(lines.len(), 4, "header plus one row");
    assert!(lines[3].contains("ESPNOW"));
    assert!(lines[3].contains("DISC"));
}
