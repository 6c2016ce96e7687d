//! Liveness monitor.
//!
//! Runs on its own fixed timer, independent of any socket activity, and
//! evicts any bound device whose last heartbeat is older than the
//! configured timeout. A device that never sends a heartbeat at all is
//! still subject to eviction — its `last_heartbeat` is seeded at
//! registration time, so silence after `device_info` times out exactly
//! like silence after the last heartbeat would.

use crate::events::CoordinatorEvent;
use crate::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run(
    registry: Arc<Registry>,
    events: broadcast::Sender<CoordinatorEvent>,
    timeout: Duration,
    scan_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("liveness monitor stopping");
                return;
            }
            _ = ticker.tick() => {
                for (target_id, handle) in registry.evict_stale(timeout).await {
                    handle.close().await;
                    info!(%target_id, "evicted device for missing a heartbeat");
                    let _ = events.send(CoordinatorEvent::DeviceDisconnected { target_id });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DeviceEntry, SessionHandle};

    async fn fake_session_handle() -> (Arc<SessionHandle>, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        (Arc::new(SessionHandle::new(write)), client)
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_a_device_that_stops_heartbeating_and_announces_it() {
        let registry = Arc::new(Registry::new());
        let (events_tx, mut events_rx) = crate::events::channel();
        let shutdown = CancellationToken::new();
        let (handle, _client) = fake_session_handle().await;

        registry
            .register(
                "PicoW1",
                vec![DeviceEntry {
                    id: "r1".to_owned(),
                    label: "Pump".to_owned(),
                    device_type: "relay".to_owned(),
                    state: "off".to_owned(),
                }],
                handle,
            )
            .await;

        let monitor = tokio::spawn(run(
            Arc::clone(&registry),
            events_tx,
            Duration::from_secs(60),
            Duration::from_secs(10),
            shutdown.clone(),
        ));

        tokio::time::advance(Duration::from_secs(65)).await;
        // Let the interval actually fire on the paused clock.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1)).await;

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, CoordinatorEvent::DeviceDisconnected { target_id } if target_id == "PicoW1"));
        assert!(registry.snapshot().await.is_empty());

        shutdown.cancel();
        let _ = monitor.await;
    }
}
