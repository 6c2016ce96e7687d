//! Top-level wiring.
//!
//! [`Coordinator`] owns the single cancellation scope that gates all three
//! long-running activities (discovery responder, session server, liveness
//! monitor) plus every per-connection task the session server spawns.
//! `stop()` cancels it once; everything downstream tears itself down from
//! there.

use crate::config::Config;
use crate::error::CommandError;
use crate::events::{self, CoordinatorEvent};
use crate::probe;
use crate::registry::{DeviceSnapshot, Registry};
use crate::{discovery, liveness, session};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Coordinator {
    registry: Arc<Registry>,
    events: broadcast::Sender<CoordinatorEvent>,
    shutdown: CancellationToken,
    config: Config,
    server_ip: Ipv4Addr,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        let server_ip = probe::probe_primary_ipv4();
        let (events, _) = events::channel();
        Coordinator {
            registry: Arc::new(Registry::new()),
            events,
            shutdown: CancellationToken::new(),
            config,
            server_ip,
        }
    }

    /// The address advertised in discovery acks.
    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    /// Subscribes to [`CoordinatorEvent`]s. Each subscriber gets its own
    /// lagging buffer; a subscriber that falls behind misses old events
    /// rather than blocking the coordinator.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Starts the discovery responder, session server, and liveness
    /// monitor, and waits for all three to stop — which normally only
    /// happens after [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        let discovery_task = tokio::spawn(discovery::run(
            self.config.udp_port,
            self.server_ip,
            self.config.tcp_port,
            self.shutdown.clone(),
        ));
        let session_task = tokio::spawn(session::run(
            self.config.tcp_port,
            Arc::clone(&self.registry),
            self.events.clone(),
            Duration::from_secs(self.config.tcp_keepalive_idle_secs),
            Duration::from_secs(self.config.tcp_keepalive_interval_secs),
            self.shutdown.clone(),
        ));
        let liveness_task = tokio::spawn(liveness::run(
            Arc::clone(&self.registry),
            self.events.clone(),
            Duration::from_secs(self.config.heartbeat_timeout_secs),
            Duration::from_secs(self.config.heartbeat_scan_interval_secs),
            self.shutdown.clone(),
        ));

        let (discovery_result, session_result, _liveness_result) =
            tokio::join!(discovery_task, session_task, liveness_task);

        match discovery_result {
            Ok(Err(bind_error)) => error!(error = %bind_error, "discovery responder exited"),
            Err(join_error) => error!(error = %join_error, "discovery responder task panicked"),
            Ok(Ok(())) => {}
        }
        match session_result {
            Ok(Err(bind_error)) => error!(error = %bind_error, "session server exited"),
            Err(join_error) => error!(error = %join_error, "session server task panicked"),
            Ok(Ok(())) => {}
        }
    }

    /// Signals every running activity and per-session task to tear down.
    /// Returns immediately; `run()` resolves once teardown completes.
    pub fn stop(&self) {
        info!("stopping coordinator");
        self.shutdown.cancel();
    }

    pub async fn send_command(&self, target_id: &str, device_type: &str, label: &str, state: &str) -> Result<(), CommandError> {
        self.registry.send_command(target_id, device_type, label, state).await
    }

    pub async fn devices(&self) -> HashMap<String, DeviceSnapshot> {
        self.registry.snapshot().await
    }
}
