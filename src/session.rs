//! TCP session server.
//!
//! Accepts controller connections and speaks a newline-delimited JSON
//! protocol over each one. Framing, classification, and registry dispatch
//! all happen on the connection's own task — nothing here blocks on
//! anything but its own socket, its own cancellation, and registry locks
//! that are held only for the duration of a single map operation.

use crate::error::BindError;
use crate::events::CoordinatorEvent;
use crate::registry::{DeviceEntry, Registry, SessionHandle, UpdateOutcome};
use coordinator_protocol::{DeviceEntryWire, SessionFrame};
use socket2::{Domain, Protocol, SockRef, TcpKeepalive};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 4096;

pub async fn run(
    bind_port: u16,
    registry: Arc<Registry>,
    events: broadcast::Sender<CoordinatorEvent>,
    keepalive_idle: Duration,
    keepalive_interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), BindError> {
    let listener = bind_listener(bind_port).await?;
    info!(port = bind_port, "session server listening");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("session server stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        if let Err(error) = apply_keepalive(&stream, keepalive_idle, keepalive_interval) {
                            warn!(%error, %addr, "failed to configure TCP keepalive");
                        }
                        let registry = Arc::clone(&registry);
                        let events = events.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, addr, registry, events, shutdown).await;
                        });
                    }
                    Err(error) => warn!(%error, "accept failed"),
                }
            }
        }
    }
}

async fn bind_listener(port: u16) -> Result<TcpListener, BindError> {
    let to_bind_error = |source| BindError::Tcp { port, source };
    let socket = socket2::Socket::new(Domain::IPV4, socket2::Type::STREAM, Some(Protocol::TCP)).map_err(to_bind_error)?;
    socket.set_reuse_address(true).map_err(to_bind_error)?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into()).map_err(to_bind_error)?;
    socket.listen(1024).map_err(to_bind_error)?;
    socket.set_nonblocking(true).map_err(to_bind_error)?;
    TcpListener::from_std(socket.into()).map_err(to_bind_error)
}

fn apply_keepalive(stream: &TcpStream, idle: Duration, interval: Duration) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle).with_interval(interval);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Waits on a handle's cancellation when one exists, and never resolves
/// otherwise. Lets a single `select!` cover "this session was evicted" even
/// before the session has bound to anything.
async fn cancelled_if_bound(handle: &Arc<SessionHandle>) {
    handle.cancelled().await;
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<Registry>,
    events: broadcast::Sender<CoordinatorEvent>,
    shutdown: CancellationToken,
) {
    let (mut read_half, write_half) = stream.into_split();
    let session = Arc::new(SessionHandle::new(write_half));
    let mut bound_target: Option<String> = None;
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_BUFFER_SIZE];

    debug!(%addr, "session connected");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = cancelled_if_bound(&session) => break,
            read = read_half.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        debug!(%addr, "connection closed by peer");
                        break;
                    }
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(error) => {
                        warn!(%error, %addr, "read error, closing session");
                        break;
                    }
                }
            }
        }
        drain_frames(&mut buf, &mut bound_target, &session, &registry, &events, &addr).await;
    }

    teardown(bound_target, &session, &registry, &events, &addr).await;
}

async fn drain_frames(
    buf: &mut Vec<u8>,
    bound_target: &mut Option<String>,
    session: &Arc<SessionHandle>,
    registry: &Registry,
    events: &broadcast::Sender<CoordinatorEvent>,
    addr: &SocketAddr,
) {
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        handle_frame(line, bound_target, session, registry, events, addr).await;
    }
}

async fn handle_frame(
    line: &[u8],
    bound_target: &mut Option<String>,
    session: &Arc<SessionHandle>,
    registry: &Registry,
    events: &broadcast::Sender<CoordinatorEvent>,
    addr: &SocketAddr,
) {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(error) => {
            warn!(%error, %addr, "frame is not valid UTF-8, dropping it");
            return;
        }
    };
    if text.is_empty() {
        return;
    }

    let frame: SessionFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(%error, %addr, raw = %text, "failed to parse frame, dropping it");
            return;
        }
    };

    publish_message_received(&frame, bound_target.clone(), events);

    match frame {
        SessionFrame::DeviceInfo(info) => {
            handle_device_info(info, bound_target, session, registry, events, addr).await;
        }
        SessionFrame::Heartbeat(_) => handle_heartbeat(bound_target, registry, addr).await,
        SessionFrame::StatusUpdate(update) => handle_status_update(update, bound_target, registry, addr).await,
        SessionFrame::Command(_) => {
            warn!(%addr, "received a command frame from a peer; commands are server-to-peer only, dropping it");
        }
    }
}

fn publish_message_received(frame: &SessionFrame, target_id: Option<String>, events: &broadcast::Sender<CoordinatorEvent>) {
    let Ok(value) = serde_json::to_value(frame) else {
        return;
    };
    let _ = events.send(CoordinatorEvent::MessageReceived {
        target_id,
        frame_type: frame.type_name(),
        frame: Arc::new(value),
    });
}

async fn handle_heartbeat(bound_target: &Option<String>, registry: &Registry, addr: &SocketAddr) {
    match bound_target {
        Some(target_id) => {
            if !registry.heartbeat(target_id).await {
                warn!(%target_id, %addr, "heartbeat for a record no longer in the registry");
            }
        }
        None => debug!(%addr, "heartbeat on an unbound session, ignoring"),
    }
}

async fn handle_status_update(
    update: coordinator_protocol::StatusUpdate,
    bound_target: &Option<String>,
    registry: &Registry,
    addr: &SocketAddr,
) {
    let Some(target_id) = bound_target else {
        debug!(%addr, "status_update on an unbound session, ignoring");
        return;
    };
    if !update.has_target() {
        warn!(%target_id, %addr, "status_update missing both id and label, ignoring");
        return;
    }
    let outcome = registry
        .update_status(target_id, update.id.as_deref(), update.label.as_deref(), update.state.clone())
        .await;
    match outcome {
        UpdateOutcome::Applied => {}
        UpdateOutcome::NoMatch => {
            warn!(%target_id, id = ?update.id, label = ?update.label, "status_update matched no inventory entry, ignoring");
        }
        UpdateOutcome::InvalidState => {
            warn!(%target_id, state = %update.state, "status_update declared an invalid relay state, ignoring");
        }
    }
}

async fn handle_device_info(
    info: coordinator_protocol::DeviceInfo,
    bound_target: &mut Option<String>,
    session: &Arc<SessionHandle>,
    registry: &Registry,
    events: &broadcast::Sender<CoordinatorEvent>,
    addr: &SocketAddr,
) {
    let inventory = build_inventory(&info.relays);

    if bound_target.as_deref() == Some(info.target_id.as_str()) {
        registry.replace_inventory(&info.target_id, inventory).await;
        info!(target_id = %info.target_id, %addr, "device_info refreshed inventory for an already-bound session");
        return;
    }

    let previously_bound = bound_target.take();
    let evicted = registry.register(&info.target_id, inventory, Arc::clone(session)).await;
    *bound_target = Some(info.target_id.clone());
    info!(target_id = %info.target_id, %addr, "device registered");

    if let Some(old_session) = evicted {
        old_session.close().await;
        let _ = events.send(CoordinatorEvent::DeviceDisconnected {
            target_id: info.target_id.clone(),
        });
    }

    // This connection was already bound under a different identity before
    // re-registering as a new one; release the slot it used to hold.
    if let Some(previous_target_id) = previously_bound {
        if registry.remove_if_current(&previous_target_id, session).await {
            let _ = events.send(CoordinatorEvent::DeviceDisconnected {
                target_id: previous_target_id,
            });
        }
    }
}

fn build_inventory(wire: &[DeviceEntryWire]) -> Vec<DeviceEntry> {
    wire.iter()
        .map(|entry| {
            let declared = entry.initial_state.clone().unwrap_or_else(|| "off".to_owned());
            let state = if entry.device_type == coordinator_protocol::DEVICE_TYPE_RELAY
                && !coordinator_protocol::is_valid_relay_state(&declared)
            {
                warn!(entry_id = %entry.id, state = %declared, "relay declared an invalid initial_state, defaulting to off");
                "off".to_owned()
            } else {
                declared
            };
            DeviceEntry {
                id: entry.id.clone(),
                label: entry.label.clone(),
                device_type: entry.device_type.clone(),
                state,
            }
        })
        .collect()
}

async fn teardown(
    bound_target: Option<String>,
    session: &Arc<SessionHandle>,
    registry: &Registry,
    events: &broadcast::Sender<CoordinatorEvent>,
    addr: &SocketAddr,
) {
    session.close().await;
    let Some(target_id) = bound_target else {
        debug!(%addr, "session closed without ever binding to a device");
        return;
    };
    if registry.remove_if_current(&target_id, session).await {
        info!(%target_id, %addr, "session closed, record removed");
        let _ = events.send(CoordinatorEvent::DeviceDisconnected { target_id });
    } else {
        debug!(%target_id, %addr, "session closed, but its record had already been superseded or evicted");
    }
}
