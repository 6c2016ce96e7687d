//! Events the coordinator publishes for external observers (dashboards,
//! loggers, anything that wants to watch without sitting in the hot path).
//!
//! Delivery is fire-and-forget over a [`broadcast`] channel: a lagging or
//! absent subscriber can never block frame processing or session teardown.
//! Emitting one of these is always a plain `let _ = sender.send(..)`.

use std::sync::Arc;
use tokio::sync::broadcast;

/// Subscribers that never catch up simply miss old events; producers don't
/// block or buffer on their behalf. 1024 is generous for a fabric sized in
/// the tens of devices.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// A frame was parsed successfully on a session. Fires before any
    /// registry mutation the frame causes becomes visible to other
    /// observers, so a subscriber never sees an effect before its cause.
    MessageReceived {
        target_id: Option<String>,
        frame_type: &'static str,
        frame: Arc<serde_json::Value>,
    },
    /// A bound device's session ended, for any reason: clean close, I/O
    /// error, heartbeat timeout, or being superseded by a re-registration.
    /// Fires exactly once per session that ever reached the bound state.
    DeviceDisconnected { target_id: String },
}

pub fn channel() -> (
    broadcast::Sender<CoordinatorEvent>,
    broadcast::Receiver<CoordinatorEvent>,
) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
