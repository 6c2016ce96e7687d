//! Wire types for the RV device-automation fabric.
//!
//! Two independent wire formats share this crate:
//! - [`UdpMessage`]: the discovery handshake (`announce` / `ack`), one JSON
//!   object per UDP datagram.
//! - [`SessionFrame`]: the TCP session protocol (`device_info`, `heartbeat`,
//!   `status_update`, `command`), one JSON object per newline-delimited
//!   frame.
//!
//! Both are internally tagged on a top-level `type` field so that an unknown
//! or malformed frame fails to deserialize as a single unit rather than
//! partially matching — callers treat any `Err` from `serde_json` the same
//! way: log and drop the frame, never close the connection over it.
//!
//! A `version` field appears in some legacy drafts of this protocol but is
//! never consumed by any peer. It is reserved: readers must ignore it if
//! present, and this crate never emits it.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// UDP discovery
// ---------------------------------------------------------------------------

/// A controller's announce, or the server's ack, framed as a single datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UdpMessage {
    Announce(Announce),
    Ack(Ack),
}

/// `{"type":"announce","target_id":"PicoW1","ip":"192.168.1.50"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub target_id: String,
    pub ip: String,
}

/// `{"type":"ack","server_ip":"192.168.1.10","tcp_port":5001}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub server_ip: String,
    pub tcp_port: u16,
}

// ---------------------------------------------------------------------------
// TCP session
// ---------------------------------------------------------------------------

/// One newline-delimited JSON frame on a device session, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionFrame {
    DeviceInfo(DeviceInfo),
    Heartbeat(Heartbeat),
    StatusUpdate(StatusUpdate),
    Command(Command),
}

impl SessionFrame {
    /// The `type` discriminant as it appears on the wire, for logging
    /// `MessageReceived(type, message)` without re-serializing.
    pub fn type_name(&self) -> &'static str {
        match self {
            SessionFrame::DeviceInfo(_) => "device_info",
            SessionFrame::Heartbeat(_) => "heartbeat",
            SessionFrame::StatusUpdate(_) => "status_update",
            SessionFrame::Command(_) => "command",
        }
    }
}

/// Declares a controller's identity and its inventory of controllable
/// entries. First frame on a new session; also sent again to re-register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub target_id: String,
    pub relays: Vec<DeviceEntryWire>,
}

/// One entry in a `device_info` frame's `relays` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntryWire {
    pub id: String,
    pub label: String,
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<String>,
}

/// Liveness signal. Carries no fields — the bound session is already
/// identified by its connection, not by a repeated `target_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {}

/// Reports a runtime state change for one entry on the bound device.
/// Addresses the entry by `label` or by `id`; at least one must be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub state: String,
}

impl StatusUpdate {
    /// `false` means the frame is missing its required addressing field.
    pub fn has_target(&self) -> bool {
        self.id.is_some() || self.label.is_some()
    }
}

/// Server -> peer command frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub target_id: String,
    pub data: CommandData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandData {
    pub device_type: String,
    pub label: String,
    pub state: String,
}

impl Command {
    pub fn new(target_id: impl Into<String>, device_type: impl Into<String>, label: impl Into<String>, state: impl Into<String>) -> Self {
        Command {
            target_id: target_id.into(),
            data: CommandData {
                device_type: device_type.into(),
                label: label.into(),
                state: state.into(),
            },
        }
    }

    /// Render as a single newline-terminated frame ready to write to a socket.
    pub fn to_frame_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(&SessionFrame::Command(self.clone()))?;
        line.push('\n');
        Ok(line)
    }
}

/// The device type this spec mandates behavior for. Other values are
/// accepted into the data model but their `state` values are not validated.
pub const DEVICE_TYPE_RELAY: &str = "relay";

/// Whether `state` is one of the two values a relay may hold.
pub fn is_valid_relay_state(state: &str) -> bool {
    matches!(state, "on" | "off")
}
