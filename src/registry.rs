//! The device registry: one map, one lock, one source of truth.
//!
//! Earlier drafts of this kind of server (see the legacy client/pool
//! workers this codebase grew out of) kept a client list and a separate
//! per-client metadata map that could drift apart. This registry holds
//! exactly one `RwLock<HashMap<target_id, DeviceRecord>>` — inventory,
//! last-heartbeat timestamp, and the session handle live in the same
//! record, updated under the same lock, so there is nothing to drift.

use crate::error::CommandError;
use coordinator_protocol::Command;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A controllable entry on a bound device, as held internally. Distinct
/// from the wire type in `coordinator-protocol`: this one always has a
/// concrete `state`, never an `Option`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceEntry {
    pub id: String,
    pub label: String,
    pub device_type: String,
    pub state: String,
}

/// Handle to a bound session's write side, shared between the registry and
/// the session task that owns the read side. Closing it is idempotent and
/// safe to call from either side of that split.
pub struct SessionHandle {
    write: Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(write: OwnedWriteHalf) -> Self {
        SessionHandle {
            write: Mutex::new(write),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.write.lock().await;
        guard.write_all(line.as_bytes()).await
    }

    /// Resolves once this handle has been closed, from whichever side
    /// called [`close`](Self::close) first.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Cancels the handle and shuts down the write half. Safe to call more
    /// than once; the second call's shutdown attempt just errors quietly.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut guard = self.write.lock().await;
        let _ = guard.shutdown().await;
    }
}

enum MatchTarget<'a> {
    Id(&'a str),
    Label(&'a str),
}

/// Outcome of applying a `status_update` to a record's inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    NoMatch,
    InvalidState,
}

struct DeviceRecord {
    inventory: Vec<DeviceEntry>,
    inventory_by_id: HashMap<String, DeviceEntry>,
    last_heartbeat: Instant,
    session: Arc<SessionHandle>,
}

impl DeviceRecord {
    fn new(inventory: Vec<DeviceEntry>, session: Arc<SessionHandle>) -> Self {
        let inventory_by_id = inventory.iter().map(|e| (e.id.clone(), e.clone())).collect();
        DeviceRecord {
            inventory,
            inventory_by_id,
            last_heartbeat: Instant::now(),
            session,
        }
    }

    fn replace_inventory(&mut self, inventory: Vec<DeviceEntry>) {
        self.inventory_by_id = inventory.iter().map(|e| (e.id.clone(), e.clone())).collect();
        self.inventory = inventory;
        self.last_heartbeat = Instant::now();
    }

    fn update_state(&mut self, target: MatchTarget<'_>, new_state: String) -> UpdateOutcome {
        let position = self.inventory.iter().position(|entry| match target {
            MatchTarget::Id(id) => entry.id == id,
            MatchTarget::Label(label) => entry.label == label,
        });
        let Some(index) = position else {
            return UpdateOutcome::NoMatch;
        };
        let entry = &self.inventory[index];
        if entry.device_type == coordinator_protocol::DEVICE_TYPE_RELAY
            && !coordinator_protocol::is_valid_relay_state(&new_state)
        {
            return UpdateOutcome::InvalidState;
        }
        self.inventory[index].state = new_state.clone();
        let id = self.inventory[index].id.clone();
        if let Some(entry) = self.inventory_by_id.get_mut(&id) {
            entry.state = new_state;
        }
        UpdateOutcome::Applied
    }
}

/// A read-only view of one device's registered state, for external
/// observers such as `GetDevices()`. Deliberately omits the session handle.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceSnapshot {
    pub target_id: String,
    pub inventory: Vec<DeviceEntry>,
}

pub struct Registry {
    devices: tokio::sync::RwLock<HashMap<String, DeviceRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            devices: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Inserts or overwrites the record for `target_id`. Returns the session
    /// handle of whatever record previously occupied that slot, if any — the
    /// caller is responsible for closing it and announcing its departure.
    pub async fn register(
        &self,
        target_id: &str,
        inventory: Vec<DeviceEntry>,
        session: Arc<SessionHandle>,
    ) -> Option<Arc<SessionHandle>> {
        let record = DeviceRecord::new(inventory, session);
        let mut guard = self.devices.write().await;
        guard
            .insert(target_id.to_owned(), record)
            .map(|previous| previous.session)
    }

    /// Replaces a bound session's own inventory in place, without touching
    /// its session handle or evicting anyone. Used when a device re-sends
    /// `device_info` on the same connection it is already bound with.
    pub async fn replace_inventory(&self, target_id: &str, inventory: Vec<DeviceEntry>) {
        let mut guard = self.devices.write().await;
        if let Some(record) = guard.get_mut(target_id) {
            record.replace_inventory(inventory);
        }
    }

    pub async fn heartbeat(&self, target_id: &str) -> bool {
        let mut guard = self.devices.write().await;
        match guard.get_mut(target_id) {
            Some(record) => {
                record.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn update_status(
        &self,
        target_id: &str,
        id: Option<&str>,
        label: Option<&str>,
        state: String,
    ) -> UpdateOutcome {
        let target = match (id, label) {
            (Some(id), _) => MatchTarget::Id(id),
            (None, Some(label)) => MatchTarget::Label(label),
            (None, None) => return UpdateOutcome::NoMatch,
        };
        let mut guard = self.devices.write().await;
        match guard.get_mut(target_id) {
            Some(record) => record.update_state(target, state),
            None => UpdateOutcome::NoMatch,
        }
    }

    /// Removes the record for `target_id` only if it is still owned by
    /// `session` — a session that has already been superseded must never
    /// evict whatever replaced it.
    pub async fn remove_if_current(&self, target_id: &str, session: &Arc<SessionHandle>) -> bool {
        let mut guard = self.devices.write().await;
        if let std::collections::hash_map::Entry::Occupied(entry) = guard.entry(target_id.to_owned()) {
            if Arc::ptr_eq(&entry.get().session, session) {
                entry.remove();
                return true;
            }
        }
        false
    }

    /// Atomically removes every record whose last heartbeat is at least
    /// `timeout` old, returning their session handles for the caller to
    /// close and announce. The scan and the removal happen under one write
    /// lock, so a heartbeat arriving mid-scan can never be evicted out from
    /// under itself.
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<(String, Arc<SessionHandle>)> {
        let mut guard = self.devices.write().await;
        let now = Instant::now();
        let stale_ids: Vec<String> = guard
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_heartbeat) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        stale_ids
            .into_iter()
            .filter_map(|id| guard.remove(&id).map(|record| (id, record.session)))
            .collect()
    }

    pub async fn snapshot(&self) -> HashMap<String, DeviceSnapshot> {
        let guard = self.devices.read().await;
        guard
            .iter()
            .map(|(target_id, record)| {
                (
                    target_id.clone(),
                    DeviceSnapshot {
                        target_id: target_id.clone(),
                        inventory: record.inventory.clone(),
                    },
                )
            })
            .collect()
    }

    pub async fn send_command(
        &self,
        target_id: &str,
        device_type: &str,
        label: &str,
        state: &str,
    ) -> Result<(), CommandError> {
        let session = {
            let guard = self.devices.read().await;
            guard.get(target_id).map(|record| Arc::clone(&record.session))
        };
        let session = session.ok_or_else(|| CommandError::NotConnected(target_id.to_owned()))?;
        let command = Command::new(target_id, device_type, label, state);
        let line = command
            .to_frame_line()
            .map_err(|error| CommandError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, error)))?;
        session.send_line(&line).await.map_err(CommandError::Io)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, label: &str, device_type: &str, state: &str) -> DeviceEntry {
        DeviceEntry {
            id: id.to_owned(),
            label: label.to_owned(),
            device_type: device_type.to_owned(),
            state: state.to_owned(),
        }
    }

    /// A session handle needs a real `OwnedWriteHalf`, which only a live
    /// socket can produce. Binds an ephemeral loopback listener, connects to
    /// it, and returns the accepted side's handle plus the client side
    /// (kept alive by the caller so the handle's socket isn't immediately
    /// EOF'd).
    async fn fake_session_handle() -> (Arc<SessionHandle>, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        (Arc::new(SessionHandle::new(write)), client)
    }

    #[tokio::test]
    async fn register_overwrites_and_returns_the_prior_session() {
        let registry = Registry::new();
        let (handle_a, _client_a) = fake_session_handle().await;
        let (handle_b, _client_b) = fake_session_handle().await;

        let previous = registry
            .register("PicoW1", vec![entry("r1", "Pump", "relay", "off")], Arc::clone(&handle_a))
            .await;
        assert!(previous.is_none());

        let previous = registry
            .register("PicoW1", vec![entry("r1", "Pump", "relay", "off")], Arc::clone(&handle_b))
            .await;
        assert!(previous.is_some());
        assert!(Arc::ptr_eq(&previous.unwrap(), &handle_a));
    }

    #[tokio::test]
    async fn heartbeat_refreshes_an_existing_record_only() {
        let registry = Registry::new();
        let (handle, _client) = fake_session_handle().await;
        assert!(!registry.heartbeat("PicoW1").await);
        registry
            .register("PicoW1", vec![entry("r1", "Pump", "relay", "off")], handle)
            .await;
        assert!(registry.heartbeat("PicoW1").await);
    }

    #[tokio::test]
    async fn status_update_matches_by_id_or_label_and_validates_relay_states() {
        let registry = Registry::new();
        let (handle, _client) = fake_session_handle().await;
        registry
            .register("PicoW1", vec![entry("r1", "Pump", "relay", "off")], handle)
            .await;

        let outcome = registry
            .update_status("PicoW1", Some("r1"), None, "on".to_owned())
            .await;
        assert_eq!(outcome, UpdateOutcome::Applied);

        let outcome = registry
            .update_status("PicoW1", None, Some("Pump"), "off".to_owned())
            .await;
        assert_eq!(outcome, UpdateOutcome::Applied);

        let outcome = registry
            .update_status("PicoW1", Some("r1"), None, "blink".to_owned())
            .await;
        assert_eq!(outcome, UpdateOutcome::InvalidState);

        let outcome = registry
            .update_status("PicoW1", Some("nonexistent"), None, "on".to_owned())
            .await;
        assert_eq!(outcome, UpdateOutcome::NoMatch);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot["PicoW1"].inventory[0].state, "off");
    }

    #[tokio::test]
    async fn remove_if_current_refuses_to_evict_a_superseding_session() {
        let registry = Registry::new();
        let (handle_a, _client_a) = fake_session_handle().await;
        let (handle_b, _client_b) = fake_session_handle().await;

        registry
            .register("PicoW1", vec![entry("r1", "Pump", "relay", "off")], Arc::clone(&handle_a))
            .await;
        registry
            .register("PicoW1", vec![entry("r1", "Pump", "relay", "off")], Arc::clone(&handle_b))
            .await;

        assert!(!registry.remove_if_current("PicoW1", &handle_a).await);
        assert!(registry.remove_if_current("PicoW1", &handle_b).await);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn evict_stale_removes_only_records_past_the_timeout() {
        let registry = Registry::new();
        let (handle_a, _client_a) = fake_session_handle().await;
        let (handle_b, _client_b) = fake_session_handle().await;

        registry
            .register("Stale", vec![entry("r1", "Pump", "relay", "off")], handle_a)
            .await;
        registry
            .register("Fresh", vec![entry("r1", "Pump", "relay", "off")], handle_b)
            .await;

        tokio::time::advance(Duration::from_secs(120)).await;
        registry.heartbeat("Fresh").await;

        let evicted = registry.evict_stale(Duration::from_secs(60)).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "Stale");

        let snapshot = registry.snapshot().await;
        assert!(!snapshot.contains_key("Stale"));
        assert!(snapshot.contains_key("Fresh"));
    }
}
