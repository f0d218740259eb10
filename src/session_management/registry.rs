//! Registry of every connection accepted during the current session.
//!
//! Shared between the accept loop (registration) and the forwarder tasks (packets, close).
//! Readers only ever get clones taken under the lock, so no view is observed half-updated.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::data_capture::types::{ConnectionInfo, DataPacket};
use crate::network::types::ClientConnection;

const EVENT_CAPACITY: usize = 1024;

/// Change notification, published after the registry was updated.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered(Uuid),
    PacketAdded(Uuid, DataPacket),
    Closed(Uuid),
    Cleared,
}

#[derive(Default)]
struct Connections {
    by_id: HashMap<Uuid, ConnectionInfo>,
    /// Registration order.
    order: Vec<Uuid>,
}

pub struct ConnectionRegistry {
    inner: RwLock<Connections>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Connections::default()),
            events,
        }
    }

    /// Registers a connection from the accepted socket's metadata.
    pub fn register_connection(&self, connection_id: Uuid, client: &ClientConnection) -> ConnectionInfo {
        let mut info = ConnectionInfo::from_peer(connection_id, client.peer_addr);
        info.connected_at = client.accepted_at;
        self.insert(info)
    }

    pub fn register(&self, connection_id: Uuid, client_address: impl Into<String>, client_port: u16) -> ConnectionInfo {
        self.insert(ConnectionInfo::new(connection_id, client_address, client_port))
    }

    fn insert(&self, info: ConnectionInfo) -> ConnectionInfo {
        let mut inner = self.write();
        if let Some(existing) = inner.by_id.get(&info.id) {
            warn!("Connection {} is already registered", info.id);
            return existing.clone();
        }

        info!("Registered connection: {}", info.display_name());
        inner.order.push(info.id);
        inner.by_id.insert(info.id, info.clone());
        // Published under the lock so subscribers see events in mutation order.
        self.publish(RegistryEvent::Registered(info.id));
        info
    }

    /// Appends a packet to a connection's history. Unknown connections are ignored.
    pub fn add_packet(&self, connection_id: Uuid, packet: DataPacket) -> bool {
        let mut inner = self.write();
        match inner.by_id.get_mut(&connection_id) {
            Some(connection) => {
                connection.packets.push(packet.clone());
                self.publish(RegistryEvent::PacketAdded(connection_id, packet));
                true
            }
            None => {
                warn!("Attempted to add data to unknown connection: {}", connection_id);
                false
            }
        }
    }

    /// Marks a connection closed and records when. Closing twice keeps the first timestamp.
    pub fn close_connection(&self, connection_id: Uuid) -> bool {
        let mut inner = self.write();
        let Some(connection) = inner.by_id.get_mut(&connection_id) else {
            debug!("Close requested for unknown connection: {}", connection_id);
            return false;
        };
        if !connection.active {
            return false;
        }

        connection.active = false;
        connection.disconnected_at = Some(Utc::now());
        info!("Connection closed: {}", connection.display_name());
        self.publish(RegistryEvent::Closed(connection_id));
        true
    }

    pub fn get(&self, connection_id: Uuid) -> Option<ConnectionInfo> {
        self.read().by_id.get(&connection_id).cloned()
    }

    pub fn contains(&self, connection_id: Uuid) -> bool {
        self.read().by_id.contains_key(&connection_id)
    }

    pub fn active_count(&self) -> usize {
        self.read().by_id.values().filter(|c| c.active).count()
    }

    pub fn total_count(&self) -> usize {
        self.read().by_id.len()
    }

    /// All connections in registration order.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        inner.by_id.clear();
        inner.order.clear();
        info!("All connections cleared");
        self.publish(RegistryEvent::Cleared);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn read(&self) -> RwLockReadGuard<'_, Connections> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Connections> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
