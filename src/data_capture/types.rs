//! Common data types used across the data_capture subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Direction of TCP flow for captured bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Bytes flowing from the client to the proxied target.
    ClientToTarget,
    /// Bytes flowing from the target back to the client.
    TargetToClient,
}

impl Direction {
    pub fn arrow(&self) -> &'static str {
        match self {
            Direction::ClientToTarget => "C->T",
            Direction::TargetToClient => "T->C",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToTarget => f.write_str("CLIENT_TO_TARGET"),
            Direction::TargetToClient => f.write_str("TARGET_TO_CLIENT"),
        }
    }
}

/// Coarse classification of a captured payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Text,
    Binary,
}

/// One consolidated burst of bytes, as emitted by a forwarder.
///
/// Built once by the data processor and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub raw_data: Vec<u8>,
    pub data_type: DataType,
    pub display_text: String,
}

impl DataPacket {
    pub fn size(&self) -> usize {
        self.raw_data.len()
    }

    pub fn is_text(&self) -> bool {
        self.data_type == DataType::Text
    }
}

/// Everything known about one accepted client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub client_address: String,
    pub client_port: u16,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub packets: Vec<DataPacket>,
}

impl ConnectionInfo {
    pub fn new(id: Uuid, client_address: impl Into<String>, client_port: u16) -> Self {
        Self {
            id,
            client_address: client_address.into(),
            client_port,
            connected_at: Utc::now(),
            disconnected_at: None,
            active: true,
            packets: Vec::new(),
        }
    }

    pub fn from_peer(id: Uuid, peer: SocketAddr) -> Self {
        Self::new(id, peer.ip().to_string(), peer.port())
    }

    pub fn total_bytes(&self) -> usize {
        self.packets.iter().map(DataPacket::size).sum()
    }

    pub fn bytes_in(&self, direction: Direction) -> usize {
        self.packets
            .iter()
            .filter(|p| p.direction == direction)
            .map(DataPacket::size)
            .sum()
    }

    pub fn display_name(&self) -> String {
        format!("{}:{}", self.client_address, self.client_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(direction: Direction, bytes: &[u8]) -> DataPacket {
        DataPacket {
            timestamp: Utc::now(),
            direction,
            raw_data: bytes.to_vec(),
            data_type: DataType::Text,
            display_text: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    #[test]
    fn test_byte_totals() {
        let mut info = ConnectionInfo::new(Uuid::new_v4(), "10.0.0.1", 51000);
        info.packets.push(packet(Direction::ClientToTarget, b"PING"));
        info.packets.push(packet(Direction::TargetToClient, b"PONG!"));

        assert_eq!(info.total_bytes(), 9);
        assert_eq!(info.bytes_in(Direction::ClientToTarget), 4);
        assert_eq!(info.bytes_in(Direction::TargetToClient), 5);
        assert_eq!(info.display_name(), "10.0.0.1:51000");
    }

    #[test]
    fn test_from_peer() {
        let peer: SocketAddr = "[::1]:4242".parse().unwrap();
        let info = ConnectionInfo::from_peer(Uuid::new_v4(), peer);

        assert_eq!(info.client_address, "::1");
        assert_eq!(info.client_port, 4242);
        assert!(info.active);
        assert!(info.disconnected_at.is_none());
    }
}
