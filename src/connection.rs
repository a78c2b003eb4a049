use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::analyzer::AnalyzerResult;

/// Transport protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Transport {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
        }
    }
}

/// How a connection ended, as far as the sensor could tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Both sides sent FIN.
    Closed,
    /// Either side sent RST.
    Reset,
    /// No packets for longer than the flow timeout.
    TimedOut,
    /// Still open when the sensor shut down.
    Open,
}

/// Hands out connection UIDs. Owned by whoever builds records, never global,
/// so independent sensors in one process do not share a sequence.
#[derive(Debug)]
pub struct UidAllocator {
    next: AtomicU64,
}

impl UidAllocator {
    pub fn new() -> Self {
        UidAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for UidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// One network connection plus everything analyzers found out about it.
#[derive(Debug, Serialize)]
pub struct Connection {
    pub timestamp: DateTime<Utc>,
    uid: u64,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub destination_ip: IpAddr,
    pub destination_port: u16,
    pub transport_type: Transport,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_duration"
    )]
    pub duration: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ConnectionState>,
    /// Set when the flow carried more payload than the tracker keeps.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub payload_truncated: bool,
    #[serde(skip)]
    payload: Vec<u8>,
    pub analyzers: HashMap<String, AnalyzerResult>,
}

impl Connection {
    /// Builds a record, taking ownership of the captured payload.
    pub fn new(
        uid: u64,
        timestamp: DateTime<Utc>,
        transport_type: Transport,
        source: SocketAddr,
        destination: SocketAddr,
        payload: Vec<u8>,
    ) -> Self {
        Connection {
            timestamp,
            uid,
            source_ip: source.ip(),
            source_port: source.port(),
            destination_ip: destination.ip(),
            destination_port: destination.port(),
            transport_type,
            duration: None,
            state: None,
            payload_truncated: false,
            payload,
            analyzers: HashMap::new(),
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.source_ip, self.source_port)
    }

    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.destination_ip, self.destination_port)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    /// Stores a result under its own key, replacing whatever was there.
    pub fn record_result(&mut self, result: AnalyzerResult) {
        self.analyzers.insert(result.key().to_string(), result);
    }
}

fn serialize_duration<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(d) => serializer.serialize_f64(d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}
