use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::{Connection, ConnectionState, Transport, UidAllocator};
use crate::parser::PacketInfo;

/// Identifies a flow regardless of direction: the lower endpoint always comes
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    transport: Transport,
    a: SocketAddr,
    b: SocketAddr,
}

impl FlowKey {
    fn from_packet(packet: &PacketInfo) -> Self {
        let (a, b) = if packet.source <= packet.destination {
            (packet.source, packet.destination)
        } else {
            (packet.destination, packet.source)
        };
        FlowKey {
            transport: packet.transport,
            a,
            b,
        }
    }
}

// A TCP connection being accumulated.
struct Flow {
    uid: u64,
    initiator: SocketAddr,
    responder: SocketAddr,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    payload: Vec<u8>,
    truncated: bool,
    initiator_fin: bool,
    responder_fin: bool,
}

impl Flow {
    fn into_connection(self, state: ConnectionState) -> Connection {
        let mut conn = Connection::new(
            self.uid,
            self.first_seen,
            Transport::Tcp,
            self.initiator,
            self.responder,
            self.payload,
        );
        conn.duration = Some((self.last_seen - self.first_seen).to_std().unwrap_or_default());
        conn.state = Some(state);
        conn.payload_truncated = self.truncated;
        conn
    }
}

/// Groups packets into connection records.
///
/// UDP datagrams are complete records on their own. TCP payload is appended
/// in arrival order (no sequence reordering) until the flow is reset, closed
/// from both sides, or idle for longer than the timeout. At most
/// `max_flow_bytes` of payload are kept per flow; the rest is discarded and
/// the record is marked as truncated.
pub struct ConnectionTracker {
    flows: HashMap<FlowKey, Flow>,
    uids: UidAllocator,
    idle_timeout: Duration,
    max_flow_bytes: usize,
}

impl ConnectionTracker {
    pub fn new(idle_timeout: Duration, max_flow_bytes: usize) -> Self {
        ConnectionTracker {
            flows: HashMap::new(),
            uids: UidAllocator::new(),
            idle_timeout,
            max_flow_bytes,
        }
    }

    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Feeds one packet in and returns the record it completed, if any.
    pub fn observe(&mut self, timestamp: DateTime<Utc>, packet: PacketInfo) -> Option<Connection> {
        match packet.transport {
            Transport::Udp => Some(Connection::new(
                self.uids.next(),
                timestamp,
                Transport::Udp,
                packet.source,
                packet.destination,
                packet.payload,
            )),
            Transport::Tcp => self.observe_tcp(timestamp, packet),
        }
    }

    fn observe_tcp(&mut self, timestamp: DateTime<Utc>, packet: PacketInfo) -> Option<Connection> {
        let key = FlowKey::from_packet(&packet);

        if !self.flows.contains_key(&key) {
            // Stray ACKs and FINs after a flow was emitted would otherwise
            // open empty flows.
            if !packet.is_syn() && packet.payload.is_empty() {
                return None;
            }
            let uid = self.uids.next();
            self.flows.insert(
                key,
                Flow {
                    uid,
                    initiator: packet.source,
                    responder: packet.destination,
                    first_seen: timestamp,
                    last_seen: timestamp,
                    payload: Vec::new(),
                    truncated: false,
                    initiator_fin: false,
                    responder_fin: false,
                },
            );
        }

        let flow = self.flows.get_mut(&key)?;
        flow.last_seen = timestamp;
        let room = self.max_flow_bytes.saturating_sub(flow.payload.len());
        if packet.payload.len() > room {
            flow.truncated = true;
        }
        flow.payload.extend_from_slice(&packet.payload[..packet.payload.len().min(room)]);

        if packet.is_rst() {
            return self
                .flows
                .remove(&key)
                .map(|f| f.into_connection(ConnectionState::Reset));
        }
        if packet.is_fin() {
            if packet.source == flow.initiator {
                flow.initiator_fin = true;
            } else {
                flow.responder_fin = true;
            }
            if flow.initiator_fin && flow.responder_fin {
                return self
                    .flows
                    .remove(&key)
                    .map(|f| f.into_connection(ConnectionState::Closed));
            }
        }
        None
    }

    /// Emits every TCP flow that has been idle for longer than the timeout.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Connection> {
        let timeout = self.idle_timeout;
        let idle: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, f)| (now - f.last_seen).to_std().is_ok_and(|age| age > timeout))
            .map(|(k, _)| *k)
            .collect();

        idle.into_iter()
            .filter_map(|k| self.flows.remove(&k))
            .map(|f| f.into_connection(ConnectionState::TimedOut))
            .collect()
    }

    /// Emits all remaining flows, used at shutdown.
    pub fn drain(&mut self) -> Vec<Connection> {
        self.flows
            .drain()
            .map(|(_, f)| f.into_connection(ConnectionState::Open))
            .collect()
    }
}
