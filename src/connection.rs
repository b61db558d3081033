//! The per-flow data model (§3): one `Connection` per observed client
//! 4-tuple, held in a `ConnectionTable` keyed by (client_addr,
//! client_port) — the server endpoint is not part of the key, since one
//! client flow maps to exactly one server endpoint.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::Instant;

use tokio::net::TcpStream;

/// State machine position (§4.4). `Closed` entries are destroyed on the
/// next sweep; no further segments are ever emitted for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    SynRecv,
    SynSent,
    Established,
    LastAck,
    Closed,
}

/// An unacknowledged payload segment already delivered to the tun.
/// Reserved for future retransmission; nothing in this engine reads
/// `pending_out` back out today (§3, §9).
#[derive(Debug, Clone)]
pub struct PendingSegment {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub client_addr: Ipv4Addr,
    pub client_port: u16,
}

pub struct Connection {
    pub last_activity: Instant,
    pub remote_seq: u32,
    pub local_seq: u32,
    pub client_addr: Ipv4Addr,
    pub client_port: u16,
    pub server_addr: Ipv4Addr,
    pub server_port: u16,
    pub state: ConnState,
    pub socket: Option<TcpStream>,
    pub local_port: u16,
    pub pending_out: VecDeque<PendingSegment>,
}

impl Connection {
    pub fn key(&self) -> ConnKey {
        ConnKey {
            client_addr: self.client_addr,
            client_port: self.client_port,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_idle(&self, now: Instant, idle_timeout: std::time::Duration) -> bool {
        now.duration_since(self.last_activity) > idle_timeout
    }
}

/// Owns every live `Connection`, keyed by client 4-tuple. Lives entirely
/// inside the single event-loop task (§5) — no locking.
#[derive(Default)]
pub struct ConnectionTable {
    entries: HashMap<ConnKey, Connection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_mut(&mut self, key: &ConnKey) -> Option<&mut Connection> {
        self.entries.get_mut(key)
    }

    pub fn insert(&mut self, conn: Connection) {
        self.entries.insert(conn.key(), conn);
    }

    pub fn remove(&mut self, key: &ConnKey) -> Option<Connection> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ConnKey, &mut Connection)> {
        self.entries.iter_mut()
    }

    pub fn values(&self) -> impl Iterator<Item = &Connection> {
        self.entries.values()
    }

    /// Ages out idle flows and reaps `Closed` entries (§4.4.2). Applying
    /// this twice with no time advance removes nothing the second time.
    pub fn sweep(&mut self, now: Instant, idle_timeout: std::time::Duration) -> Vec<ConnKey> {
        let mut reaped = Vec::new();
        self.entries.retain(|key, conn| {
            let dead = conn.state == ConnState::Closed || conn.is_idle(now, idle_timeout);
            if dead {
                reaped.push(*key);
            }
            !dead
        });
        reaped
    }
}
