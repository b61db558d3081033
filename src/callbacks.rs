//! Host capability injection (§9 "Host-runtime callbacks", §6 "External
//! interfaces"). The engine knows nothing about the embedder's object
//! system; it only ever calls through this trait.

use std::net::IpAddr;

use socket2::Socket;

/// One attribution event, emitted exactly once per decoded packet
/// regardless of outcome (§4.3 step 6, §7 "User-visible behavior").
#[derive(Debug, Clone)]
pub struct PacketEvent {
    pub version: u8,
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
    pub protocol: u8,
    pub flags: String,
    pub uid: Option<u32>,
    pub allowed: bool,
}

/// Host-supplied capabilities the engine cannot provide for itself.
pub trait Callbacks: Send + Sync {
    /// Must be invoked after creating each outbound socket and before
    /// `connect`, so the host routing layer exempts it from being routed
    /// back into the tun. A `false` return or a panic unwound by the
    /// caller is non-fatal — the connection proceeds regardless.
    fn protect(&self, socket: &Socket) -> bool;

    /// Emitted once per decoded packet by C3.
    fn log_packet(&self, event: &PacketEvent);
}

/// A `Callbacks` impl that protects nothing and drops every event,
/// useful for tests and for embedders that run in a network namespace
/// where routing loopback is not a concern.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl Callbacks for NoopCallbacks {
    fn protect(&self, _socket: &Socket) -> bool {
        true
    }

    fn log_packet(&self, _event: &PacketEvent) {}
}
