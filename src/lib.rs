//! `tunward`: a user-space TCP-terminating firewall for tun-based
//! traffic. Reads whole L3 datagrams off a host-supplied tun
//! descriptor, terminates IPv4 TCP on the tun side, and relays payload
//! through ordinary outbound sockets while attributing every decoded
//! packet to its owning uid.

pub mod callbacks;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod decode;
pub mod engine;
pub mod error;
pub mod flags;
pub mod headers;
pub mod tcp_engine;
pub mod uid;

pub use callbacks::{Callbacks, NoopCallbacks, PacketEvent};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, FlowError};
