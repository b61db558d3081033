//! Error taxonomy. Per §7: nothing from the checksum/header codec or the
//! uid resolver ever propagates; per-flow failures close that flow only;
//! the event loop alone decides what is engine-fatal.

use std::io;

use thiserror::Error;

/// Errors surfaced by the control surface (`init`/`start`/`stop`/`reload`).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("engine is not running")]
    NotRunning,
    #[error("failed to read the tun device: {0}")]
    TunRead(#[source] io::Error),
    #[error("failed to write to the tun device: {0}")]
    TunWrite(#[source] io::Error),
}

/// A per-flow failure. Never leaves the engine; it is always folded into
/// a transition of the owning `Connection` to `CLOSED`.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("outbound connect failed: {0}")]
    ConnectFailed(#[source] io::Error),
    #[error("outbound socket error: {0}")]
    SocketError(#[source] io::Error),
    #[error("tun write failed: {0}")]
    TunWriteFailed(#[source] io::Error),
    #[error("server closed the connection")]
    ServerClosed,
    #[error("reset by client")]
    ResetByClient,
    #[error("idle timeout exceeded")]
    IdleTimeout,
}
