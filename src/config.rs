//! Tunable constants. The teacher inlines these as bare literals; this
//! crate promotes the ones an embedder might reasonably want to override
//! (idle timeout, tun read size) into a small config struct while
//! keeping wire-format constants (TTL, advertised window) as the fixed
//! values §6 requires.

use std::time::Duration;

/// A flow with no accepted segment in either direction for longer than
/// this is reaped by the sweep (§4.4.2).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum bytes read from the tun device (and from an outbound socket)
/// in a single pass, matching the original's `MAXPKT`.
pub const MAX_PACKET_SIZE: usize = 32_678;

/// Bound on the readiness wait per event-loop iteration (§4.5 step 2).
pub const SELECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub idle_timeout: Duration,
    pub max_packet_size: usize,
    /// Upper bound on how long the event loop can go between sweeps
    /// when no tun traffic or socket readiness arrives (§4.5 step 2).
    pub select_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT,
            max_packet_size: MAX_PACKET_SIZE,
            select_timeout: SELECT_TIMEOUT,
        }
    }
}
