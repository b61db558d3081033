//! The event loop (C5): owns the tun descriptor and every outbound
//! socket, drives a readiness multiplexer, and dispatches tun reads to
//! the decoder and socket readiness to the flow engine.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::callbacks::Callbacks;
use crate::config::EngineConfig;
use crate::connection::{ConnKey, ConnState, ConnectionTable};
use crate::decode::decode_packet;
use crate::error::EngineError;
use crate::tcp_engine;

/// A bare file descriptor that yields and accepts whole L3 datagrams.
/// Never closes `fd`; ownership stays with whoever opened the tun (or,
/// in tests, whichever half of a socket pair stands in for it).
struct TunDevice {
    fd: RawFd,
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[derive(Debug, Clone, Copy)]
enum Readiness {
    Writable,
    Readable,
}

/// Controls the lifetime of one running event-loop task (§6 control
/// surface, §10.4).
#[derive(Default)]
pub struct Engine {
    handle: Option<RunningHandle>,
}

struct RunningHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// No-op per §6; present so embedders have a place to hang one-time
    /// setup without it being confused with `start`.
    pub fn init(&self) {
        debug!("engine initialized");
    }

    /// Spawns the event loop exactly once. Re-entry while already
    /// running is refused (§6, §10.4).
    pub fn start(
        &mut self,
        tun_fd: RawFd,
        callbacks: Arc<dyn Callbacks>,
        config: EngineConfig,
    ) -> Result<(), EngineError> {
        if self.handle.is_some() {
            warn!("start called while the engine is already running");
            return Err(EngineError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = run_loop(tun_fd, callbacks, config, loop_cancel).await {
                error!(error = %e, "event loop exited with an error");
            }
        });

        self.handle = Some(RunningHandle { cancel, join });
        Ok(())
    }

    /// Delivers the stop signal and joins the loop task (§6, §10.4).
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        let Some(handle) = self.handle.take() else {
            warn!("stop called while the engine is not running");
            return Err(EngineError::NotRunning);
        };
        handle.cancel.cancel();
        let _ = handle.join.await;
        Ok(())
    }

    /// `stop()` followed by `start()`; seamless handover is not
    /// guaranteed (§4.5).
    pub async fn reload(
        &mut self,
        tun_fd: RawFd,
        callbacks: Arc<dyn Callbacks>,
        config: EngineConfig,
    ) -> Result<(), EngineError> {
        self.stop().await?;
        self.start(tun_fd, callbacks, config)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

async fn read_tun(tun: &AsyncFd<TunDevice>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = tun.readable().await?;
        let result = guard.try_io(|inner| {
            let fd = inner.get_ref().as_raw_fd();
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        });
        match result {
            Ok(r) => return r,
            Err(_would_block) => continue,
        }
    }
}

async fn write_tun(tun: &AsyncFd<TunDevice>, bytes: &[u8]) -> io::Result<()> {
    loop {
        let mut guard = tun.writable().await?;
        let result = guard.try_io(|inner| {
            let fd = inner.get_ref().as_raw_fd();
            let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        });
        match result {
            Ok(r) => return r,
            Err(_would_block) => continue,
        }
    }
}

/// Waits for the next outbound socket to reach the readiness its flow
/// is currently waiting on (writable during `SynRecv`, readable during
/// `Established`). Never resolves if no flow is waiting on anything,
/// leaving the tun-read and cancellation branches of the surrounding
/// `select!` free to fire.
async fn wait_for_readiness(table: &ConnectionTable) -> (ConnKey, Readiness) {
    let mut pending: FuturesUnordered<BoxFuture<'_, (ConnKey, Readiness)>> = FuturesUnordered::new();

    for conn in table.values() {
        let key = conn.key();
        let Some(socket) = conn.socket.as_ref() else {
            continue;
        };
        match conn.state {
            ConnState::SynRecv => pending.push(
                async move {
                    let _ = socket.writable().await;
                    (key, Readiness::Writable)
                }
                .boxed(),
            ),
            ConnState::Established => pending.push(
                async move {
                    let _ = socket.readable().await;
                    (key, Readiness::Readable)
                }
                .boxed(),
            ),
            ConnState::SynSent | ConnState::LastAck | ConnState::Closed => {}
        }
    }

    match pending.next().await {
        Some(result) => result,
        None => std::future::pending().await,
    }
}

async fn handle_readiness(
    table: &mut ConnectionTable,
    key: ConnKey,
    readiness: Readiness,
    tun: &AsyncFd<TunDevice>,
    max_len: usize,
) {
    let Some(conn) = table.get_mut(&key) else {
        return;
    };

    tcp_engine::check_socket_error(conn);
    if conn.state == ConnState::Closed {
        return;
    }

    match readiness {
        Readiness::Writable if conn.state == ConnState::SynRecv => {
            let segment = tcp_engine::on_connect_complete(conn);
            if let Err(e) = write_tun(tun, &segment).await {
                warn!(error = %e, "failed to write SYN+ACK to tun");
                tcp_engine::on_synack_write_failed(conn);
            }
        }
        Readiness::Readable if conn.state == ConnState::Established => {
            if let Some(segment) = tcp_engine::on_socket_readable(conn, max_len).await {
                if let Err(e) = write_tun(tun, &segment).await {
                    warn!(error = %e, "failed to write data ack to tun");
                }
            }
        }
        _ => {}
    }
}

async fn run_loop(
    tun_fd: RawFd,
    callbacks: Arc<dyn Callbacks>,
    config: EngineConfig,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let tun = AsyncFd::new(TunDevice { fd: tun_fd }).map_err(EngineError::TunRead)?;
    let mut table = ConnectionTable::new();
    let mut buf = vec![0u8; config.max_packet_size];

    loop {
        let now = Instant::now();
        for key in table.sweep(now, config.idle_timeout) {
            debug!(client = %key.client_addr, port = key.client_port, "reaped connection");
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("stop signal received, exiting event loop");
                return Ok(());
            }

            result = read_tun(&tun, &mut buf) => {
                match result {
                    Ok(0) => {
                        error!("tun read returned zero, exiting");
                        return Err(EngineError::TunRead(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "tun closed",
                        )));
                    }
                    Ok(n) => {
                        if let Some(decoded) = decode_packet(&buf[..n], callbacks.as_ref()).await {
                            let segments = tcp_engine::handle_tun_segment(
                                &mut table,
                                decoded,
                                callbacks.as_ref(),
                                Instant::now(),
                            )
                            .await;
                            for segment in segments {
                                if let Err(e) = write_tun(&tun, &segment).await {
                                    warn!(error = %e, "tun write failed");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "tun read error, exiting");
                        return Err(EngineError::TunRead(e));
                    }
                }
            }

            (key, readiness) = wait_for_readiness(&table) => {
                handle_readiness(&mut table, key, readiness, &tun, config.max_packet_size).await;
            }

            _ = tokio::time::sleep(config.select_timeout) => {
                debug!("select timeout elapsed, re-running sweep");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::NoopCallbacks;
    use crate::flags::TcpFlags;
    use crate::headers::{decode_ipv4_tcp, encode_ipv4_tcp};
    use std::net::Ipv4Addr;
    use std::os::unix::net::UnixDatagram;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn stop_without_start_is_not_running_error() {
        let mut engine = Engine::new();
        let err = engine.stop().await.unwrap_err();
        assert!(matches!(err, EngineError::NotRunning));
    }

    #[tokio::test]
    async fn start_twice_is_already_running_error() {
        let (host_side, _tun_side) = UnixDatagram::pair().unwrap();
        host_side.set_nonblocking(true).unwrap();

        let mut engine = Engine::new();
        engine
            .start(
                host_side.as_raw_fd(),
                Arc::new(NoopCallbacks),
                EngineConfig::default(),
            )
            .unwrap();

        let err = engine
            .start(
                host_side.as_raw_fd(),
                Arc::new(NoopCallbacks),
                EngineConfig::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning));

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn engine_completes_handshake_over_a_socketpair_tun() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let (tun_side, harness_side) = UnixDatagram::pair().unwrap();
        tun_side.set_nonblocking(true).unwrap();
        harness_side.set_nonblocking(true).unwrap();

        let mut engine = Engine::new();
        engine
            .start(
                tun_side.as_raw_fd(),
                Arc::new(NoopCallbacks),
                EngineConfig::default(),
            )
            .unwrap();

        let client_ip = Ipv4Addr::new(10, 0, 0, 9);
        let server_ip = Ipv4Addr::new(127, 0, 0, 1);
        let syn = encode_ipv4_tcp(client_ip, server_ip, 4000, server_port, 1000, 0, TcpFlags::SYN, b"");
        harness_side.send(&syn).unwrap();

        let syn_ack = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let mut buf = [0u8; 1500];
                match harness_side.recv(&mut buf) {
                    Ok(n) => return buf[..n].to_vec(),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Err(e) => panic!("unexpected recv error: {e}"),
                }
            }
        })
        .await
        .expect("synack should arrive within timeout");

        let (_, tcp, _) = decode_ipv4_tcp(&syn_ack).unwrap();
        assert!(tcp.flags.contains(TcpFlags::SYN | TcpFlags::ACK));
        assert_eq!(tcp.ack, 1001);

        engine.stop().await.unwrap();
    }
}
