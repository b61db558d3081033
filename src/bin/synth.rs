//! Builds a synthesized SYN+ACK the way the engine would emit it on
//! connect completion, and hex-dumps it. Standalone demonstration of
//! the wire format produced by `headers::encode_ipv4_tcp`; does not
//! open a tun device or run the event loop.

use std::net::Ipv4Addr;

use tracing::info;
use tunward::flags::TcpFlags;
use tunward::headers::encode_ipv4_tcp;

fn setup_logging() {
    tracing_subscriber::fmt::init();
}

fn main() {
    setup_logging();

    let server = Ipv4Addr::new(93, 184, 216, 34);
    let client = Ipv4Addr::new(10, 0, 0, 5);
    let packet = encode_ipv4_tcp(
        server,
        client,
        80,
        4444,
        123_456,
        1001,
        TcpFlags::SYN | TcpFlags::ACK,
        b"",
    );

    info!(len = packet.len(), "synthesized SYN+ACK");
    for chunk in packet.chunks(16) {
        let line: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        println!("{}", line.join(" "));
    }
}
