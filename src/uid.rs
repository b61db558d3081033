//! Source-attribution lookup: map a (protocol, ip version, local address,
//! local port) tuple to the owning user id by scanning the kernel's
//! per-protocol connection tables (`/proc/net/{tcp,tcp6,udp,udp6}`).

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tracing::warn;

/// Small delay before the first lookup for a freshly observed flow, to
/// let the kernel publish the row in the proc table.
pub const LOOKUP_SETTLE_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn proc_file(self, ipv6: bool) -> &'static str {
        match (self, ipv6) {
            (Protocol::Tcp, false) => "/proc/net/tcp",
            (Protocol::Tcp, true) => "/proc/net/tcp6",
            (Protocol::Udp, false) => "/proc/net/udp",
            (Protocol::Udp, true) => "/proc/net/udp6",
        }
    }
}

/// Resolves the uid owning `(protocol, addr, port)`. Returns `None`
/// ("unknown") if the table is missing, unreadable, malformed, or has no
/// matching row. A v4 query that misses is retried against the v6 table
/// using the IPv4-mapped `::ffff:a.b.c.d` form, to cover dual-stack
/// sockets bound on the v6 wildcard.
pub fn resolve_uid(protocol: Protocol, addr: IpAddr, port: u16) -> Option<u32> {
    match addr {
        IpAddr::V4(v4) => {
            if let Some(uid) = scan_table(protocol, addr, port) {
                return Some(uid);
            }
            let mapped = v4.to_ipv6_mapped();
            scan_table(protocol, IpAddr::V6(mapped), port)
        }
        IpAddr::V6(_) => scan_table(protocol, addr, port),
    }
}

fn scan_table(protocol: Protocol, addr: IpAddr, port: u16) -> Option<u32> {
    let ipv6 = matches!(addr, IpAddr::V6(_));
    let path = protocol.proc_file(ipv6);

    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path, error = %e, "could not read connection table");
            return None;
        }
    };

    for line in contents.lines().skip(1) {
        if let Some((row_addr, row_port, uid)) = parse_row(line, ipv6) {
            if row_port == port && row_addr == addr {
                return Some(uid);
            }
        }
    }

    None
}

fn parse_row(line: &str, ipv6: bool) -> Option<(IpAddr, u16, u32)> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let local = fields.next()?;
    let (addr_hex, port_hex) = local.split_once(':')?;
    let uid_field = fields.clone().nth(5)?; // uid is column 8 overall (1-indexed), 6 past local addr

    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let uid: u32 = uid_field.parse().ok()?;

    let addr = if ipv6 {
        parse_hex_addr_v6(addr_hex)?
    } else {
        parse_hex_addr_v4(addr_hex)?
    };

    Some((addr, port, uid))
}

/// `/proc/net/tcp`'s address field is the 4 address bytes in *host* byte
/// order hex, i.e. little-endian on every architecture Linux runs this
/// on for IPv4.
fn parse_hex_addr_v4(hex: &str) -> Option<IpAddr> {
    if hex.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(hex, 16).ok()?;
    Some(IpAddr::V4(Ipv4Addr::from(raw.to_le_bytes())))
}

/// `/proc/net/tcp6`'s address field is four 32-bit host-order words
/// concatenated, each representing 4 bytes of the address in that
/// word's native (little-endian) layout.
fn parse_hex_addr_v6(hex: &str) -> Option<IpAddr> {
    if hex.len() != 32 {
        return None;
    }
    let mut octets = [0u8; 16];
    for (word_idx, chunk) in hex.as_bytes().chunks(8).enumerate() {
        let word = u32::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
        octets[word_idx * 4..word_idx * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    Some(IpAddr::V6(Ipv6Addr::from(octets)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_row() {
        // 0100007F = 127.0.0.1 little-endian hex, port 1F90 = 8080.
        let line = "   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0";
        let (addr, port, uid) = parse_row(line, false).unwrap();
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(port, 8080);
        assert_eq!(uid, 1000);
    }

    #[test]
    fn no_matching_row_yields_none() {
        // Port 1 is reserved and essentially never bound locally in a test
        // sandbox, so this should miss even if /proc/net/tcp exists.
        assert_eq!(
            scan_table(Protocol::Tcp, "127.0.0.1".parse().unwrap(), 1),
            None
        );
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        assert_eq!(parse_row("garbage line with no colons", false), None);
    }

    #[test]
    fn v4_mapped_v6_form_round_trips_through_parse() {
        let mapped = Ipv4Addr::new(192, 168, 1, 5).to_ipv6_mapped();
        assert!(mapped.to_string().contains("ffff"));
    }
}
