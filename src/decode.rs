//! Packet decoder (C3): validates a single tun-read buffer as a complete
//! L3 datagram, extracts the 5-tuple/flags, resolves the owning uid, and
//! emits exactly one attribution event before handing IPv4 TCP datagrams
//! onward to the flow engine.

use std::net::{IpAddr, Ipv6Addr};

use tracing::{debug, warn};

use crate::callbacks::{Callbacks, PacketEvent};
use crate::flags::TcpFlags;
use crate::headers::{HeaderDecodeError, Ipv4Header, TcpHeader, IPPROTO_TCP, IPPROTO_UDP};
use crate::uid::{self, Protocol};

const IPV6_HEADER_LEN: usize = 40;

/// What survives decoding of an IPv4 TCP datagram, ready for the flow
/// engine (C4).
#[derive(Debug)]
pub struct DecodedIpv4Tcp {
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
    pub payload: Vec<u8>,
}

/// Per-packet classification shared between the real decoder and its
/// unit tests; does not touch the uid resolver or the callbacks trait.
#[derive(Debug)]
enum Classified {
    Ipv4Tcp(DecodedIpv4Tcp),
    /// Decoded successfully but not IPv4 TCP (IPv4 UDP, any IPv6, or an
    /// IPv4 packet with a protocol this engine does not terminate).
    Other {
        version: u8,
        src: IpAddr,
        dst: IpAddr,
        sport: Option<u16>,
        dport: Option<u16>,
        protocol: u8,
        flags: TcpFlags,
    },
}

fn classify(bytes: &[u8]) -> Result<Classified, HeaderDecodeError> {
    if bytes.is_empty() {
        return Err(HeaderDecodeError::TooShortForIpv4(0));
    }
    let version = bytes[0] >> 4;

    match version {
        4 => {
            let ip = Ipv4Header::decode(bytes)?;
            let payload = &bytes[ip.header_len()..];

            if ip.protocol == IPPROTO_TCP {
                let tcp = TcpHeader::decode(payload)?;
                let data = payload[crate::headers::TCP_HEADER_LEN.min(payload.len())..].to_vec();
                return Ok(Classified::Ipv4Tcp(DecodedIpv4Tcp {
                    ip,
                    tcp,
                    payload: data,
                }));
            }

            let (sport, dport) = ports_for(ip.protocol, payload);
            Ok(Classified::Other {
                version,
                src: IpAddr::V4(ip.src),
                dst: IpAddr::V4(ip.dst),
                sport,
                dport,
                protocol: ip.protocol,
                flags: TcpFlags::UNINT,
            })
        }
        6 => {
            if bytes.len() < IPV6_HEADER_LEN {
                return Err(HeaderDecodeError::TooShortForIpv4(bytes.len()));
            }
            let protocol = bytes[6];
            let src = Ipv6Addr::from(<[u8; 16]>::try_from(&bytes[8..24]).unwrap());
            let dst = Ipv6Addr::from(<[u8; 16]>::try_from(&bytes[24..40]).unwrap());
            let payload = &bytes[IPV6_HEADER_LEN..];

            let (sport, dport, flags) = if protocol == IPPROTO_TCP {
                let tcp = TcpHeader::decode(payload).ok();
                match tcp {
                    Some(tcp) => (Some(tcp.src_port), Some(tcp.dst_port), tcp.flags),
                    None => (None, None, TcpFlags::UNINT),
                }
            } else {
                let (s, d) = ports_for(protocol, payload);
                (s, d, TcpFlags::UNINT)
            };

            Ok(Classified::Other {
                version,
                src: IpAddr::V6(src),
                dst: IpAddr::V6(dst),
                sport,
                dport,
                protocol,
                flags,
            })
        }
        other => Err(HeaderDecodeError::UnsupportedVersion(other)),
    }
}

fn ports_for(protocol: u8, payload: &[u8]) -> (Option<u16>, Option<u16>) {
    if protocol == IPPROTO_UDP && payload.len() >= 4 {
        let sport = u16::from_be_bytes([payload[0], payload[1]]);
        let dport = u16::from_be_bytes([payload[2], payload[3]]);
        (Some(sport), Some(dport))
    } else {
        (None, None)
    }
}

/// Decodes one tun-read buffer. Emits exactly one attribution event via
/// `callbacks.log_packet` regardless of outcome, then returns the
/// decoded IPv4 TCP datagram if (and only if) that's what the buffer
/// contained — everything else (malformed input, IPv6, UDP, other
/// protocols) returns `None` after having already logged.
pub async fn decode_packet(bytes: &[u8], callbacks: &dyn Callbacks) -> Option<DecodedIpv4Tcp> {
    let classified = match classify(bytes) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, len = bytes.len(), "dropping malformed packet");
            return None;
        }
    };

    match classified {
        Classified::Ipv4Tcp(decoded) => {
            let event = build_event(
                4,
                IpAddr::V4(decoded.ip.src),
                decoded.tcp.src_port,
                IpAddr::V4(decoded.ip.dst),
                decoded.tcp.dst_port,
                IPPROTO_TCP,
                decoded.tcp.flags,
            )
            .await;
            callbacks.log_packet(&event);
            debug!(
                src = %decoded.ip.src, sport = decoded.tcp.src_port,
                dst = %decoded.ip.dst, dport = decoded.tcp.dst_port,
                flags = %decoded.tcp.flags, "decoded ipv4 tcp"
            );
            Some(decoded)
        }
        Classified::Other {
            version,
            src,
            dst,
            sport,
            dport,
            protocol,
            flags,
        } => {
            let event = build_event(
                version,
                src,
                sport.unwrap_or(0),
                dst,
                dport.unwrap_or(0),
                protocol,
                flags,
            )
            .await;
            callbacks.log_packet(&event);
            None
        }
    }
}

async fn build_event(
    version: u8,
    src: IpAddr,
    sport: u16,
    dst: IpAddr,
    dport: u16,
    protocol: u8,
    flags: TcpFlags,
) -> PacketEvent {
    let uid = if protocol == IPPROTO_TCP || protocol == IPPROTO_UDP {
        tokio::time::sleep(uid::LOOKUP_SETTLE_DELAY).await;
        let proto = if protocol == IPPROTO_TCP {
            Protocol::Tcp
        } else {
            Protocol::Udp
        };
        uid::resolve_uid(proto, src, sport)
    } else {
        None
    };

    PacketEvent {
        version,
        src,
        sport,
        dst,
        dport,
        protocol,
        flags: flags.short(),
        uid,
        allowed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::NoopCallbacks;
    use crate::headers::encode_ipv4_tcp;
    use std::net::Ipv4Addr;

    #[test]
    fn rejects_buffer_shorter_than_minimum_ipv4_header() {
        let err = classify(&[0x45, 0x00]).unwrap_err();
        assert!(matches!(err, HeaderDecodeError::TooShortForIpv4(_)));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut buf = vec![0u8; 40];
        buf[0] = 7 << 4;
        let err = classify(&buf).unwrap_err();
        assert!(matches!(err, HeaderDecodeError::UnsupportedVersion(7)));
    }

    #[test]
    fn length_mismatch_never_reaches_classification_as_tcp() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut packet = encode_ipv4_tcp(src, dst, 1, 2, 0, 0, TcpFlags::SYN, b"");
        packet.push(0xAA); // buffer now longer than tot_len claims
        let err = classify(&packet).unwrap_err();
        assert!(matches!(err, HeaderDecodeError::LengthMismatch { .. }));
    }

    #[test]
    fn bad_checksum_is_dropped_before_reaching_tcp_state() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut packet = encode_ipv4_tcp(src, dst, 1, 2, 0, 0, TcpFlags::SYN, b"");
        packet[10] ^= 0xFF;
        packet[11] ^= 0xFF;
        let err = classify(&packet).unwrap_err();
        assert!(matches!(err, HeaderDecodeError::BadChecksum));
    }

    #[test]
    fn valid_ipv4_tcp_syn_classifies_for_c4() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let packet = encode_ipv4_tcp(src, dst, 1, 2, 1000, 0, TcpFlags::SYN, b"");
        let classified = classify(&packet).unwrap();
        match classified {
            Classified::Ipv4Tcp(decoded) => {
                assert!(decoded.tcp.flags.contains(TcpFlags::SYN));
                assert!(decoded.payload.is_empty());
            }
            _ => panic!("expected Ipv4Tcp"),
        }
    }

    #[tokio::test]
    async fn every_decoded_packet_emits_exactly_one_event() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Counter(Arc<AtomicUsize>);
        impl Callbacks for Counter {
            fn protect(&self, _s: &socket2::Socket) -> bool {
                true
            }
            fn log_packet(&self, _event: &PacketEvent) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let cb = Counter(count.clone());

        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let good = encode_ipv4_tcp(src, dst, 1, 2, 0, 0, TcpFlags::SYN, b"");
        decode_packet(&good, &cb).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let garbage = vec![0u8; 4];
        decode_packet(&garbage, &NoopCallbacks).await;
        assert_eq!(count.load(Ordering::SeqCst), 1); // NoopCallbacks used, counter untouched

        decode_packet(&good, &cb).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
