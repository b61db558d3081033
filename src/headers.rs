//! Encode/decode of the canonical (no-options) 20-byte IPv4 header and
//! 20-byte TCP header, and synthesis of a complete IPv4+TCP datagram.

use std::net::Ipv4Addr;

use crate::checksum::{ip_checksum, tcp_checksum};
use crate::flags::TcpFlags;

/// TTL stamped onto every packet this engine synthesizes toward the tun.
pub const SYNTH_TTL: u8 = 64;
/// Advertised window on every synthesized segment (no flow-control
/// feedback from the outbound socket is modeled).
pub const SYNTH_WINDOW: u16 = 2048;

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

#[derive(Debug, thiserror::Error)]
pub enum HeaderDecodeError {
    #[error("buffer too short for an IPv4 header: {0} bytes")]
    TooShortForIpv4(usize),
    #[error("buffer too short for a TCP header: {0} bytes")]
    TooShortForTcp(usize),
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),
    #[error("tot_len {tot_len} disagrees with buffer length {buffer_len}")]
    LengthMismatch { tot_len: u16, buffer_len: usize },
    #[error("bad IPv4 header checksum")]
    BadChecksum,
}

/// A decoded (or about-to-be-encoded) IPv4 header. No options are ever
/// emitted; options present on a decoded header are skipped over via
/// `ihl` but not retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub ihl: u8,
    pub total_length: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Header length in bytes implied by `ihl`, including any options.
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    /// Parses the leading IPv4 header out of `bytes`. Rejects a version
    /// other than 4 (callers dispatch IPv6 separately), a `tot_len` that
    /// disagrees with the buffer it arrived in, and a bad header
    /// checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderDecodeError> {
        if bytes.len() < IPV4_MIN_HEADER_LEN {
            return Err(HeaderDecodeError::TooShortForIpv4(bytes.len()));
        }

        let version = bytes[0] >> 4;
        if version != 4 {
            return Err(HeaderDecodeError::UnsupportedVersion(version));
        }

        let ihl = bytes[0] & 0x0F;
        let total_length = u16::from_be_bytes([bytes[2], bytes[3]]);
        if total_length as usize != bytes.len() {
            return Err(HeaderDecodeError::LengthMismatch {
                tot_len: total_length,
                buffer_len: bytes.len(),
            });
        }

        let header_len = ihl as usize * 4;
        if bytes.len() < header_len.max(IPV4_MIN_HEADER_LEN) {
            return Err(HeaderDecodeError::TooShortForIpv4(bytes.len()));
        }

        if ip_checksum(&bytes[..header_len]) != 0 {
            return Err(HeaderDecodeError::BadChecksum);
        }

        Ok(Self {
            ihl,
            total_length,
            ttl: bytes[8],
            protocol: bytes[9],
            checksum: u16::from_be_bytes([bytes[10], bytes[11]]),
            src: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
            dst: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
        })
    }

    /// Encodes a canonical, option-free 20-byte IPv4 header (`ihl = 5`)
    /// with a freshly computed checksum.
    pub fn encode(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, total_length: u16) -> [u8; 20] {
        let mut buf = [0u8; IPV4_MIN_HEADER_LEN];
        buf[0] = (4 << 4) | 5; // version 4, ihl 5
        buf[2..4].copy_from_slice(&total_length.to_be_bytes());
        buf[8] = SYNTH_TTL;
        buf[9] = protocol;
        buf[12..16].copy_from_slice(&src.octets());
        buf[16..20].copy_from_slice(&dst.octets());

        let csum = ip_checksum(&buf);
        buf[10..12].copy_from_slice(&csum.to_be_bytes());
        buf
    }
}

/// A decoded (or about-to-be-encoded) TCP header. Always 20 bytes;
/// incoming options are not represented (the data offset field on
/// decode is the caller's responsibility if a larger header is ever
/// admitted, but this engine's decoder assumes none, matching the
/// original's handling of client segments).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
}

impl TcpHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderDecodeError> {
        if bytes.len() < TCP_HEADER_LEN {
            return Err(HeaderDecodeError::TooShortForTcp(bytes.len()));
        }

        Ok(Self {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            seq: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ack: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            flags: TcpFlags::from_bits_truncate(bytes[13]),
            window: u16::from_be_bytes([bytes[14], bytes[15]]),
            checksum: u16::from_be_bytes([bytes[16], bytes[17]]),
        })
    }

    /// Encodes a canonical 20-byte TCP header (`data offset = 5`, no
    /// options, `urgent ptr = 0`) with the checksum field zeroed — the
    /// checksum itself is filled in by `encode_ipv4_tcp`, since it needs
    /// the enclosing IP addresses.
    fn encode_unchecked(&self) -> [u8; TCP_HEADER_LEN] {
        let mut buf = [0u8; TCP_HEADER_LEN];
        buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ack.to_be_bytes());
        buf[12] = 5 << 4; // data offset 5, reserved 0
        buf[13] = self.flags.bits();
        buf[14..16].copy_from_slice(&self.window.to_be_bytes());
        // buf[16..18] (checksum) and buf[18..20] (urgent ptr) stay zero.
        buf
    }
}

/// Synthesizes a complete IPv4+TCP datagram (headers plus `payload`)
/// with both checksums computed, as the engine sends it toward the tun.
#[allow(clippy::too_many_arguments)]
pub fn encode_ipv4_tcp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let tcp = TcpHeader {
        src_port,
        dst_port,
        seq,
        ack,
        flags,
        window: SYNTH_WINDOW,
        checksum: 0,
    };
    let mut tcp_bytes = tcp.encode_unchecked();
    let tcp_csum = tcp_checksum(src, dst, &tcp_bytes, payload);
    tcp_bytes[16..18].copy_from_slice(&tcp_csum.to_be_bytes());

    let total_len = (IPV4_MIN_HEADER_LEN + TCP_HEADER_LEN + payload.len()) as u16;
    let ip_bytes = Ipv4Header::encode(src, dst, IPPROTO_TCP, total_len);

    let mut packet = Vec::with_capacity(total_len as usize);
    packet.extend_from_slice(&ip_bytes);
    packet.extend_from_slice(&tcp_bytes);
    packet.extend_from_slice(payload);
    packet
}

/// Decodes a complete IPv4+TCP datagram, returning the two headers and
/// the byte range of the payload within `bytes`.
pub fn decode_ipv4_tcp(
    bytes: &[u8],
) -> Result<(Ipv4Header, TcpHeader, std::ops::Range<usize>), HeaderDecodeError> {
    let ip = Ipv4Header::decode(bytes)?;
    let header_len = ip.header_len();
    let tcp_start = header_len;
    let tcp_end = tcp_start + TCP_HEADER_LEN;
    if bytes.len() < tcp_end {
        return Err(HeaderDecodeError::TooShortForTcp(
            bytes.len().saturating_sub(tcp_start),
        ));
    }
    let tcp = TcpHeader::decode(&bytes[tcp_start..])?;
    Ok((ip, tcp, tcp_end..bytes.len()))
}
