use bitflags::bitflags;
use std::fmt;

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const UNINT = 0x00;
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = vec![];

        if self.contains(TcpFlags::FIN) {
            flags.push("FIN");
        }
        if self.contains(TcpFlags::SYN) {
            flags.push("SYN");
        }
        if self.contains(TcpFlags::RST) {
            flags.push("RST");
        }
        if self.contains(TcpFlags::PSH) {
            flags.push("PSH");
        }
        if self.contains(TcpFlags::ACK) {
            flags.push("ACK");
        }
        if self.contains(TcpFlags::URG) {
            flags.push("URG");
        }
        if self.contains(TcpFlags::ECE) {
            flags.push("ECE");
        }
        if self.contains(TcpFlags::CWR) {
            flags.push("CWR");
        }

        if flags.is_empty() {
            write!(f, "UNINT {}", self.bits())
        } else {
            write!(f, "{} {}", flags.join(" | "), self.bits())
        }
    }
}

impl TcpFlags {
    /// One-letter-per-flag rendering used in the packet-attribution log
    /// line (`S`, `A`, `P`, `F`, `R`, in that order), mirroring the
    /// original engine's compact flag string.
    pub fn short(&self) -> String {
        let mut out = String::with_capacity(5);
        if self.contains(TcpFlags::SYN) {
            out.push('S');
        }
        if self.contains(TcpFlags::ACK) {
            out.push('A');
        }
        if self.contains(TcpFlags::PSH) {
            out.push('P');
        }
        if self.contains(TcpFlags::FIN) {
            out.push('F');
        }
        if self.contains(TcpFlags::RST) {
            out.push('R');
        }
        out
    }
}
