//! IPv4 + TCP header construction for half-open probes
//!
//! Frames are exactly a 20-byte IPv4 header followed by a 20-byte TCP header:
//! no IP options, no TCP options, no payload. The SYN carries an unpredictable
//! sequence number; the optional RST continues the same exchange so the peer
//! drops its half-open entry.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::BitOr;

use crate::probe::checksum::{checksum, fold, sum_words};

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;

/// IPv4 header size without options
pub const IPV4_HEADER_SIZE: usize = 20;

/// TCP header size without options
pub const TCP_HEADER_SIZE: usize = 20;

/// Full probe frame size (IPv4 + TCP, no payload)
pub const FRAME_SIZE: usize = IPV4_HEADER_SIZE + TCP_HEADER_SIZE;

/// TTL written into outgoing IPv4 headers
pub const DEFAULT_TTL: u8 = 64;

/// Advertised receive window (29200, a common Linux initial window)
pub const WINDOW_SIZE: u16 = 0x7210;

/// IPv4 "don't fragment" bit in the flags/fragment-offset word
const IPV4_FLAG_DF: u16 = 0x4000;

/// TCP control flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);

    pub const fn from_bits(bits: u8) -> Self {
        TcpFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if every bit in `other` is also set in `self`
    pub const fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::PSH, "PSH"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// Build the 20-byte IPv4 header for a probe frame
///
/// Total length is fixed at 40 (header + bare TCP header). The checksum is
/// computed with the checksum field zeroed, then written in place.
pub fn build_ipv4_header(src: Ipv4Addr, dst: Ipv4Addr) -> [u8; IPV4_HEADER_SIZE] {
    let mut header = [0u8; IPV4_HEADER_SIZE];

    // Version (4) + IHL (5 words)
    header[0] = 0x45;
    // DSCP/ECN
    header[1] = 0x00;
    header[2..4].copy_from_slice(&(FRAME_SIZE as u16).to_be_bytes());
    // Identification left 0, the kernel fills it in for IP_HDRINCL frames
    header[4..6].copy_from_slice(&0u16.to_be_bytes());
    header[6..8].copy_from_slice(&IPV4_FLAG_DF.to_be_bytes());
    header[8] = DEFAULT_TTL;
    header[9] = IPPROTO_TCP;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());

    let sum = checksum(&header);
    header[10..12].copy_from_slice(&sum.to_be_bytes());

    header
}

/// Build a 20-byte TCP header (data offset 5, no options)
///
/// `ack` is `None` for a SYN (acknowledgment number 0) and the peer's
/// acknowledgment number for a teardown RST.
pub fn build_tcp_header(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    flags: TcpFlags,
    ack: Option<u32>,
) -> [u8; TCP_HEADER_SIZE] {
    let mut header = [0u8; TCP_HEADER_SIZE];

    header[0..2].copy_from_slice(&src.port().to_be_bytes());
    header[2..4].copy_from_slice(&dst.port().to_be_bytes());
    header[4..8].copy_from_slice(&seq.to_be_bytes());
    header[8..12].copy_from_slice(&ack.unwrap_or(0).to_be_bytes());

    // Data offset = 5 (20 bytes / 4) in the high nibble, reserved bits zero
    header[12] = 0x50;
    header[13] = flags.bits();
    header[14..16].copy_from_slice(&WINDOW_SIZE.to_be_bytes());
    // Checksum (16..18) computed below, urgent pointer (18..20) stays 0

    let sum = tcp_checksum(&header, *src.ip(), *dst.ip());
    header[16..18].copy_from_slice(&sum.to_be_bytes());

    header
}

/// TCP checksum over the IPv4 pseudo-header followed by the segment
///
/// Pseudo-header: source IP (4), destination IP (4), zero (1), protocol (1),
/// TCP length (2). The segment's checksum field must be zero on entry.
pub fn tcp_checksum(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
    !fold(sum_words(segment, sum_words(&pseudo_header(src, dst, segment.len()), 0)))
}

/// The 12-byte IPv4 pseudo-header used for TCP checksums
pub fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, segment_len: usize) -> [u8; 12] {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[8] = 0;
    pseudo[9] = IPPROTO_TCP;
    pseudo[10..12].copy_from_slice(&(segment_len as u16).to_be_bytes());
    pseudo
}

/// Full IPv4 + TCP SYN frame for the given 4-tuple
pub fn build_syn_frame(src: SocketAddrV4, dst: SocketAddrV4, seq: u32) -> [u8; FRAME_SIZE] {
    assemble(
        build_ipv4_header(*src.ip(), *dst.ip()),
        build_tcp_header(src, dst, seq, TcpFlags::SYN, None),
    )
}

/// Full IPv4 + TCP RST frame tearing down a half-open exchange
///
/// `seq` is the sequence number of the original SYN and `peer_ack` the
/// acknowledgment number taken from the matched SYN-ACK.
pub fn build_rst_frame(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    peer_ack: u32,
) -> [u8; FRAME_SIZE] {
    assemble(
        build_ipv4_header(*src.ip(), *dst.ip()),
        build_tcp_header(src, dst, seq, TcpFlags::RST, Some(peer_ack)),
    )
}

fn assemble(ip: [u8; IPV4_HEADER_SIZE], tcp: [u8; TCP_HEADER_SIZE]) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    frame[..IPV4_HEADER_SIZE].copy_from_slice(&ip);
    frame[IPV4_HEADER_SIZE..].copy_from_slice(&tcp);
    frame
}
