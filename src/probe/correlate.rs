//! Correlation of inbound raw TCP frames with the probe in flight
//!
//! A raw IPPROTO_TCP socket sees every TCP segment addressed to the host, so
//! each frame is checked against the reversed 4-tuple of the probe and the
//! SYN-ACK acknowledgment rule before it counts as a reply.

use pnet::packet::Packet;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use std::net::SocketAddrV4;

use crate::probe::tcp::{FRAME_SIZE, IPV4_HEADER_SIZE, TCP_HEADER_SIZE, TcpFlags};

/// Identifying fields of the SYN currently in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    /// Our address and source port
    pub source: SocketAddrV4,
    /// Peer address and port
    pub destination: SocketAddrV4,
    /// Sequence number carried by the SYN
    pub seq: u32,
}

/// Classification of an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// SYN-ACK for our SYN; carries the peer's acknowledgment number
    Accepted { ack: u32 },
    /// Someone else's traffic, or our tuple with the wrong flags/ack
    Unrelated,
    /// Too short or not a parseable IPv4/TCP frame
    Malformed,
}

/// Fields pulled out of a TCP-over-IPv4 frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
}

/// Parse the IPv4 and TCP headers of a raw frame
///
/// Returns None for frames shorter than a bare IPv4 + TCP header, non-IPv4
/// frames, and header lengths that overrun the buffer. Non-TCP frames parse
/// as None too; callers that need to tell those apart check the protocol.
pub fn parse_segment(frame: &[u8]) -> Option<Segment> {
    if frame.len() < FRAME_SIZE {
        return None;
    }

    let ip = Ipv4Packet::new(frame)?;
    if ip.get_version() != 4 {
        return None;
    }

    let ip_header_len = (ip.get_header_length() as usize) * 4;
    if ip_header_len < IPV4_HEADER_SIZE || frame.len() < ip_header_len + TCP_HEADER_SIZE {
        return None;
    }

    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return None;
    }

    let tcp = TcpPacket::new(&frame[ip_header_len..])?;
    // Flags byte read directly: offset 13 of the TCP header
    let flags = TcpFlags::from_bits(tcp.packet()[13]);

    Some(Segment {
        source: SocketAddrV4::new(ip.get_source(), tcp.get_source()),
        destination: SocketAddrV4::new(ip.get_destination(), tcp.get_destination()),
        flags,
        seq: tcp.get_sequence(),
        ack: tcp.get_acknowledgement(),
    })
}

/// Decide whether `frame` is the SYN-ACK answering `expected`
///
/// Accepted only when the frame travels the probe's 4-tuple in reverse, has
/// both SYN and ACK set, and acknowledges `seq + 1` (mod 2^32). A bare RST or
/// a retransmitted SYN on the right tuple is Unrelated; the caller keeps
/// waiting until its deadline.
pub fn match_reply(frame: &[u8], expected: &Expected) -> MatchResult {
    if frame.len() < FRAME_SIZE {
        return MatchResult::Malformed;
    }

    let Some(ip) = Ipv4Packet::new(frame) else {
        return MatchResult::Malformed;
    };
    if ip.get_version() != 4 {
        return MatchResult::Malformed;
    }
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return MatchResult::Unrelated;
    }

    let Some(segment) = parse_segment(frame) else {
        return MatchResult::Malformed;
    };

    if segment.source != expected.destination || segment.destination != expected.source {
        return MatchResult::Unrelated;
    }

    if segment.flags.contains(TcpFlags::SYN | TcpFlags::ACK)
        && segment.ack == expected.seq.wrapping_add(1)
    {
        MatchResult::Accepted { ack: segment.ack }
    } else {
        MatchResult::Unrelated
    }
}
