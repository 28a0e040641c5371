// Raw frame parsing: link-layer strip + IPv4/UDP header decoding.
//
// Offset-based parsing over capture buffers. Anything that does not decode
// as IPv4/UDP is dropped silently by returning `None`; the receive path
// simply moves on to the next captured frame.

use std::net::Ipv4Addr;

// Ethernet
const ETH_HLEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;

// Null/Loop loopback framing: 4-byte address-family word
const AF_HLEN: usize = 4;
const AF_INET_WORD: u32 = 2;

// IPv4
const IPV4_MIN_HLEN: usize = 20;
pub(crate) const PROTO_UDP: u8 = 17;

// Flags+offset word: MF bit plus the 13-bit fragment offset. A non-zero
// value under this mask marks the packet as part of a fragmented datagram.
pub(crate) const FRAGMENT_WORD_MASK: u16 = 0x3fff;
const MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

// UDP
const UDP_HLEN: usize = 8;

/// Link-layer framing of a capture handle, fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkType {
    /// 14-byte Ethernet II header, EtherType at offset 12.
    Ethernet,
    /// 4-byte address-family word in host byte order (BSD/Npcap loopback).
    Null,
    /// 4-byte address-family word in big-endian byte order.
    Loop,
    /// No link-layer header; IP version from the first nibble.
    Raw,
}

impl LinkType {
    pub(crate) fn from_pcap(linktype: pcap::Linktype) -> Option<Self> {
        match linktype.0 {
            1 => Some(Self::Ethernet),  // EN10MB
            0 => Some(Self::Null),      // loopback, host-order AF word
            108 => Some(Self::Loop),    // loopback, big-endian AF word
            12 | 228 => Some(Self::Raw),
            _ => None,
        }
    }
}

/// Strips the link-layer header, returning the network-layer slice of an
/// IPv4 frame. `None` for non-IPv4 traffic or truncated frames.
pub(crate) fn strip_link_header(frame: &[u8], link_type: LinkType) -> Option<&[u8]> {
    match link_type {
        LinkType::Ethernet => {
            if frame.len() < ETH_HLEN {
                return None;
            }
            let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
            if ethertype != ETHERTYPE_IPV4 {
                return None;
            }
            Some(&frame[ETH_HLEN..])
        }
        LinkType::Null | LinkType::Loop => {
            if frame.len() < AF_HLEN {
                return None;
            }
            let word = [frame[0], frame[1], frame[2], frame[3]];
            let af = match link_type {
                LinkType::Null => u32::from_ne_bytes(word),
                _ => u32::from_be_bytes(word),
            };
            if af != AF_INET_WORD {
                return None;
            }
            Some(&frame[AF_HLEN..])
        }
        LinkType::Raw => {
            if frame.is_empty() || frame[0] >> 4 != 4 {
                return None;
            }
            Some(frame)
        }
    }
}

/// Decoded IPv4 header. Offsets are relative to the start of the IP packet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ipv4Header {
    pub header_len: usize,
    pub total_len: usize,
    pub identification: u16,
    pub flags_fragment: u16,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub(crate) fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < IPV4_MIN_HLEN || packet[0] >> 4 != 4 {
            return None;
        }
        let header_len = ((packet[0] & 0x0f) as usize) * 4;
        if header_len < IPV4_MIN_HLEN || packet.len() < header_len {
            return None;
        }
        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        if total_len < header_len {
            return None;
        }
        Some(Self {
            header_len,
            total_len,
            identification: u16::from_be_bytes([packet[4], packet[5]]),
            flags_fragment: u16::from_be_bytes([packet[6], packet[7]]),
            protocol: packet[9],
            src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        })
    }

    pub(crate) fn is_fragment(&self) -> bool {
        self.flags_fragment & FRAGMENT_WORD_MASK != 0
    }

    pub(crate) fn more_fragments(&self) -> bool {
        self.flags_fragment & MORE_FRAGMENTS != 0
    }

    /// Fragment offset in bytes (the wire encodes 8-byte units).
    pub(crate) fn fragment_offset(&self) -> usize {
        ((self.flags_fragment & FRAGMENT_OFFSET_MASK) as usize) * 8
    }

    /// The network-layer payload. The total-length field bounds the slice,
    /// which discards any link-layer trailer padding the capture included.
    pub(crate) fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        let end = self.total_len.min(packet.len());
        &packet[self.header_len.min(end)..end]
    }
}

/// Decoded UDP header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: usize,
}

impl UdpHeader {
    pub(crate) fn parse(segment: &[u8]) -> Option<Self> {
        if segment.len() < UDP_HLEN {
            return None;
        }
        let length = u16::from_be_bytes([segment[4], segment[5]]) as usize;
        if length < UDP_HLEN {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            length,
        })
    }

    /// The datagram payload, bounded by the UDP length field.
    pub(crate) fn payload<'a>(&self, segment: &'a [u8]) -> &'a [u8] {
        let end = self.length.min(segment.len());
        &segment[UDP_HLEN.min(end)..end]
    }
}
