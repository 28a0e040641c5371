// Raw-frame construction helpers for unit tests.

use std::net::Ipv4Addr;

const UDP_HLEN: usize = 8;

/// Builder for raw IPv4/UDP test packets, with optional link-layer framing
/// and fragment-word control.
pub(crate) struct PacketBuilder {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: Vec<u8>,
    identification: u16,
    flags_fragment: u16,
}

impl PacketBuilder {
    pub(crate) fn udp(
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Self {
        Self {
            src: Ipv4Addr::from(src),
            dst: Ipv4Addr::from(dst),
            src_port,
            dst_port,
            payload: payload.to_vec(),
            identification: 0,
            flags_fragment: 0,
        }
    }

    pub(crate) fn identification(mut self, id: u16) -> Self {
        self.identification = id;
        self
    }

    /// Marks the packet as the offset-0 fragment of a larger datagram.
    /// `more` sets the MF bit. Non-first fragments carry no UDP header;
    /// build those with [`PacketBuilder::raw_ip_fragment`].
    pub(crate) fn fragment(mut self, offset_bytes: usize, more: bool) -> Self {
        assert_eq!(offset_bytes % 8, 0);
        self.flags_fragment = ((offset_bytes / 8) as u16) & 0x1fff;
        if more {
            self.flags_fragment |= 0x2000;
        }
        self
    }

    /// The IPv4 packet: header + UDP segment.
    pub(crate) fn ip_packet(&self) -> Vec<u8> {
        let mut segment = Vec::with_capacity(UDP_HLEN + self.payload.len());
        segment.extend_from_slice(&self.src_port.to_be_bytes());
        segment.extend_from_slice(&self.dst_port.to_be_bytes());
        segment.extend_from_slice(&((UDP_HLEN + self.payload.len()) as u16).to_be_bytes());
        segment.extend_from_slice(&[0, 0]); // checksum unverified
        segment.extend_from_slice(&self.payload);

        ipv4_packet(
            self.src,
            self.dst,
            self.identification,
            self.flags_fragment,
            &segment,
        )
    }

    pub(crate) fn ethernet_frame(&self) -> Vec<u8> {
        wrap_ethernet(&self.ip_packet())
    }

    pub(crate) fn null_frame(&self) -> Vec<u8> {
        wrap_null(&self.ip_packet())
    }

    /// A standalone IPv4 fragment carrying `data` at `offset_bytes` of the
    /// original datagram, with no UDP header of its own.
    pub(crate) fn raw_ip_fragment(
        src: [u8; 4],
        dst: [u8; 4],
        identification: u16,
        offset_bytes: usize,
        more: bool,
        data: &[u8],
    ) -> Vec<u8> {
        assert_eq!(offset_bytes % 8, 0);
        let mut word = ((offset_bytes / 8) as u16) & 0x1fff;
        if more {
            word |= 0x2000;
        }
        ipv4_packet(Ipv4Addr::from(src), Ipv4Addr::from(dst), identification, word, data)
    }
}

/// Splits one UDP datagram into IPv4 fragments of `chunk` bytes each
/// (the last may be shorter). `chunk` must be a multiple of 8.
pub(crate) fn fragment_udp(
    src: [u8; 4],
    dst: [u8; 4],
    identification: u16,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
    chunk: usize,
) -> Vec<Vec<u8>> {
    assert_eq!(chunk % 8, 0);

    let mut segment = Vec::with_capacity(UDP_HLEN + payload.len());
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&((UDP_HLEN + payload.len()) as u16).to_be_bytes());
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);

    let mut fragments = Vec::new();
    let mut offset = 0;
    while offset < segment.len() {
        let end = (offset + chunk).min(segment.len());
        let more = end < segment.len();
        fragments.push(PacketBuilder::raw_ip_fragment(
            src,
            dst,
            identification,
            offset,
            more,
            &segment[offset..end],
        ));
        offset = end;
    }
    fragments
}

pub(crate) fn wrap_ethernet(ip_packet: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + ip_packet.len());
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]); // dst MAC
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]); // src MAC
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(ip_packet);
    frame
}

pub(crate) fn wrap_null(ip_packet: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + ip_packet.len());
    frame.extend_from_slice(&2u32.to_ne_bytes()); // AF_INET
    frame.extend_from_slice(ip_packet);
    frame
}

fn ipv4_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    identification: u16,
    flags_fragment: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = 20 + payload.len();
    let mut packet = Vec::with_capacity(total_len);
    packet.push(0x45); // version 4, IHL 5
    packet.push(0);
    packet.extend_from_slice(&(total_len as u16).to_be_bytes());
    packet.extend_from_slice(&identification.to_be_bytes());
    packet.extend_from_slice(&flags_fragment.to_be_bytes());
    packet.push(64); // TTL
    packet.push(17); // UDP
    packet.extend_from_slice(&[0, 0]); // checksum unverified
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    packet.extend_from_slice(payload);
    packet
}
