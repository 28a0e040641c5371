// One open capture handle and its per-device state.
//
// A device is opened in promiscuous mode with the full UDP snap length,
// immediate delivery, and non-blocking reads; the receive loop pulls one
// captured frame at a time and runs it through the frame handler below.

use crate::driver;
use crate::error::Error;
use crate::filter;
use crate::packet::{self, Ipv4Header, LinkType, UdpHeader, PROTO_UDP};
use crate::reassembly::{IpReassembly, REASSEMBLY_TIMEOUT};
use crate::socket::Datagram;
use crate::wait::WaitHandle;

/// Snap length covering any UDP datagram the wire can carry.
pub(crate) const MAX_PACKET_SIZE: usize = 65536;

/// Outcome of one non-blocking pull on one device.
pub(crate) enum PullOutcome {
    /// A complete UDP datagram was copied into the caller's buffer.
    Datagram(Datagram),
    /// A frame was captured but no datagram completed (wrong port, parse
    /// failure, or a fragment still waiting for its siblings).
    Packet,
    /// Nothing buffered on this device.
    NoData,
    /// The capture handle reported an error.
    Error(String),
}

pub(crate) struct CaptureDevice {
    handle: pcap::Capture<pcap::Active>,
    name: String,
    is_loopback: bool,
    link_type: LinkType,
    reassembly: IpReassembly,
}

impl CaptureDevice {
    /// Opens and activates a capture handle on `device_name`.
    ///
    /// `buffer_size` is the pre-bind receive-buffer hint; it must be
    /// applied before activation or the driver ignores it.
    pub(crate) fn open(device_name: &str, buffer_size: Option<i32>) -> Result<Self, Error> {
        let is_loopback = driver::is_loopback_device(device_name);

        let mut inactive = pcap::Capture::from_device(device_name)
            .map_err(|e| Error::Capture(format!("unable to open {device_name}: {e}")))?
            .snaplen(MAX_PACKET_SIZE as i32)
            .promisc(true)
            .immediate_mode(true);

        if let Some(size) = buffer_size {
            inactive = inactive.buffer_size(size);
        }

        let handle = inactive
            .open()
            .map_err(|e| Error::Capture(format!("unable to activate {device_name}: {e}")))?;
        let handle = handle
            .setnonblock()
            .map_err(|e| Error::Capture(format!("unable to set {device_name} non-blocking: {e}")))?;

        // Receive path only. Without this, platforms that tap transmitted
        // frames deliver every loopback datagram twice (outgoing copy and
        // incoming copy).
        if let Err(e) = handle.direction(pcap::Direction::In) {
            log::warn!("unable to restrict {device_name} to inbound traffic: {e}");
        }

        let datalink = handle.get_datalink();
        let link_type = LinkType::from_pcap(datalink).ok_or_else(|| {
            Error::Capture(format!(
                "unsupported link type {} on {device_name}",
                datalink.0
            ))
        })?;

        log::info!(
            "opened capture on {device_name} (link type {}, loopback = {})",
            datalink.0,
            is_loopback
        );

        Ok(Self {
            handle,
            name: device_name.to_string(),
            is_loopback,
            link_type,
            reassembly: IpReassembly::new(REASSEMBLY_TIMEOUT),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_loopback(&self) -> bool {
        self.is_loopback
    }

    /// MAC address for the self-frame suppression clause. Only Ethernet
    /// devices have one worth filtering on.
    pub(crate) fn mac(&self) -> Option<String> {
        if self.is_loopback || self.link_type != LinkType::Ethernet {
            return None;
        }
        filter::device_mac(&self.name)
    }

    /// Installs a compiled filter on the handle. Compilation is serialized
    /// through the global compile mutex; on failure the handle keeps
    /// whatever filter it had.
    pub(crate) fn install_filter(&mut self, expression: &str) {
        let _compile_guard = driver::compile_mutex()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match self.handle.filter(expression, true) {
            Ok(()) => log::debug!("installed filter on {}: {expression}", self.name),
            Err(e) => log::warn!(
                "unable to install filter \"{expression}\" on {}: {e}",
                self.name
            ),
        }
    }

    /// One non-blocking pull: grab the next buffered frame, run it through
    /// the frame handler, and report what happened.
    pub(crate) fn pull_datagram(&mut self, bound_port: u16, buf: &mut [u8]) -> PullOutcome {
        let frame = match self.handle.next_packet() {
            Ok(packet) => packet.data,
            Err(pcap::Error::TimeoutExpired) => return PullOutcome::NoData,
            Err(e) => return PullOutcome::Error(e.to_string()),
        };
        handle_frame(frame, self.link_type, &mut self.reassembly, bound_port, buf)
    }

    #[cfg(unix)]
    pub(crate) fn wait_handle(&self) -> WaitHandle {
        use std::os::unix::io::AsRawFd;
        self.handle.as_raw_fd()
    }

    #[cfg(windows)]
    pub(crate) fn wait_handle(&self) -> WaitHandle {}
}

/// The per-frame path: strip the link layer, locate IPv4, feed fragments
/// to the reassembler, locate UDP, match the bound port, copy the payload.
/// Anything that does not complete a datagram is dropped silently.
pub(crate) fn handle_frame(
    frame: &[u8],
    link_type: LinkType,
    reassembly: &mut IpReassembly,
    bound_port: u16,
    buf: &mut [u8],
) -> PullOutcome {
    let ip_packet = match packet::strip_link_header(frame, link_type) {
        Some(p) => p,
        None => return PullOutcome::Packet,
    };
    let header = match Ipv4Header::parse(ip_packet) {
        Some(h) => h,
        None => return PullOutcome::Packet,
    };

    if header.is_fragment() {
        // The UDP port check happens after reassembly; the kernel filter
        // lets every fragment through.
        return match reassembly.process(ip_packet) {
            Some(rebuilt) => deliver(&rebuilt, bound_port, buf),
            None => PullOutcome::Packet,
        };
    }

    deliver(ip_packet, bound_port, buf)
}

fn deliver(ip_packet: &[u8], bound_port: u16, buf: &mut [u8]) -> PullOutcome {
    let header = match Ipv4Header::parse(ip_packet) {
        Some(h) => h,
        None => return PullOutcome::Packet,
    };
    if header.protocol != PROTO_UDP {
        return PullOutcome::Packet;
    }

    let segment = header.payload(ip_packet);
    let udp = match UdpHeader::parse(segment) {
        Some(u) => u,
        None => return PullOutcome::Packet,
    };
    if udp.dst_port != bound_port {
        return PullOutcome::Packet;
    }

    let payload = udp.payload(segment);
    let len = payload.len().min(buf.len());
    buf[..len].copy_from_slice(&payload[..len]);

    PullOutcome::Datagram(Datagram {
        len,
        source_address: header.src,
        source_port: udp.src_port,
    })
}
