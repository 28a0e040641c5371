// IPv4 fragment reassembly, one instance per capture device.
//
// Fragments are keyed by (source, destination, identification, protocol)
// and accumulated by byte offset until the range [0, total) is covered
// contiguously, where the total is learned from the fragment with a clear
// MF bit. Completed datagrams are emitted as reconstructed raw IPv4
// packets so the receive path can re-parse them like any other capture.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::packet::Ipv4Header;

/// Contexts older than this are dropped on the next call.
pub(crate) const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

// Memory guard: fragments for at most this many datagrams are held at
// once. Expiration frees slots; beyond the cap new keys are dropped.
const MAX_CONTEXTS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    identification: u16,
    protocol: u8,
}

struct FragmentContext {
    first_seen: Instant,
    /// Fragment data by byte offset into the original datagram.
    fragments: BTreeMap<usize, Vec<u8>>,
    /// IPv4 header of the offset-0 fragment, reused for the rebuilt packet.
    header: Option<Vec<u8>>,
    /// Total payload length, known once the MF-clear fragment arrives.
    expected_len: Option<usize>,
}

impl FragmentContext {
    fn new(now: Instant) -> Self {
        Self {
            first_seen: now,
            fragments: BTreeMap::new(),
            header: None,
            expected_len: None,
        }
    }

    /// Contiguous coverage of [0, expected_len)?
    fn is_complete(&self) -> bool {
        let expected = match self.expected_len {
            Some(len) => len,
            None => return false,
        };
        let mut covered = 0usize;
        for (offset, data) in &self.fragments {
            if *offset > covered {
                return false;
            }
            covered = covered.max(offset + data.len());
            if covered >= expected {
                return true;
            }
        }
        covered >= expected
    }
}

pub(crate) struct IpReassembly {
    timeout: Duration,
    contexts: HashMap<FragmentKey, FragmentContext>,
}

impl IpReassembly {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            contexts: HashMap::new(),
        }
    }

    /// Feed one IPv4 fragment (a complete IPv4 packet whose fragment word
    /// is non-zero). Returns the reassembled raw IPv4 packet when this
    /// fragment completes its datagram.
    pub(crate) fn process(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        let now = Instant::now();
        self.expire(now);

        let header = Ipv4Header::parse(packet)?;
        if !header.is_fragment() {
            return None;
        }

        let key = FragmentKey {
            src: header.src,
            dst: header.dst,
            identification: header.identification,
            protocol: header.protocol,
        };

        if !self.contexts.contains_key(&key) && self.contexts.len() >= MAX_CONTEXTS {
            log::debug!(
                "fragment cache full ({} contexts), dropping fragment from {}",
                self.contexts.len(),
                header.src
            );
            return None;
        }

        let context = self
            .contexts
            .entry(key)
            .or_insert_with(|| FragmentContext::new(now));

        let offset = header.fragment_offset();
        let data = header.payload(packet);

        if offset == 0 {
            context.header = Some(packet[..header.header_len].to_vec());
        }
        if !header.more_fragments() {
            context.expected_len = Some(offset + data.len());
        }

        // Duplicate offsets are discarded; the first arrival wins.
        context.fragments.entry(offset).or_insert_with(|| data.to_vec());

        if !context.is_complete() {
            return None;
        }

        let context = self.contexts.remove(&key)?;
        Some(rebuild(context))
    }

    fn expire(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.contexts
            .retain(|_, context| now.duration_since(context.first_seen) <= timeout);
    }
}

/// Rebuilds the raw IPv4 packet from a complete context: offset-0 header
/// with the fragment word cleared and the total length fixed up, followed
/// by the assembled payload.
fn rebuild(context: FragmentContext) -> Vec<u8> {
    let expected = context.expected_len.unwrap_or(0);
    let mut header = context.header.unwrap_or_default();

    let mut payload = vec![0u8; expected];
    for (offset, data) in &context.fragments {
        let end = (offset + data.len()).min(expected);
        if *offset < end {
            payload[*offset..end].copy_from_slice(&data[..end - offset]);
        }
    }

    let total_len = (header.len() + expected) as u16;
    if header.len() >= 20 {
        header[2..4].copy_from_slice(&total_len.to_be_bytes());
        header[6] = 0;
        header[7] = 0;
        header[10] = 0; // checksum is not recomputed; parsers ignore it
        header[11] = 0;
    }

    header.extend_from_slice(&payload);
    header
}
