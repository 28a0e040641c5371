// The capture socket.
//
// Owns the set of open capture devices, selects and opens them at bind
// time, keeps their kernel filters in sync with the bound endpoint and
// the multicast membership, and multiplexes a blocking receive across all
// of them. Close may run concurrently with a blocked receive.
//
// Locking discipline, two locks:
//
// - `wait_handles` (reader/writer): a receive holds it shared for the
//   whole call so the descriptor array it parks on stays stable; bind and
//   the final phase of close take it exclusively to swap the array.
// - `inner` (mutex): held around every non-blocking pull and during
//   handle teardown, so close can never free a handle while the frame
//   handler is reading packet memory owned by it. Also guards all socket
//   state, including the closed flag.
//
// Lock order is always `wait_handles` before `inner`.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::device::{CaptureDevice, PullOutcome, MAX_PACKET_SIZE};
use crate::driver;
use crate::error::Error;
use crate::filter::{self, FilterConfig};
use crate::kickstart;
use crate::wait::{self, WaitHandle, WaitOutcome, MAX_WAIT_DEVICES};

/// A successfully received datagram: how many bytes were copied into the
/// caller's buffer, and who sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    pub len: usize,
    pub source_address: Ipv4Addr,
    pub source_port: u16,
}

#[derive(Clone, Copy)]
struct Binding {
    address: Ipv4Addr,
    port: u16,
}

struct Inner {
    closed: bool,
    bound: Option<Binding>,
    devices: Vec<CaptureDevice>,
    multicast_groups: BTreeSet<Ipv4Addr>,
    multicast_loopback: bool,
    receive_buffer_size: Option<i32>,
}

/// A receive-only UDP socket on top of the packet-capture driver.
///
/// Binding opens one capture handle per selected adapter and installs a
/// kernel filter narrowing traffic to the bound port. The filter also
/// admits IPv4 fragments, whose UDP port is not yet visible; those are
/// reassembled in user space before delivery.
///
/// Concurrency contract: at most one thread may be inside
/// [`receive_datagram`](Self::receive_datagram) at a time; [`close`](Self::close)
/// may be called from any thread at any time, including while a receive is
/// blocked. All other state-changing calls require that no receive is in
/// flight.
pub struct CaptureSocket {
    valid: bool,
    inner: Mutex<Inner>,
    wait_handles: RwLock<Vec<WaitHandle>>,
}

impl CaptureSocket {
    /// Creates the socket and probes the capture driver. No capture
    /// resources are allocated until [`bind`](Self::bind).
    pub fn new() -> Self {
        let valid = driver::initialize();
        if !valid {
            log::warn!(
                "capture driver unavailable: {}",
                driver::initialization_error().unwrap_or_else(|| "unknown error".to_string())
            );
        }
        Self {
            valid,
            inner: Mutex::new(Inner {
                closed: false,
                bound: None,
                devices: Vec::new(),
                multicast_groups: BTreeSet::new(),
                multicast_loopback: true,
                receive_buffer_size: None,
            }),
            wait_handles: RwLock::new(Vec::new()),
        }
    }

    /// Whether the capture driver came up; a socket that failed bootstrap
    /// is permanently non-functional.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Sets the driver-level receive buffer size for the handles a later
    /// [`bind`](Self::bind) will open. Fails on an invalid or already
    /// bound socket, or when `size` is below the snap length (65 536).
    pub fn set_receive_buffer_size(&self, size: usize) -> bool {
        if !self.valid {
            log::debug!("set receive buffer size error: socket is invalid");
            return false;
        }

        let mut inner = self.lock_inner();
        if inner.bound.is_some() {
            log::debug!("set receive buffer size error: socket is already bound");
            return false;
        }
        if size < MAX_PACKET_SIZE {
            log::debug!(
                "set receive buffer size error: {size} is smaller than the maximum packet size ({MAX_PACKET_SIZE})"
            );
            return false;
        }

        inner.receive_buffer_size = Some(size.min(i32::MAX as usize) as i32);
        true
    }

    /// Binds to `address:port` by opening capture handles on the adapters
    /// the address implies:
    ///
    /// - loopback address: the loopback adapter only; its open must succeed.
    /// - unspecified (0.0.0.0): every enumerable adapter, best-effort; the
    ///   bind succeeds as long as at least one of them opened.
    /// - specific unicast: the adapter carrying that address, plus the
    ///   loopback adapter (the host stack delivers traffic addressed to a
    ///   local IP through loopback); both opens must succeed.
    pub fn bind(&self, address: Ipv4Addr, port: u16) -> bool {
        if !self.valid {
            log::debug!("bind error: socket is invalid");
            return false;
        }

        let mut wait_handles = self.write_handles();
        let mut inner = self.lock_inner();

        if inner.closed {
            log::debug!("bind error: socket is closed");
            return false;
        }
        if inner.bound.is_some() {
            log::debug!("bind error: socket is already bound");
            return false;
        }

        let buffer_size = inner.receive_buffer_size;
        let mut devices = Vec::new();

        if address.is_loopback() {
            let name = driver::loopback_device_name();
            log::debug!("opening loopback device {name}");
            match CaptureDevice::open(&name, buffer_size) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    log::debug!("bind error: unable to open {name}: {e}");
                    return false;
                }
            }
        } else if address.is_unspecified() {
            let all = match pcap::Device::list() {
                Ok(all) => all,
                Err(e) => {
                    log::debug!("bind error: device enumeration failed: {e}");
                    return false;
                }
            };
            if all.is_empty() {
                log::debug!("bind error: no capture devices found");
                return false;
            }
            for candidate in &all {
                log::debug!(
                    "opening {} ({})",
                    candidate.name,
                    candidate.desc.as_deref().unwrap_or("no description")
                );
                match CaptureDevice::open(&candidate.name, buffer_size) {
                    Ok(device) => devices.push(device),
                    Err(e) => log::debug!("bind error: unable to open {}: {e}", candidate.name),
                }
            }
            if devices.is_empty() {
                log::debug!("bind error: unable to open any capture device");
                return false;
            }
        } else {
            let name = match device_by_address(address) {
                Some(name) => name,
                None => {
                    log::debug!("bind error: no local device with address {address}");
                    return false;
                }
            };
            log::debug!("opening {name}");
            match CaptureDevice::open(&name, buffer_size) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    log::debug!("bind error: unable to open {name}: {e}");
                    return false;
                }
            }

            // The local machine may send to its own address; that traffic
            // shows up on the loopback path, never on the wire.
            let loopback = driver::loopback_device_name();
            log::debug!("opening loopback device {loopback}");
            match CaptureDevice::open(&loopback, buffer_size) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    log::debug!("bind error: unable to open {loopback}: {e}");
                    return false;
                }
            }
        }

        inner.bound = Some(Binding { address, port });
        inner.devices = devices;
        refresh_filters(&mut inner);

        *wait_handles = inner
            .devices
            .iter()
            .map(CaptureDevice::wait_handle)
            .collect();
        if wait_handles.len() > MAX_WAIT_DEVICES {
            log::warn!(
                "{} adapters are open but only {} can be waited on; the rest are drained opportunistically",
                wait_handles.len(),
                MAX_WAIT_DEVICES
            );
        }

        true
    }

    pub fn is_bound(&self) -> bool {
        self.lock_inner().bound.is_some()
    }

    /// The bound address, or `None` when not bound.
    pub fn local_address(&self) -> Option<Ipv4Addr> {
        self.lock_inner().bound.map(|b| b.address)
    }

    /// The bound port, or 0 when not bound.
    pub fn local_port(&self) -> u16 {
        self.lock_inner().bound.map(|b| b.port).unwrap_or(0)
    }

    /// Adds `group` to the multicast membership and reinstalls the
    /// capture filters. When multicast loopback is enabled this also
    /// primes the host stack's loopback delivery path for the group.
    pub fn join_multicast_group(&self, group: Ipv4Addr) -> bool {
        if !self.valid {
            log::debug!("join multicast group error: socket is invalid");
            return false;
        }
        if !group.is_multicast() {
            log::debug!("join multicast group error: {group} is not a multicast address");
            return false;
        }

        let mut inner = self.lock_inner();
        if inner.bound.is_none() {
            log::debug!("join multicast group error: socket is not bound");
            return false;
        }
        if inner.multicast_groups.contains(&group) {
            log::debug!("join multicast group error: already joined {group}");
            return false;
        }

        inner.multicast_groups.insert(group);
        refresh_filters(&mut inner);

        if inner.multicast_loopback {
            kickstart::kickstart_loopback_multicast(&inner.multicast_groups);
        }

        true
    }

    /// Removes `group` from the multicast membership and reinstalls the
    /// capture filters.
    pub fn leave_multicast_group(&self, group: Ipv4Addr) -> bool {
        if !self.valid {
            log::debug!("leave multicast group error: socket is invalid");
            return false;
        }

        let mut inner = self.lock_inner();
        if !inner.multicast_groups.remove(&group) {
            log::debug!("leave multicast group error: not a member of {group}");
            return false;
        }
        refresh_filters(&mut inner);
        true
    }

    /// Controls whether multicast sent by this host is received back on
    /// the loopback path (on by default, like the ordinary socket option).
    pub fn set_multicast_loopback_enabled(&self, enabled: bool) {
        let mut inner = self.lock_inner();
        if inner.multicast_loopback == enabled {
            return;
        }
        inner.multicast_loopback = enabled;

        if enabled {
            kickstart::kickstart_loopback_multicast(&inner.multicast_groups);
        }
        refresh_filters(&mut inner);
    }

    pub fn is_multicast_loopback_enabled(&self) -> bool {
        self.lock_inner().multicast_loopback
    }

    /// Blocks until a complete UDP datagram for the bound port arrives,
    /// copies up to `buf.len()` bytes of its payload into `buf`, and
    /// reports the byte count and source endpoint.
    ///
    /// `timeout` of `None` waits forever; `Some(Duration::ZERO)` polls
    /// once. A concurrent [`close`](Self::close) makes a blocked call
    /// return [`Error::SocketClosed`].
    pub fn receive_datagram(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<Datagram, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);

        if !self.valid {
            log::debug!("receive error: socket is invalid");
            return Err(Error::DriverNotInitialized);
        }

        // Shared for the whole call: the descriptor array must not move
        // while the loop below parks on it.
        let wait_handles = self.read_handles();

        loop {
            let mut received_any = false;

            {
                let mut inner = self.lock_inner();

                if inner.closed {
                    return Err(Error::SocketClosed);
                }
                let binding = match inner.bound {
                    Some(binding) => binding,
                    None => {
                        log::debug!("receive error: socket is not bound");
                        return Err(Error::NotBound);
                    }
                };

                // One non-blocking pull per device per pass. Waiting on
                // the descriptors first would lose buffered packets: a
                // wait wakes once however many packets are queued behind
                // it.
                for device in inner.devices.iter_mut() {
                    match device.pull_datagram(binding.port, buf) {
                        PullOutcome::Datagram(datagram) => return Ok(datagram),
                        PullOutcome::Packet => received_any = true,
                        PullOutcome::NoData => {}
                        PullOutcome::Error(detail) => {
                            log::debug!("receive error on {}: {detail}", device.name());
                            return Err(Error::Capture(detail));
                        }
                    }
                }
            }

            // Anything captured this pass (even a lone fragment) may mean
            // more is buffered; sweep again before waiting.
            if received_any {
                continue;
            }

            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Err(Error::Timeout);
                }
            }
            let remaining = deadline.map(|d| d.duration_since(now));

            match wait::wait_for_data(&wait_handles, remaining) {
                // Ready or failed: loop around; the next pass re-checks
                // the closed flag before touching any handle.
                WaitOutcome::Ready | WaitOutcome::Failed => continue,
                WaitOutcome::TimedOut => return Err(Error::Timeout),
            }
        }
    }

    /// Closes the socket. Idempotent; safe to call while another thread
    /// is blocked in [`receive_datagram`](Self::receive_datagram), which
    /// then returns [`Error::SocketClosed`].
    pub fn close(&self) {
        {
            // Phase one: mark closed and tear down the handles, under the
            // pull lock so no frame handler can be mid-packet, and with
            // the descriptor array still intact for any parked receiver.
            let _wait_handles = self.read_handles();
            let mut inner = self.lock_inner();
            if !inner.closed {
                inner.closed = true;
                for device in &inner.devices {
                    log::debug!("closing {}", device.name());
                }
                inner.devices.clear();
            }
        }

        {
            // Phase two: once the receiver is out (the write lock waits
            // for it), drop the descriptor array and the binding.
            let mut wait_handles = self.write_handles();
            wait_handles.clear();
            let mut inner = self.lock_inner();
            inner.bound = None;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock_inner().closed
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_handles(&self) -> RwLockReadGuard<'_, Vec<WaitHandle>> {
        self.wait_handles
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_handles(&self) -> RwLockWriteGuard<'_, Vec<WaitHandle>> {
        self.wait_handles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CaptureSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CaptureSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Rebuilds and reinstalls the capture filter on every open device.
fn refresh_filters(inner: &mut Inner) {
    let binding = match inner.bound {
        Some(binding) => binding,
        None => return,
    };

    let Inner {
        devices,
        multicast_groups,
        multicast_loopback,
        ..
    } = inner;

    let config = FilterConfig {
        bound_address: binding.address,
        bound_port: binding.port,
        multicast_groups: &*multicast_groups,
        multicast_loopback: *multicast_loopback,
    };

    for device in devices.iter_mut() {
        let mac = device.mac();
        let expression = filter::build_filter(&config, device.is_loopback(), mac.as_deref());
        device.install_filter(&expression);
    }
}

/// Finds the capture device carrying `address`. Loopback adapters are
/// skipped even if one somehow carries the address.
fn device_by_address(address: Ipv4Addr) -> Option<String> {
    let all = match pcap::Device::list() {
        Ok(all) => all,
        Err(e) => {
            log::debug!("device enumeration failed: {e}");
            return None;
        }
    };

    for device in all {
        if device.flags.is_loopback() || driver::is_loopback_device(&device.name) {
            continue;
        }
        for addr in &device.addresses {
            if addr.addr == std::net::IpAddr::V4(address) {
                return Some(device.name.clone());
            }
        }
    }
    None
}
