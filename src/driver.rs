//! Capture-driver bootstrap.
//!
//! Probes the packet-capture driver once per process: enumerates the
//! capture devices, verifies that a loopback device is visible, and caches
//! its name. Everything else in the crate treats the probe outcome as
//! read-only. Also home of the process-wide filter-compile mutex, because
//! the driver's filter compiler is not reentrant.

use std::sync::{Mutex, OnceLock};

static DRIVER: OnceLock<Result<DriverState, String>> = OnceLock::new();
static COMPILE_MUTEX: Mutex<()> = Mutex::new(());

#[cfg(windows)]
const FALLBACK_LOOPBACK_NAME: &str = "\\Device\\NPF_Loopback";
#[cfg(not(windows))]
const FALLBACK_LOOPBACK_NAME: &str = "lo";

struct DriverState {
    loopback_name: String,
}

/// Probe the capture driver. The first call does the work; subsequent
/// calls return the cached outcome.
pub fn initialize() -> bool {
    DRIVER.get_or_init(probe).is_ok()
}

/// Whether a probe has already run and succeeded.
pub fn is_initialized() -> bool {
    matches!(DRIVER.get(), Some(Ok(_)))
}

/// Human-readable description of why the probe failed, if it did.
pub fn initialization_error() -> Option<String> {
    match DRIVER.get() {
        Some(Err(e)) => Some(e.clone()),
        _ => None,
    }
}

/// Name of the loopback capture device.
///
/// Falls back to the platform's conventional name when the probe did not
/// find one (some driver builds hide the loopback adapter from
/// enumeration but still open it by name).
pub fn loopback_device_name() -> String {
    match DRIVER.get() {
        Some(Ok(state)) => state.loopback_name.clone(),
        _ => FALLBACK_LOOPBACK_NAME.to_string(),
    }
}

/// Whether `device_name` refers to the loopback capture device.
pub fn is_loopback_device(device_name: &str) -> bool {
    device_name.eq_ignore_ascii_case(&loopback_device_name())
        || device_name.eq_ignore_ascii_case(FALLBACK_LOOPBACK_NAME)
}

/// The filter compiler inside the capture driver is not reentrant; every
/// compile in the process must hold this lock.
pub(crate) fn compile_mutex() -> &'static Mutex<()> {
    &COMPILE_MUTEX
}

fn probe() -> Result<DriverState, String> {
    log::info!("probing capture driver");

    let devices = pcap::Device::list()
        .map_err(|e| format!("capture device enumeration failed: {e}"))?;

    if devices.is_empty() {
        return Err("no capture devices found".to_string());
    }

    let loopback = devices
        .iter()
        .find(|dev| dev.flags.is_loopback())
        .map(|dev| dev.name.clone())
        .unwrap_or_else(|| FALLBACK_LOOPBACK_NAME.to_string());

    log::info!(
        "capture driver ready ({} devices, loopback = {})",
        devices.len(),
        loopback
    );

    Ok(DriverState {
        loopback_name: loopback,
    })
}
