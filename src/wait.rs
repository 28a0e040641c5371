// Multiplexed wait for capture-handle readiness.
//
// The receive loop parks here when a non-blocking sweep found nothing.
// Waits are sliced: no single wait exceeds WAIT_SLICE, so a socket closed
// from another thread is noticed within one slice even on platforms where
// closing a descriptor does not wake a parked waiter. Spurious wake-ups
// are part of the contract; the caller re-checks closed-ness and the
// deadline before sweeping again.

use std::time::Duration;

/// Upper bound on descriptors handed to one wait call. Devices beyond the
/// cap still capture; they are only drained when something else wakes the
/// loop. Logged at bind time when exceeded.
pub(crate) const MAX_WAIT_DEVICES: usize = 64;

const WAIT_SLICE: Duration = Duration::from_millis(100);

#[cfg(unix)]
pub(crate) type WaitHandle = std::os::unix::io::RawFd;
#[cfg(windows)]
pub(crate) type WaitHandle = ();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Data may be available, or the wait was cut short; sweep again.
    Ready,
    /// The caller's remaining time elapsed with nothing to read.
    TimedOut,
    /// The wait itself failed; sweep again (the loop re-checks state).
    Failed,
}

/// `TimedOut` only when the full remaining budget fit into the slice we
/// just slept; an expired longer wait is a spurious `Ready`.
fn slice_outcome(remaining: Option<Duration>) -> WaitOutcome {
    match remaining {
        Some(r) if r <= WAIT_SLICE => WaitOutcome::TimedOut,
        _ => WaitOutcome::Ready,
    }
}

#[cfg(unix)]
pub(crate) fn wait_for_data(handles: &[WaitHandle], remaining: Option<Duration>) -> WaitOutcome {
    let slice = match remaining {
        Some(r) => r.min(WAIT_SLICE),
        None => WAIT_SLICE,
    };

    if handles.is_empty() {
        std::thread::sleep(slice);
        return slice_outcome(remaining);
    }

    let mut pollfds: Vec<libc::pollfd> = handles
        .iter()
        .take(MAX_WAIT_DEVICES)
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let ret = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            ceil_millis(slice),
        )
    };

    if ret > 0 {
        // Readable, or an invalidated descriptor after close; either way
        // the caller must re-check state before pulling.
        WaitOutcome::Ready
    } else if ret == 0 {
        slice_outcome(remaining)
    } else {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return WaitOutcome::Ready;
        }
        log::debug!("poll on {} capture handles failed: {err}", pollfds.len());
        WaitOutcome::Failed
    }
}

#[cfg(windows)]
pub(crate) fn wait_for_data(_handles: &[WaitHandle], remaining: Option<Duration>) -> WaitOutcome {
    // The capture bindings expose no waitable event handle here, so the
    // loop degrades to bounded sleep slices between non-blocking sweeps.
    let slice = match remaining {
        Some(r) => r.min(WAIT_SLICE),
        None => WAIT_SLICE,
    };
    std::thread::sleep(slice);
    slice_outcome(remaining)
}

#[cfg(unix)]
fn ceil_millis(duration: Duration) -> libc::c_int {
    let mut ms = duration.as_millis();
    if Duration::from_millis(ms as u64) < duration {
        ms += 1;
    }
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}
