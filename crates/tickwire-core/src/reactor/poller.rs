//! Level-triggered readiness backend built on `poll(2)`.
//!
//! The poll set is rebuilt from the enabled descriptor subscriptions on every
//! tick, so enabling, disabling and cancelling never need a registration call
//! into the kernel.  Error and hangup conditions are reported as readiness:
//! the callback's next read or write surfaces the actual failure.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::subscription::{Interest, SubscriptionId};

/// One descriptor the current tick waits on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Watch {
    pub(crate) id: SubscriptionId,
    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
}

/// Blocks until at least one watch is ready or `timeout` elapses
/// (`None` = wait indefinitely) and returns the ready subscriptions in the
/// order of `watches`.
///
/// An interrupted wait (`EINTR`) is reported as an empty result.
pub(crate) fn wait(watches: &[Watch], timeout: Option<Duration>) -> io::Result<Vec<SubscriptionId>> {
    let mut fds: Vec<libc::pollfd> = watches
        .iter()
        .map(|w| libc::pollfd {
            fd: w.fd,
            events: match w.interest {
                Interest::Readable => libc::POLLIN,
                Interest::Writable => libc::POLLOUT,
            },
            revents: 0,
        })
        .collect();

    // SAFETY: `fds` is a live, exclusively borrowed buffer of `fds.len()`
    // initialised `pollfd` structs for the whole duration of the call.
    let rc = unsafe {
        libc::poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            timeout_millis(timeout),
        )
    };

    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }

    Ok(fds
        .iter()
        .zip(watches)
        .filter(|(pfd, _)| pfd.revents != 0)
        .map(|(_, w)| w.id)
        .collect())
}

/// Converts a timeout to `poll(2)` milliseconds, rounding up so the loop
/// never wakes before a deadline and spins.
fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
