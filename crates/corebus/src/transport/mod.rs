// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport contract and readiness plumbing.
//!
//! The connection engine never touches sockets directly; it drives a
//! [`Transport`] one non-blocking step at a time. Two implementations ship
//! with the crate: [`stream::StreamTransport`] for unix/tcp/exec stream
//! sockets and [`mem::pair`] for in-process endpoints with atomic delivery
//! (the kernel-delivery analog, also used throughout the tests).

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::id::ServerId;
use crate::message::Message;

pub mod frame;
pub mod mem;
pub mod stream;

// ============================================================================
// Readiness events
// ============================================================================

/// The poll interest a caller should wait for on behalf of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Events {
    pub readable: bool,
    pub writable: bool,
}

impl Events {
    pub fn none() -> Events {
        Events::default()
    }

    pub fn readable() -> Events {
        Events {
            readable: true,
            writable: false,
        }
    }

    pub fn writable() -> Events {
        Events {
            readable: false,
            writable: true,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }
}

// ============================================================================
// Write outcome
// ============================================================================

/// Result of one non-blocking write attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// Nothing could be written; wait for write readiness.
    Blocked,
    /// Some bytes went out, the message is not complete yet.
    Partial,
    /// The message is fully transmitted.
    Complete,
}

// ============================================================================
// Transport contract
// ============================================================================

/// One bus transport: connect/auth progression plus message-granular I/O.
///
/// Every method is non-blocking: it makes progress or reports that it could
/// not, and the connection decides what readiness to wait for.
pub trait Transport {
    /// Advance a connect in progress. `Ok(true)` once the endpoint is
    /// connected and authentication may begin.
    fn continue_connect(&mut self) -> Result<bool>;

    /// Advance the authentication handshake. `Ok(true)` once complete.
    fn continue_auth(&mut self) -> Result<bool>;

    /// Whether the auth handshake has bytes waiting to be written.
    fn auth_needs_write(&self) -> bool;

    /// Try to read one fully-assembled message. `Ok(None)` means would-block.
    fn read_message(&mut self) -> Result<Option<Message>>;

    /// Try to write `message`, resuming from `*windex` bytes already sent.
    /// Updates `*windex`; atomic transports ignore it and never report
    /// [`WriteStatus::Partial`].
    fn write_message(&mut self, message: &Message, windex: &mut usize) -> Result<WriteStatus>;

    /// Whether messages are delivered whole-or-not-at-all.
    fn atomic_delivery(&self) -> bool;

    /// Whether fd passing was negotiated.
    fn supports_fds(&self) -> bool;

    /// Descriptor to poll for reads, if the transport is fd-backed.
    fn input_fd(&self) -> Option<RawFd>;

    /// Descriptor to poll for writes, if the transport is fd-backed.
    fn output_fd(&self) -> Option<RawFd>;

    /// The peer identity learned during the handshake, if any.
    fn server_id(&self) -> Option<ServerId>;

    /// Tear the transport down. Idempotent.
    fn close(&mut self);
}

// ============================================================================
// Readiness waiting
// ============================================================================

/// Block on `input`/`output` readiness until `deadline`, retrying on EINTR.
///
/// Returns `Ok(true)` when at least one descriptor is ready, `Ok(false)` on
/// timeout. Transports without descriptors sleep toward the deadline in
/// short slices instead (there is nothing to poll).
pub(crate) fn wait_readiness(
    input: Option<RawFd>,
    output: Option<RawFd>,
    events: Events,
    deadline: Option<Instant>,
) -> std::io::Result<bool> {
    let (input, output) = match (input, output) {
        (Some(i), Some(o)) => (i, o),
        _ => {
            // Fd-less transport: nothing to poll, pace the caller's loop.
            let slice = Duration::from_millis(1);
            let nap = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()).min(slice),
                None => slice,
            };
            std::thread::sleep(nap);
            return Ok(true);
        }
    };

    platform::poll_fds(input, output, events, deadline)
}

mod platform {
    use std::io;
    use std::os::fd::RawFd;
    use std::time::Instant;

    use super::Events;

    pub fn poll_fds(
        input: RawFd,
        output: RawFd,
        events: Events,
        deadline: Option<Instant>,
    ) -> io::Result<bool> {
        let mut fds = [
            libc::pollfd {
                fd: input,
                events: 0,
                revents: 0,
            },
            libc::pollfd {
                fd: output,
                events: 0,
                revents: 0,
            },
        ];

        let n: libc::nfds_t;
        if input == output {
            if events.readable {
                fds[0].events |= libc::POLLIN;
            }
            if events.writable {
                fds[0].events |= libc::POLLOUT;
            }
            n = 1;
        } else {
            if events.readable {
                fds[0].events |= libc::POLLIN;
            }
            if events.writable {
                fds[1].events |= libc::POLLOUT;
            }
            n = 2;
        }

        loop {
            let timeout_ms: libc::c_int = match deadline {
                None => -1,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    // Round up so we never spin on a sub-millisecond rest.
                    left.as_millis()
                        .saturating_add(u128::from(left.subsec_nanos() % 1_000_000 != 0))
                        .try_into()
                        .unwrap_or(libc::c_int::MAX)
                }
            };

            // SAFETY: fds points at our stack array, n is within bounds.
            let r = unsafe { libc::poll(fds.as_mut_ptr(), n, timeout_ms) };
            if r < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(r > 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_constructors() {
        assert!(Events::none().is_empty());
        assert!(Events::readable().readable);
        assert!(!Events::readable().writable);
        assert!(Events::writable().writable);
    }

    #[test]
    fn test_fdless_wait_naps_one_slice() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let start = Instant::now();
        wait_readiness(None, None, Events::readable(), Some(deadline)).unwrap();
        // One call naps a short slice so the caller's loop stays responsive;
        // it must not sleep out the whole deadline.
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
