// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global tunables and protocol constants - single source of truth.
//!
//! Every queue bound, timeout and well-known path used by the engine lives
//! here. **Never hardcode these elsewhere!**

use std::time::Duration;

// =======================================================================
// Queue bounds
// =======================================================================

/// Maximum number of outgoing messages queued on a connection.
///
/// The write queue is the worst-case buffer; the socket buffer is the
/// primary one. Exceeding this yields a no-buffer-space error.
pub const WQUEUE_MAX: usize = 1024;

/// Maximum number of incoming messages queued awaiting dispatch.
///
/// Only the synchronous call path accumulates here; ordinary processing
/// drains one message at a time.
pub const RQUEUE_MAX: usize = 64 * 1024;

/// Maximum encoded size of a single message accepted from a stream.
pub const MESSAGE_SIZE_MAX: usize = 16 * 1024 * 1024;

// =======================================================================
// Timeouts
// =======================================================================

/// Default deadline applied to method calls that pass a zero timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// Deadline for the authentication handshake after the transport connects.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(90);

// =======================================================================
// Address grammar
// =======================================================================

/// Highest `argvN` index accepted in a `unixexec:` endpoint.
pub const EXEC_ARGV_MAX: usize = 256;

// =======================================================================
// Well-known endpoints
// =======================================================================

/// Default system bus socket, used when [`SYSTEM_BUS_ADDRESS_ENV`] is unset.
pub const SYSTEM_BUS_DEFAULT_ADDRESS: &str = "unix:path=/run/dbus/system_bus_socket";

/// Environment variable overriding the system bus address.
pub const SYSTEM_BUS_ADDRESS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";

/// Environment variable carrying the user bus address.
pub const SESSION_BUS_ADDRESS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";

/// Environment variable locating the per-user runtime directory; the user
/// bus socket is `$XDG_RUNTIME_DIR/bus`.
pub const RUNTIME_DIR_ENV: &str = "XDG_RUNTIME_DIR";

// =======================================================================
// Wire protocol
// =======================================================================

/// Highest message version this engine seals and accepts.
pub const MESSAGE_VERSION: u8 = 1;

/// Well-known name of the broker itself.
pub const BROKER_SERVICE: &str = "org.freedesktop.DBus";

/// Interface hosting the broker's Hello call.
pub const BROKER_INTERFACE: &str = "org.freedesktop.DBus";
