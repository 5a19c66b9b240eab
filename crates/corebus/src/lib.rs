// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # corebus - message-oriented IPC bus connection engine
//!
//! A client/server library for a message-oriented IPC bus: applications open
//! a [`Connection`] to a broker or a peer, send typed [`Message`]s (method
//! calls, replies, errors, signals), register local objects exposing
//! interfaces with methods, properties, signals and introspection, and react
//! to incoming traffic via filters, matches and object callbacks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use corebus::{CallTimeout, Connection, Message, Value};
//!
//! fn main() -> corebus::Result<()> {
//!     let mut bus = Connection::open_system()?;
//!
//!     let mut call = Message::method_call(
//!         Some("org.freedesktop.hostname1"),
//!         "/org/freedesktop/hostname1",
//!         Some("org.freedesktop.DBus.Properties"),
//!         "Get",
//!     )?;
//!     call.append(Value::string("org.freedesktop.hostname1"))?;
//!     call.append(Value::string("Hostname"))?;
//!
//!     let mut reply = bus.call(call, CallTimeout::Default)?;
//!     println!("hostname: {:?}", reply.read());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |     Connection -> send / call / call_async / emit_signal           |
//! |     add_filter / add_match / add_object_vtable / enumerators       |
//! +--------------------------------------------------------------------+
//! |                         Engine Layer                               |
//! |  state machine | rqueue/wqueue | reply tracker | dispatch pipeline |
//! |  hello -> replies -> filters -> matches -> Peer -> object tree     |
//! +--------------------------------------------------------------------+
//! |                        Transport Layer                             |
//! |    unix path/abstract | tcp | spawned process | in-process pair    |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Integrating with an event loop
//!
//! The engine never blocks on its own: poll [`Connection::fd`] for
//! [`Connection::events`] with the deadline from [`Connection::timeout`],
//! then call [`Connection::process`] until it reports
//! [`Processed::Idle`](connection::Processed). The only blocking entry
//! points are [`Connection::wait`], [`Connection::flush`] and the
//! synchronous [`Connection::call`].
//!
//! A connection is a single-owner object: one thread drives it at a time,
//! and it does not survive `fork()`.

/// Bus address parsing (`unix:`, `tcp:`, `unixexec:`, `kernel:`).
pub mod address;
pub(crate) mod builtin;
/// Tunables and protocol constants.
pub mod config;
/// The connection object and its engine.
pub mod connection;
mod error;
/// Ordered message filters.
pub mod filter;
/// 128-bit identities and the machine id.
pub mod id;
/// Match rules and their registry.
pub mod matches;
/// Typed messages and body values.
pub mod message;
/// Name and signature validation.
pub mod names;
/// The server-side object tree.
pub mod object;
pub(crate) mod reply;
/// Transport contract and the provided transports.
pub mod transport;

pub use address::{Endpoint, TcpFamily};
pub use connection::{
    AttachFlags, CallTimeout, ConnState, Connection, MessageHandler, Processed,
};
pub use error::{Error, Result};
pub use filter::FilterId;
pub use id::ServerId;
pub use matches::{MatchId, MatchRule};
pub use message::{BusError, Message, MessageFlags, MessageType, Value};
pub use object::vtable::{
    EnumeratorHandler, FindHandler, PropertyContext, PropertyGetter, PropertySetter, Vtable,
    VtableBuilder, VtableFlags,
};
pub use object::SlotId;
pub use transport::{Events, Transport, WriteStatus};
