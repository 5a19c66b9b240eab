// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The connection object.
//!
//! A [`Connection`] is a single-owner value: the caller serializes all
//! operations on it, the library takes no locks. Setup operations are legal
//! only before [`Connection::start`]; afterwards the connection is driven by
//! the readiness loop entry points in [`process`](Connection::process),
//! [`wait`](Connection::wait) and [`flush`](Connection::flush).
//!
//! A connection does not survive `fork()`: every entry point compares the
//! owning process id and fails with [`Error::ChildProcess`] on mismatch.

mod process;
mod state;

pub use process::Processed;
pub use state::ConnState;

use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::address::{AddressCursor, Endpoint};
use crate::config::{
    DEFAULT_CALL_TIMEOUT, RUNTIME_DIR_ENV, SESSION_BUS_ADDRESS_ENV, SYSTEM_BUS_ADDRESS_ENV,
    SYSTEM_BUS_DEFAULT_ADDRESS, WQUEUE_MAX,
};
use crate::error::{Error, Result};
use crate::filter::{FilterChain, FilterId};
use crate::id::ServerId;
use crate::matches::{MatchId, MatchRegistry, MatchRule};
use crate::message::{BusError, Message, MessageType, Value};
use crate::names::service_name_is_valid;
use crate::object::vtable::{EnumeratorHandler, FindHandler, Vtable};
use crate::object::{dispatch, ObjectTree, SlotId};
use crate::reply::ReplyTracker;
use crate::transport::stream::{ClientOptions, StreamTransport};
use crate::transport::{Transport, WriteStatus};

/// Callback invoked for inbound messages: filters, matches, replies, object
/// callbacks and vtable methods all share this shape.
///
/// `Ok(false)` passes the message to the next stage, `Ok(true)` consumes it,
/// `Err(_)` aborts the dispatch step.
pub type MessageHandler = Rc<dyn Fn(&mut Connection, &mut Message) -> Result<bool>>;

// ============================================================================
// Call timeouts
// ============================================================================

/// Deadline policy for a method call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallTimeout {
    /// Apply the library-wide default.
    Default,
    /// Wait forever; the tracker never expires the call.
    Never,
    /// Expire after this long. A zero duration means [`CallTimeout::Default`].
    After(Duration),
}

impl CallTimeout {
    pub(crate) fn deadline(self, now: Instant) -> Option<Instant> {
        match self {
            CallTimeout::Default => Some(now + DEFAULT_CALL_TIMEOUT),
            CallTimeout::Never => None,
            CallTimeout::After(d) if d.is_zero() => Some(now + DEFAULT_CALL_TIMEOUT),
            CallTimeout::After(d) => Some(now + d),
        }
    }
}

impl From<Duration> for CallTimeout {
    fn from(d: Duration) -> CallTimeout {
        CallTimeout::After(d)
    }
}

// ============================================================================
// Credential attach flags
// ============================================================================

/// Peer credential categories negotiated at connection setup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttachFlags(u32);

impl AttachFlags {
    pub const COMM: AttachFlags = AttachFlags(0x1);
    pub const EXE: AttachFlags = AttachFlags(0x2);
    pub const CMDLINE: AttachFlags = AttachFlags(0x4);
    pub const CGROUP: AttachFlags = AttachFlags(0x8);
    pub const CAPS: AttachFlags = AttachFlags(0x10);
    pub const SECLABEL: AttachFlags = AttachFlags(0x20);
    pub const AUDIT: AttachFlags = AttachFlags(0x40);

    pub fn empty() -> AttachFlags {
        AttachFlags(0)
    }

    pub fn contains(self, other: AttachFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AttachFlags {
    type Output = AttachFlags;

    fn bitor(self, rhs: AttachFlags) -> AttachFlags {
        AttachFlags(self.0 | rhs.0)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One live bus connection.
pub struct Connection {
    pub(crate) state: ConnState,
    pub(crate) transport: Option<Box<dyn Transport>>,

    // Endpoint configuration (setup phase).
    address: Option<AddressCursor>,
    direct_endpoint: Option<Endpoint>,
    preset_transport: Option<Box<dyn Transport>>,
    expected_server_id: Option<ServerId>,

    // Role flags.
    bus_client: bool,
    is_server: bool,
    server_id_config: ServerId,
    anonymous: bool,
    accept_fd: bool,
    attach_flags: AttachFlags,

    // Negotiated and learned state.
    pub(crate) can_fds: bool,
    unique_name: Option<String>,
    server_id: Option<ServerId>,
    pub(crate) hello_serial: Option<u64>,

    // Queues.
    pub(crate) rqueue: VecDeque<Message>,
    pub(crate) wqueue: VecDeque<Message>,
    /// Bytes of the wqueue head already written (stream transports).
    pub(crate) windex: usize,

    // Engine state.
    serial: u64,
    pub(crate) replies: ReplyTracker,
    pub(crate) filters: FilterChain,
    pub(crate) matches: MatchRegistry,
    pub(crate) objects: ObjectTree,
    pub(crate) iteration: u64,
    pub(crate) processing: bool,
    pub(crate) auth_deadline: Option<Instant>,

    last_connect_error: Option<Error>,
    owner_pid: u32,
}

impl Default for Connection {
    fn default() -> Self {
        Connection::new()
    }
}

impl Connection {
    /// A fresh connection in the unset state.
    pub fn new() -> Connection {
        Connection {
            state: ConnState::Unset,
            transport: None,
            address: None,
            direct_endpoint: None,
            preset_transport: None,
            expected_server_id: None,
            bus_client: false,
            is_server: false,
            server_id_config: ServerId::NULL,
            anonymous: false,
            accept_fd: true,
            attach_flags: AttachFlags::empty(),
            can_fds: false,
            unique_name: None,
            server_id: None,
            hello_serial: None,
            rqueue: VecDeque::new(),
            wqueue: VecDeque::new(),
            windex: 0,
            serial: 0,
            replies: ReplyTracker::new(),
            filters: FilterChain::new(),
            matches: MatchRegistry::new(),
            objects: ObjectTree::new(),
            iteration: 0,
            processing: false,
            auth_deadline: None,
            last_connect_error: None,
            owner_pid: std::process::id(),
        }
    }

    /// Connect to the system bus: `$DBUS_SYSTEM_BUS_ADDRESS`, else the
    /// well-known socket.
    pub fn open_system() -> Result<Connection> {
        let mut conn = Connection::new();
        let address = std::env::var(SYSTEM_BUS_ADDRESS_ENV)
            .unwrap_or_else(|_| SYSTEM_BUS_DEFAULT_ADDRESS.to_string());
        conn.set_address(&address)?;
        conn.set_bus_client(true)?;
        conn.start()?;
        Ok(conn)
    }

    /// Connect to the user bus: `$DBUS_SESSION_BUS_ADDRESS`, else the socket
    /// under `$XDG_RUNTIME_DIR`.
    pub fn open_user() -> Result<Connection> {
        let mut conn = Connection::new();
        match std::env::var(SESSION_BUS_ADDRESS_ENV) {
            Ok(address) => conn.set_address(&address)?,
            Err(_) => {
                let runtime_dir = std::env::var(RUNTIME_DIR_ENV)
                    .map_err(|_| Error::NoSuchFile("user runtime directory".into()))?;
                conn.set_address(&format!("unix:path={}/bus", runtime_dir))?;
            }
        }
        conn.set_bus_client(true)?;
        conn.start()?;
        Ok(conn)
    }

    // ========================================================================
    // Guards
    // ========================================================================

    pub(crate) fn pid_guard(&self) -> Result<()> {
        if self.owner_pid != std::process::id() {
            return Err(Error::ChildProcess);
        }
        Ok(())
    }

    fn setup_guard(&self) -> Result<()> {
        self.pid_guard()?;
        if self.state != ConnState::Unset {
            return Err(Error::PermissionDenied("setup after start"));
        }
        Ok(())
    }

    // ========================================================================
    // Setup operations (unset state only)
    // ========================================================================

    /// Configure the endpoint list to connect to.
    pub fn set_address(&mut self, address: &str) -> Result<()> {
        self.setup_guard()?;
        self.address = Some(AddressCursor::new(address));
        Ok(())
    }

    /// Configure a process to spawn and speak to over its stdio.
    pub fn set_exec(&mut self, path: &str, argv: Vec<String>) -> Result<()> {
        self.setup_guard()?;
        if path.is_empty() || argv.is_empty() {
            return Err(Error::InvalidArgument("exec path and argv required".into()));
        }
        self.direct_endpoint = Some(Endpoint::Exec {
            path: path.to_string(),
            argv,
        });
        Ok(())
    }

    /// Inject a ready-made transport (preopened descriptors, a kernel
    /// transport, or an in-process pair).
    pub fn set_transport(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        self.setup_guard()?;
        self.preset_transport = Some(transport);
        Ok(())
    }

    /// Whether this connection talks to a broker (and greets it with Hello).
    pub fn set_bus_client(&mut self, bus_client: bool) -> Result<()> {
        self.setup_guard()?;
        self.bus_client = bus_client;
        Ok(())
    }

    /// Take the server role in a peer-to-peer handshake.
    pub fn set_server(&mut self, is_server: bool, server_id: ServerId) -> Result<()> {
        self.setup_guard()?;
        if !is_server && !server_id.is_null() {
            return Err(Error::InvalidArgument(
                "server id given without server role".into(),
            ));
        }
        self.is_server = is_server;
        self.server_id_config = server_id;
        Ok(())
    }

    /// Allow anonymous peers (server) or authenticate anonymously (client).
    pub fn set_anonymous(&mut self, anonymous: bool) -> Result<()> {
        self.setup_guard()?;
        self.anonymous = anonymous;
        Ok(())
    }

    /// Negotiate fd passing during the handshake. Defaults to on.
    pub fn negotiate_fds(&mut self, enable: bool) -> Result<()> {
        self.setup_guard()?;
        self.accept_fd = enable;
        Ok(())
    }

    /// Ask the peer to attach the given credential categories.
    pub fn negotiate_attach(&mut self, flags: AttachFlags, enable: bool) -> Result<()> {
        self.setup_guard()?;
        if enable {
            self.attach_flags = self.attach_flags | flags;
        } else {
            self.attach_flags = AttachFlags(self.attach_flags.0 & !flags.0);
        }
        Ok(())
    }

    /// The negotiated attach flags.
    pub fn attach_flags(&self) -> AttachFlags {
        self.attach_flags
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Leave the unset state and begin connecting.
    pub fn start(&mut self) -> Result<()> {
        self.pid_guard()?;
        if self.state != ConnState::Unset {
            return Err(Error::PermissionDenied("started twice"));
        }
        if self.is_server && self.bus_client {
            return Err(Error::InvalidArgument(
                "bus-client and server roles are exclusive".into(),
            ));
        }

        self.state = ConnState::Opening;

        if let Some(transport) = self.preset_transport.take() {
            self.transport = Some(transport);
        } else if self.direct_endpoint.is_some() || self.address.is_some() {
            self.connect_next_endpoint()?;
        } else {
            return Err(Error::InvalidArgument("no endpoint configured".into()));
        }

        log::debug!("[bus] starting, state {}", self.state);
        self.queue_hello()
    }

    /// Try endpoints until one begins connecting; on exhaustion, the most
    /// recent connect error (or connection-refused) surfaces.
    pub(crate) fn connect_next_endpoint(&mut self) -> Result<()> {
        let options = ClientOptions {
            anonymous: self.anonymous,
            negotiate_fds: self.accept_fd,
        };

        if let Some(endpoint) = self.direct_endpoint.take() {
            match StreamTransport::connect(&endpoint, options) {
                Ok(t) => {
                    self.transport = Some(Box::new(t));
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("[bus] direct endpoint failed: {}", e);
                    self.last_connect_error = Some(e);
                }
            }
        }

        loop {
            let parsed = match self.address.as_mut() {
                Some(cursor) => cursor.next()?,
                None => None,
            };
            let Some(parsed) = parsed else {
                return Err(self.take_connect_error());
            };

            if self.expected_server_id.is_none() {
                self.expected_server_id = parsed.guid;
            }

            match StreamTransport::connect(&parsed.endpoint, options) {
                Ok(t) => {
                    self.transport = Some(Box::new(t));
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("[bus] endpoint failed, trying next: {}", e);
                    self.last_connect_error = Some(e);
                }
            }
        }
    }

    fn take_connect_error(&mut self) -> Error {
        self.last_connect_error.take().unwrap_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no endpoint could be connected",
            ))
        })
    }

    /// Queue the initial Hello call for bus clients on stream transports.
    fn queue_hello(&mut self) -> Result<()> {
        let atomic = self
            .transport
            .as_ref()
            .is_some_and(|t| t.atomic_delivery());
        if !self.bus_client || atomic {
            return Ok(());
        }

        let m = Message::method_call(
            Some(crate::config::BROKER_SERVICE),
            "/",
            Some(crate::config::BROKER_INTERFACE),
            "Hello",
        )?;

        let serial = self.call_async(
            m,
            CallTimeout::Default,
            Rc::new(|conn, reply| conn.hello_reply(reply)),
        )?;
        self.hello_serial = Some(serial);
        Ok(())
    }

    /// The Hello reply: a single string, the broker-assigned unique name.
    fn hello_reply(&mut self, reply: &mut Message) -> Result<bool> {
        if reply.message_type() == MessageType::MethodError {
            let detail = reply
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".into());
            return Err(Error::Protocol(format!("hello failed: {}", detail)));
        }

        reply.rewind();
        let name = reply
            .read_str()
            .ok_or_else(|| Error::Protocol("hello reply carries no name".into()))?;
        if !service_name_is_valid(name) || !name.starts_with(':') {
            return Err(Error::Protocol(format!("invalid unique name '{}'", name)));
        }

        self.unique_name = Some(name.to_string());
        self.state = ConnState::Running;
        log::debug!("[bus] hello complete, unique name {:?}", self.unique_name);
        Ok(true)
    }

    /// Leave the handshake once the transport authenticated.
    pub(crate) fn start_running(&mut self) -> Result<()> {
        let transport = self.transport.as_ref().ok_or(Error::NotConnected)?;

        // Pin the expected server identity, if one was configured.
        if let Some(id) = transport.server_id() {
            if let Some(expected) = self.expected_server_id {
                if id != expected {
                    return Err(Error::Protocol(format!(
                        "server identity mismatch: expected {}, got {}",
                        expected, id
                    )));
                }
            }
            self.server_id = Some(id);
        } else if self.is_server {
            self.server_id = Some(self.server_id_config);
        }

        self.can_fds = self.accept_fd && transport.supports_fds();

        let atomic = transport.atomic_delivery();
        self.state = if self.bus_client && !atomic {
            ConnState::Hello
        } else {
            ConnState::Running
        };
        log::debug!("[bus] handshake complete, state {}", self.state);
        Ok(())
    }

    /// Tear the connection down. Idempotent; safe in every state.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        if self.pid_guard().is_err() {
            // After a fork the descriptors belong to the parent.
            return;
        }

        log::debug!("[bus] closing (state {})", self.state);
        self.state = ConnState::Closed;
        if let Some(transport) = &mut self.transport {
            transport.close();
        }
    }

    /// Whether the connection accepts I/O entry points.
    pub fn is_open(&self) -> bool {
        self.pid_guard().is_ok() && self.state.is_open()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The broker-assigned unique name, once Hello completed.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    /// The server identity; drives the connection to running first.
    pub fn server_id(&mut self) -> Result<ServerId> {
        self.pid_guard()?;
        self.ensure_running()?;
        Ok(self.server_id.unwrap_or(ServerId::NULL))
    }

    /// Whether messages with attached fds can be sent; drives the
    /// connection to running to learn the negotiated answer.
    pub fn can_send_fds(&mut self) -> Result<bool> {
        self.pid_guard()?;
        if self.state == ConnState::Unset {
            return Err(Error::NotConnected);
        }
        if !self.accept_fd {
            return Ok(false);
        }
        self.ensure_running()?;
        Ok(self.can_fds)
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn seal_message(&mut self, m: &mut Message) -> Result<()> {
        if m.version() > crate::config::MESSAGE_VERSION {
            return Err(Error::PermissionDenied("message version too new"));
        }
        if m.is_sealed() {
            return Ok(());
        }

        self.serial += 1;
        m.seal(self.serial)
    }

    /// Seal and transmit (or queue) a message; returns its serial.
    ///
    /// When the connection is ready and the write queue is idle the message
    /// goes straight to the transport; a partial write parks it at the queue
    /// head with its progress. Otherwise it joins the queue tail, bounded by
    /// the configured maximum.
    pub fn send(&mut self, mut m: Message) -> Result<u64> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }

        if m.fd_count() > 0 {
            let fds_ok = self.accept_fd
                && self
                    .transport
                    .as_ref()
                    .is_some_and(|t| t.supports_fds());
            if !fds_ok {
                return Err(Error::NotSupported);
            }
        }

        self.seal_message(&mut m)?;
        let serial = m.serial();

        // Replies to callers that asked for none are quietly dropped.
        if m.dont_send() {
            return Ok(serial);
        }

        if self.state.is_ready() && self.wqueue.is_empty() {
            let mut idx = 0usize;
            let status = match self.transport.as_mut() {
                Some(t) => t.write_message(&m, &mut idx),
                None => Err(Error::NotConnected),
            };

            match status {
                Ok(WriteStatus::Complete) => return Ok(serial),
                Ok(_) => {
                    // The queue head slot is always available for parking
                    // partial progress.
                    self.wqueue.push_back(m);
                    self.windex = idx;
                }
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            }
        } else {
            if self.wqueue.len() >= WQUEUE_MAX {
                return Err(Error::NoBufferSpace);
            }
            self.wqueue.push_back(m);
        }

        Ok(serial)
    }

    /// Send a method call and register `callback` for its reply.
    ///
    /// The callback always receives a message eventually: the reply, the
    /// error reply, or a synthesized timeout error.
    pub fn call_async(
        &mut self,
        mut m: Message,
        timeout: CallTimeout,
        callback: MessageHandler,
    ) -> Result<u64> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }
        if m.message_type() != MessageType::MethodCall {
            return Err(Error::InvalidArgument("only method calls take replies".into()));
        }
        if m.no_reply_expected() {
            return Err(Error::InvalidArgument(
                "call is flagged no-reply-expected".into(),
            ));
        }

        self.seal_message(&mut m)?;
        let serial = m.serial();
        let deadline = timeout.deadline(Instant::now());

        self.replies.insert(serial, callback, deadline)?;
        if let Err(e) = self.send(m) {
            self.replies.cancel(serial);
            return Err(e);
        }
        Ok(serial)
    }

    /// Cancel a pending call by serial. Reports whether one was pending.
    pub fn cancel_call(&mut self, serial: u64) -> Result<bool> {
        self.pid_guard()?;
        if serial == 0 {
            return Err(Error::InvalidArgument("serial zero is reserved".into()));
        }
        Ok(self.replies.cancel(serial))
    }

    /// Emit a signal from `path`.
    pub fn emit_signal(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<u64> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }

        let mut m = Message::signal(path, interface, member)?;
        m.append_all(body)?;
        self.send(m)
    }

    /// Emit PropertiesChanged for the named properties of `interface` at
    /// `path`. Every name must exist there and carry the emits-change flag;
    /// invalidate-only properties travel in the invalidated list.
    pub fn emit_properties_changed(
        &mut self,
        path: &str,
        interface: &str,
        names: &[&str],
    ) -> Result<()> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }
        dispatch::emit_properties_changed(self, path, interface, names)
    }

    /// Reserved by the object-manager interface; not provided.
    pub fn emit_interfaces_added(&mut self, _path: &str, _interfaces: &[&str]) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Reserved by the object-manager interface; not provided.
    pub fn emit_interfaces_removed(&mut self, _path: &str, _interfaces: &[&str]) -> Result<()> {
        Err(Error::NotSupported)
    }

    // ========================================================================
    // Replying
    // ========================================================================

    /// Reply successfully to `call` with `body`. Suppressed when the caller
    /// asked for no reply.
    pub fn reply_method_return(&mut self, call: &Message, body: Vec<Value>) -> Result<()> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }
        if call.no_reply_expected() {
            return Ok(());
        }

        let mut m = Message::method_return(call)?;
        m.append_all(body)?;
        self.send(m)?;
        Ok(())
    }

    /// Reply to `call` with a named error. Suppressed when the caller asked
    /// for no reply.
    pub fn reply_method_error(&mut self, call: &Message, error: BusError) -> Result<()> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }
        if call.no_reply_expected() {
            return Ok(());
        }

        let m = Message::method_error(call, error)?;
        self.send(m)?;
        Ok(())
    }

    pub(crate) fn reply_error_parts(
        &mut self,
        call: &Message,
        name: &str,
        message: String,
    ) -> Result<()> {
        self.reply_method_error(call, BusError::new(name, message))
    }

    /// Send a fully built reply, honoring reply suppression.
    pub(crate) fn send_reply(&mut self, m: Message) -> Result<()> {
        self.send(m).map(|_| ())
    }

    // ========================================================================
    // Filters and matches
    // ========================================================================

    /// Register a filter; it sees every inbound message from the next one on.
    pub fn add_filter(&mut self, callback: MessageHandler) -> Result<FilterId> {
        self.pid_guard()?;
        Ok(self.filters.add(callback, self.iteration))
    }

    pub fn remove_filter(&mut self, id: FilterId) -> Result<bool> {
        self.pid_guard()?;
        Ok(self.filters.remove(id))
    }

    /// Subscribe a callback to the traffic selected by `rule`.
    pub fn add_match(&mut self, rule: MatchRule, callback: MessageHandler) -> Result<MatchId> {
        self.pid_guard()?;
        Ok(self.matches.add(rule, callback, self.iteration))
    }

    pub fn remove_match(&mut self, id: MatchId) -> Result<bool> {
        self.pid_guard()?;
        Ok(self.matches.remove(id))
    }

    // ========================================================================
    // Object tree registration
    // ========================================================================

    /// Attach a plain callback at `path`; it sees every message addressed
    /// there.
    pub fn add_object(&mut self, path: &str, callback: MessageHandler) -> Result<SlotId> {
        self.pid_guard()?;
        self.objects
            .add_callback(path, callback, false, self.iteration)
    }

    /// Attach a callback serving the whole subtree below `prefix`.
    pub fn add_fallback(&mut self, prefix: &str, callback: MessageHandler) -> Result<SlotId> {
        self.pid_guard()?;
        self.objects
            .add_callback(prefix, callback, true, self.iteration)
    }

    /// Remove a plain or fallback callback by its slot handle.
    pub fn remove_object(&mut self, path: &str, slot: SlotId) -> Result<bool> {
        self.pid_guard()?;
        self.objects.remove_callback(path, slot)
    }

    /// Expose `interface` at `path` through `vtable`.
    pub fn add_object_vtable(
        &mut self,
        path: &str,
        interface: &str,
        vtable: Vtable,
    ) -> Result<()> {
        self.pid_guard()?;
        self.objects.add_vtable(path, interface, vtable, false, None)
    }

    /// Expose `interface` for every path below `prefix`. The optional `find`
    /// hook decides which concrete paths exist.
    pub fn add_fallback_vtable(
        &mut self,
        prefix: &str,
        interface: &str,
        vtable: Vtable,
        find: Option<FindHandler>,
    ) -> Result<()> {
        self.pid_guard()?;
        self.objects.add_vtable(prefix, interface, vtable, true, find)
    }

    /// Remove an interface vtable. The second removal reports no change.
    pub fn remove_object_vtable(&mut self, path: &str, interface: &str) -> Result<bool> {
        self.pid_guard()?;
        self.objects.remove_vtable(path, interface, false)
    }

    pub fn remove_fallback_vtable(&mut self, prefix: &str, interface: &str) -> Result<bool> {
        self.pid_guard()?;
        self.objects.remove_vtable(prefix, interface, true)
    }

    /// Register a producer of dynamic child paths below `path`.
    pub fn add_node_enumerator(
        &mut self,
        path: &str,
        callback: EnumeratorHandler,
    ) -> Result<SlotId> {
        self.pid_guard()?;
        self.objects.add_enumerator(path, callback)
    }

    pub fn remove_node_enumerator(&mut self, path: &str, slot: SlotId) -> Result<bool> {
        self.pid_guard()?;
        self.objects.remove_enumerator(path, slot)
    }

    /// Serve GetManagedObjects for the subtree rooted at `path`.
    pub fn add_object_manager(&mut self, path: &str) -> Result<()> {
        self.pid_guard()?;
        self.objects.add_object_manager(path)
    }

    pub fn remove_object_manager(&mut self, path: &str) -> Result<bool> {
        self.pid_guard()?;
        self.objects.remove_object_manager(path)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
