// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The non-blocking engine: `process`, `wait`, `flush` and the synchronous
//! call path.
//!
//! `process` advances the connection by exactly one step. While handshaking
//! that means one transport step; once running it expires at most one
//! pending call, pushes the write queue, pulls one inbound message and runs
//! it through the dispatch pipeline:
//!
//! ```text
//! hello gate -> reply tracker -> filters -> matches -> Peer built-in -> object tree
//! ```
//!
//! Only `wait`, `flush` and `call` block, and only through the readiness
//! poll. Everything else returns `Idle` when it cannot make progress.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::builtin::process_builtin;
use crate::config::{AUTH_TIMEOUT, RQUEUE_MAX};
use crate::error::{Error, Result};
use crate::message::{BusError, Message, MessageType};
use crate::object::dispatch::process_object;
use crate::transport::{wait_readiness, Events, WriteStatus};

use super::{CallTimeout, ConnState, Connection};

/// Outcome of one [`Connection::process`] step.
#[derive(Debug)]
pub enum Processed {
    /// Nothing to do; block on readiness before calling again.
    Idle,
    /// Work was done; call again.
    Progress,
    /// Work was done and this message was not claimed by any dispatch
    /// stage; the caller owns it now.
    Message(Message),
}

impl Processed {
    /// Whether the step did any work.
    pub fn progressed(&self) -> bool {
        !matches!(self, Processed::Idle)
    }
}

impl Connection {
    // ========================================================================
    // Readiness accessors
    // ========================================================================

    /// The descriptor to poll, when input and output coincide.
    pub fn fd(&self) -> Result<RawFd> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }

        let transport = self.transport.as_ref().ok_or(Error::NotConnected)?;
        match (transport.input_fd(), transport.output_fd()) {
            (Some(input), Some(output)) if input == output => Ok(input),
            _ => Err(Error::PermissionDenied(
                "input and output descriptors differ",
            )),
        }
    }

    /// The poll interest appropriate for the current state.
    pub fn events(&self) -> Result<Events> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }

        let mut events = Events::none();
        match self.state {
            ConnState::Opening => events.writable = true,
            ConnState::Authenticating => {
                events.readable = true;
                events.writable = self
                    .transport
                    .as_ref()
                    .is_some_and(|t| t.auth_needs_write());
            }
            ConnState::Hello | ConnState::Running => {
                events.readable = self.rqueue.is_empty();
                events.writable = !self.wqueue.is_empty();
            }
            ConnState::Unset | ConnState::Closed => {}
        }
        Ok(events)
    }

    /// The absolute deadline the caller should wake at, if any: the auth
    /// timeout while handshaking, else the earliest pending-call deadline.
    pub fn timeout(&self) -> Result<Option<Instant>> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }

        match self.state {
            ConnState::Authenticating => Ok(self.auth_deadline),
            ConnState::Hello | ConnState::Running => Ok(self.replies.next_deadline()),
            _ => Ok(None),
        }
    }

    // ========================================================================
    // process
    // ========================================================================

    /// Advance the connection by one step. Unclaimed method calls are
    /// answered with `UnknownObject`; other unclaimed messages are dropped.
    pub fn process(&mut self) -> Result<Processed> {
        self.process_internal(false)
    }

    /// Like [`Connection::process`], but unclaimed messages are handed back
    /// as [`Processed::Message`] instead of being answered or dropped.
    pub fn process_take(&mut self) -> Result<Processed> {
        self.process_internal(true)
    }

    fn process_internal(&mut self, take: bool) -> Result<Processed> {
        self.pid_guard()?;
        if self.processing {
            return Err(Error::Busy);
        }

        match self.state {
            ConnState::Unset | ConnState::Closed => Err(Error::NotConnected),
            ConnState::Opening => self.step_opening(),
            ConnState::Authenticating => self.step_authenticating(),
            ConnState::Hello | ConnState::Running => {
                self.processing = true;
                let result = self.process_running(take);
                self.processing = false;

                // Wire violations and transport failures are fatal.
                if matches!(&result, Err(Error::Protocol(_)) | Err(Error::Io(_))) {
                    self.close();
                }
                result
            }
        }
    }

    fn step_opening(&mut self) -> Result<Processed> {
        let step = match self.transport.as_mut() {
            Some(t) => t.continue_connect(),
            None => return Err(Error::NotConnected),
        };

        match step {
            Ok(false) => Ok(Processed::Idle),
            Ok(true) => {
                self.auth_deadline = Some(Instant::now() + AUTH_TIMEOUT);
                self.state = ConnState::Authenticating;
                Ok(Processed::Progress)
            }
            Err(e) => {
                // This endpoint is dead; move the cursor along.
                log::debug!("[bus] connect failed: {}", e);
                self.last_connect_error = Some(e);
                self.transport = None;
                match self.connect_next_endpoint() {
                    Ok(()) => Ok(Processed::Progress),
                    Err(e) => {
                        self.close();
                        Err(e)
                    }
                }
            }
        }
    }

    fn step_authenticating(&mut self) -> Result<Processed> {
        if let Some(deadline) = self.auth_deadline {
            if Instant::now() >= deadline {
                self.close();
                return Err(Error::TimedOut);
            }
        }

        let step = match self.transport.as_mut() {
            Some(t) => t.continue_auth(),
            None => return Err(Error::NotConnected),
        };

        match step {
            Ok(false) => Ok(Processed::Idle),
            Ok(true) => {
                if let Err(e) = self.start_running() {
                    self.close();
                    return Err(e);
                }
                Ok(Processed::Progress)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn process_running(&mut self, take: bool) -> Result<Processed> {
        if self.process_timeout()? {
            return Ok(Processed::Progress);
        }

        if self.dispatch_wqueue()? {
            return Ok(Processed::Progress);
        }

        let Some(mut m) = self.dispatch_rqueue()? else {
            return Ok(Processed::Idle);
        };

        self.iteration += 1;
        if self.process_message(&mut m)? {
            return Ok(Processed::Progress);
        }

        if take {
            m.rewind();
            return Ok(Processed::Message(m));
        }

        if m.message_type() == MessageType::MethodCall {
            self.reply_error_parts(
                &m,
                "org.freedesktop.DBus.Error.UnknownObject",
                format!("Unknown object '{}'.", m.path().unwrap_or("")),
            )?;
        }
        Ok(Processed::Progress)
    }

    /// Expire at most one pending call, synthesizing its timeout error.
    fn process_timeout(&mut self) -> Result<bool> {
        let Some(pending) = self.replies.take_expired(Instant::now()) else {
            return Ok(false);
        };

        log::debug!("[bus] call {} timed out", pending.serial);
        let mut m = Message::synthetic_error(
            pending.serial,
            BusError::new("org.freedesktop.DBus.Error.Timeout", "Timed out"),
        );
        (pending.callback)(self, &mut m)?;
        Ok(true)
    }

    // ========================================================================
    // Queue dispatch
    // ========================================================================

    /// Push queued messages to the transport. `Ok(true)` when at least one
    /// message was fully transmitted.
    pub(crate) fn dispatch_wqueue(&mut self) -> Result<bool> {
        let mut progress = false;

        loop {
            let status = {
                let Some(head) = self.wqueue.front() else { break };
                let Some(t) = self.transport.as_mut() else {
                    return Err(Error::NotConnected);
                };
                t.write_message(head, &mut self.windex)
            };

            match status {
                Ok(WriteStatus::Complete) => {
                    self.wqueue.pop_front();
                    self.windex = 0;
                    progress = true;
                }
                Ok(WriteStatus::Partial) | Ok(WriteStatus::Blocked) => break,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            }
        }

        Ok(progress)
    }

    /// Pull one inbound message: the queued backlog first, then the
    /// transport.
    fn dispatch_rqueue(&mut self) -> Result<Option<Message>> {
        if let Some(m) = self.rqueue.pop_front() {
            return Ok(Some(m));
        }
        self.read_transport()
    }

    fn read_transport(&mut self) -> Result<Option<Message>> {
        let result = match self.transport.as_mut() {
            Some(t) => t.read_message(),
            None => return Err(Error::NotConnected),
        };

        match result {
            Ok(m) => Ok(m),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    // ========================================================================
    // The dispatch pipeline
    // ========================================================================

    fn process_message(&mut self, m: &mut Message) -> Result<bool> {
        log::trace!(
            "[bus] dispatching {:?} path={:?} member={:?} serial={} reply={}",
            m.message_type(),
            m.path(),
            m.member(),
            m.serial(),
            m.reply_serial()
        );

        self.process_hello_gate(m)?;

        if self.process_reply(m)? {
            return Ok(true);
        }
        if self.process_filters(m)? {
            return Ok(true);
        }
        if self.process_matches(m)? {
            return Ok(true);
        }
        if process_builtin(self, m)? {
            return Ok(true);
        }
        process_object(self, m)
    }

    /// In the hello state nothing but the Hello reply may arrive. The gate
    /// never consumes the message; the ordinary reply path does.
    fn process_hello_gate(&mut self, m: &Message) -> Result<()> {
        if self.state != ConnState::Hello {
            return Ok(());
        }

        if !m.message_type().is_reply() {
            return Err(Error::Protocol(
                "non-reply traffic before the hello reply".into(),
            ));
        }
        if Some(m.reply_serial()) != self.hello_serial {
            return Err(Error::Protocol(format!(
                "reply serial {} does not match the hello call",
                m.reply_serial()
            )));
        }
        Ok(())
    }

    fn process_reply(&mut self, m: &mut Message) -> Result<bool> {
        if !m.message_type().is_reply() {
            return Ok(false);
        }
        let Some(pending) = self.replies.take(m.reply_serial()) else {
            return Ok(false);
        };

        m.rewind();
        (pending.callback)(self, m)
    }

    fn process_filters(&mut self, m: &mut Message) -> Result<bool> {
        loop {
            self.filters.modified = false;

            while let Some(callback) = self.filters.next_pending(self.iteration) {
                m.rewind();
                if callback(self, m)? {
                    return Ok(true);
                }
                if self.filters.modified {
                    break;
                }
            }

            if !self.filters.modified {
                return Ok(false);
            }
        }
    }

    fn process_matches(&mut self, m: &mut Message) -> Result<bool> {
        loop {
            self.matches.modified = false;

            while let Some(callback) = self.matches.next_pending(m, self.iteration) {
                m.rewind();
                if callback(self, m)? {
                    return Ok(true);
                }
                if self.matches.modified {
                    break;
                }
            }

            if !self.matches.modified {
                return Ok(false);
            }
        }
    }

    // ========================================================================
    // Blocking entry points
    // ========================================================================

    /// Block until the connection is ready for another `process` step, up
    /// to `limit`. Returns immediately when inbound messages are queued.
    pub fn wait(&mut self, limit: Option<Duration>) -> Result<bool> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }

        if !self.rqueue.is_empty() {
            return Ok(true);
        }
        self.poll_readiness(false, limit)
    }

    /// Drive the handshake to running, then drain the write queue.
    pub fn flush(&mut self) -> Result<()> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }

        self.ensure_running()?;

        loop {
            self.dispatch_wqueue()?;
            if self.wqueue.is_empty() {
                return Ok(());
            }
            self.poll_readiness(false, None)?;
        }
    }

    /// Process until the connection reaches the running state.
    pub(crate) fn ensure_running(&mut self) -> Result<()> {
        match self.state {
            ConnState::Unset | ConnState::Closed => return Err(Error::NotConnected),
            ConnState::Running => return Ok(()),
            _ => {}
        }

        loop {
            let step = self.process()?;
            if self.state == ConnState::Running {
                return Ok(());
            }
            if self.state == ConnState::Closed {
                return Err(Error::NotConnected);
            }
            if !step.progressed() {
                self.wait(None)?;
            }
        }
    }

    /// Send `m` and block for its reply.
    ///
    /// Unrelated traffic arriving meanwhile is queued for later dispatch;
    /// the caller's deadline is honored with [`Error::TimedOut`], and error
    /// replies surface as [`Error::Remote`].
    pub fn call(&mut self, m: Message, timeout: CallTimeout) -> Result<Message> {
        self.pid_guard()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }
        if m.message_type() != MessageType::MethodCall {
            return Err(Error::InvalidArgument("only method calls block".into()));
        }
        if m.no_reply_expected() {
            return Err(Error::InvalidArgument(
                "call is flagged no-reply-expected".into(),
            ));
        }

        self.ensure_running()?;

        let serial = self.send(m)?;
        let deadline = timeout.deadline(Instant::now());

        loop {
            // Reserve backlog room before reading, so nothing is lost.
            if self.rqueue.len() >= RQUEUE_MAX {
                return Err(Error::NoBufferSpace);
            }

            if let Some(mut incoming) = self.read_transport()? {
                if incoming.reply_serial() == serial {
                    return match incoming.message_type() {
                        MessageType::MethodReturn => {
                            incoming.rewind();
                            Ok(incoming)
                        }
                        MessageType::MethodError => {
                            let error = incoming.error().cloned().unwrap_or_else(|| {
                                BusError::new(
                                    "org.freedesktop.DBus.Error.Failed",
                                    "unnamed error reply",
                                )
                            });
                            Err(Error::Remote(error))
                        }
                        _ => Err(Error::Protocol(
                            "reply serial on a non-reply message".into(),
                        )),
                    };
                }

                self.rqueue.push_back(incoming);
                continue;
            }

            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::TimedOut);
                    }
                    Some(d - now)
                }
                None => None,
            };

            self.poll_readiness(true, remaining)?;
            self.dispatch_wqueue()?;
        }
    }

    /// Poll the transport for the current interest set, intersecting the
    /// caller's limit with the connection's own deadline.
    fn poll_readiness(&mut self, need_more: bool, limit: Option<Duration>) -> Result<bool> {
        let mut events = self.events()?;
        if need_more {
            events.readable = true;
        }

        let engine_deadline = self.timeout()?;
        let limit_deadline = limit.map(|d| Instant::now() + d);
        let deadline = match (engine_deadline, limit_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let (input, output) = match self.transport.as_ref() {
            Some(t) => (t.input_fd(), t.output_fd()),
            None => return Err(Error::NotConnected),
        };

        wait_readiness(input, output, events, deadline).map_err(Error::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Value;
    use crate::transport::mem::{pair, PairTransport};
    use crate::transport::Transport;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Drive a fresh connection over one end of a pair to Running.
    fn running_conn() -> (Connection, PairTransport) {
        let (ours, theirs) = pair();
        let mut conn = Connection::new();
        conn.set_transport(Box::new(ours)).unwrap();
        conn.start().unwrap();

        // Opening -> Authenticating -> Running, one step each.
        assert!(conn.process().unwrap().progressed());
        assert!(conn.process().unwrap().progressed());
        assert_eq!(conn.state(), ConnState::Running);

        (conn, theirs)
    }

    fn peer_send(peer: &mut PairTransport, m: Message) {
        let mut windex = 0;
        assert_eq!(
            peer.write_message(&m, &mut windex).unwrap(),
            WriteStatus::Complete
        );
    }

    fn peer_recv(peer: &mut PairTransport) -> Option<Message> {
        peer.read_message().unwrap()
    }

    #[test]
    fn test_handshake_reaches_running() {
        let (conn, _peer) = running_conn();
        assert!(conn.is_open());
        assert_eq!(conn.state(), ConnState::Running);
    }

    #[test]
    fn test_process_idle_when_nothing_to_do() {
        let (mut conn, _peer) = running_conn();
        assert!(!conn.process().unwrap().progressed());
    }

    #[test]
    fn test_events_and_unclaimed_handoff() {
        let (mut conn, mut peer) = running_conn();

        // Idle and running: poll for reads, nothing to write.
        let e = conn.events().unwrap();
        assert!(e.readable);
        assert!(!e.writable);

        // A signal nobody claims comes back from process_take.
        peer_send(
            &mut peer,
            Message::signal("/t", "org.example.E", "Tick")
                .unwrap()
                .sealed_with(9),
        );
        let step = conn.process_take().unwrap();
        let Processed::Message(m) = step else {
            panic!("signal should be handed out");
        };
        assert_eq!(m.member(), Some("Tick"));
    }

    #[test]
    fn test_unknown_object_auto_reply() {
        let (mut conn, mut peer) = running_conn();

        let call = Message::method_call(None, "/nowhere", Some("org.example.I"), "M")
            .unwrap()
            .sealed_with(77);
        peer_send(&mut peer, call);

        assert!(conn.process().unwrap().progressed());

        let reply = peer_recv(&mut peer).expect("error reply");
        assert_eq!(reply.message_type(), MessageType::MethodError);
        assert_eq!(reply.reply_serial(), 77);
        assert_eq!(
            reply.error().map(|e| e.name.as_str()),
            Some("org.freedesktop.DBus.Error.UnknownObject")
        );
    }

    #[test]
    fn test_recursive_process_is_busy() {
        let (mut conn, mut peer) = running_conn();

        let seen = Rc::new(Cell::new(false));
        let seen2 = seen.clone();
        conn.add_filter(Rc::new(move |conn, _m| {
            assert!(matches!(conn.process(), Err(Error::Busy)));
            seen2.set(true);
            Ok(true)
        }))
        .unwrap();

        peer_send(
            &mut peer,
            Message::signal("/t", "org.example.E", "Tick")
                .unwrap()
                .sealed_with(5),
        );
        conn.process().unwrap();
        assert!(seen.get());
    }

    #[test]
    fn test_call_timeout_synthesizes_error() {
        let (mut conn, _peer) = running_conn();

        let got: Rc<Cell<Option<&'static str>>> = Rc::new(Cell::new(None));
        let got2 = got.clone();

        let call = Message::method_call(None, "/svc", Some("org.example.I"), "Slow").unwrap();
        conn.call_async(
            call,
            CallTimeout::After(Duration::from_millis(10)),
            Rc::new(move |_conn, reply| {
                let name = reply.error().map(|e| e.name.clone()).unwrap_or_default();
                got2.set(Some(if name == "org.freedesktop.DBus.Error.Timeout" {
                    "timeout"
                } else {
                    "other"
                }));
                Ok(true)
            }),
        )
        .unwrap();

        // Before the deadline the tracker stays quiet.
        assert!(conn.timeout().unwrap().is_some());
        std::thread::sleep(Duration::from_millis(15));
        assert!(conn.process().unwrap().progressed());
        assert_eq!(got.get(), Some("timeout"));
        // The entry is gone; the engine goes idle again.
        assert!(conn.timeout().unwrap().is_none());
        assert!(!conn.process().unwrap().progressed());
    }

    #[test]
    fn test_cancelled_call_never_fires() {
        let (mut conn, _peer) = running_conn();

        let call = Message::method_call(None, "/svc", Some("org.example.I"), "M").unwrap();
        let serial = conn
            .call_async(
                call,
                CallTimeout::After(Duration::from_millis(1)),
                Rc::new(|_, _| panic!("cancelled call must not fire")),
            )
            .unwrap();

        assert!(conn.cancel_call(serial).unwrap());
        assert!(!conn.cancel_call(serial).unwrap());

        std::thread::sleep(Duration::from_millis(5));
        assert!(!conn.process().unwrap().progressed());
    }

    #[test]
    fn test_reply_dispatch_invokes_callback() {
        let (mut conn, mut peer) = running_conn();

        let got = Rc::new(Cell::new(0u64));
        let got2 = got.clone();
        let call = Message::method_call(None, "/svc", Some("org.example.I"), "M").unwrap();
        let serial = conn
            .call_async(
                call,
                CallTimeout::Never,
                Rc::new(move |_conn, reply| {
                    got2.set(reply.reply_serial());
                    Ok(true)
                }),
            )
            .unwrap();

        let sent = peer_recv(&mut peer).expect("outgoing call");
        assert_eq!(sent.serial(), serial);

        let reply = Message::method_return(&sent).unwrap().sealed_with(1);
        peer_send(&mut peer, reply);

        assert!(conn.process().unwrap().progressed());
        assert_eq!(got.get(), serial);
    }

    #[test]
    fn test_queue_exhaustion_keeps_existing_messages() {
        let (mut conn, _peer) = running_conn();

        // Fill the pair queue (direct sends), then the connection's write
        // queue, and expect no-buffer-space afterwards with nothing lost.
        let mut accepted = 0u32;
        let err = loop {
            let m = Message::signal("/t", "org.example.E", "Tick").unwrap();
            match conn.send(m) {
                Ok(_) => accepted += 1,
                Err(e) => break e,
            }
        };

        assert!(matches!(err, Error::NoBufferSpace));
        assert_eq!(conn.wqueue.len(), crate::config::WQUEUE_MAX);
        assert!(accepted as usize > crate::config::WQUEUE_MAX);
    }

    #[test]
    fn test_fd_accessor_needs_descriptors() {
        let (conn, _peer) = running_conn();
        // The in-process pair has no descriptors to poll.
        assert!(matches!(conn.fd(), Err(Error::PermissionDenied(_))));
    }

    #[test]
    fn test_filter_short_circuits_object_dispatch() {
        let (mut conn, mut peer) = running_conn();

        let handled = Rc::new(Cell::new(false));
        let handled2 = handled.clone();
        conn.add_filter(Rc::new(move |_conn, m| {
            if m.member() == Some("Swallowed") {
                handled2.set(true);
                return Ok(true);
            }
            Ok(false)
        }))
        .unwrap();

        let call = Message::method_call(None, "/x", Some("org.example.I"), "Swallowed")
            .unwrap()
            .sealed_with(3);
        peer_send(&mut peer, call);

        assert!(conn.process().unwrap().progressed());
        assert!(handled.get());
        // Swallowed by the filter: no UnknownObject reply goes out.
        assert!(peer_recv(&mut peer).is_none());
    }

    #[test]
    fn test_filter_removing_itself_is_not_reinvoked() {
        let (mut conn, mut peer) = running_conn();

        let runs = Rc::new(Cell::new(0u32));
        let later_runs = Rc::new(Cell::new(0u32));

        let self_id: Rc<Cell<Option<crate::filter::FilterId>>> = Rc::new(Cell::new(None));
        let id_slot = self_id.clone();
        let counter = runs.clone();
        let id = conn
            .add_filter(Rc::new(move |conn, _m| {
                counter.set(counter.get() + 1);
                if let Some(id) = id_slot.get() {
                    conn.remove_filter(id)?;
                }
                Ok(false)
            }))
            .unwrap();
        self_id.set(Some(id));

        let counter = later_runs.clone();
        conn.add_filter(Rc::new(move |_conn, _m| {
            counter.set(counter.get() + 1);
            Ok(false)
        }))
        .unwrap();

        peer_send(
            &mut peer,
            Message::signal("/t", "org.example.E", "Tick")
                .unwrap()
                .sealed_with(4),
        );
        conn.process().unwrap();

        // The self-removing filter ran once despite the restart; the other
        // filter ran exactly once too.
        assert_eq!(runs.get(), 1);
        assert_eq!(later_runs.get(), 1);

        // And it is really gone for the next message.
        peer_send(
            &mut peer,
            Message::signal("/t", "org.example.E", "Tick")
                .unwrap()
                .sealed_with(5),
        );
        conn.process().unwrap();
        assert_eq!(runs.get(), 1);
        assert_eq!(later_runs.get(), 2);
    }

    #[test]
    fn test_match_sees_selected_signal_only() {
        let (mut conn, mut peer) = running_conn();

        let hits = Rc::new(Cell::new(0u32));
        let hits2 = hits.clone();
        conn.add_match(
            crate::matches::MatchRule::new().member("Tick"),
            Rc::new(move |_conn, _m| {
                hits2.set(hits2.get() + 1);
                Ok(true)
            }),
        )
        .unwrap();

        for member in ["Tick", "Tock", "Tick"] {
            peer_send(
                &mut peer,
                Message::signal("/t", "org.example.E", member)
                    .unwrap()
                    .sealed_with(1),
            );
        }
        for _ in 0..3 {
            conn.process().unwrap();
        }
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_builtin_ping() {
        let (mut conn, mut peer) = running_conn();

        let ping = Message::method_call(None, "/any", Some("org.freedesktop.DBus.Peer"), "Ping")
            .unwrap()
            .sealed_with(42);
        peer_send(&mut peer, ping);

        assert!(conn.process().unwrap().progressed());

        let reply = peer_recv(&mut peer).expect("pong");
        assert_eq!(reply.message_type(), MessageType::MethodReturn);
        assert_eq!(reply.reply_serial(), 42);
        assert!(reply.body().is_empty());
    }

    #[test]
    fn test_send_while_opening_queues() {
        let (ours, mut theirs) = pair();
        let mut conn = Connection::new();
        conn.set_transport(Box::new(ours)).unwrap();
        conn.start().unwrap();
        assert_eq!(conn.state(), ConnState::Opening);

        // Sending is legal in any open state; transmission waits for the
        // handshake.
        let m = Message::signal("/t", "org.example.E", "Early").unwrap();
        let serial = conn.send(m).unwrap();
        assert!(serial > 0);
        assert!(peer_recv(&mut theirs).is_none());

        conn.process().unwrap();
        conn.process().unwrap();
        assert_eq!(conn.state(), ConnState::Running);
        conn.process().unwrap();

        let got = peer_recv(&mut theirs).expect("flushed after handshake");
        assert_eq!(got.member(), Some("Early"));
    }

    #[test]
    fn test_value_round_trip_preserved() {
        let (mut conn, mut peer) = running_conn();

        let mut m = Message::signal("/t", "org.example.E", "Data").unwrap();
        m.append(Value::Struct(vec![Value::I32(-3), Value::string("x")]))
            .unwrap();
        let signature = m.signature();
        conn.send(m).unwrap();

        let got = peer_recv(&mut peer).expect("signal");
        assert_eq!(got.signature(), signature);
    }
}
