// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream-socket transport: unix (filesystem and abstract), TCP and
//! spawned-process endpoints.
//!
//! The transport moves through three phases. `Connecting` covers the
//! non-blocking connect (completion is detected by write readiness plus
//! `SO_ERROR`). `Authenticating` runs the line-based handshake: the client
//! announces a mechanism, the server answers `OK <server-id>`, fd passing is
//! negotiated, `BEGIN` switches to message framing. `Ready` moves framed
//! messages with byte-granular partial-write resume.
//!
//! Authentication *policy* is collaborator territory; only the exchange
//! needed to reach the running state lives here.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use socket2::{Domain, SockAddr, Socket, Type};

use crate::address::{Endpoint, TcpFamily};
use crate::error::{Error, Result};
use crate::id::ServerId;
use crate::message::Message;
use crate::transport::frame::{self, FrameDecoder};
use crate::transport::{wait_readiness, Events, Transport, WriteStatus};

// ============================================================================
// Byte streams
// ============================================================================

/// Abstraction over the byte-oriented streams the transport can ride on.
pub trait ByteStream: Read + Write {
    fn shutdown_both(&mut self) -> io::Result<()>;
    fn take_error(&self) -> io::Result<Option<io::Error>>;
    fn raw_fd(&self) -> Option<RawFd>;
}

impl ByteStream for Socket {
    fn shutdown_both(&mut self) -> io::Result<()> {
        Socket::shutdown(self, Shutdown::Both)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Socket::take_error(self)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

// ============================================================================
// Authentication exchange
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AuthState {
    /// Client: waiting for `OK <server-id>`.
    WaitOk,
    /// Client: waiting for the fd-negotiation answer.
    WaitFdReply,
    /// Server: waiting for an `AUTH` line.
    WaitAuth,
    /// Server: waiting for `BEGIN` (fd negotiation may interleave).
    WaitBegin,
    Done,
}

#[derive(Debug)]
struct Auth {
    state: AuthState,
    is_server: bool,
    anonymous: bool,
    negotiate_fds: bool,
    out: Vec<u8>,
    opos: usize,
    inbuf: Vec<u8>,
    /// Server side: the single NUL that precedes the client's first line.
    nul_pending: bool,
    /// Server side: the identity we present.
    local_id: ServerId,
    /// Client side: the identity the server presented.
    peer_id: Option<ServerId>,
    can_fds: bool,
}

impl Auth {
    fn client(anonymous: bool, negotiate_fds: bool) -> Auth {
        let mut out = vec![0u8];
        if anonymous {
            out.extend_from_slice(b"AUTH ANONYMOUS\r\n");
        } else {
            // SAFETY: getuid never fails and touches no memory.
            let uid = unsafe { libc::getuid() };
            out.extend_from_slice(b"AUTH EXTERNAL ");
            for digit in uid.to_string().bytes() {
                out.extend_from_slice(format!("{:02x}", digit).as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }

        Auth {
            state: AuthState::WaitOk,
            is_server: false,
            anonymous,
            negotiate_fds,
            out,
            opos: 0,
            inbuf: Vec::new(),
            nul_pending: false,
            local_id: ServerId::NULL,
            peer_id: None,
            can_fds: false,
        }
    }

    fn server(local_id: ServerId, anonymous: bool, negotiate_fds: bool) -> Auth {
        Auth {
            state: AuthState::WaitAuth,
            is_server: true,
            anonymous,
            negotiate_fds,
            out: Vec::new(),
            opos: 0,
            inbuf: Vec::new(),
            nul_pending: true,
            local_id,
            peer_id: None,
            can_fds: false,
        }
    }

    fn needs_write(&self) -> bool {
        self.opos < self.out.len()
    }

    fn done(&self) -> bool {
        self.state == AuthState::Done && !self.needs_write()
    }

    fn send_line(&mut self, line: &str) {
        self.out.extend_from_slice(line.as_bytes());
        self.out.extend_from_slice(b"\r\n");
    }

    /// Consume buffered input lines, advancing the handshake.
    fn drain_lines(&mut self) -> Result<()> {
        loop {
            if self.nul_pending {
                match self.inbuf.first() {
                    Some(0) => {
                        self.inbuf.remove(0);
                        self.nul_pending = false;
                    }
                    Some(_) => {
                        return Err(Error::Protocol("auth stream did not start with NUL".into()))
                    }
                    None => return Ok(()),
                }
            }

            let Some(end) = self
                .inbuf
                .windows(2)
                .position(|w| w == b"\r\n")
            else {
                return Ok(());
            };

            let line: Vec<u8> = self.inbuf.drain(..end + 2).take(end).collect();
            let line = String::from_utf8(line)
                .map_err(|_| Error::Protocol("auth line is not valid UTF-8".into()))?;
            log::trace!("[transport] auth <- {:?}", line);
            self.handle_line(line.trim_end())?;
        }
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        match self.state {
            AuthState::WaitOk => {
                if let Some(rest) = line.strip_prefix("OK") {
                    self.peer_id = match rest.trim() {
                        "" => None,
                        id => Some(
                            id.parse()
                                .map_err(|_| Error::Protocol("malformed server id in OK".into()))?,
                        ),
                    };

                    if self.negotiate_fds {
                        self.send_line("NEGOTIATE_UNIX_FD");
                        self.state = AuthState::WaitFdReply;
                    } else {
                        self.send_line("BEGIN");
                        self.state = AuthState::Done;
                    }
                    Ok(())
                } else if line.starts_with("REJECTED") {
                    Err(Error::Protocol(format!("authentication rejected: {}", line)))
                } else {
                    Err(Error::Protocol(format!("unexpected auth reply '{}'", line)))
                }
            }

            AuthState::WaitFdReply => {
                match line {
                    "AGREE_UNIX_FD" => self.can_fds = true,
                    _ => self.can_fds = false,
                }
                self.send_line("BEGIN");
                self.state = AuthState::Done;
                Ok(())
            }

            AuthState::WaitAuth => {
                let accepted = line.starts_with("AUTH EXTERNAL")
                    || (self.anonymous && line.starts_with("AUTH ANONYMOUS"));
                if accepted {
                    self.send_line(&format!("OK {}", self.local_id));
                    self.state = AuthState::WaitBegin;
                } else {
                    self.send_line("REJECTED EXTERNAL");
                }
                Ok(())
            }

            AuthState::WaitBegin => {
                match line {
                    "BEGIN" => self.state = AuthState::Done,
                    "NEGOTIATE_UNIX_FD" => {
                        if self.negotiate_fds {
                            self.can_fds = true;
                            self.send_line("AGREE_UNIX_FD");
                        } else {
                            self.send_line("ERROR");
                        }
                    }
                    "CANCEL" => {
                        self.send_line("REJECTED EXTERNAL");
                        self.state = AuthState::WaitAuth;
                    }
                    _ => self.send_line("ERROR"),
                }
                Ok(())
            }

            AuthState::Done => Ok(()),
        }
    }
}

// ============================================================================
// Stream transport
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Connecting,
    Authenticating,
    Ready,
    Closed,
}

/// Client-side handshake knobs, taken from the connection's negotiated state.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClientOptions {
    /// Authenticate anonymously instead of presenting the uid.
    pub anonymous: bool,
    /// Ask the server for fd passing.
    pub negotiate_fds: bool,
}

/// A connection transport over a stream socket.
pub struct StreamTransport {
    stream: Box<dyn ByteStream>,
    phase: Phase,
    auth: Auth,
    decoder: FrameDecoder,
    child: Option<Child>,
}

impl StreamTransport {
    /// Start connecting to a resolved endpoint. Returns with the connect in
    /// flight; drive it with [`Transport::continue_connect`].
    pub fn connect(endpoint: &Endpoint, options: ClientOptions) -> Result<StreamTransport> {
        match endpoint {
            Endpoint::Unix { path } => {
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.set_nonblocking(true)?;
                let addr = SockAddr::unix(path)?;
                start_connect(&socket, &addr)?;
                Ok(Self::client(Box::new(socket), options, None))
            }

            Endpoint::UnixAbstract { name } => {
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.set_nonblocking(true)?;
                connect_abstract(&socket, name)?;
                Ok(Self::client(Box::new(socket), options, None))
            }

            Endpoint::Tcp { host, port, family } => {
                let addr = resolve_tcp(host, *port, *family)?;
                let domain = Domain::for_address(addr);
                let socket = Socket::new(domain, Type::STREAM, None)?;
                socket.set_nonblocking(true)?;
                start_connect(&socket, &SockAddr::from(addr))?;
                Ok(Self::client(Box::new(socket), options, None))
            }

            Endpoint::Exec { path, argv } => {
                let (socket, child) = spawn_exec(path, argv)?;
                socket.set_nonblocking(true)?;
                Ok(Self::client(Box::new(socket), options, Some(child)))
            }

            // The kernel pool primitive is collaborator territory; inject a
            // transport explicitly to use one.
            Endpoint::Kernel { .. } => Err(Error::NotSupported),
        }
    }

    fn client(
        stream: Box<dyn ByteStream>,
        options: ClientOptions,
        child: Option<Child>,
    ) -> StreamTransport {
        StreamTransport {
            stream,
            phase: Phase::Connecting,
            auth: Auth::client(options.anonymous, options.negotiate_fds),
            decoder: FrameDecoder::new(),
            child,
        }
    }

    /// Wrap an accepted stream on the server side of a handshake.
    pub fn server(
        stream: Box<dyn ByteStream>,
        server_id: ServerId,
        accept_anonymous: bool,
        negotiate_fds: bool,
    ) -> StreamTransport {
        StreamTransport {
            stream,
            phase: Phase::Authenticating,
            auth: Auth::server(server_id, accept_anonymous, negotiate_fds),
            decoder: FrameDecoder::new(),
            child: None,
        }
    }

    /// Flush pending auth bytes; `Ok(false)` when the socket pushed back.
    fn flush_auth(&mut self) -> Result<bool> {
        while self.auth.needs_write() {
            match self.stream.write(&self.auth.out[self.auth.opos..]) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "stream closed during auth",
                    )))
                }
                Ok(n) => self.auth.opos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        if self.auth.opos == self.auth.out.len() {
            self.auth.out.clear();
            self.auth.opos = 0;
        }
        Ok(true)
    }

    /// Read whatever auth bytes are available; `Ok(false)` on would-block
    /// with no progress.
    fn read_auth(&mut self) -> Result<bool> {
        let mut any = false;
        let mut chunk = [0u8; 256];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed during auth",
                    )))
                }
                Ok(n) => {
                    self.auth.inbuf.extend_from_slice(&chunk[..n]);
                    any = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(any),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

impl Transport for StreamTransport {
    fn continue_connect(&mut self) -> Result<bool> {
        match self.phase {
            Phase::Connecting => {}
            Phase::Closed => return Err(Error::NotConnected),
            _ => return Ok(true),
        }

        let fd = self.stream.raw_fd();
        let writable = wait_readiness(fd, fd, Events::writable(), Some(Instant::now()))?;
        if !writable {
            return Ok(false);
        }

        if let Some(err) = self.stream.take_error()? {
            return Err(Error::Io(err));
        }

        log::debug!("[transport] stream connected, starting auth");
        self.phase = Phase::Authenticating;
        Ok(true)
    }

    fn continue_auth(&mut self) -> Result<bool> {
        match self.phase {
            Phase::Authenticating => {}
            Phase::Ready => return Ok(true),
            _ => return Err(Error::NotConnected),
        }

        loop {
            let flushed = self.flush_auth()?;
            if self.auth.done() {
                break;
            }

            let read_any = self.read_auth()?;
            self.auth.drain_lines()?;

            if self.auth.done() && !self.auth.needs_write() {
                break;
            }
            if !read_any && (!flushed || !self.auth.needs_write()) {
                // No bytes either way; wait for readiness.
                return Ok(false);
            }
        }

        // One last flush so BEGIN actually leaves the socket.
        if !self.flush_auth()? {
            return Ok(false);
        }

        log::debug!(
            "[transport] auth complete (fds: {}, server: {:?})",
            self.auth.can_fds,
            self.auth.peer_id
        );
        self.phase = Phase::Ready;
        Ok(true)
    }

    fn auth_needs_write(&self) -> bool {
        self.phase == Phase::Authenticating && self.auth.needs_write()
    }

    fn read_message(&mut self) -> Result<Option<Message>> {
        if self.phase != Phase::Ready {
            return Ok(None);
        }

        self.decoder
            .decode(&mut *self.stream)
            .map_err(Error::Io)
    }

    fn write_message(&mut self, message: &Message, windex: &mut usize) -> Result<WriteStatus> {
        if self.phase != Phase::Ready {
            return Ok(WriteStatus::Blocked);
        }

        let frame = frame::encode(message);
        let before = *windex;

        while *windex < frame.len() {
            match self.stream.write(&frame[*windex..]) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "stream closed mid-message",
                    )))
                }
                Ok(n) => *windex += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(if *windex > before {
                        WriteStatus::Partial
                    } else {
                        WriteStatus::Blocked
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Ok(WriteStatus::Complete)
    }

    fn atomic_delivery(&self) -> bool {
        false
    }

    fn supports_fds(&self) -> bool {
        self.auth.can_fds
    }

    fn input_fd(&self) -> Option<RawFd> {
        self.stream.raw_fd()
    }

    fn output_fd(&self) -> Option<RawFd> {
        self.stream.raw_fd()
    }

    fn server_id(&self) -> Option<ServerId> {
        if self.auth.is_server {
            Some(self.auth.local_id)
        } else {
            self.auth.peer_id
        }
    }

    fn close(&mut self) {
        if self.phase != Phase::Closed {
            self.phase = Phase::Closed;
            let _ = self.stream.shutdown_both();
            if let Some(child) = &mut self.child {
                let _ = child.try_wait();
            }
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Connect helpers
// ============================================================================

/// Kick off a non-blocking connect; in-progress is success here.
fn start_connect(socket: &Socket, addr: &SockAddr) -> Result<()> {
    match socket.connect(addr) {
        Ok(()) => Ok(()),
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            Ok(())
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// Connect to an abstract-namespace socket: a leading NUL byte and a length
/// that covers exactly the name.
fn connect_abstract(socket: &Socket, name: &str) -> Result<()> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let path_offset = std::mem::size_of::<libc::sa_family_t>();
    if name.len() + 1 > addr.sun_path.len() {
        return Err(Error::InvalidArgument(format!(
            "abstract socket name '{}' too long",
            name
        )));
    }
    for (i, b) in name.bytes().enumerate() {
        addr.sun_path[i + 1] = b as libc::c_char;
    }
    let len = (path_offset + 1 + name.len()) as libc::socklen_t;

    // SAFETY: addr is a fully initialized sockaddr_un and len covers the
    // family field, the NUL marker and the name.
    let r = unsafe {
        libc::connect(
            socket.as_raw_fd(),
            std::ptr::addr_of!(addr).cast(),
            len,
        )
    };
    if r == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock {
        Ok(())
    } else {
        Err(Error::Io(err))
    }
}

/// Resolve a TCP endpoint with stream semantics and family preference.
fn resolve_tcp(host: &str, port: u16, family: Option<TcpFamily>) -> Result<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;

    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(Error::Io)?
        .filter(|a| match family {
            None => true,
            Some(TcpFamily::V4) => a.is_ipv4(),
            Some(TcpFamily::V6) => a.is_ipv6(),
        })
        .collect::<Vec<_>>();

    addrs.into_iter().next().ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {}:{}", host, port),
        ))
    })
}

/// Spawn the endpoint process with the far end of a socketpair on its stdio.
fn spawn_exec(path: &str, argv: &[String]) -> Result<(Socket, Child)> {
    let (ours, theirs) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;

    let theirs: OwnedFd = theirs.into();
    let stdin: OwnedFd = theirs.try_clone()?;

    let mut command = Command::new(path);
    if let Some(argv0) = argv.first() {
        command.arg0(argv0);
    }
    command
        .args(&argv[1.min(argv.len())..])
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(theirs))
        .stderr(Stdio::inherit());

    let child = command.spawn()?;
    Ok((ours, child))
}

// ============================================================================
// Scripted stream for unit tests
// ============================================================================


#[cfg(test)]
mod tests {
    use super::mock::ScriptedStream;
    use super::*;
    use crate::message::Value;

    fn ready_transport(stream: ScriptedStream) -> StreamTransport {
        let mut t = StreamTransport::client(Box::new(stream), ClientOptions::default(), None);
        t.phase = Phase::Ready;
        t
    }

    #[test]
    fn test_client_auth_exchange() {
        let mut stream = ScriptedStream::new();
        stream.feed(b"OK 0123456789abcdef0123456789abcdef\r\n");

        let mut t = StreamTransport::client(
            Box::new(stream),
            ClientOptions {
                anonymous: false,
                negotiate_fds: false,
            },
            None,
        );
        t.phase = Phase::Authenticating;

        assert!(t.continue_auth().unwrap());
        assert_eq!(
            t.server_id(),
            Some("0123456789abcdef0123456789abcdef".parse().unwrap())
        );
    }

    #[test]
    fn test_client_auth_fd_negotiation() {
        let mut stream = ScriptedStream::new();
        stream.feed(b"OK 0123456789abcdef0123456789abcdef\r\nAGREE_UNIX_FD\r\n");

        let mut t = StreamTransport::client(
            Box::new(stream),
            ClientOptions {
                anonymous: false,
                negotiate_fds: true,
            },
            None,
        );
        t.phase = Phase::Authenticating;

        assert!(t.continue_auth().unwrap());
        assert!(t.supports_fds());
    }

    #[test]
    fn test_client_auth_rejected() {
        let mut stream = ScriptedStream::new();
        stream.feed(b"REJECTED EXTERNAL\r\n");

        let mut t = StreamTransport::client(Box::new(stream), ClientOptions::default(), None);
        t.phase = Phase::Authenticating;

        assert!(matches!(t.continue_auth(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_server_auth_exchange() {
        let id: ServerId = "00112233445566778899aabbccddeeff".parse().unwrap();

        let mut stream = ScriptedStream::new();
        stream.feed(b"\0AUTH EXTERNAL 31303030\r\nNEGOTIATE_UNIX_FD\r\nBEGIN\r\n");

        let mut t = StreamTransport::server(Box::new(stream), id, false, true);
        assert!(t.continue_auth().unwrap());
        assert!(t.supports_fds());
        assert_eq!(t.server_id(), Some(id));
    }

    #[test]
    fn test_auth_would_block_midway() {
        let mut stream = ScriptedStream::new();
        // Only half a reply available; the handshake must park, not fail.
        stream.feed(b"OK 0123456789abcd");

        let mut t = StreamTransport::client(Box::new(stream), ClientOptions::default(), None);
        t.phase = Phase::Authenticating;

        assert!(!t.continue_auth().unwrap());
        assert_eq!(t.phase, Phase::Authenticating);
    }

    #[test]
    fn test_partial_write_resumes() {
        let mut call = Message::method_call(None, "/obj", None, "Frob").unwrap();
        call.append(Value::string("payload-payload-payload")).unwrap();
        let call = call.sealed_with(4);

        let encoded_len = frame::encode(&call).len();

        let mut stream = ScriptedStream::new();
        stream.set_write_quota(Some(7));
        let mut t = ready_transport(stream);

        let mut windex = 0;
        assert_eq!(
            t.write_message(&call, &mut windex).unwrap(),
            WriteStatus::Partial
        );
        assert_eq!(windex, 7);

        // A fresh transport with no quota and the surviving windex stands in
        // for the socket becoming writable again: the resumed write starts
        // at byte 7, not at zero.
        let mut stream2 = ScriptedStream::new();
        stream2.set_write_quota(None);
        let mut t2 = ready_transport(stream2);
        assert_eq!(
            t2.write_message(&call, &mut windex).unwrap(),
            WriteStatus::Complete
        );
        assert_eq!(windex, encoded_len);
    }

    #[test]
    fn test_blocked_write_reports_blocked() {
        let call = Message::method_call(None, "/obj", None, "Frob")
            .unwrap()
            .sealed_with(4);

        let mut stream = ScriptedStream::new();
        stream.set_write_quota(Some(0));
        let mut t = ready_transport(stream);

        let mut windex = 0;
        assert_eq!(
            t.write_message(&call, &mut windex).unwrap(),
            WriteStatus::Blocked
        );
        assert_eq!(windex, 0);
    }

    #[test]
    fn test_message_round_trip_through_stream() {
        let mut m = Message::signal("/topic", "org.example.Events", "Tick").unwrap();
        m.append(Value::U64(77)).unwrap();
        let m = m.sealed_with(12);

        let mut sender = ready_transport(ScriptedStream::new());
        let mut windex = 0;
        assert_eq!(
            sender.write_message(&m, &mut windex).unwrap(),
            WriteStatus::Complete
        );

        // Feed the same encoding to a receiving transport.
        let mut receiver_stream = ScriptedStream::new();
        receiver_stream.feed(&frame::encode(&m));
        let mut receiver = ready_transport(receiver_stream);

        let got = receiver.read_message().unwrap().expect("message");
        assert_eq!(got.serial(), 12);
        assert_eq!(got.member(), Some("Tick"));
        assert_eq!(got.body(), m.body());
    }
}
