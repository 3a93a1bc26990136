//! Non-blocking sockets
//!
//! A [`Socket`] couples a raw non-blocking transport endpoint with the I/O
//! strategy chosen when it was created ([`SocketIo::Plain`] or
//! [`SocketIo::Tls`]). All I/O code goes through the same call surface; the
//! strategy decides whether bytes hit the wire directly or pass through a
//! TLS engine first.
//!
//! # Phases
//!
//! ```text
//! Uninitialized ─accept─▶ Accepting ─────────────┐
//!       │                                        ├─▶ Established
//!       └─connect─▶ TransportConnecting ─▶ Connecting ┘
//!
//! any phase ─failure─▶ Dead
//! ```
//!
//! The reactor ([`SocketEngine`]) reads each socket's [`Interest`] to decide
//! which readiness events to wait for, and calls back into the socket when
//! one fires. Sockets in [`Phase::Dead`] are reaped by the engine.

pub mod engine;
pub mod io;

pub use engine::SocketEngine;
pub use io::{IoStats, PlainIo, SocketIo};

use bytes::{Buf, BytesMut};
use socket2::{Domain, Protocol, SockAddr, Type};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, warn};

/// Result type for socket operations
pub type Result<T> = std::result::Result<T, IoError>;

/// Size of the scratch buffer used when draining readable sockets
pub const READ_CHUNK: usize = 8192;

/// Listen backlog for listening sockets
pub const LISTEN_BACKLOG: i32 = 128;

/// Socket I/O errors
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("Unable to accept connection: {0}")]
    AcceptFailed(#[source] std::io::Error),

    #[error("Unable to connect: {0}")]
    ConnectFailed(String),

    #[error("Unable to initialize TLS engine: {0}")]
    EngineInit(#[from] openssl::error::ErrorStack),

    #[error("TLS read failed: {0}")]
    TlsReadFailed(String),

    #[error("TLS write failed: {0}")]
    TlsWriteFailed(String),

    /// Transient: the operation must be retried once the socket is ready
    /// in the given direction
    #[error("Operation would block (waiting for {0:?})")]
    WouldBlock(Direction),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handshake/connection phase of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Freshly created, no handshake started
    Uninitialized,
    /// Non-blocking `connect` issued, transport not yet connected
    TransportConnecting,
    /// Server-side handshake in progress
    Accepting,
    /// Client-side handshake in progress
    Connecting,
    /// Handshake finished, application data may flow
    Established,
    /// Failed or closed; waiting to be reaped
    Dead,
}

/// Readiness direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Readiness directions a socket is registered for with the reactor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }
}

/// What the socket is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listening for inbound connections
    Listener,
    /// Inbound connection produced by a listener
    Accepted,
    /// Outbound connection
    Outbound,
}

/// Callbacks invoked by the socket layer toward its owner
///
/// All methods have no-op defaults.
pub trait SocketHandler {
    /// A listener accepted a connection from `peer`; returns the handler for
    /// the new socket
    fn on_incoming(&mut self, _peer: &SockAddr) -> Box<dyn SocketHandler> {
        Box::new(NullHandler)
    }

    /// The inbound handshake completed
    fn on_accept(&mut self) {}

    /// The outbound handshake completed
    fn on_connect(&mut self) {}

    /// The socket failed and is about to be reaped
    fn on_error(&mut self, _message: &str) {}

    /// Application data arrived; anything appended to `out` is queued for
    /// sending
    fn on_read(&mut self, _data: &[u8], _out: &mut BytesMut) {}
}

/// Handler that ignores every event
pub struct NullHandler;

impl SocketHandler for NullHandler {}

/// Transport endpoint plus the state the handshake driver manipulates
pub struct SocketCore {
    pub(crate) sock: socket2::Socket,
    pub(crate) domain: Domain,
    pub(crate) phase: Phase,
    pub(crate) interest: Interest,
    pub(crate) handler: Box<dyn SocketHandler>,
}

impl SocketCore {
    pub(crate) fn new(
        sock: socket2::Socket,
        domain: Domain,
        handler: Box<dyn SocketHandler>,
    ) -> Self {
        SocketCore {
            sock,
            domain,
            phase: Phase::Uninitialized,
            interest: Interest::default(),
            handler,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Enable or disable reactor interest in one direction
    pub(crate) fn change(&mut self, direction: Direction, enabled: bool) {
        match direction {
            Direction::Read => self.interest.read = enabled,
            Direction::Write => self.interest.write = enabled,
        }
    }

    /// Register for exactly one direction, clearing the other
    pub(crate) fn want(&mut self, direction: Direction) {
        self.change(Direction::Read, direction == Direction::Read);
        self.change(Direction::Write, direction == Direction::Write);
    }

    /// Mark the socket dead and report `message` to the handler
    pub(crate) fn fail(&mut self, message: &str) {
        if self.phase == Phase::Dead {
            return;
        }
        debug!(fd = self.fd(), phase = ?self.phase, %message, "socket failed");
        self.phase = Phase::Dead;
        self.interest = Interest::default();
        self.handler.on_error(message);
    }

    /// Pending error on the transport, e.g. the outcome of a non-blocking connect
    pub(crate) fn transport_error(&self) -> Option<String> {
        match self.sock.take_error() {
            Ok(None) => None,
            Ok(Some(err)) => Some(err.to_string()),
            Err(err) => Some(err.to_string()),
        }
    }
}

/// A non-blocking socket with its I/O strategy
pub struct Socket {
    // Declared before `core`: a TLS close notify must go out before the
    // descriptor is closed
    io: SocketIo,
    core: SocketCore,
    role: Role,
    outbuf: BytesMut,
}

impl Socket {
    /// Bind a listening socket; accepted connections inherit the I/O
    /// strategy of `io`
    pub fn listen(addr: SocketAddr, io: SocketIo, handler: Box<dyn SocketHandler>) -> Result<Self> {
        let domain = Domain::for_address(addr);
        let sock = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)?;
        sock.bind(&addr.into())?;
        sock.listen(LISTEN_BACKLOG)?;

        let mut core = SocketCore::new(sock, domain, handler);
        core.change(Direction::Read, true);
        debug!(fd = core.fd(), %addr, tls = io.is_tls(), "listening");

        Ok(Socket::from_parts(core, Role::Listener, io))
    }

    /// Create an unconnected outbound socket of the given address family
    pub fn outbound(domain: Domain, io: SocketIo, handler: Box<dyn SocketHandler>) -> Result<Self> {
        let sock = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_nonblocking(true)?;
        Ok(Socket::from_parts(SocketCore::new(sock, domain, handler), Role::Outbound, io))
    }

    pub(crate) fn from_parts(core: SocketCore, role: Role, io: SocketIo) -> Self {
        Socket {
            core,
            role,
            io,
            outbuf: BytesMut::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.core.fd()
    }

    pub fn phase(&self) -> Phase {
        self.core.phase
    }

    pub fn interest(&self) -> Interest {
        self.core.interest
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn io(&self) -> &SocketIo {
        &self.io
    }

    pub fn is_ipv6(&self) -> bool {
        self.core.domain == Domain::IPV6
    }

    /// Local address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.core
            .sock
            .local_addr()?
            .as_socket()
            .ok_or_else(|| IoError::Io(std::io::Error::other("not an inet socket")))
    }

    /// Bytes queued but not yet sent
    pub fn pending_output(&self) -> usize {
        self.outbuf.len()
    }

    /// Accept one pending connection
    ///
    /// The new socket uses the same I/O strategy as the listener. Its
    /// handshake is started immediately, so the returned socket may already
    /// be established, still accepting, or dead.
    pub fn accept(&mut self) -> Result<Socket> {
        assert_eq!(self.role, Role::Listener, "accept called on a non-listening socket");

        let (core, io) = self.io.accept(&mut self.core)?;
        let mut socket = Socket::from_parts(core, Role::Accepted, io);
        socket.after_handshake_step();
        Ok(socket)
    }

    /// Continue an inbound handshake
    ///
    /// # Panics
    ///
    /// Panics if the socket is neither accepting nor established.
    pub fn finish_accept(&mut self) -> Phase {
        let phase = self.io.finish_accept(&mut self.core);
        self.after_handshake_step();
        phase
    }

    /// Start connecting to `target:port`
    ///
    /// Completion is reported through [`SocketHandler::on_connect`] once
    /// [`finish_connect`](Self::finish_connect) succeeds.
    pub fn connect(&mut self, target: &str, port: u16) -> Result<()> {
        assert_eq!(self.role, Role::Outbound, "connect called on a non-outbound socket");

        let result = self.io.connect(&mut self.core, target, port);
        self.after_handshake_step();
        result
    }

    /// Continue an outbound connection
    ///
    /// # Panics
    ///
    /// Panics if the socket is neither connecting nor established.
    pub fn finish_connect(&mut self) -> Phase {
        let phase = self.io.finish_connect(&mut self.core);
        self.after_handshake_step();
        phase
    }

    /// Receive application data
    ///
    /// `Ok(0)` means the peer closed the stream.
    ///
    /// # Panics
    ///
    /// Panics if the socket is not established.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        assert_eq!(self.core.phase, Phase::Established, "recv before the socket is established");
        self.io.recv(&mut self.core, buf)
    }

    /// Send application data directly, bypassing the output buffer
    ///
    /// Partial writes are returned as-is; the caller retries the remainder.
    ///
    /// # Panics
    ///
    /// Panics if the socket is not established.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize> {
        assert_eq!(self.core.phase, Phase::Established, "send before the socket is established");
        self.io.send(&mut self.core, buf)
    }

    /// Queue data for sending; it is flushed when the socket becomes writable
    pub fn write(&mut self, data: &[u8]) {
        self.outbuf.extend_from_slice(data);
        if self.core.phase == Phase::Established {
            self.core.change(Direction::Write, true);
        }
    }

    /// Send as much queued output as the transport accepts
    ///
    /// A TLS engine that needs peer data before it can write parks the
    /// output until the socket is readable again.
    pub fn flush(&mut self) -> Result<()> {
        while !self.outbuf.is_empty() {
            match self.io.send(&mut self.core, &self.outbuf) {
                Ok(0) => break,
                Ok(n) => self.outbuf.advance(n),
                Err(IoError::WouldBlock(Direction::Read)) => {
                    self.core.change(Direction::Write, false);
                    return Ok(());
                }
                Err(IoError::WouldBlock(Direction::Write)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        if self.outbuf.is_empty() {
            self.core.change(Direction::Write, false);
            self.core.change(Direction::Read, true);
        }
        Ok(())
    }

    /// Mark the socket dead, reporting `message` to its handler
    pub fn kill(&mut self, message: &str) {
        self.core.fail(message);
    }

    /// Output queued before the handshake finished must still go out
    fn after_handshake_step(&mut self) {
        if self.core.phase == Phase::Established && !self.outbuf.is_empty() {
            self.core.change(Direction::Write, true);
        }
    }

    /// Readiness callback; a listener returns the socket it accepted
    pub(crate) fn on_readable(&mut self) -> Option<Socket> {
        if self.role == Role::Listener {
            return match self.accept() {
                Ok(socket) => Some(socket),
                Err(e) => {
                    warn!(fd = self.fd(), error = %e, "accept failed");
                    None
                }
            };
        }

        match self.core.phase {
            Phase::Accepting => {
                self.finish_accept();
            }
            Phase::TransportConnecting | Phase::Connecting => {
                self.finish_connect();
            }
            Phase::Established => {
                self.drain();
                // Retry output parked on a read
                if self.core.phase == Phase::Established && !self.outbuf.is_empty() {
                    self.core.change(Direction::Write, true);
                }
            }
            Phase::Uninitialized | Phase::Dead => {}
        }
        None
    }

    pub(crate) fn on_writable(&mut self) {
        match self.core.phase {
            Phase::Accepting => {
                self.finish_accept();
            }
            Phase::TransportConnecting | Phase::Connecting => {
                self.finish_connect();
            }
            Phase::Established => {
                if let Err(e) = self.flush() {
                    self.core.fail(&e.to_string());
                }
            }
            Phase::Uninitialized | Phase::Dead => {}
        }
    }

    pub(crate) fn on_poll_error(&mut self) {
        match self.core.phase {
            Phase::TransportConnecting => {
                self.finish_connect();
            }
            Phase::Dead => {}
            _ => {
                let message = self
                    .core
                    .transport_error()
                    .unwrap_or_else(|| "Socket error".to_string());
                self.core.fail(&message);
            }
        }
    }

    /// Read until the transport would block
    ///
    /// A TLS engine may hold decrypted bytes beyond one read, and those never
    /// show up as socket readiness, so a single read per event can stall.
    fn drain(&mut self) {
        let mut buf = [0u8; READ_CHUNK];
        while self.core.phase == Phase::Established {
            match self.io.recv(&mut self.core, &mut buf) {
                Ok(0) => self.core.fail("Connection closed"),
                Ok(n) => {
                    self.core.handler.on_read(&buf[..n], &mut self.outbuf);
                    if !self.outbuf.is_empty() {
                        self.core.change(Direction::Write, true);
                    }
                }
                Err(IoError::WouldBlock(_)) => break,
                Err(e) => self.core.fail(&e.to_string()),
            }
        }
    }
}
