//! Socket I/O strategies
//!
//! Every socket picks one strategy when it is created and keeps it for its
//! whole life:
//!
//! - [`PlainIo`] moves bytes straight between the caller and the transport
//! - [`TlsSession`] passes them through a TLS engine
//!
//! [`SocketIo`] is the tagged union of the two, so the owning socket never
//! has to ask what kind of I/O it carries.

use super::{Direction, IoError, Phase, Result, SocketCore};
use crate::tls::{handshake, TlsSession};
use socket2::{Domain, SockAddr};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Cumulative byte counters shared by every socket of a process
#[derive(Debug, Default)]
pub struct IoStats {
    read: AtomicU64,
    written: AtomicU64,
}

impl IoStats {
    pub fn shared() -> Arc<Self> {
        Arc::new(IoStats::default())
    }

    /// Total bytes delivered by successful reads
    pub fn total_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// Total bytes accepted by successful writes
    pub fn total_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub(crate) fn record_read(&self, n: usize) {
        self.read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, n: usize) {
        self.written.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Unencrypted socket I/O
pub struct PlainIo {
    stats: Arc<IoStats>,
}

impl PlainIo {
    pub fn new(stats: Arc<IoStats>) -> Self {
        PlainIo { stats }
    }

    fn recv(&mut self, core: &mut SocketCore, buf: &mut [u8]) -> Result<usize> {
        match (&core.sock).read(buf) {
            Ok(n) => {
                self.stats.record_read(n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(IoError::WouldBlock(Direction::Read))
            }
            Err(e) => Err(IoError::Io(e)),
        }
    }

    fn send(&mut self, core: &mut SocketCore, buf: &[u8]) -> Result<usize> {
        match (&core.sock).write(buf) {
            Ok(n) => {
                self.stats.record_written(n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                core.change(Direction::Write, true);
                Err(IoError::WouldBlock(Direction::Write))
            }
            Err(e) => Err(IoError::Io(e)),
        }
    }

    fn finish_accept(&mut self, core: &mut SocketCore) -> Phase {
        match core.phase {
            Phase::Established => return Phase::Established,
            Phase::Accepting => {}
            other => panic!(
                "finish_accept called for a socket neither accepted nor accepting ({:?})",
                other
            ),
        }
        core.phase = Phase::Established;
        core.want(Direction::Read);
        core.handler.on_accept();
        Phase::Established
    }

    fn finish_connect(&mut self, core: &mut SocketCore) -> Phase {
        match core.phase {
            Phase::Established => return Phase::Established,
            Phase::TransportConnecting | Phase::Connecting => {}
            other => panic!(
                "finish_connect called for a socket neither connected nor connecting ({:?})",
                other
            ),
        }
        if let Some(message) = core.transport_error() {
            core.fail(&message);
            return Phase::Dead;
        }
        core.phase = Phase::Established;
        core.want(Direction::Read);
        core.handler.on_connect();
        Phase::Established
    }
}

/// I/O strategy of a socket
pub enum SocketIo {
    Plain(PlainIo),
    Tls(TlsSession),
}

impl SocketIo {
    pub fn plain(stats: Arc<IoStats>) -> Self {
        SocketIo::Plain(PlainIo::new(stats))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, SocketIo::Tls(_))
    }

    /// The TLS session, if this socket is TLS-wrapped
    pub fn tls(&self) -> Option<&TlsSession> {
        match self {
            SocketIo::Tls(session) => Some(session),
            SocketIo::Plain(_) => None,
        }
    }

    pub(crate) fn recv(&mut self, core: &mut SocketCore, buf: &mut [u8]) -> Result<usize> {
        match self {
            SocketIo::Plain(plain) => plain.recv(core, buf),
            SocketIo::Tls(session) => session.recv(core, buf),
        }
    }

    pub(crate) fn send(&mut self, core: &mut SocketCore, buf: &[u8]) -> Result<usize> {
        match self {
            SocketIo::Plain(plain) => plain.send(core, buf),
            SocketIo::Tls(session) => session.send(core, buf),
        }
    }

    /// Accept one connection on `listener`, returning the new socket's core
    /// and an I/O strategy of the same kind as this one
    pub(crate) fn accept(&mut self, listener: &mut SocketCore) -> Result<(SocketCore, SocketIo)> {
        let mut core = raw_accept(listener)?;
        match self {
            SocketIo::Plain(plain) => {
                let mut io = PlainIo::new(plain.stats.clone());
                core.phase = Phase::Accepting;
                io.finish_accept(&mut core);
                Ok((core, SocketIo::Plain(io)))
            }
            SocketIo::Tls(template) => {
                let session = handshake::accept(template, &mut core)?;
                Ok((core, SocketIo::Tls(session)))
            }
        }
    }

    pub(crate) fn finish_accept(&mut self, core: &mut SocketCore) -> Phase {
        match self {
            SocketIo::Plain(plain) => plain.finish_accept(core),
            SocketIo::Tls(session) => handshake::finish_accept(session, core),
        }
    }

    pub(crate) fn connect(&mut self, core: &mut SocketCore, target: &str, port: u16) -> Result<()> {
        match self {
            SocketIo::Plain(plain) => {
                if raw_connect(core, target, port)? {
                    plain.finish_connect(core);
                }
                Ok(())
            }
            SocketIo::Tls(session) => handshake::connect(session, core, target, port),
        }
    }

    pub(crate) fn finish_connect(&mut self, core: &mut SocketCore) -> Phase {
        match self {
            SocketIo::Plain(plain) => plain.finish_connect(core),
            SocketIo::Tls(session) => handshake::finish_connect(session, core),
        }
    }
}

/// Non-blocking `accept` on a listening socket
pub(crate) fn raw_accept(listener: &mut SocketCore) -> Result<SocketCore> {
    let (sock, peer) = listener.sock.accept().map_err(IoError::AcceptFailed)?;
    sock.set_nonblocking(true).map_err(IoError::AcceptFailed)?;

    let domain = peer
        .as_socket()
        .map(Domain::for_address)
        .unwrap_or(listener.domain);
    debug!(listener = listener.fd(), peer = ?peer.as_socket(), "accepted connection");

    let handler = listener.handler.on_incoming(&peer);
    Ok(SocketCore::new(sock, domain, handler))
}

/// Issue a non-blocking `connect`
///
/// Returns `true` if the transport connected immediately, `false` if the
/// connection is in progress (write interest is registered). Hard failures
/// kill the socket.
pub(crate) fn raw_connect(core: &mut SocketCore, target: &str, port: u16) -> Result<bool> {
    let addr = match resolve(target, port, core.domain) {
        Ok(addr) => addr,
        Err(message) => {
            core.fail(&message);
            return Err(IoError::ConnectFailed(message));
        }
    };

    match core.sock.connect(&SockAddr::from(addr)) {
        Ok(()) => {
            core.phase = Phase::TransportConnecting;
            Ok(true)
        }
        Err(e) if connect_in_progress(&e) => {
            core.phase = Phase::TransportConnecting;
            core.change(Direction::Write, true);
            Ok(false)
        }
        Err(e) => {
            let message = e.to_string();
            core.fail(&message);
            Err(IoError::ConnectFailed(message))
        }
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

/// Resolve `target` to an address of the socket's family
fn resolve(target: &str, port: u16, domain: Domain) -> std::result::Result<SocketAddr, String> {
    let want_v6 = domain == Domain::IPV6;
    (target, port)
        .to_socket_addrs()
        .map_err(|e| format!("Unable to resolve {}: {}", target, e))?
        .find(|addr| addr.is_ipv6() == want_v6)
        .ok_or_else(|| {
            let family = if want_v6 { "IPv6" } else { "IPv4" };
            format!("No {} address for {}", family, target)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate() {
        let stats = IoStats::shared();
        stats.record_read(3);
        stats.record_read(7);
        stats.record_written(5);
        assert_eq!(stats.total_read(), 10);
        assert_eq!(stats.total_written(), 5);
    }

    #[test]
    fn test_resolve_matches_family() {
        let v4 = resolve("127.0.0.1", 6667, Domain::IPV4).unwrap();
        assert_eq!(v4, "127.0.0.1:6667".parse().unwrap());

        let v6 = resolve("::1", 6697, Domain::IPV6).unwrap();
        assert_eq!(v6, "[::1]:6697".parse().unwrap());

        assert!(resolve("127.0.0.1", 6667, Domain::IPV6).is_err());
    }
}
