//! Readiness reactor
//!
//! A minimal `poll(2)` socket engine. It owns every registered socket,
//! waits for the readiness each one asked for through its [`Interest`], and
//! dispatches events to the accept, handshake and record I/O paths.
//! Sockets that end up [`Phase::Dead`] are removed and dropped after every
//! round, which also tears down their TLS session.

use super::{IoError, Phase, Result, Socket};
use libc::{poll, pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};
use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::{debug, trace};

/// Socket registry and event loop
#[derive(Default)]
pub struct SocketEngine {
    sockets: BTreeMap<RawFd, Socket>,
}

impl SocketEngine {
    pub fn new() -> Self {
        SocketEngine::default()
    }

    /// Register a socket; returns its descriptor
    pub fn add(&mut self, socket: Socket) -> RawFd {
        let fd = socket.fd();
        trace!(fd, phase = ?socket.phase(), "socket registered");
        self.sockets.insert(fd, socket);
        fd
    }

    /// Unregister a socket without destroying it
    pub fn remove(&mut self, fd: RawFd) -> Option<Socket> {
        self.sockets.remove(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.sockets.contains_key(&fd)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Socket> {
        self.sockets.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Socket> {
        self.sockets.get_mut(&fd)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Socket> {
        self.sockets.values()
    }

    /// Drop every socket matching `pred`; returns how many were destroyed
    pub fn destroy_where(&mut self, pred: impl Fn(&Socket) -> bool) -> usize {
        let doomed: Vec<RawFd> = self
            .sockets
            .iter()
            .filter(|(_, socket)| pred(socket))
            .map(|(fd, _)| *fd)
            .collect();
        for fd in &doomed {
            self.sockets.remove(fd);
        }
        doomed.len()
    }

    /// Wait up to `timeout` (forever if `None`) for readiness and dispatch it
    ///
    /// Returns the number of sockets that had events.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let mut fds: Vec<pollfd> = self
            .sockets
            .iter()
            .filter(|(_, socket)| !socket.interest().is_empty())
            .map(|(fd, socket)| {
                let interest = socket.interest();
                let mut events = 0;
                if interest.read {
                    events |= POLLIN;
                }
                if interest.write {
                    events |= POLLOUT;
                }
                pollfd {
                    fd: *fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        if fds.is_empty() {
            self.reap();
            return Ok(0);
        }

        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        let result = unsafe { poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(IoError::Io(err));
        }

        let mut accepted = Vec::new();
        for pfd in fds.iter().filter(|pfd| pfd.revents != 0) {
            let Some(socket) = self.sockets.get_mut(&pfd.fd) else {
                continue;
            };
            dispatch(socket, pfd.revents, &mut accepted);
        }

        for socket in accepted {
            self.add(socket);
        }
        self.reap();

        Ok(result as usize)
    }

    /// Drop dead sockets
    fn reap(&mut self) {
        let destroyed = self.destroy_where(|socket| socket.phase() == Phase::Dead);
        if destroyed > 0 {
            debug!(destroyed, remaining = self.sockets.len(), "reaped dead sockets");
        }
    }
}

fn dispatch(socket: &mut Socket, revents: i16, accepted: &mut Vec<Socket>) {
    trace!(fd = socket.fd(), revents, phase = ?socket.phase(), "socket event");

    if revents & (POLLIN | POLLHUP) != 0 && socket.interest().read {
        if let Some(new) = socket.on_readable() {
            accepted.push(new);
        }
    }
    if revents & POLLOUT != 0 && socket.phase() != Phase::Dead {
        socket.on_writable();
    }
    if revents & (POLLERR | POLLNVAL) != 0 && socket.phase() != Phase::Dead {
        socket.on_poll_error();
    }
}
