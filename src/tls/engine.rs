//! TLS engine abstraction
//!
//! A [`TlsEngine`] is one TLS protocol instance bound to a socket. The
//! handshake driver only needs to know how a step ended, so every OpenSSL
//! result is folded into a [`HandshakeStep`] or [`Transfer`] here.

use openssl::error::ErrorStack;
use openssl::ssl::{self, ErrorCode, Ssl, SslContextRef, SslStream};
use std::io::{self, Read, Write};
use std::os::fd::RawFd;

/// Outcome of one handshake continuation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    Complete,
    /// Needs more input from the peer
    WantRead,
    /// Needs to flush output to the peer
    WantWrite,
    Failed(String),
}

/// Outcome of one record read or write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Done(usize),
    /// The peer sent a close notify
    Closed,
    WantRead,
    WantWrite,
    Failed(String),
}

/// A TLS protocol instance driving one connection
pub trait TlsEngine {
    /// Continue the handshake as far as the transport allows
    fn handshake(&mut self) -> HandshakeStep;

    /// Decrypt and read application data
    fn read(&mut self, buf: &mut [u8]) -> Transfer;

    /// Encrypt and write application data
    fn write(&mut self, buf: &[u8]) -> Transfer;

    /// Send a close notify, once, without waiting for the peer
    fn shutdown(&mut self);

    /// Negotiated protocol and cipher, once the handshake is complete
    fn summary(&self) -> Option<String> {
        None
    }
}

/// Side of the handshake an engine plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineRole {
    Server,
    Client,
}

/// Creates engines bound to a shared TLS context
pub trait EngineFactory {
    fn create(&self, role: EngineRole, fd: RawFd) -> Result<Box<dyn TlsEngine>, ErrorStack>;
}

/// Borrowed file descriptor used as the engine's transport
///
/// The socket owns the descriptor; this only performs `recv`/`send` on it.
#[derive(Debug)]
pub(crate) struct FdTransport {
    fd: RawFd,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

impl Read for FdTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for FdTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// OpenSSL-backed engine
pub struct OpensslEngine {
    stream: SslStream<FdTransport>,
}

impl OpensslEngine {
    pub fn new(ctx: &SslContextRef, role: EngineRole, fd: RawFd) -> Result<Self, ErrorStack> {
        let mut ssl = Ssl::new(ctx)?;
        match role {
            EngineRole::Server => ssl.set_accept_state(),
            EngineRole::Client => ssl.set_connect_state(),
        }
        let stream = SslStream::new(ssl, FdTransport { fd })?;
        Ok(OpensslEngine { stream })
    }
}

impl TlsEngine for OpensslEngine {
    fn handshake(&mut self) -> HandshakeStep {
        match self.stream.do_handshake() {
            Ok(()) => HandshakeStep::Complete,
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => HandshakeStep::WantRead,
                ErrorCode::WANT_WRITE => HandshakeStep::WantWrite,
                _ => HandshakeStep::Failed(describe(&e)),
            },
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Transfer {
        match self.stream.ssl_read(buf) {
            Ok(n) => Transfer::Done(n),
            Err(e) => transfer_error(&e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Transfer {
        match self.stream.ssl_write(buf) {
            Ok(n) => Transfer::Done(n),
            Err(e) => transfer_error(&e),
        }
    }

    fn shutdown(&mut self) {
        // The peer may already be gone
        let _ = self.stream.shutdown();
    }

    fn summary(&self) -> Option<String> {
        let ssl = self.stream.ssl();
        let cipher = ssl.current_cipher().map(|c| c.name()).unwrap_or("<undef>");
        Some(format!("{} {}", ssl.version_str(), cipher))
    }
}

fn transfer_error(e: &ssl::Error) -> Transfer {
    match e.code() {
        ErrorCode::ZERO_RETURN => Transfer::Closed,
        ErrorCode::WANT_READ => Transfer::WantRead,
        ErrorCode::WANT_WRITE => Transfer::WantWrite,
        ErrorCode::SYSCALL if e.io_error().is_none() && e.ssl_error().is_none() => {
            Transfer::Failed("unexpected EOF".to_string())
        }
        _ => Transfer::Failed(describe(e)),
    }
}

/// Human-readable reason, preferring the library's error queue
fn describe(e: &ssl::Error) -> String {
    if let Some(stack) = e.ssl_error() {
        return stack.to_string();
    }
    if let Some(io) = e.io_error() {
        return io.to_string();
    }
    e.to_string()
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted engine for exercising the driver without a peer

    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    pub(crate) struct Script {
        /// Handshake outcomes, `WantRead` once exhausted
        pub handshakes: VecDeque<HandshakeStep>,
        /// Plaintext per read; an empty entry is a close notify. `WantRead`
        /// once exhausted
        pub reads: VecDeque<Vec<u8>>,
        /// Write outcomes; `Done(n)` accepts at most `n` bytes. `WantWrite`
        /// once exhausted
        pub writes: VecDeque<Transfer>,
        pub created: Vec<EngineRole>,
        pub shutdowns: usize,
        pub dropped: usize,
    }

    pub(crate) type Shared = Rc<RefCell<Script>>;

    pub(crate) struct ScriptedEngine {
        script: Shared,
    }

    impl TlsEngine for ScriptedEngine {
        fn handshake(&mut self) -> HandshakeStep {
            self.script
                .borrow_mut()
                .handshakes
                .pop_front()
                .unwrap_or(HandshakeStep::WantRead)
        }

        fn read(&mut self, buf: &mut [u8]) -> Transfer {
            match self.script.borrow_mut().reads.pop_front() {
                None => Transfer::WantRead,
                Some(data) if data.is_empty() => Transfer::Closed,
                Some(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Transfer::Done(n)
                }
            }
        }

        fn write(&mut self, buf: &[u8]) -> Transfer {
            match self.script.borrow_mut().writes.pop_front() {
                None => Transfer::WantWrite,
                Some(Transfer::Done(cap)) => Transfer::Done(cap.min(buf.len())),
                Some(other) => other,
            }
        }

        fn shutdown(&mut self) {
            self.script.borrow_mut().shutdowns += 1;
        }
    }

    impl Drop for ScriptedEngine {
        fn drop(&mut self) {
            self.script.borrow_mut().dropped += 1;
        }
    }

    pub(crate) struct ScriptedFactory {
        pub script: Shared,
    }

    impl EngineFactory for ScriptedFactory {
        fn create(&self, role: EngineRole, _fd: RawFd) -> Result<Box<dyn TlsEngine>, ErrorStack> {
            self.script.borrow_mut().created.push(role);
            Ok(Box::new(ScriptedEngine {
                script: self.script.clone(),
            }))
        }
    }
}
