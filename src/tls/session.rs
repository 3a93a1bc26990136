//! TLS session state
//!
//! A [`TlsSession`] decorates exactly one socket. It holds the TLS engine
//! once the handshake has started and releases it, after a best-effort
//! close notify, when the socket is dropped.

use super::engine::{EngineFactory, EngineRole, TlsEngine, Transfer};
use crate::socket::{Direction, IoError, IoStats, Result, SocketCore};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::trace;

/// Per-socket TLS state
pub struct TlsSession {
    factory: Rc<dyn EngineFactory>,
    stats: Arc<IoStats>,
    engine: Option<Box<dyn TlsEngine>>,
}

impl TlsSession {
    pub fn new(factory: Rc<dyn EngineFactory>, stats: Arc<IoStats>) -> Self {
        TlsSession {
            factory,
            stats,
            engine: None,
        }
    }

    /// A fresh session drawing from the same contexts and counters
    pub(crate) fn fork(&self) -> Self {
        TlsSession::new(self.factory.clone(), self.stats.clone())
    }

    /// Whether a TLS engine is currently allocated
    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    /// Negotiated protocol and cipher
    pub fn summary(&self) -> Option<String> {
        self.engine.as_ref().and_then(|engine| engine.summary())
    }

    /// Allocate the engine for `role`, bound to the socket's descriptor
    pub(crate) fn start(&mut self, role: EngineRole, core: &SocketCore) -> Result<()> {
        debug_assert!(self.engine.is_none(), "TLS engine allocated twice");
        self.engine = Some(self.factory.create(role, core.fd())?);
        Ok(())
    }

    pub(crate) fn engine_mut(&mut self) -> Option<&mut (dyn TlsEngine + 'static)> {
        self.engine.as_deref_mut()
    }

    /// Drop the engine without a close notify; used once the session is dead
    pub(crate) fn release(&mut self) {
        self.engine = None;
    }

    /// Decrypt and read application data
    ///
    /// A close notify from the peer reads as end of stream (`Ok(0)`).
    pub(crate) fn recv(&mut self, core: &mut SocketCore, buf: &mut [u8]) -> Result<usize> {
        let engine = self
            .engine
            .as_deref_mut()
            .ok_or_else(|| IoError::TlsReadFailed("no TLS engine".to_string()))?;

        match engine.read(buf) {
            Transfer::Done(n) => {
                self.stats.record_read(n);
                trace!(fd = core.fd(), bytes = n, "tls read");
                Ok(n)
            }
            Transfer::Closed => Ok(0),
            Transfer::WantRead => Err(IoError::WouldBlock(Direction::Read)),
            Transfer::WantWrite => {
                core.change(Direction::Write, true);
                Err(IoError::WouldBlock(Direction::Write))
            }
            Transfer::Failed(reason) => Err(IoError::TlsReadFailed(reason)),
        }
    }

    /// Encrypt and write application data
    ///
    /// May accept fewer bytes than offered; the caller resends the rest.
    pub(crate) fn send(&mut self, core: &mut SocketCore, buf: &[u8]) -> Result<usize> {
        let engine = self
            .engine
            .as_deref_mut()
            .ok_or_else(|| IoError::TlsWriteFailed("no TLS engine".to_string()))?;

        match engine.write(buf) {
            Transfer::Done(n) => {
                self.stats.record_written(n);
                trace!(fd = core.fd(), bytes = n, "tls write");
                Ok(n)
            }
            Transfer::Closed => Err(IoError::TlsWriteFailed("session closed by peer".to_string())),
            Transfer::WantRead => {
                core.change(Direction::Read, true);
                Err(IoError::WouldBlock(Direction::Read))
            }
            Transfer::WantWrite => {
                core.change(Direction::Write, true);
                Err(IoError::WouldBlock(Direction::Write))
            }
            Transfer::Failed(reason) => Err(IoError::TlsWriteFailed(reason)),
        }
    }

    /// Send a single close notify and release the engine
    ///
    /// Safe to call more than once; only the first call with a live engine
    /// does anything.
    pub fn destroy(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.shutdown();
        }
    }
}

impl Drop for TlsSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("engine", &self.engine.is_some())
            .finish()
    }
}
