//! TLS for non-blocking sockets
//!
//! This module wraps sockets in TLS without ever blocking: handshakes and
//! record I/O advance only as far as the transport allows, and the reactor
//! is told which readiness event to wait for next.
//!
//! # Architecture
//!
//! 1. `TlsContextStore` holds the client and server contexts for the life
//!    of the module
//! 2. `TlsSession` is the per-socket TLS state (engine handle, record I/O)
//! 3. `handshake` drives accept/connect handshakes one step per readiness
//!    event
//! 4. `TlsModule` ties load, reload and ordered unload together
//!
//! # Examples
//!
//! ```no_run
//! use tlsio::config::TlsSettings;
//! use tlsio::socket::{NullHandler, Socket, SocketEngine};
//! use tlsio::tls::TlsModule;
//! use std::time::Duration;
//!
//! let module = TlsModule::load(TlsSettings::with_files("server.pem", "server.pem")).unwrap();
//! let mut engine = SocketEngine::new();
//!
//! let listener = Socket::listen(
//!     "127.0.0.1:6697".parse().unwrap(),
//!     module.tls_io(),
//!     Box::new(NullHandler),
//! )
//! .unwrap();
//! engine.add(listener);
//!
//! loop {
//!     engine.run_once(Some(Duration::from_secs(1))).unwrap();
//! }
//! ```

pub mod context;
pub mod engine;
pub mod handshake;
pub mod module;
pub mod session;

pub use context::{ConfigError, ContextHandle, TlsContextStore};
pub use engine::{EngineFactory, EngineRole, HandshakeStep, OpensslEngine, TlsEngine, Transfer};
pub use module::TlsModule;
pub use session::TlsSession;
