//! tlsio - non-blocking TLS socket layer
//!
//! This crate drives TLS handshakes and encrypted I/O over sockets that
//! never block, for services built around a single-threaded readiness
//! reactor.

pub mod config;
pub mod socket;
pub mod tls;
