//! TLS handshake driver
//!
//! Drives a [`TlsSession`] through the server-side (accept) or client-side
//! (connect) handshake on a non-blocking socket. Each call advances the
//! engine as far as the transport allows and then returns the socket's
//! phase:
//!
//! - still `Accepting`/`Connecting`: the engine is waiting on the network,
//!   and the socket's reactor interest now points at the direction it waits
//!   for. Call again on the next readiness event.
//! - `Established`: handshake complete, `on_accept`/`on_connect` delivered.
//! - `Dead`: handshake failed, the reason went to `on_error`.

use super::engine::{EngineRole, HandshakeStep};
use super::session::TlsSession;
use crate::socket::io::raw_connect;
use crate::socket::{Direction, Phase, Result, SocketCore, SocketHandler};
use tracing::{debug, warn};

/// Start the server-side handshake on a freshly accepted socket
///
/// The handshake is driven once right away, so the returned session may
/// already be established or dead.
pub fn accept(template: &TlsSession, core: &mut SocketCore) -> Result<TlsSession> {
    let mut session = template.fork();
    session.start(EngineRole::Server, core)?;
    core.phase = Phase::Accepting;
    finish_accept(&mut session, core);
    Ok(session)
}

/// Continue the server-side handshake
///
/// # Panics
///
/// Panics if the socket is neither accepting nor established.
pub fn finish_accept(session: &mut TlsSession, core: &mut SocketCore) -> Phase {
    match core.phase {
        Phase::Established => return Phase::Established,
        Phase::Accepting => {}
        other => panic!(
            "finish_accept called for a socket neither accepted nor accepting ({:?})",
            other
        ),
    }

    let step = match session.engine_mut() {
        Some(engine) => engine.handshake(),
        None => HandshakeStep::Failed("no TLS engine".to_string()),
    };
    advance(session, core, step, Phase::Accepting, |handler| handler.on_accept())
}

/// Start connecting to `target:port`
///
/// An immediate transport connection continues straight into the
/// handshake; otherwise the socket waits for writability in
/// `TransportConnecting`.
pub fn connect(
    session: &mut TlsSession,
    core: &mut SocketCore,
    target: &str,
    port: u16,
) -> Result<()> {
    if raw_connect(core, target, port)? {
        finish_connect(session, core);
    }
    Ok(())
}

/// Continue an outbound connection
///
/// From `TransportConnecting` the transport outcome is checked first; the
/// engine is only allocated once the transport is up.
///
/// # Panics
///
/// Panics if the socket is neither connecting nor established.
pub fn finish_connect(session: &mut TlsSession, core: &mut SocketCore) -> Phase {
    match core.phase {
        Phase::Established => return Phase::Established,
        Phase::Connecting => {}
        Phase::TransportConnecting => {
            if let Some(message) = core.transport_error() {
                core.fail(&message);
                return Phase::Dead;
            }
            if let Err(e) = session.start(EngineRole::Client, core) {
                core.fail(&e.to_string());
                return Phase::Dead;
            }
            core.phase = Phase::Connecting;
        }
        other => panic!(
            "finish_connect called for a socket neither connected nor connecting ({:?})",
            other
        ),
    }

    let step = match session.engine_mut() {
        Some(engine) => engine.handshake(),
        None => HandshakeStep::Failed("no TLS engine".to_string()),
    };
    advance(session, core, step, Phase::Connecting, |handler| handler.on_connect())
}

/// Apply one handshake outcome to the socket
fn advance(
    session: &mut TlsSession,
    core: &mut SocketCore,
    step: HandshakeStep,
    pending: Phase,
    completed: fn(&mut dyn SocketHandler),
) -> Phase {
    match step {
        HandshakeStep::WantRead => {
            core.want(Direction::Read);
            pending
        }
        HandshakeStep::WantWrite => {
            core.want(Direction::Write);
            pending
        }
        HandshakeStep::Failed(reason) => {
            warn!(fd = core.fd(), phase = ?pending, %reason, "TLS handshake failed");
            session.release();
            core.fail(&reason);
            Phase::Dead
        }
        HandshakeStep::Complete => {
            core.phase = Phase::Established;
            core.want(Direction::Read);
            debug!(
                fd = core.fd(),
                tls = session.summary().as_deref().unwrap_or("<undef>"),
                "TLS handshake complete"
            );
            completed(core.handler.as_mut());
            Phase::Established
        }
    }
}
