//! TLS layer lifecycle
//!
//! [`TlsModule`] owns the shared contexts from load to unload and hands out
//! I/O strategies for new sockets. Unloading destroys every TLS socket still
//! registered with the engine before the contexts are released.

use super::context::{ConfigError, ContextHandle, TlsContextStore};
use super::session::TlsSession;
use crate::config::TlsSettings;
use crate::socket::{IoStats, SocketEngine, SocketIo};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{error, info};

/// The loaded TLS layer
pub struct TlsModule {
    settings: TlsSettings,
    contexts: Rc<ContextHandle>,
    stats: Arc<IoStats>,
}

impl TlsModule {
    /// Build the contexts; any configuration error aborts the load
    pub fn load(settings: TlsSettings) -> Result<Self, ConfigError> {
        let store = TlsContextStore::initialize(&settings.ssl)?;
        info!(
            cert = %settings.ssl.cert.display(),
            uplink_ssl = settings.uplink.ssl,
            "TLS module loaded"
        );
        Ok(TlsModule {
            settings,
            contexts: Rc::new(ContextHandle::new(store)),
            stats: IoStats::shared(),
        })
    }

    pub fn settings(&self) -> &TlsSettings {
        &self.settings
    }

    /// Byte counters shared by every socket created through this module
    pub fn stats(&self) -> &Arc<IoStats> {
        &self.stats
    }

    /// Whether server sessions present a certificate
    pub fn has_identity(&self) -> bool {
        self.contexts.has_identity()
    }

    /// TLS I/O for a socket being created
    pub fn tls_io(&self) -> SocketIo {
        SocketIo::Tls(TlsSession::new(self.contexts.clone(), self.stats.clone()))
    }

    /// Plain I/O counted against the same statistics
    pub fn plain_io(&self) -> SocketIo {
        SocketIo::plain(self.stats.clone())
    }

    /// I/O for the uplink connection, TLS when `uplink.ssl` is set
    pub fn uplink_io(&self) -> SocketIo {
        if self.settings.uplink.ssl {
            self.tls_io()
        } else {
            self.plain_io()
        }
    }

    /// Re-read certificate and key
    ///
    /// Every engine allocated from now on uses the new contexts, including
    /// connections accepted by listeners created before the reload.
    /// Established sessions keep the contexts they were created from. On
    /// error the current contexts stay in place.
    pub fn reload(&mut self, settings: TlsSettings) -> Result<(), ConfigError> {
        match TlsContextStore::initialize(&settings.ssl) {
            Ok(store) => {
                self.contexts.replace(store);
                self.settings = settings;
                info!(cert = %self.settings.ssl.cert.display(), "TLS contexts reloaded");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to reload TLS contexts. Keeping current configuration.");
                Err(e)
            }
        }
    }

    /// Destroy every TLS socket in `engine`, then release the contexts
    ///
    /// Returns the number of sockets destroyed.
    pub fn unload(self, engine: &mut SocketEngine) -> usize {
        let destroyed = engine.destroy_where(|socket| socket.io().is_tls());
        info!(destroyed, "TLS sockets destroyed");

        // Sessions living outside the engine keep the contexts alive
        match Rc::try_unwrap(self.contexts) {
            Ok(contexts) => {
                if let Err(store) = contexts.teardown() {
                    error!(
                        holders = Arc::strong_count(&store) - 1,
                        "TLS contexts still in use at unload"
                    );
                }
            }
            Err(shared) => {
                error!(
                    sessions = Rc::strong_count(&shared) - 1,
                    "TLS sessions outlive module unload"
                );
            }
        }
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{NullHandler, Socket};
    use socket2::Domain;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SERVER_PEM: &str = include_str!("../../tests/data/server.pem");

    fn settings(pem: &NamedTempFile) -> TlsSettings {
        TlsSettings::with_files(pem.path(), pem.path())
    }

    fn pem_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SERVER_PEM.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_uplink_io_follows_settings() {
        let pem = pem_file();
        let mut cfg = settings(&pem);

        let module = TlsModule::load(cfg.clone()).unwrap();
        assert!(!module.uplink_io().is_tls());

        cfg.uplink.ssl = true;
        let module = TlsModule::load(cfg).unwrap();
        assert!(module.uplink_io().is_tls());
        assert!(module.has_identity());
    }

    #[test]
    fn test_failed_reload_keeps_contexts() {
        let pem = pem_file();
        let mut module = TlsModule::load(settings(&pem)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let broken = TlsSettings::with_files(pem.path(), dir.path().join("missing.key"));
        assert!(module.reload(broken).is_err());
        assert_eq!(module.settings().ssl.key, pem.path());
        assert!(module.has_identity());
    }

    #[test]
    fn test_reload_switches_identity() {
        let pem = pem_file();
        let mut module = TlsModule::load(settings(&pem)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        module
            .reload(TlsSettings::with_files(dir.path().join("a.crt"), dir.path().join("a.key")))
            .unwrap();
        assert!(!module.has_identity());
    }

    #[test]
    fn test_unload_destroys_only_tls_sockets() {
        let pem = pem_file();
        let module = TlsModule::load(settings(&pem)).unwrap();
        let mut engine = SocketEngine::new();

        let tls = Socket::outbound(Domain::IPV4, module.tls_io(), Box::new(NullHandler)).unwrap();
        let plain =
            Socket::outbound(Domain::IPV4, module.plain_io(), Box::new(NullHandler)).unwrap();
        let tls_fd = engine.add(tls);
        let plain_fd = engine.add(plain);

        assert_eq!(module.unload(&mut engine), 1);
        assert!(!engine.contains(tls_fd));
        assert!(engine.contains(plain_fd));
    }
}
