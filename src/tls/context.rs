//! Shared TLS contexts
//!
//! One client context and one server context are built when the TLS layer
//! loads and shared by every session of the matching role. Both carry the
//! same certificate and key, an always-accept verification callback and a
//! fixed session id context.

use super::engine::{EngineFactory, EngineRole, OpensslEngine, TlsEngine};
use crate::config::SslSection;
use openssl::error::ErrorStack;
use openssl::ssl::{SslContext, SslContextBuilder, SslFiletype, SslMethod, SslMode, SslVerifyMode};
use openssl::x509::X509StoreContextRef;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration errors; all of them abort loading the TLS layer
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Error initializing {role} TLS context: {source}")]
    ContextCreationFailed {
        role: &'static str,
        source: ErrorStack,
    },

    #[error("Error loading certificate {}: {source}", .path.display())]
    CertificateLoadFailed { path: PathBuf, source: ErrorStack },

    #[error("Error loading private key {}: {reason}", .path.display())]
    PrivateKeyMissing { path: PathBuf, reason: String },

    #[error("Unable to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),
}

/// Peer certificates are not validated at this layer
fn always_accept(_preverified: bool, _ctx: &mut X509StoreContextRef) -> bool {
    true
}

/// The client and server TLS contexts
pub struct TlsContextStore {
    client: SslContext,
    server: SslContext,
    has_identity: bool,
}

impl TlsContextStore {
    /// Build both contexts from the `[ssl]` settings
    ///
    /// A missing certificate file is only a warning: the store is usable for
    /// client connections, but server sessions present no identity. A
    /// certificate without a usable key is fatal.
    pub fn initialize(settings: &SslSection) -> Result<Self, ConfigError> {
        let mut client = new_builder(SslMethod::tls_client(), "client")?;
        let mut server = new_builder(SslMethod::tls_server(), "server")?;

        let has_cert = settings.cert.is_file();
        if has_cert {
            for builder in [&mut client, &mut server] {
                builder
                    .set_certificate_file(&settings.cert, SslFiletype::PEM)
                    .map_err(|source| ConfigError::CertificateLoadFailed {
                        path: settings.cert.clone(),
                        source,
                    })?;
            }
            debug!(path = %settings.cert.display(), "loaded certificate");
        } else {
            warn!(path = %settings.cert.display(), "Unable to open certificate");
        }

        if settings.key.is_file() {
            for builder in [&mut client, &mut server] {
                load_key(builder, &settings.key, has_cert)?;
            }
            debug!(path = %settings.key.display(), "loaded private key");
        } else if has_cert {
            return Err(ConfigError::PrivateKeyMissing {
                path: settings.key.clone(),
                reason: "file not found".to_string(),
            });
        } else {
            warn!(path = %settings.key.display(), "Unable to open private key");
        }

        for (builder, role) in [(&mut client, "client"), (&mut server, "server")] {
            configure(builder, settings)
                .map_err(|source| ConfigError::ContextCreationFailed { role, source })?;
        }

        info!(
            identity = has_cert,
            session_id_context = %settings.session_id_context,
            "TLS contexts initialized"
        );

        Ok(TlsContextStore {
            client: client.build(),
            server: server.build(),
            has_identity: has_cert,
        })
    }

    pub fn client_context(&self) -> &SslContext {
        &self.client
    }

    pub fn server_context(&self) -> &SslContext {
        &self.server
    }

    /// Whether a certificate and key were loaded
    pub fn has_identity(&self) -> bool {
        self.has_identity
    }

    /// Release both contexts
    ///
    /// Every session created from this store must be gone by now.
    pub fn teardown(self) {
        debug!("releasing TLS contexts");
        drop(self);
    }
}

/// The current context store, shared by the module and every session
///
/// Reload swaps the store in place, so sessions forked from a listener
/// created earlier still pick up the new certificate. Engines already
/// allocated keep the contexts they were built from.
pub struct ContextHandle {
    current: RefCell<Arc<TlsContextStore>>,
}

impl ContextHandle {
    pub fn new(store: TlsContextStore) -> Self {
        ContextHandle {
            current: RefCell::new(Arc::new(store)),
        }
    }

    /// The store new engines are created from
    pub fn current(&self) -> Arc<TlsContextStore> {
        self.current.borrow().clone()
    }

    /// Install `store` for every engine created from now on
    pub fn replace(&self, store: TlsContextStore) {
        *self.current.borrow_mut() = Arc::new(store);
    }

    pub fn has_identity(&self) -> bool {
        self.current.borrow().has_identity()
    }

    /// Tear down the current store if nothing else holds it
    ///
    /// Returns the handle back when the store is still shared.
    pub fn teardown(self) -> Result<(), Arc<TlsContextStore>> {
        let store = Arc::try_unwrap(self.current.into_inner())?;
        store.teardown();
        Ok(())
    }
}

impl EngineFactory for ContextHandle {
    fn create(&self, role: EngineRole, fd: RawFd) -> Result<Box<dyn TlsEngine>, ErrorStack> {
        self.current.borrow().create(role, fd)
    }
}

impl EngineFactory for TlsContextStore {
    fn create(&self, role: EngineRole, fd: RawFd) -> Result<Box<dyn TlsEngine>, ErrorStack> {
        let ctx = match role {
            EngineRole::Server => &self.server,
            EngineRole::Client => &self.client,
        };
        Ok(Box::new(OpensslEngine::new(ctx, role, fd)?))
    }
}

fn new_builder(method: SslMethod, role: &'static str) -> Result<SslContextBuilder, ConfigError> {
    SslContextBuilder::new(method)
        .map_err(|source| ConfigError::ContextCreationFailed { role, source })
}

fn load_key(
    builder: &mut SslContextBuilder,
    path: &Path,
    has_cert: bool,
) -> Result<(), ConfigError> {
    builder
        .set_private_key_file(path, SslFiletype::PEM)
        .map_err(|e| ConfigError::PrivateKeyMissing {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if has_cert {
        builder.check_private_key().map_err(|e| ConfigError::PrivateKeyMissing {
            path: path.to_path_buf(),
            reason: format!("key does not match certificate: {}", e),
        })?;
    }
    Ok(())
}

/// Modes, verification, session id context and protocol range
fn configure(builder: &mut SslContextBuilder, settings: &SslSection) -> Result<(), ErrorStack> {
    builder.set_mode(SslMode::ENABLE_PARTIAL_WRITE | SslMode::ACCEPT_MOVING_WRITE_BUFFER);
    builder.set_verify_callback(SslVerifyMode::PEER | SslVerifyMode::CLIENT_ONCE, always_accept);
    builder.set_session_id_context(settings.session_id_context.as_bytes())?;
    if let Some(min) = settings.min_version {
        builder.set_min_proto_version(Some(min.to_openssl_version()))?;
    }
    if let Some(max) = settings.max_version {
        builder.set_max_proto_version(Some(max.to_openssl_version()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsVersion;
    use openssl::ssl::SslVersion;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SERVER_PEM: &str = include_str!("../../tests/data/server.pem");

    fn pem_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn section(cert: &Path, key: &Path) -> SslSection {
        SslSection {
            cert: cert.to_path_buf(),
            key: key.to_path_buf(),
            ..SslSection::default()
        }
    }

    #[test]
    fn test_combined_pem_loads() {
        let pem = pem_file(SERVER_PEM);
        let store = TlsContextStore::initialize(&section(pem.path(), pem.path())).unwrap();
        assert!(store.has_identity());
        store.teardown();
    }

    #[test]
    fn test_missing_cert_and_key_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = TlsContextStore::initialize(&section(
            &dir.path().join("missing.crt"),
            &dir.path().join("missing.key"),
        ))
        .unwrap();
        assert!(!store.has_identity());
    }

    #[test]
    fn test_corrupt_certificate() {
        let corrupt = pem_file(
            "-----BEGIN CERTIFICATE-----\nnot base64 at all\n-----END CERTIFICATE-----\n",
        );
        let pem = pem_file(SERVER_PEM);

        let err = TlsContextStore::initialize(&section(corrupt.path(), pem.path()))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::CertificateLoadFailed { .. }));
    }

    #[test]
    fn test_certificate_without_key() {
        let pem = pem_file(SERVER_PEM);
        let dir = tempfile::tempdir().unwrap();

        let err = TlsContextStore::initialize(&section(pem.path(), &dir.path().join("missing.key")))
            .err()
            .unwrap();
        match err {
            ConfigError::PrivateKeyMissing { reason, .. } => assert_eq!(reason, "file not found"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_key_file_without_key() {
        // Certificate-only PEM used as key file
        let cert_only: String = SERVER_PEM
            .split_inclusive('\n')
            .take_while(|line| !line.contains("PRIVATE KEY"))
            .collect();
        let cert = pem_file(&cert_only);

        let err = TlsContextStore::initialize(&section(cert.path(), cert.path()))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::PrivateKeyMissing { .. }));
    }

    #[test]
    fn test_version_range_applied() {
        let settings = SslSection {
            min_version: Some(TlsVersion::Tls12),
            max_version: Some(TlsVersion::Tls13),
            ..SslSection::default()
        };

        let mut builder = new_builder(SslMethod::tls_server(), "server").unwrap();
        configure(&mut builder, &settings).unwrap();
        assert!(builder.min_proto_version() == Some(SslVersion::TLS1_2));
        assert!(builder.max_proto_version() == Some(SslVersion::TLS1_3));
    }

    #[test]
    fn test_handle_replace_switches_store() {
        let dir = tempfile::tempdir().unwrap();
        let anonymous = TlsContextStore::initialize(&section(
            &dir.path().join("missing.crt"),
            &dir.path().join("missing.key"),
        ))
        .unwrap();
        let handle = ContextHandle::new(anonymous);
        assert!(!handle.has_identity());

        let pem = pem_file(SERVER_PEM);
        handle.replace(TlsContextStore::initialize(&section(pem.path(), pem.path())).unwrap());
        assert!(handle.has_identity());
        assert!(handle.current().has_identity());
    }

    #[test]
    fn test_handle_teardown_waits_for_last_user() {
        let pem = pem_file(SERVER_PEM);
        let handle = ContextHandle::new(
            TlsContextStore::initialize(&section(pem.path(), pem.path())).unwrap(),
        );

        let held = handle.current();
        let store = handle.teardown().err().unwrap();
        assert!(Arc::ptr_eq(&held, &store));
    }
}
