//! TLS layer settings
//!
//! Settings are read from a TOML file:
//!
//! ```toml
//! [ssl]
//! cert = "data/service.crt"
//! key = "data/service.key"
//! min_version = "TLSv1.2"
//!
//! [uplink]
//! ssl = true
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::tls::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default certificate path
pub const DEFAULT_CERT_FILE: &str = "data/service.crt";

/// Default private key path
pub const DEFAULT_KEY_FILE: &str = "data/service.key";

/// Session id context scoping session resumption to this service
pub const DEFAULT_SESSION_ID_CONTEXT: &str = "tlsio";

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(self) -> openssl::ssl::SslVersion {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = ConfigError;

    /// Case-insensitive, accepts both `TLSv1.2` and `TLS1.2` spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(ConfigError::InvalidVersion(s.to_string())),
        }
    }
}

impl TryFrom<String> for TlsVersion {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for the certificate, key and protocol policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SslSection {
    /// PEM certificate file
    pub cert: PathBuf,
    /// PEM private key file (may be the same file as `cert`)
    pub key: PathBuf,
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
    pub session_id_context: String,
}

impl Default for SslSection {
    fn default() -> Self {
        SslSection {
            cert: PathBuf::from(DEFAULT_CERT_FILE),
            key: PathBuf::from(DEFAULT_KEY_FILE),
            min_version: None,
            max_version: None,
            session_id_context: DEFAULT_SESSION_ID_CONTEXT.to_string(),
        }
    }
}

/// Settings for the outbound uplink connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UplinkSection {
    /// Whether the uplink connection is TLS-wrapped
    pub ssl: bool,
}

/// Complete TLS layer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub ssl: SslSection,
    pub uplink: UplinkSection,
}

impl TlsSettings {
    /// Settings with explicit certificate and key paths, everything else default
    pub fn with_files(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        TlsSettings {
            ssl: SslSection {
                cert: cert.into(),
                key: key.into(),
                ..SslSection::default()
            },
            uplink: UplinkSection::default(),
        }
    }

    /// Parse settings from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings: TlsSettings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(min), Some(max)) = (self.ssl.min_version, self.ssl.max_version) {
            if min > max {
                return Err(ConfigError::InvalidVersion(format!(
                    "min_version {} is above max_version {}",
                    min, max
                )));
            }
        }
        Ok(())
    }
}
