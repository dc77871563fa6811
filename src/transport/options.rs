//! Configuration surface for client sockets and servers.
//!
//! All option structs can be filled in directly or loaded from a
//! [`config::Config`]. Configuration lookup follows the same priority for
//! every key:
//! 1. `{name}.{key}` (e.g., `ccu.hostname`)
//! 2. `{key}` (e.g., `hostname`)
//! 3. Hard-coded default

use crate::config::{
    get_namespaced_bool, get_namespaced_string, get_namespaced_u64, get_namespaced_usize,
    optional,
};
use crate::error::Error;
use ::config::Config;

use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_CONNECTION_RETRIES: u32 = 3;
const DEFAULT_MAX_CONNECTIONS: usize = 100;
const DEFAULT_CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// PEM material supplied either as a file path or as an in-memory blob.
///
/// Both forms are equivalent inputs to TLS setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PemSource {
    /// Path to a PEM file.
    File(PathBuf),
    /// PEM text held in memory.
    Data(Vec<u8>),
}

impl PemSource {
    /// Reads the PEM bytes. Files are read on every call.
    pub(crate) fn read(&self) -> std::io::Result<Cow<'_, [u8]>> {
        match self {
            PemSource::File(path) => std::fs::read(path).map(Cow::Owned),
            PemSource::Data(data) => Ok(Cow::Borrowed(data)),
        }
    }

    /// Human readable origin, used in error messages.
    pub(crate) fn describe(&self) -> String {
        match self {
            PemSource::File(path) => path.display().to_string(),
            PemSource::Data(_) => "in-memory PEM data".to_string(),
        }
    }
}

impl From<PathBuf> for PemSource {
    fn from(path: PathBuf) -> Self {
        PemSource::File(path)
    }
}

impl From<String> for PemSource {
    fn from(data: String) -> Self {
        PemSource::Data(data.into_bytes())
    }
}

/// Cipher-suite policy applied to every TLS session of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherPolicy {
    /// Every suite of the crypto provider, TLS 1.2 and TLS 1.3.
    #[default]
    Normal,
    /// TLS 1.3 suites only.
    Tls13,
}

impl CipherPolicy {
    /// Parses a policy string (`"NORMAL"` or `"TLS13"`, case-insensitive).
    pub fn parse(policy: &str) -> Result<Self, Error> {
        match policy.to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(CipherPolicy::Normal),
            "TLS13" => Ok(CipherPolicy::Tls13),
            _ => Err(Error::InvalidParameters(format!(
                "Unknown cipher policy '{policy}', expected one of: NORMAL, TLS13"
            ))),
        }
    }
}

/// TLS material and policy for one socket object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// Trusted certificate authorities.
    pub ca: Option<PemSource>,
    /// Local certificate chain. Required for servers, optional for clients.
    pub cert: Option<PemSource>,
    /// Private key matching `cert`.
    pub key: Option<PemSource>,
    /// Diffie-Hellman parameters (servers only).
    pub dh_params: Option<PemSource>,
    /// Client role: fail the handshake on any certificate problem.
    pub verify_certificate: bool,
    /// Server role: require and verify a client certificate.
    pub require_client_cert: bool,
    /// Negotiated cipher-suite policy.
    pub cipher_policy: CipherPolicy,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            ca: None,
            cert: None,
            key: None,
            dh_params: None,
            verify_certificate: true,
            require_client_cert: false,
            cipher_policy: CipherPolicy::Normal,
        }
    }
}

impl TlsOptions {
    /// Loads TLS options if the `tls` key is enabled, `None` otherwise.
    pub fn from_config(config: &Config, name: &str) -> Result<Option<Self>, Error> {
        let enabled = optional(get_namespaced_bool(config, name, "tls"))?.unwrap_or(false);
        if !enabled {
            return Ok(None);
        }

        let cipher_policy = match optional(get_namespaced_string(config, name, "tls_cipher_policy"))? {
            Some(policy) => CipherPolicy::parse(&policy)?,
            None => CipherPolicy::Normal,
        };

        Ok(Some(Self {
            ca: pem_source(config, name, "tls_ca_cert", "tls_ca_data")?,
            cert: pem_source(config, name, "tls_cert", "tls_cert_data")?,
            key: pem_source(config, name, "tls_key", "tls_key_data")?,
            dh_params: pem_source(config, name, "tls_dh_params", "tls_dh_params_data")?,
            verify_certificate: optional(get_namespaced_bool(config, name, "tls_verify_certificate"))?
                .unwrap_or(true),
            require_client_cert: optional(get_namespaced_bool(config, name, "tls_require_client_cert"))?
                .unwrap_or(false),
            cipher_policy,
        }))
    }
}

// In-memory data wins over a file path when both are configured.
fn pem_source(
    config: &Config,
    name: &str,
    file_key: &str,
    data_key: &str,
) -> Result<Option<PemSource>, Error> {
    if let Some(data) = optional(get_namespaced_string(config, name, data_key))? {
        if !data.is_empty() {
            return Ok(Some(PemSource::Data(data.into_bytes())));
        }
    }
    match optional(get_namespaced_string(config, name, file_key))? {
        Some(path) if !path.is_empty() => Ok(Some(PemSource::File(PathBuf::from(path)))),
        _ => Ok(None),
    }
}

fn micros(config: &Config, name: &str, key: &str, default: Duration) -> Result<Duration, Error> {
    Ok(optional(get_namespaced_u64(config, name, key))?
        .map(Duration::from_micros)
        .unwrap_or(default))
}

/// Options of a client-mode [`TcpSocket`](crate::TcpSocket).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Host name or address literal to connect to.
    pub hostname: String,
    /// Remote port. Zero means "not configured".
    pub port: u16,
    /// TLS settings, `None` for plaintext.
    pub tls: Option<TlsOptions>,
    /// Bound on each read readiness wait, on connect completion and on the
    /// client TLS handshake.
    pub read_timeout: Duration,
    /// Bound on each write readiness wait.
    pub write_timeout: Duration,
    /// Connection attempts per connect, clamped to `[1, 10]`.
    pub connection_retries: u32,
    /// Reconnect transparently from `read`/`write` when disconnected.
    pub auto_connect: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: 0,
            tls: None,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            connection_retries: DEFAULT_CONNECTION_RETRIES,
            auto_connect: false,
        }
    }
}

impl ClientOptions {
    /// Plaintext options for `hostname:port` with default timeouts.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            ..Self::default()
        }
    }

    /// Loads client options from configuration.
    ///
    /// # Configuration Keys
    ///
    /// - `hostname`, `port`
    /// - `read_timeout_us`, `write_timeout_us`
    /// - `connection_retries`, `auto_connect`
    /// - `tls` and the `tls_*` keys of [`TlsOptions`]
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let port = match optional(get_namespaced_u64(config, name, "port"))? {
            Some(port) => u16::try_from(port)
                .map_err(|_| Error::InvalidParameters(format!("Port {port} is out of range")))?,
            None => 0,
        };

        Ok(Self {
            hostname: optional(get_namespaced_string(config, name, "hostname"))?.unwrap_or_default(),
            port,
            tls: TlsOptions::from_config(config, name)?,
            read_timeout: micros(config, name, "read_timeout_us", DEFAULT_TIMEOUT)?,
            write_timeout: micros(config, name, "write_timeout_us", DEFAULT_TIMEOUT)?,
            connection_retries: optional(get_namespaced_u64(config, name, "connection_retries"))?
                .map(|retries| retries.min(u32::MAX as u64) as u32)
                .unwrap_or(DEFAULT_CONNECTION_RETRIES),
            auto_connect: optional(get_namespaced_bool(config, name, "auto_connect"))?.unwrap_or(false),
        })
    }
}

/// Options of a [`TcpServer`](crate::TcpServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// TLS settings, `None` for plaintext.
    pub tls: Option<TlsOptions>,
    /// Maximum number of registered clients.
    pub max_connections: usize,
    /// Read timeout of accepted client connections.
    pub client_read_timeout: Duration,
    /// Write timeout of accepted client connections (directed sends).
    pub client_write_timeout: Duration,
    /// Bound on the server-side TLS handshake of one accepted client.
    pub handshake_timeout: Duration,
    /// Size of each client's read buffer.
    pub read_buffer_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tls: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            client_read_timeout: DEFAULT_CLIENT_READ_TIMEOUT,
            client_write_timeout: DEFAULT_CLIENT_WRITE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ServerOptions {
    /// Loads server options from configuration.
    ///
    /// # Configuration Keys
    ///
    /// - `max_connections`, `read_buffer_size`
    /// - `client_read_timeout_us`, `client_write_timeout_us`,
    ///   `tls_handshake_timeout_us`
    /// - `tls` and the `tls_*` keys of [`TlsOptions`]
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        Ok(Self {
            tls: TlsOptions::from_config(config, name)?,
            max_connections: optional(get_namespaced_usize(config, name, "max_connections"))?
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            client_read_timeout: micros(config, name, "client_read_timeout_us", DEFAULT_CLIENT_READ_TIMEOUT)?,
            client_write_timeout: micros(config, name, "client_write_timeout_us", DEFAULT_CLIENT_WRITE_TIMEOUT)?,
            handshake_timeout: micros(config, name, "tls_handshake_timeout_us", DEFAULT_HANDSHAKE_TIMEOUT)?,
            read_buffer_size: optional(get_namespaced_usize(config, name, "read_buffer_size"))?
                .unwrap_or(DEFAULT_READ_BUFFER_SIZE)
                .max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_keys_override_globals() {
        let config = Config::builder()
            .set_default("hostname", "global.local")
            .unwrap()
            .set_default("ccu.hostname", "ccu.local")
            .unwrap()
            .set_default("port", 2001)
            .unwrap()
            .set_default("ccu.connection_retries", 15)
            .unwrap()
            .build()
            .unwrap();

        let options = ClientOptions::from_config(&config, "ccu").unwrap();
        assert_eq!(options.hostname, "ccu.local");
        assert_eq!(options.port, 2001);
        assert_eq!(options.connection_retries, 15);
        assert!(options.tls.is_none());

        let options = ClientOptions::from_config(&config, "").unwrap();
        assert_eq!(options.hostname, "global.local");
        assert_eq!(options.connection_retries, DEFAULT_CONNECTION_RETRIES);
    }

    #[test]
    fn in_memory_pem_wins_over_file() {
        let config = Config::builder()
            .set_default("tls", true)
            .unwrap()
            .set_default("tls_ca_cert", "/etc/ssl/ca.pem")
            .unwrap()
            .set_default("tls_ca_data", "-----BEGIN CERTIFICATE-----")
            .unwrap()
            .set_default("tls_cert", "/etc/ssl/cert.pem")
            .unwrap()
            .build()
            .unwrap();

        let tls = TlsOptions::from_config(&config, "").unwrap().unwrap();
        assert_eq!(
            tls.ca,
            Some(PemSource::Data(b"-----BEGIN CERTIFICATE-----".to_vec()))
        );
        assert_eq!(tls.cert, Some(PemSource::File(PathBuf::from("/etc/ssl/cert.pem"))));
        assert!(tls.verify_certificate);
    }

    #[test]
    fn server_defaults_and_overrides() {
        let config = Config::builder()
            .set_default("max_connections", 2)
            .unwrap()
            .set_default("client_read_timeout_us", 250_000)
            .unwrap()
            .build()
            .unwrap();

        let options = ServerOptions::from_config(&config, "").unwrap();
        assert_eq!(options.max_connections, 2);
        assert_eq!(options.client_read_timeout, Duration::from_millis(250));
        assert_eq!(options.client_write_timeout, DEFAULT_CLIENT_WRITE_TIMEOUT);
        assert_eq!(options.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn cipher_policy_parsing() {
        assert_eq!(CipherPolicy::parse("normal").unwrap(), CipherPolicy::Normal);
        assert_eq!(CipherPolicy::parse("TLS13").unwrap(), CipherPolicy::Tls13);
        assert!(CipherPolicy::parse("SECURE256").is_err());
    }
}
