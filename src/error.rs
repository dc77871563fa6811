use thiserror::Error;

/// The error type for hubsock operations.
///
/// Every variant belongs to exactly one [`ErrorKind`], which is what callers
/// should match on when choosing a recovery strategy: reconnect on
/// [`ErrorKind::Closed`], back off on [`ErrorKind::Timeout`], give up on
/// [`ErrorKind::DataLimit`] or [`ErrorKind::Tls`].
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Parameter and Configuration Errors
    // ============================================================================

    /// Required connection parameters (hostname, port) are missing or invalid.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Configuration lookup failed or a value had the wrong type.
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    // ============================================================================
    // Socket Errors
    // ============================================================================

    /// A socket operation failed (socket creation, bind, setsockopt,
    /// connect completion, a failed write call).
    #[error("Socket operation failed: {0}")]
    Operation(String),

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A readiness wait for connect, read, or write expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The peer closed the connection or the local handle is no longer valid.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// A write payload exceeded the hard size cap.
    #[error("Data size {size} exceeds the limit of {limit} bytes")]
    DataLimit {
        /// Size of the rejected payload.
        size: usize,
        /// The cap it exceeded.
        limit: usize,
    },

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate material from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load a TLS private key from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate data is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key data is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Diffie-Hellman parameters could not be loaded or parsed.
    #[error("Invalid DH parameters: {0}")]
    TlsInvalidDhParams(String),

    /// Verification or mutual authentication is enabled without trust material.
    #[error("No trusted certificate authorities configured: {0}")]
    TlsMissingTrust(String),

    /// TLS is enabled for a server, but no certificate and key were provided.
    #[error("TLS is enabled but no server certificate and key are specified")]
    TlsServerConfigMissing,

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    /// TLS handshake or peer verification failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or malformed parameters or configuration.
    InvalidParameters,
    /// OS-level socket failure.
    Operation,
    /// A readiness wait expired ("slow peer").
    Timeout,
    /// The connection is gone ("dead peer").
    Closed,
    /// An oversized write was rejected before touching the socket.
    DataLimit,
    /// TLS setup, handshake, or verification failure.
    Tls,
}

impl Error {
    /// Returns the taxonomy entry of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidParameters(_) | Error::Config(_) => ErrorKind::InvalidParameters,
            Error::Operation(_) | Error::Io(_) => ErrorKind::Operation,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Closed(_) => ErrorKind::Closed,
            Error::DataLimit { .. } => ErrorKind::DataLimit,
            Error::TlsCertificateLoad { .. }
            | Error::TlsKeyLoad { .. }
            | Error::TlsInvalidCertificate(_)
            | Error::TlsInvalidKey(_)
            | Error::TlsInvalidDhParams(_)
            | Error::TlsMissingTrust(_)
            | Error::TlsServerConfigMissing
            | Error::TlsInvalidServerName(_)
            | Error::TlsServerConfigBuild(_)
            | Error::TlsClientConfigBuild(_)
            | Error::TlsHandshake(_) => ErrorKind::Tls,
        }
    }

    /// Returns true if a readiness wait expired.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Returns true if the connection was closed by the peer or locally.
    pub fn is_closed(&self) -> bool {
        self.kind() == ErrorKind::Closed
    }
}
