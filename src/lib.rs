//! hubsock - TLS-capable TCP transport for home-automation hubs
//!
//! hubsock provides blocking, timeout-bounded client connections with
//! connect retry and optional TLS, plus a multiplexed server that accepts
//! many clients on a dedicated thread and reports their traffic through
//! callbacks. Every failure maps to one [`ErrorKind`] so callers can tell a
//! slow peer ([`ErrorKind::Timeout`]) from a dead one ([`ErrorKind::Closed`]).
//!
//! The transport imposes no framing: reads deliver byte chunks as received.
//!
//! ```no_run
//! use hubsock::{ClientOptions, TcpSocket};
//!
//! let socket = TcpSocket::new(ClientOptions::new("ccu.local", 2001))?;
//! socket.open()?;
//! socket.write(b"ping")?;
//! let mut buf = [0u8; 4096];
//! let n = socket.read(&mut buf)?;
//! println!("received {n} bytes");
//! # Ok::<(), hubsock::Error>(())
//! ```

// Internal-only modules
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod transport;

// These are the intended public API
pub use error::{Error, ErrorKind};
pub use transport::{
    CipherPolicy, ClientId, ClientOptions, Handle, HandleRegistry, HandleTable, PemSource,
    ServerCallbacks, ServerOptions, TcpServer, TcpSocket, TlsOptions, MAX_CONNECTION_RETRIES,
    MAX_WRITE_SIZE,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::error::{Error, ErrorKind};
    pub use crate::transport::{
        ClientId, ClientOptions, ServerCallbacks, ServerOptions, TcpServer, TcpSocket, TlsOptions,
    };
}
