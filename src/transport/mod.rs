//! TCP transport with optional TLS.
//!
//! [`TcpSocket`] is the client side: connect with retry, then blocking reads
//! and writes bounded by timeouts. [`TcpServer`] runs an accept and read
//! loop on its own thread and reports new clients and received bytes through
//! [`ServerCallbacks`]. Both keep their sockets in a [`HandleRegistry`].

mod handle;
mod interface;
mod net;
mod options;
mod server;
mod tcp;
mod tls;
mod tls_config;
mod verifier;

pub use handle::{Handle, HandleRegistry, HandleTable};
pub use interface::ServerCallbacks;
pub use options::{CipherPolicy, ClientOptions, PemSource, ServerOptions, TlsOptions};
pub use server::TcpServer;
pub use tcp::TcpSocket;

use std::time::Duration;

/// Identifier of a client accepted by a [`TcpServer`].
///
/// Ids are assigned in increasing order and never reused by the same server.
pub type ClientId = usize;

/// Largest payload a single write accepts.
pub const MAX_WRITE_SIZE: usize = 100 * 1024 * 1024;

/// Upper bound for connection attempts per connect.
pub const MAX_CONNECTION_RETRIES: u32 = 10;

const CONNECT_RETRY_BACKOFF: Duration = Duration::from_millis(200);
const CLIENT_ID_RANGE_START: ClientId = 1000;
