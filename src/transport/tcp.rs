//! Client-mode TCP socket with optional TLS.
//!
//! [`TcpSocket`] connects with bounded retries, upgrades to TLS when
//! configured, and offers blocking reads and writes bounded by per-wait
//! timeouts. Reads and writes are serialized by separate guards; opening
//! and closing take both, so a reconnect never races in-flight I/O.

use super::handle::{Handle, HandleRegistry, Socket};
use super::options::{ClientOptions, TlsOptions};
use super::tls::connect_handshake;
use super::tls_config::build_client_config;
use super::{CONNECT_RETRY_BACKOFF, MAX_CONNECTION_RETRIES, MAX_WRITE_SIZE};
use crate::error::Error;
use crate::transport::net;
use ::config::Config;

use rustls::ClientConfig;
use std::io::{self, ErrorKind};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// A blocking, timeout-bounded TCP connection, plaintext or TLS.
///
/// All I/O methods take `&self`; share the socket between a reader and a
/// writer thread with an `Arc`.
#[derive(Debug)]
pub struct TcpSocket {
    options: ClientOptions,
    tls_config: Option<Arc<ClientConfig>>,
    registry: Arc<HandleRegistry>,
    handle: Mutex<Option<Arc<Handle>>>,
    read_guard: Mutex<()>,
    write_guard: Mutex<()>,
    ip_address: Mutex<Option<IpAddr>>,
}

// ============================================================================
// Constructors
// ============================================================================

impl TcpSocket {
    /// Creates an unconnected socket using the process-wide handle registry.
    ///
    /// The TLS context is built here, so missing trust material or unreadable
    /// certificates fail before any network activity.
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        Self::with_registry(options, HandleRegistry::global())
    }

    /// Creates an unconnected socket whose handles live in `registry`.
    pub fn with_registry(options: ClientOptions, registry: Arc<HandleRegistry>) -> Result<Self, Error> {
        let tls_config = options.tls.as_ref().map(build_client_config).transpose()?;
        Ok(Self {
            options,
            tls_config,
            registry,
            handle: Mutex::new(None),
            read_guard: Mutex::new(()),
            write_guard: Mutex::new(()),
            ip_address: Mutex::new(None),
        })
    }

    /// Creates a socket from configuration. See [`ClientOptions::from_config`].
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates a socket from configuration with `{name}.{key}` lookups.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        Self::new(ClientOptions::from_config(config, name)?)
    }

    // Wraps a descriptor accepted by the server. Any TLS session is already
    // attached to the handle.
    pub(crate) fn from_handle(
        handle: Arc<Handle>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        let peer = handle.peer_addr();
        let options = ClientOptions {
            hostname: peer.map(|addr| addr.ip().to_string()).unwrap_or_default(),
            port: peer.map(|addr| addr.port()).unwrap_or_default(),
            read_timeout,
            write_timeout,
            ..ClientOptions::default()
        };
        Self {
            options,
            tls_config: None,
            registry: Arc::clone(handle.registry()),
            handle: Mutex::new(Some(handle)),
            read_guard: Mutex::new(()),
            write_guard: Mutex::new(()),
            ip_address: Mutex::new(peer.map(|addr| addr.ip())),
        }
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl TcpSocket {
    /// Connects unless already connected.
    ///
    /// Every connection attempt tries each resolved address in order. Failed
    /// attempts are retried after a short backoff up to the configured
    /// number of times (clamped to `[1, 10]`). A TLS handshake failure is
    /// returned immediately.
    #[instrument(skip(self), fields(host = %self.options.hostname, port = self.options.port))]
    pub fn open(&self) -> Result<(), Error> {
        let _read = lock(&self.read_guard);
        let _write = lock(&self.write_guard);
        self.connect_locked()
    }

    /// Connects only if auto-connect is enabled and the socket is not
    /// connected.
    pub fn auto_connect(&self) -> Result<(), Error> {
        if self.options.auto_connect && !self.connected() {
            self.open()?;
        }
        Ok(())
    }

    /// Closes the current connection. Safe to call repeatedly.
    #[instrument(skip(self), fields(host = %self.options.hostname, port = self.options.port))]
    pub fn close(&self) {
        let _read = lock(&self.read_guard);
        let _write = lock(&self.write_guard);
        if let Some(handle) = lock(&self.handle).take() {
            self.registry.close(&handle);
            info!(id = handle.id(), "Closed connection");
        }
    }

    /// Probes whether the connection is still alive without consuming data.
    pub fn connected(&self) -> bool {
        self.current_socket()
            .is_some_and(|(_, socket)| socket.peek_alive())
    }

    /// The address the last successful connect resolved to.
    pub fn ip_address(&self) -> Option<IpAddr> {
        *lock(&self.ip_address)
    }

    fn connect_locked(&self) -> Result<(), Error> {
        if self.connected() {
            return Ok(());
        }
        if let Some(handle) = lock(&self.handle).take() {
            self.registry.close(&handle);
        }

        let hostname = self.options.hostname.as_str();
        let port = self.options.port;
        if hostname.is_empty() || port == 0 {
            return Err(Error::InvalidParameters(
                "Hostname or port is not set".to_string(),
            ));
        }

        let addrs = net::resolve(hostname, port)?;
        let attempts = self.options.connection_retries.clamp(1, MAX_CONNECTION_RETRIES);

        for attempt in 1..=attempts {
            let mut timed_out = false;
            for &addr in &addrs {
                *lock(&self.ip_address) = Some(addr.ip());
                match net::connect_stream(addr, self.options.read_timeout) {
                    Ok(stream) => return self.attach(stream),
                    Err(err) => {
                        timed_out |= err.kind() == ErrorKind::TimedOut;
                        debug!(attempt, %addr, ?err, "Connection attempt failed");
                    }
                }
            }
            if attempt < attempts && !timed_out {
                std::thread::sleep(CONNECT_RETRY_BACKOFF);
            }
        }

        let ip = self
            .ip_address()
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        warn!(host = hostname, %ip, port, attempts, "Giving up connecting");
        Err(Error::Timeout(format!(
            "Connecting to server {hostname} ({ip}) on port {port} timed out."
        )))
    }

    fn attach(&self, stream: mio::net::TcpStream) -> Result<(), Error> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let handle = self.registry.add(stream)?;

        if let Some(config) = &self.tls_config {
            connect_handshake(
                &handle,
                Arc::clone(config),
                &self.options.hostname,
                self.options.read_timeout,
            )?;
        }

        info!(id = handle.id(), %local_addr, %peer_addr, tls = self.tls_config.is_some(), "Connected");
        *lock(&self.handle) = Some(handle);
        Ok(())
    }

    fn current_socket(&self) -> Option<(Arc<Handle>, Arc<Socket>)> {
        let handle = lock(&self.handle).clone()?;
        let socket = handle.socket()?;
        Some((handle, socket))
    }

    fn require_socket(&self) -> Result<(Arc<Handle>, Arc<Socket>), Error> {
        self.current_socket()
            .ok_or_else(|| Error::Closed("Socket is not connected".to_string()))
    }

    fn reconnect_if_needed(&self) -> Result<(), Error> {
        if self.options.auto_connect && self.current_socket().is_none() {
            self.open()?;
        }
        Ok(())
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl TcpSocket {
    /// Reads available bytes into `buf`, waiting up to the read timeout.
    ///
    /// Returns [`Error::Closed`] when the peer closed the connection, never
    /// a zero-length success (except for an empty `buf`).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.read_with_more(buf).map(|(n, _)| n)
    }

    /// Like [`TcpSocket::read`], additionally reporting whether the TLS
    /// layer still holds decrypted bytes, so the next read will not wait.
    pub fn read_with_more(&self, buf: &mut [u8]) -> Result<(usize, bool), Error> {
        if buf.is_empty() {
            return Ok((0, false));
        }
        self.reconnect_if_needed()?;

        let _guard = lock(&self.read_guard);
        let (handle, socket) = self.require_socket()?;
        let deadline = Instant::now() + self.options.read_timeout;

        loop {
            match socket.read_now(buf) {
                Ok((0, _)) => {
                    self.registry.shutdown(&handle);
                    return Err(Error::Closed("Connection to server closed.".to_string()));
                }
                Ok((n, more)) => {
                    trace!(id = handle.id(), len = n, more, "Read data");
                    return Ok((n, more));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if !socket.wait_readable(remaining).map_err(closed)? {
                        return Err(Error::Timeout("Reading from socket timed out.".to_string()));
                    }
                }
                Err(err) => {
                    self.registry.shutdown(&handle);
                    return Err(closed(err));
                }
            }
        }
    }

    /// Writes all of `data`, waiting up to the write timeout whenever the
    /// socket is not writable.
    ///
    /// Payloads above 100 MiB are rejected with [`Error::DataLimit`] before
    /// the socket is touched. A failed write call closes the connection.
    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<usize, Error> {
        let data = data.as_ref();
        if data.is_empty() {
            return Ok(0);
        }
        self.reconnect_if_needed()?;
        if data.len() > MAX_WRITE_SIZE {
            return Err(Error::DataLimit {
                size: data.len(),
                limit: MAX_WRITE_SIZE,
            });
        }

        let _guard = lock(&self.write_guard);
        let (handle, socket) = self.require_socket()?;

        let mut written = 0;
        while written < data.len() {
            match socket.write_now(&data[written..]) {
                Ok(0) => return Err(self.write_failed(&handle, ErrorKind::WriteZero.into())),
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => self.wait_writable(&socket)?,
                Err(err) => return Err(self.write_failed(&handle, err)),
            }
        }

        loop {
            match socket.flush_now() {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => self.wait_writable(&socket)?,
                Err(err) => return Err(self.write_failed(&handle, err)),
            }
        }

        trace!(id = handle.id(), len = written, "Wrote data");
        Ok(written)
    }

    fn wait_writable(&self, socket: &Socket) -> Result<(), Error> {
        if socket.wait_writable(self.options.write_timeout).map_err(closed)? {
            Ok(())
        } else {
            Err(Error::Timeout("Writing to socket timed out.".to_string()))
        }
    }

    fn write_failed(&self, handle: &Handle, err: io::Error) -> Error {
        warn!(id = handle.id(), ?err, "Write failed, closing connection");
        self.registry.close(handle);
        Error::Operation(format!("Could not write to socket: {err}"))
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl TcpSocket {
    /// The options this socket was created with.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Host to connect to.
    pub fn hostname(&self) -> &str {
        &self.options.hostname
    }

    /// Sets the host used by the next connect.
    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.options.hostname = hostname.into();
    }

    /// Port to connect to.
    pub fn port(&self) -> u16 {
        self.options.port
    }

    /// Sets the port used by the next connect.
    pub fn set_port(&mut self, port: u16) {
        self.options.port = port;
    }

    /// Upper bound for one read wait and for connect completion.
    pub fn read_timeout(&self) -> Duration {
        self.options.read_timeout
    }

    /// Sets the read timeout.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.options.read_timeout = timeout;
    }

    /// Upper bound for one write-readiness wait.
    pub fn write_timeout(&self) -> Duration {
        self.options.write_timeout
    }

    /// Sets the write timeout.
    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.options.write_timeout = timeout;
    }

    /// Configured connection attempts, before clamping to `[1, 10]`.
    pub fn connection_retries(&self) -> u32 {
        self.options.connection_retries
    }

    /// Sets the number of connection attempts.
    pub fn set_connection_retries(&mut self, retries: u32) {
        self.options.connection_retries = retries;
    }

    /// Returns true if reads and writes reconnect a dead connection.
    pub fn auto_connect_enabled(&self) -> bool {
        self.options.auto_connect
    }

    /// Enables or disables reconnecting before reads and writes.
    pub fn set_auto_connect(&mut self, enabled: bool) {
        self.options.auto_connect = enabled;
    }

    /// Returns true if connections are upgraded to TLS.
    pub fn is_tls(&self) -> bool {
        self.tls_config.is_some()
    }

    /// Replaces the TLS settings and rebuilds the TLS context. Takes effect
    /// on the next connect.
    pub fn set_tls(&mut self, tls: Option<TlsOptions>) -> Result<(), Error> {
        self.tls_config = tls.as_ref().map(build_client_config).transpose()?;
        self.options.tls = tls;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed(err: io::Error) -> Error {
    Error::Closed(format!("Connection closed: {err}"))
}
