//! Multiplexed TCP server.
//!
//! The server thread owns the listener and a readiness poll covering the
//! listener plus every registered client. New clients are upgraded to TLS
//! when configured, registered under a fresh [`ClientId`], and announced via
//! the new-connection callback. Bytes read from a client go to the
//! packet-received callback. Clients whose handle became invalid are evicted
//! by garbage collection, which runs on idle ticks and before a new client
//! is rejected for capacity.

use super::handle::{Handle, HandleRegistry};
use super::interface::ServerCallbacks;
use super::net;
use super::options::ServerOptions;
use super::tcp::TcpSocket;
use super::tls::accept_handshake;
use super::tls_config::build_server_config;
use super::{ClientId, CLIENT_ID_RANGE_START};
use crate::error::{Error, ErrorKind};
use ::config::Config;

use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use rustls::ServerConfig;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

const LISTENER_TOKEN: Token = Token(0);
const POLL_TICK: Duration = Duration::from_millis(100);
const REBIND_INTERVAL: Duration = Duration::from_secs(5);
const GC_INTERVAL: Duration = Duration::from_secs(60);
const EVENTS_CAPACITY: usize = 256;
// Socket reads per client and turn, not counting TLS-buffered drains
const READS_PER_TURN: usize = 4;

// Per-client state kept in the client registry
#[derive(Debug)]
struct ClientEntry {
    id: ClientId,
    handle: Arc<Handle>,
    connection: TcpSocket,
    buffer: Mutex<Vec<u8>>,
    address: String,
    port: u16,
}

// State shared between the server thread and the public API
#[derive(Debug)]
struct ServerShared {
    stop: AtomicBool,
    running: AtomicBool,
    clients: Mutex<HashMap<ClientId, Arc<ClientEntry>>>,
    last_gc: Mutex<Instant>,
    next_client_id: AtomicUsize,
    callbacks: ServerCallbacks,
    registry: Arc<HandleRegistry>,
}

/// TCP server running an accept and read loop on a dedicated thread.
///
/// # Example
///
/// ```no_run
/// use hubsock::{ServerCallbacks, ServerOptions, TcpServer};
///
/// let callbacks = ServerCallbacks::new()
///     .on_new_connection(|id, address, port| println!("client {id} from {address}:{port}"))
///     .on_packet_received(|id, data| println!("client {id} sent {} bytes", data.len()));
/// let server = TcpServer::new(ServerOptions::default(), callbacks);
/// let addr = server.start_server("127.0.0.1", 0)?;
/// println!("listening on {addr}");
/// # Ok::<(), hubsock::Error>(())
/// ```
#[derive(Debug)]
pub struct TcpServer {
    options: ServerOptions,
    shared: Arc<ServerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

// ============================================================================
// Constructors
// ============================================================================

impl TcpServer {
    /// Creates a stopped server using the process-wide handle registry.
    pub fn new(options: ServerOptions, callbacks: ServerCallbacks) -> Self {
        Self::with_registry(options, callbacks, HandleRegistry::global())
    }

    /// Creates a stopped server whose client handles live in `registry`.
    pub fn with_registry(
        options: ServerOptions,
        callbacks: ServerCallbacks,
        registry: Arc<HandleRegistry>,
    ) -> Self {
        Self {
            options,
            shared: Arc::new(ServerShared {
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
                clients: Mutex::new(HashMap::new()),
                last_gc: Mutex::new(Instant::now()),
                next_client_id: AtomicUsize::new(CLIENT_ID_RANGE_START),
                callbacks,
                registry,
            }),
            thread: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Creates a server from configuration. See [`ServerOptions::from_config`].
    pub fn from_config(config: &Config, callbacks: ServerCallbacks) -> Result<Self, Error> {
        Self::new_named(config, "", callbacks)
    }

    /// Creates a server from configuration with `{name}.{key}` lookups.
    pub fn new_named(config: &Config, name: &str, callbacks: ServerCallbacks) -> Result<Self, Error> {
        Ok(Self::new(ServerOptions::from_config(config, name)?, callbacks))
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl TcpServer {
    /// Starts listening on `address:port` and spawns the server thread.
    ///
    /// A running server is stopped first. The TLS context is rebuilt on every
    /// start; TLS and bind failures are returned and leave the server
    /// stopped. Returns the bound address, useful with port 0.
    #[instrument(skip(self))]
    pub fn start_server(&self, address: &str, port: u16) -> Result<SocketAddr, Error> {
        self.wait_for_server_stopped();

        let tls_config = self
            .options
            .tls
            .as_ref()
            .map(build_server_config)
            .transpose()?;

        let mut listener = net::bind_listener(address, port)?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let server_loop = ServerLoop {
            shared: Arc::clone(&self.shared),
            options: self.options.clone(),
            tls_config,
            address: address.to_string(),
            port,
            listener: Some(listener),
            poll,
            pending: BTreeSet::new(),
        };

        self.shared.stop.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        *lock(&self.shared.last_gc) = Instant::now();

        let thread = std::thread::Builder::new()
            .name("hubsock-server".to_string())
            .spawn(move || server_loop.run());
        let thread = match thread {
            Ok(thread) => thread,
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(err.into());
            }
        };

        *lock(&self.thread) = Some(thread);
        *lock(&self.local_addr) = Some(local_addr);
        info!(%local_addr, tls = self.options.tls.is_some(), "Server started");
        Ok(local_addr)
    }

    /// Asks the server thread to stop. Returns immediately.
    pub fn stop_server(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Stops the server thread, waits for it to exit, and closes every
    /// remaining client connection.
    #[instrument(skip(self))]
    pub fn wait_for_server_stopped(&self) {
        self.stop_server();

        let thread = lock(&self.thread).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("Server thread panicked");
            }
        }

        let clients: Vec<Arc<ClientEntry>> = lock(&self.shared.clients)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &clients {
            self.shared.registry.close(&entry.handle);
        }
        if !clients.is_empty() {
            info!(count = clients.len(), "Closed remaining client connections");
        }
        *lock(&self.local_addr) = None;
    }

    /// Returns true while the server thread is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The address the listener is bound to, while running.
    pub fn local_address(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// The options this server was created with.
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.wait_for_server_stopped();
    }
}

// ============================================================================
// Client Registry
// ============================================================================

impl TcpServer {
    /// Writes `data` to one client, blocking up to the client write timeout.
    ///
    /// Unknown ids are ignored: the client may have disconnected in the
    /// meantime. A failed send closes that client's connection.
    #[instrument(skip(self, data))]
    pub fn send_to_client(&self, id: ClientId, data: impl AsRef<[u8]>) -> Result<(), Error> {
        let entry = lock(&self.shared.clients).get(&id).cloned();
        let Some(entry) = entry else {
            debug!("Client not found when sending data");
            return Ok(());
        };

        match entry.connection.write(data) {
            Ok(len) => {
                trace!(len, "Sent data to client");
                Ok(())
            }
            Err(err) => {
                if err.kind() != ErrorKind::DataLimit {
                    warn!(?err, "Sending to client failed, closing connection");
                    self.shared.registry.close(&entry.handle);
                }
                Err(err)
            }
        }
    }

    /// Closes one client's connection. The entry is evicted by the next
    /// garbage collection. Unknown ids are ignored.
    pub fn close_client(&self, id: ClientId) {
        let entry = lock(&self.shared.clients).get(&id).cloned();
        if let Some(entry) = entry {
            self.shared.registry.close(&entry.handle);
            info!(id, "Closed client connection");
        }
    }

    /// Evicts every client whose handle is no longer valid and returns how
    /// many were removed.
    pub fn collect_garbage(&self) -> usize {
        self.shared.collect_garbage()
    }

    /// Number of registered clients, including ones awaiting eviction.
    pub fn client_count(&self) -> usize {
        self.shared.client_count()
    }
}

impl ServerShared {
    fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    fn collect_garbage(&self) -> usize {
        let removed: Vec<Arc<ClientEntry>> = {
            let mut clients = lock(&self.clients);
            let dead: Vec<ClientId> = clients
                .values()
                .filter(|entry| !entry.handle.is_valid())
                .map(|entry| entry.id)
                .collect();
            dead.iter().filter_map(|id| clients.remove(id)).collect()
        };
        *lock(&self.last_gc) = Instant::now();

        for entry in &removed {
            debug!(id = entry.id, address = %entry.address, port = entry.port, "Connection to client number {} closed", entry.id);
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "Collected garbage");
        }
        removed.len()
    }

    fn gc_due(&self) -> bool {
        lock(&self.last_gc).elapsed() > GC_INTERVAL
    }
}

// ============================================================================
// Server Loop
// ============================================================================

struct ServerLoop {
    shared: Arc<ServerShared>,
    options: ServerOptions,
    tls_config: Option<Arc<ServerConfig>>,
    address: String,
    port: u16,
    listener: Option<TcpListener>,
    poll: Poll,
    // Clients that may still hold unread data after their last turn
    pending: BTreeSet<ClientId>,
}

impl ServerLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.stopping() {
            if self.listener.is_none() {
                self.rebind();
                continue;
            }

            let timeout = if self.pending.is_empty() {
                POLL_TICK
            } else {
                Duration::ZERO
            };
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(?err, "Polling failed");
                    continue;
                }
            }

            let idle = events.is_empty() && self.pending.is_empty();
            if self.shared.gc_due()
                || (idle && self.shared.client_count() >= self.options.max_connections)
            {
                self.shared.collect_garbage();
            }
            if idle {
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(id) => {
                        self.pending.insert(id);
                    }
                }
            }
            self.serve_pending();
        }

        self.shared.running.store(false, Ordering::Release);
        info!("Server stopped");
    }

    // Gives every pending client one bounded turn. Clients that still have
    // data stay pending for the next iteration.
    fn serve_pending(&mut self) {
        let ids = std::mem::take(&mut self.pending);
        for id in ids {
            if self.stopping() {
                return;
            }
            if self.read_client(id) {
                self.pending.insert(id);
            }
        }
    }

    fn stopping(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    fn rebind(&mut self) {
        let deadline = Instant::now() + REBIND_INTERVAL;
        while Instant::now() < deadline {
            if self.stopping() {
                return;
            }
            std::thread::sleep(POLL_TICK);
        }

        match net::bind_listener(&self.address, self.port) {
            Ok(mut listener) => {
                match self
                    .poll
                    .registry()
                    .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
                {
                    Ok(()) => {
                        info!(address = %self.address, port = self.port, "Listener bound again");
                        self.listener = Some(listener);
                    }
                    Err(err) => error!(?err, "Could not register listener"),
                }
            }
            Err(err) => error!(?err, "Could not bind listener"),
        }
    }

    fn accept_connections(&mut self) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer_addr)) => self.accept_client(stream, peer_addr),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(?err, "Client went away before it was accepted");
                }
                Err(err) => {
                    error!(?err, "Accepting connections failed, dropping listener");
                    if let Some(mut listener) = self.listener.take() {
                        let _ = self.poll.registry().deregister(&mut listener);
                    }
                    return;
                }
            }
        }
    }

    #[instrument(skip(self, stream))]
    fn accept_client(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(?err, "Could not disable Nagle's algorithm");
        }
        let handle = match self.shared.registry.add(stream) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(?err, "Could not register accepted connection");
                return;
            }
        };

        let max = self.options.max_connections;
        if self.shared.client_count() >= max {
            self.shared.collect_garbage();
            if self.shared.client_count() >= max {
                warn!(max, "Too many connections, rejecting client");
                self.shared.registry.shutdown(&handle);
                return;
            }
        }
        if self.stopping() {
            self.shared.registry.shutdown(&handle);
            return;
        }

        let id = self.shared.next_client_id.fetch_add(1, Ordering::Relaxed);

        if let Some(config) = &self.tls_config {
            if accept_handshake(&handle, Arc::clone(config), self.options.handshake_timeout).is_err() {
                return;
            }
        }

        let connection = TcpSocket::from_handle(
            Arc::clone(&handle),
            self.options.client_read_timeout,
            self.options.client_write_timeout,
        );

        {
            let table = self.shared.registry.lock();
            let Some(fd) = handle.raw_fd() else {
                return;
            };
            if let Err(err) = self
                .poll
                .registry()
                .register(&mut SourceFd(&fd), Token(id), Interest::READABLE)
            {
                drop(table);
                warn!(?err, "Could not watch client connection");
                self.shared.registry.shutdown(&handle);
                return;
            }
        }

        let entry = Arc::new(ClientEntry {
            id,
            handle,
            connection,
            buffer: Mutex::new(vec![0; self.options.read_buffer_size.max(1)]),
            address: peer_addr.ip().to_string(),
            port: peer_addr.port(),
        });
        lock(&self.shared.clients).insert(id, Arc::clone(&entry));
        info!(id, "Accepted connection");

        self.shared
            .callbacks
            .new_connection(id, entry.address.clone(), entry.port);

        // Bytes may already be waiting, some of them inside the TLS session.
        self.pending.insert(id);
    }

    /// Reads from one client for a bounded turn and hands every chunk to the
    /// packet callback. Returns true if the client may still have unread
    /// data, which the edge-triggered poll will not report again.
    fn read_client(&mut self, id: ClientId) -> bool {
        let entry = lock(&self.shared.clients).get(&id).cloned();
        let Some(entry) = entry else {
            return false;
        };
        let Some(socket) = entry.handle.socket() else {
            return false;
        };

        let mut reads = 0;
        loop {
            let mut buffer = lock(&entry.buffer);
            match socket.read_now(&mut buffer) {
                Ok((0, _)) => {
                    info!(id, "Connection to client number {id} closed");
                    self.shared.registry.close(&entry.handle);
                    return false;
                }
                Ok((n, more)) => {
                    let chunk = buffer[..n].to_vec();
                    drop(buffer);
                    trace!(id, len = n, more, "Received data");
                    self.shared.callbacks.packet_received(id, &chunk);
                    if !more {
                        reads += 1;
                        if reads >= READS_PER_TURN || self.stopping() {
                            return true;
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) => {
                    debug!(id, ?err, "Reading from client failed, closing connection");
                    self.shared.registry.close(&entry.handle);
                    return false;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
