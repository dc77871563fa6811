//! Resource registry for socket handles.
//!
//! Every socket the crate opens or accepts is owned by a [`Handle`] created
//! through a [`HandleRegistry`]. Handles are reference counted; closing or
//! shutting one down is idempotent, tears down an attached TLS session first
//! and leaves the handle permanently invalid. The registry's table lock is
//! also what the server holds while it inspects a handle and registers it
//! for readiness, so a concurrent close cannot slip in between.

use super::tls::TlsSession;
use crate::error::Error;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const READY_TOKEN: Token = Token(0);

/// Table of live handles, keyed by handle id.
pub type HandleTable = HashMap<u64, Weak<Handle>>;

/// Owner of every socket handle.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: Mutex<HandleTable>,
    next_id: AtomicU64,
}

impl HandleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide registry used when no explicit one is supplied.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<HandleRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(HandleRegistry::new).clone()
    }

    /// Takes ownership of a connected stream and returns its handle.
    pub(crate) fn add(self: &Arc<Self>, stream: mio::net::TcpStream) -> Result<Arc<Handle>, Error> {
        let socket = Socket::new(stream)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(Handle {
            id,
            registry: Arc::clone(self),
            socket: Mutex::new(Some(Arc::new(socket))),
            valid: AtomicBool::new(true),
        });
        self.lock().insert(id, Arc::downgrade(&handle));
        trace!(id, "Registered handle");
        Ok(handle)
    }

    /// Shuts the handle down and releases its socket. Idempotent.
    pub fn close(&self, handle: &Handle) {
        handle.shutdown();
        let socket = handle
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if socket.is_some() {
            debug!(id = handle.id, "Closed handle");
        }
    }

    /// Shuts the handle down without releasing its socket. Idempotent.
    pub fn shutdown(&self, handle: &Handle) {
        handle.shutdown();
    }

    /// Closes every handle still alive in this registry.
    pub fn close_all(&self) {
        let handles: Vec<Arc<Handle>> = self.lock().values().filter_map(Weak::upgrade).collect();
        for handle in &handles {
            self.close(handle);
        }
    }

    /// Locks the handle table.
    ///
    /// Hold the guard only for short inspect-then-register sequences. A
    /// handle must not be dropped while the guard is held.
    pub fn lock(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of handles currently alive.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no handle is alive.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Reference-counted owner of one socket plus its optional TLS session.
#[derive(Debug)]
pub struct Handle {
    id: u64,
    registry: Arc<HandleRegistry>,
    socket: Mutex<Option<Arc<Socket>>>,
    valid: AtomicBool,
}

impl Handle {
    /// Registry-unique id of this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns false once the handle was closed or shut down.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// The registry that owns this handle.
    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Remote address of the socket, if still known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|socket| socket.peer_addr)
    }

    pub(crate) fn socket(&self) -> Option<Arc<Socket>> {
        if !self.is_valid() {
            return None;
        }
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.socket().map(|socket| socket.stream.as_raw_fd())
    }

    fn shutdown(&self) {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(socket) = socket {
            socket.teardown();
        }
        debug!(id = self.id, "Shut down handle");
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shutdown();
        self.registry.lock().remove(&self.id);
    }
}

/// The descriptor and TLS state behind a handle, plus private readiness
/// waiters for blocking reads and writes.
pub(crate) struct Socket {
    stream: mio::net::TcpStream,
    tls: Mutex<Option<TlsSession>>,
    read_poll: Mutex<Poll>,
    write_poll: Mutex<Poll>,
    peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.stream.as_raw_fd())
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl Socket {
    fn new(stream: mio::net::TcpStream) -> Result<Self, Error> {
        let fd = stream.as_raw_fd();
        let read_poll = Poll::new()?;
        read_poll
            .registry()
            .register(&mut SourceFd(&fd), READY_TOKEN, Interest::READABLE)?;
        let write_poll = Poll::new()?;
        write_poll
            .registry()
            .register(&mut SourceFd(&fd), READY_TOKEN, Interest::WRITABLE)?;

        Ok(Self {
            peer_addr: stream.peer_addr().ok(),
            stream,
            tls: Mutex::new(None),
            read_poll: Mutex::new(read_poll),
            write_poll: Mutex::new(write_poll),
        })
    }

    pub(crate) fn stream(&self) -> &mio::net::TcpStream {
        &self.stream
    }

    pub(crate) fn attach_tls(&self, session: TlsSession) {
        *self.tls_guard() = Some(session);
    }

    fn tls_guard(&self) -> MutexGuard<'_, Option<TlsSession>> {
        self.tls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One non-blocking read attempt.
    ///
    /// Returns the number of bytes read (zero on end of stream) and whether
    /// the TLS layer still holds decrypted bytes for an immediate next read.
    /// Fails with `WouldBlock` if nothing is available yet.
    pub(crate) fn read_now(&self, buf: &mut [u8]) -> io::Result<(usize, bool)> {
        let mut tls = self.tls_guard();
        let Some(session) = tls.as_mut() else {
            return (&self.stream).read(buf).map(|n| (n, false));
        };

        loop {
            let result = session.reader().read(buf);
            match result {
                Ok(n) => {
                    let state = session.process_new_packets().map_err(invalid_data)?;
                    return Ok((n, state.plaintext_bytes_to_read() > 0));
                }
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok((0, false)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }

            if session.read_tls(&mut &self.stream)? == 0 {
                return Ok((0, false));
            }
            session.process_new_packets().map_err(invalid_data)?;
            match flush_tls(session, &self.stream) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// One non-blocking write attempt. Returns how many bytes of `data` were
    /// accepted. TLS records that could not be sent yet stay queued for
    /// [`Socket::flush_now`].
    pub(crate) fn write_now(&self, data: &[u8]) -> io::Result<usize> {
        let mut tls = self.tls_guard();
        let Some(session) = tls.as_mut() else {
            return (&self.stream).write(data);
        };

        flush_tls(session, &self.stream)?;
        let written = session.writer().write(data)?;
        match flush_tls(session, &self.stream) {
            Ok(()) => Ok(written),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(written),
            Err(err) => Err(err),
        }
    }

    /// Sends queued TLS records. Fails with `WouldBlock` while some remain.
    pub(crate) fn flush_now(&self) -> io::Result<()> {
        match self.tls_guard().as_mut() {
            Some(session) => flush_tls(session, &self.stream),
            None => Ok(()),
        }
    }

    /// Non-destructive liveness probe.
    pub(crate) fn peek_alive(&self) -> bool {
        let mut byte = [0u8; 1];
        match self.stream.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(err) => matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
        }
    }

    /// Waits until the socket may be readable. Returns false on timeout.
    pub(crate) fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        wait_ready(&self.read_poll, timeout)
    }

    /// Waits until the socket may be writable. Returns false on timeout.
    pub(crate) fn wait_writable(&self, timeout: Duration) -> io::Result<bool> {
        wait_ready(&self.write_poll, timeout)
    }

    fn teardown(&self) {
        if let Some(mut session) = self.tls_guard().take() {
            session.send_close_notify();
            // Best effort, the peer may already be gone.
            let _ = session.write_tls(&mut &self.stream);
        }
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
            Err(err) => trace!(?err, "Error shutting down socket"),
        }
    }
}

pub(crate) fn flush_tls(session: &mut TlsSession, stream: &mio::net::TcpStream) -> io::Result<()> {
    while session.wants_write() {
        if session.write_tls(&mut &*stream)? == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
    }
    Ok(())
}

pub(crate) fn invalid_data(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

fn wait_ready(poll: &Mutex<Poll>, timeout: Duration) -> io::Result<bool> {
    let mut poll = poll.lock().unwrap_or_else(PoisonError::into_inner);
    let mut events = Events::with_capacity(4);
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match poll.poll(&mut events, Some(remaining)) {
            Ok(()) => return Ok(!events.is_empty()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}
