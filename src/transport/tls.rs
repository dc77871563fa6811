//! TLS sessions and the blocking client and server handshakes.
//!
//! A handshake runs on a non-blocking socket: pending records are flushed,
//! incoming records are read and processed, and `WouldBlock` parks the
//! thread on the socket's readiness waiter until the deadline. Any other
//! failure aborts the handshake and shuts the handle down.

use super::handle::{flush_tls, Handle, Socket};
use crate::error::Error;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// TLS session of either role
pub(crate) enum TlsSession {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsSession {
    pub(crate) fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            TlsSession::Server(conn) => conn.read_tls(rd),
            TlsSession::Client(conn) => conn.read_tls(rd),
        }
    }

    pub(crate) fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            TlsSession::Server(conn) => conn.write_tls(wr),
            TlsSession::Client(conn) => conn.write_tls(wr),
        }
    }

    pub(crate) fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsSession::Server(conn) => conn.process_new_packets(),
            TlsSession::Client(conn) => conn.process_new_packets(),
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.wants_write(),
            TlsSession::Client(conn) => conn.wants_write(),
        }
    }

    pub(crate) fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSession::Server(conn) => conn.writer(),
            TlsSession::Client(conn) => conn.writer(),
        }
    }

    pub(crate) fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSession::Server(conn) => conn.reader(),
            TlsSession::Client(conn) => conn.reader(),
        }
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.is_handshaking(),
            TlsSession::Client(conn) => conn.is_handshaking(),
        }
    }

    pub(crate) fn send_close_notify(&mut self) {
        match self {
            TlsSession::Server(conn) => conn.send_close_notify(),
            TlsSession::Client(conn) => conn.send_close_notify(),
        }
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match self {
            TlsSession::Server(conn) => conn.peer_certificates(),
            TlsSession::Client(conn) => conn.peer_certificates(),
        }
    }
}

/// Performs the client handshake on a freshly connected handle and attaches
/// the session. On failure the handle is shut down.
pub(crate) fn connect_handshake(
    handle: &Handle,
    config: Arc<ClientConfig>,
    hostname: &str,
    timeout: Duration,
) -> Result<(), Error> {
    let result = client_session(handle, config, hostname, timeout);
    if let Err(err) = &result {
        warn!(hostname, ?err, "TLS handshake with server failed");
        handle.registry().shutdown(handle);
    }
    result
}

fn client_session(
    handle: &Handle,
    config: Arc<ClientConfig>,
    hostname: &str,
    timeout: Duration,
) -> Result<(), Error> {
    let socket = handle
        .socket()
        .ok_or_else(|| Error::Closed("Handle is invalid".to_string()))?;
    socket.stream().set_nodelay(true)?;

    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| Error::TlsInvalidServerName(hostname.to_string()))?;
    let conn = ClientConnection::new(config, server_name)
        .map_err(|e| Error::TlsHandshake(e.to_string()))?;
    let mut session = TlsSession::Client(conn);

    complete_handshake(&socket, &mut session, timeout)?;

    if session.peer_certificates().is_none_or(|certs| certs.is_empty()) {
        return Err(Error::TlsHandshake("No certificate was found".to_string()));
    }

    debug!(id = handle.id(), hostname, "TLS handshake with server complete");
    socket.attach_tls(session);
    Ok(())
}

/// Performs the server handshake on an accepted handle and attaches the
/// session. On failure the handle is shut down.
pub(crate) fn accept_handshake(
    handle: &Handle,
    config: Arc<ServerConfig>,
    timeout: Duration,
) -> Result<(), Error> {
    let result = server_session(handle, config, timeout);
    if let Err(err) = &result {
        warn!(id = handle.id(), ?err, "TLS handshake with client failed");
        handle.registry().shutdown(handle);
    }
    result
}

fn server_session(handle: &Handle, config: Arc<ServerConfig>, timeout: Duration) -> Result<(), Error> {
    let socket = handle
        .socket()
        .ok_or_else(|| Error::Closed("Handle is invalid".to_string()))?;
    let conn = ServerConnection::new(config).map_err(|e| Error::TlsHandshake(e.to_string()))?;
    let mut session = TlsSession::Server(conn);

    complete_handshake(&socket, &mut session, timeout)?;

    debug!(id = handle.id(), "TLS handshake with client complete");
    socket.attach_tls(session);
    Ok(())
}

fn complete_handshake(socket: &Socket, session: &mut TlsSession, timeout: Duration) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;

    loop {
        match flush_tls(session, socket.stream()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                wait(socket, deadline, true)?;
                continue;
            }
            Err(err) => return Err(Error::TlsHandshake(err.to_string())),
        }

        if !session.is_handshaking() {
            return Ok(());
        }

        match session.read_tls(&mut socket.stream()) {
            Ok(0) => {
                return Err(Error::TlsHandshake(
                    "Connection closed during handshake".to_string(),
                ))
            }
            Ok(_) => {
                if let Err(err) = session.process_new_packets() {
                    // Let the peer see our alert.
                    let _ = flush_tls(session, socket.stream());
                    return Err(Error::TlsHandshake(err.to_string()));
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => wait(socket, deadline, false)?,
            Err(err) => return Err(Error::TlsHandshake(err.to_string())),
        }
    }
}

fn wait(socket: &Socket, deadline: Instant, writable: bool) -> Result<(), Error> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let ready = if writable {
        socket.wait_writable(remaining)
    } else {
        socket.wait_readable(remaining)
    }
    .map_err(|e| Error::TlsHandshake(e.to_string()))?;

    if ready {
        Ok(())
    } else {
        Err(Error::TlsHandshake("Handshake timed out".to_string()))
    }
}
