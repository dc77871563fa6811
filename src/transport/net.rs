//! Address resolution plus client and listening socket construction.

use crate::error::Error;

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace, warn};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
const KEEPALIVE_PROBES: u32 = 4;

const LISTEN_BACKLOG: i32 = 100;

/// Resolves `host:port` to every candidate address, in resolver order.
///
/// Resolution failures are reported as [`Error::Operation`] and are never
/// retried by callers.
pub(crate) fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|err| {
            Error::Operation(format!("Could not resolve host {host} on port {port}: {err}"))
        })?
        .collect();

    if addrs.is_empty() {
        return Err(Error::Operation(format!(
            "Could not resolve host {host} on port {port}: no addresses"
        )));
    }
    trace!(host, port, count = addrs.len(), "Resolved address");
    Ok(addrs)
}

/// Opens a keep-alive TCP connection to `addr`, waiting up to `timeout` for
/// the connect to complete. The returned stream is non-blocking.
pub(crate) fn connect_stream(addr: SocketAddr, timeout: Duration) -> io::Result<mio::net::TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_tcp_keepalive(&keepalive())?;

    // socket2 rejects a zero connect timeout.
    let timeout = timeout.max(Duration::from_millis(1));
    socket.connect_timeout(&SockAddr::from(addr), timeout)?;
    socket.set_nonblocking(true)?;

    let stream: std::net::TcpStream = socket.into();
    Ok(mio::net::TcpStream::from_std(stream))
}

fn keepalive() -> TcpKeepalive {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
    let keepalive = keepalive
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_PROBES);
    keepalive
}

/// Binds a non-blocking, address-reusing listener. Every resolved candidate
/// is tried in order and the first successful bind wins.
pub(crate) fn bind_listener(address: &str, port: u16) -> Result<mio::net::TcpListener, Error> {
    let mut last_err = None;

    for addr in resolve(address, port)? {
        match bind_one(addr) {
            Ok(listener) => {
                debug!(%addr, "Bound listener");
                return Ok(listener);
            }
            Err(err) => {
                warn!(%addr, ?err, "Could not bind candidate address");
                last_err = Some(err);
            }
        }
    }

    let detail = last_err.map(|err| err.to_string()).unwrap_or_default();
    Err(Error::Operation(format!(
        "Could not bind to {address} on port {port}: {detail}"
    )))
}

fn bind_one(addr: SocketAddr) -> io::Result<mio::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(mio::net::TcpListener::from_std(listener))
}
