//! Server Lifecycle and Client Registry Tests
//!
//! Capacity limits, garbage collection, directed sends and restarts, driven
//! by plain `std::net` clients.

use hubsock::prelude::*;
use hubsock::MAX_WRITE_SIZE;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("hubsock={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Helper Functions
// ============================================================================

fn start_server(options: ServerOptions) -> (TcpServer, u16, Receiver<(ClientId, String, u16)>) {
    init_tracing();
    let (tx, rx) = channel();
    let callbacks = ServerCallbacks::new().on_new_connection(move |id, address, port| {
        let _ = tx.send((id, address, port));
    });
    let server = TcpServer::new(options, callbacks);
    let port = server.start_server("127.0.0.1", 0).unwrap().port();
    (server, port, rx)
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    stream
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// True if the server closed the stream, false if it is still open
fn closed_by_server(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => !matches!(err.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn new_connection_reports_peer() {
    let (server, port, connections) = start_server(ServerOptions::default());
    assert!(server.is_running());
    assert_eq!(server.local_address().map(|addr| addr.port()), Some(port));

    let stream = connect(port);
    let (id, address, remote_port) = connections.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(id >= 1000);
    assert_eq!(address, "127.0.0.1");
    assert_eq!(remote_port, stream.local_addr().unwrap().port());

    let _second = connect(port);
    let (next_id, _, _) = connections.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(next_id > id);

    server.wait_for_server_stopped();
    assert!(!server.is_running());
    assert_eq!(server.client_count(), 0);
    assert!(server.local_address().is_none());
}

#[test]
fn connections_beyond_capacity_are_closed() {
    let options = ServerOptions {
        max_connections: 2,
        ..ServerOptions::default()
    };
    let (server, port, connections) = start_server(options);

    let mut first = connect(port);
    let mut second = connect(port);
    connections.recv_timeout(Duration::from_secs(5)).unwrap();
    connections.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(server.client_count(), 2);

    let mut third = connect(port);
    let start = Instant::now();
    assert!(closed_by_server(&mut third), "Third connection was kept open");
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(connections.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(server.client_count(), 2);

    // The admitted clients are untouched
    first.set_nonblocking(true).unwrap();
    second.set_nonblocking(true).unwrap();
    assert!(!closed_by_server(&mut first));
    assert!(!closed_by_server(&mut second));
}

#[test]
fn freed_slot_is_reused_after_garbage_collection() {
    let options = ServerOptions {
        max_connections: 1,
        ..ServerOptions::default()
    };
    let (server, port, connections) = start_server(options);

    let first = connect(port);
    connections.recv_timeout(Duration::from_secs(5)).unwrap();
    drop(first);
    thread::sleep(Duration::from_millis(300));

    // The dead entry is collected before the next client is admitted
    let _second = connect(port);
    connections.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(server.client_count(), 1);
}

#[test]
fn garbage_collection_is_idempotent() {
    let (server, port, connections) = start_server(ServerOptions::default());

    let staying = connect(port);
    let (staying_id, _, _) = connections.recv_timeout(Duration::from_secs(5)).unwrap();
    let leaving = connect(port);
    let (leaving_id, _, _) = connections.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(server.client_count(), 2);

    drop(leaving);
    let mut removed = 0;
    assert!(wait_until(Duration::from_secs(5), || {
        removed += server.collect_garbage();
        removed == 1
    }));
    assert_eq!(server.collect_garbage(), 0);
    assert_eq!(server.client_count(), 1);

    // Directed sends to evicted or unknown ids are silent no-ops
    server.send_to_client(leaving_id, b"anyone there?").unwrap();
    server.send_to_client(42, b"never existed").unwrap();

    server.send_to_client(staying_id, b"still here").unwrap();
    let mut staying = staying;
    let mut buf = [0u8; 16];
    let n = staying.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"still here");
}

#[test]
fn close_client_disconnects_only_that_client() {
    let (server, port, connections) = start_server(ServerOptions::default());

    let mut kept = connect(port);
    let (kept_id, _, _) = connections.recv_timeout(Duration::from_secs(5)).unwrap();
    let mut closed = connect(port);
    let (closed_id, _, _) = connections.recv_timeout(Duration::from_secs(5)).unwrap();

    server.close_client(closed_id);
    server.close_client(closed_id);
    server.close_client(4242);
    assert!(closed_by_server(&mut closed));
    assert_eq!(server.collect_garbage(), 1);

    server.send_to_client(kept_id, b"ok").unwrap();
    let mut buf = [0u8; 2];
    kept.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ok");
}

#[test]
fn maximum_write_size_is_accepted() {
    init_tracing();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let callbacks = ServerCallbacks::new().on_packet_received(move |_, data| {
        counter.fetch_add(data.len(), Ordering::Relaxed);
    });
    let server = TcpServer::new(ServerOptions::default(), callbacks);
    let port = server.start_server("127.0.0.1", 0).unwrap().port();

    let client = TcpSocket::new(ClientOptions::new("127.0.0.1", port)).unwrap();
    client.open().unwrap();

    let data = vec![0x5au8; MAX_WRITE_SIZE];
    assert_eq!(client.write(&data).unwrap(), MAX_WRITE_SIZE);
    assert!(wait_until(Duration::from_secs(60), || {
        received.load(Ordering::Relaxed) == MAX_WRITE_SIZE
    }));

    // One byte more is refused without touching the connection
    let data = vec![0x5au8; MAX_WRITE_SIZE + 1];
    assert_eq!(client.write(&data).unwrap_err().kind(), ErrorKind::DataLimit);
    assert!(client.connected());
}

#[test]
fn oversized_directed_send_keeps_client() {
    let (server, port, connections) = start_server(ServerOptions::default());
    let _stream = connect(port);
    let (id, _, _) = connections.recv_timeout(Duration::from_secs(5)).unwrap();

    let data = vec![0u8; MAX_WRITE_SIZE + 1];
    let err = server.send_to_client(id, &data).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataLimit);
    assert_eq!(server.collect_garbage(), 0);
    assert_eq!(server.client_count(), 1);
}

#[test]
fn flooding_client_does_not_starve_loop() {
    init_tracing();
    let (tx, connections) = channel();
    let callbacks = ServerCallbacks::new()
        .on_new_connection(move |id, _, _| {
            let _ = tx.send(id);
        })
        .on_packet_received(|_, _| thread::sleep(Duration::from_micros(200)));
    let server = TcpServer::new(ServerOptions::default(), callbacks);
    let port = server.start_server("127.0.0.1", 0).unwrap().port();

    // Writes as fast as the server accepts data until it is closed
    let done = Arc::new(AtomicBool::new(false));
    let flood_done = Arc::clone(&done);
    let mut flood = connect(port);
    flood
        .set_write_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let flooder = thread::spawn(move || {
        let chunk = vec![0xa5u8; 1024 * 1024];
        while !flood_done.load(Ordering::Relaxed) {
            if flood.write_all(&chunk).is_err() {
                break;
            }
        }
    });
    connections.recv_timeout(Duration::from_secs(5)).unwrap();
    thread::sleep(Duration::from_millis(500));

    let _second = connect(port);
    let start = Instant::now();
    assert!(
        connections.recv_timeout(Duration::from_secs(3)).is_ok(),
        "Second client was not announced while another client kept sending"
    );
    println!("second client announced after {:?}", start.elapsed());

    server.stop_server();
    assert!(
        wait_until(Duration::from_secs(2), || !server.is_running()),
        "Server kept running after stop_server"
    );

    done.store(true, Ordering::Relaxed);
    server.wait_for_server_stopped();
    flooder.join().unwrap();
}

#[test]
fn restart_replaces_running_server() {
    let (server, port, connections) = start_server(ServerOptions::default());
    let mut old_client = connect(port);
    connections.recv_timeout(Duration::from_secs(5)).unwrap();

    let new_port = server.start_server("127.0.0.1", 0).unwrap().port();
    assert!(server.is_running());
    assert_eq!(server.client_count(), 0);
    assert!(closed_by_server(&mut old_client));

    let _new_client = connect(new_port);
    connections.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(server.client_count(), 1);
}

#[test]
fn bind_failure_is_reported() {
    let (_server, port, _) = start_server(ServerOptions::default());
    let other = TcpServer::new(ServerOptions::default(), ServerCallbacks::new());

    // SO_REUSEADDR does not allow two listeners on one port
    let err = other.start_server("127.0.0.1", port).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Operation);
    assert!(!other.is_running());
}

#[test]
fn server_from_config() {
    let config = config::Config::builder()
        .set_default("hub.max_connections", 7)
        .unwrap()
        .set_default("hub.client_read_timeout_us", 50_000)
        .unwrap()
        .build()
        .unwrap();
    let server = TcpServer::new_named(&config, "hub", ServerCallbacks::new()).unwrap();
    assert_eq!(server.options().max_connections, 7);
    assert_eq!(server.options().client_read_timeout, Duration::from_millis(50));
    assert!(server.options().tls.is_none());
}
