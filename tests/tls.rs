//! TLS Context and Handshake Tests
//!
//! Trust validation, Diffie-Hellman parameters, mutual TLS, and the
//! certificate policy applied when verification is disabled.

mod tls_test_helper;

use hubsock::prelude::*;
use hubsock::PemSource;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Once;
use std::time::Duration;
use tls_test_helper::*;

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

/// Starts a TLS echo-less server and returns it with its port and a channel
/// of accepted client ids.
fn start_tls_server(tls: TlsOptions) -> (TcpServer, u16, Receiver<ClientId>) {
    init_tracing();
    let (tx, rx) = channel();
    let callbacks = ServerCallbacks::new().on_new_connection(move |id, _, _| {
        let _ = tx.send(id);
    });
    let options = ServerOptions {
        tls: Some(tls),
        handshake_timeout: Duration::from_secs(2),
        ..ServerOptions::default()
    };
    let server = TcpServer::new(options, callbacks);
    let port = server.start_server("127.0.0.1", 0).unwrap().port();
    (server, port, rx)
}

fn tls_client(hostname: &str, port: u16, tls: TlsOptions) -> TcpSocket {
    let mut options = ClientOptions::new(hostname, port);
    options.tls = Some(tls);
    options.read_timeout = Duration::from_secs(2);
    options.connection_retries = 1;
    TcpSocket::new(options).unwrap()
}

fn dh_fixture() -> PemSource {
    PemSource::File(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/ffdhe2048.pem"))
}

// ============================================================================
// Context Validation
// ============================================================================

#[test]
fn verification_without_trust_fails_fast() {
    // Unroutable target: construction must fail before any network activity
    let mut options = ClientOptions::new("192.0.2.1", 2001);
    options.tls = Some(TlsOptions::default());
    match TcpSocket::new(options) {
        Err(Error::TlsMissingTrust(_)) => {}
        other => panic!("Expected TlsMissingTrust, got {other:?}"),
    }
}

#[test]
fn required_client_certs_without_trust_prevent_start() {
    let identity = self_signed(&["localhost"]);
    let tls = TlsOptions {
        require_client_cert: true,
        ..server_tls(&identity)
    };
    let server = TcpServer::new(
        ServerOptions {
            tls: Some(tls),
            ..ServerOptions::default()
        },
        ServerCallbacks::new(),
    );
    let err = server.start_server("127.0.0.1", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Tls);
    assert!(!server.is_running());
}

#[test]
fn server_without_identity_fails() {
    let server = TcpServer::new(
        ServerOptions {
            tls: Some(TlsOptions::default()),
            ..ServerOptions::default()
        },
        ServerCallbacks::new(),
    );
    assert!(matches!(
        server.start_server("127.0.0.1", 0),
        Err(Error::TlsServerConfigMissing)
    ));
}

#[test]
fn malformed_dh_params_are_fatal() {
    let identity = self_signed(&["localhost"]);
    let tls = TlsOptions {
        dh_params: Some(PemSource::Data(
            b"-----BEGIN DH PARAMETERS-----\nMIIBCAKCAQEA\n-----END DH PARAMETERS-----\n".to_vec(),
        )),
        ..server_tls(&identity)
    };
    let server = TcpServer::new(
        ServerOptions {
            tls: Some(tls),
            ..ServerOptions::default()
        },
        ServerCallbacks::new(),
    );
    match server.start_server("127.0.0.1", 0) {
        Err(Error::TlsInvalidDhParams(_)) => {}
        other => panic!("Expected TlsInvalidDhParams, got {other:?}"),
    }
    assert!(!server.is_running());
}

#[test]
fn valid_dh_params_are_accepted() {
    let identity = self_signed(&["localhost"]);
    let tls = TlsOptions {
        dh_params: Some(dh_fixture()),
        ..server_tls(&identity)
    };
    let (_server, port, accepted) = start_tls_server(tls);

    let client = tls_client("localhost", port, client_tls(&identity));
    client.open().unwrap();
    accepted.recv_timeout(Duration::from_secs(5)).unwrap();
}

// ============================================================================
// Mutual TLS
// ============================================================================

#[test]
fn mutual_tls_accepts_trusted_client() {
    let server_identity = self_signed(&["localhost"]);
    let client_identity = self_signed(&["hub-client"]);

    let tls = TlsOptions {
        ca: Some(client_identity.cert()),
        require_client_cert: true,
        ..server_tls(&server_identity)
    };
    let (server, port, accepted) = start_tls_server(tls);

    let client_options = TlsOptions {
        cert: Some(client_identity.cert()),
        key: Some(client_identity.key()),
        ..client_tls(&server_identity)
    };
    let client = tls_client("localhost", port, client_options);
    client.open().unwrap();

    let id = accepted.recv_timeout(Duration::from_secs(5)).unwrap();
    server.send_to_client(id, b"welcome").unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"welcome");
}

#[test]
fn mutual_tls_rejects_untrusted_client() {
    let server_identity = self_signed(&["localhost"]);
    let trusted_identity = self_signed(&["hub-client"]);
    let rogue_identity = self_signed(&["hub-client"]);

    let tls = TlsOptions {
        ca: Some(trusted_identity.cert()),
        require_client_cert: true,
        ..server_tls(&server_identity)
    };
    let (server, port, accepted) = start_tls_server(tls);

    for identity in [Some(&rogue_identity), None] {
        let mut client_options = client_tls(&server_identity);
        if let Some(identity) = identity {
            client_options.cert = Some(identity.cert());
            client_options.key = Some(identity.key());
        }
        let client = tls_client("localhost", port, client_options);

        // With TLS 1.3 the client may finish its side before the server
        // rejects the certificate, so the failure can surface on first I/O.
        let result = client.open().and_then(|_| {
            client.write(b"hello")?;
            let mut buf = [0u8; 16];
            client.read(&mut buf)
        });
        assert!(result.is_err(), "Untrusted client was served");
    }

    assert!(accepted.recv_timeout(Duration::from_millis(500)).is_err());
    assert_eq!(server.client_count(), 0);
}

// ============================================================================
// Verification Policy
// ============================================================================

#[test]
fn expired_certificate_fails_with_verification_disabled() {
    let identity = expired();
    let (_server, port, accepted) = start_tls_server(server_tls(&identity));

    let client = tls_client("localhost", port, client_tls_unverified());
    let err = client.open().unwrap_err();
    println!("expired certificate: {err}");
    assert_eq!(err.kind(), ErrorKind::Tls);
    assert!(accepted.recv_timeout(Duration::from_millis(500)).is_err());

    // Also with a CA that would otherwise anchor the chain
    let tls = TlsOptions {
        ca: Some(identity.cert()),
        ..client_tls_unverified()
    };
    let client = tls_client("localhost", port, tls);
    assert_eq!(client.open().unwrap_err().kind(), ErrorKind::Tls);
}

#[test]
fn hostname_mismatch_fails() {
    let identity = self_signed(&["otherhost"]);
    let (_server, port, _accepted) = start_tls_server(server_tls(&identity));

    let client = tls_client("localhost", port, client_tls(&identity));
    assert_eq!(client.open().unwrap_err().kind(), ErrorKind::Tls);

    // A chain that verifies must match the name even with verification off
    let tls = TlsOptions {
        ca: Some(identity.cert()),
        ..client_tls_unverified()
    };
    let client = tls_client("localhost", port, tls);
    assert_eq!(client.open().unwrap_err().kind(), ErrorKind::Tls);
}

#[test]
fn unknown_issuer_is_tolerated_with_verification_disabled() {
    let identity = self_signed(&["localhost"]);
    let (server, port, accepted) = start_tls_server(server_tls(&identity));

    // Strict client rejects a certificate from an unknown issuer
    let stranger = self_signed(&["localhost"]);
    let client = tls_client("localhost", port, client_tls(&stranger));
    assert_eq!(client.open().unwrap_err().kind(), ErrorKind::Tls);

    // Lenient client accepts it
    let client = tls_client("localhost", port, client_tls_unverified());
    client.open().unwrap();
    let id = accepted.recv_timeout(Duration::from_secs(5)).unwrap();
    server.send_to_client(id, b"hi").unwrap();
    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hi");
}

#[test]
fn read_after_server_stop_is_closed() {
    let identity = self_signed(&["localhost"]);
    let (server, port, accepted) = start_tls_server(server_tls(&identity));

    let client = tls_client("localhost", port, client_tls(&identity));
    client.open().unwrap();
    accepted.recv_timeout(Duration::from_secs(5)).unwrap();

    server.wait_for_server_stopped();

    let mut buf = [0u8; 16];
    let err = client.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    assert!(!client.connected());
}

#[test]
fn buffered_plaintext_is_reported() {
    let identity = self_signed(&["localhost"]);
    let (server, port, accepted) = start_tls_server(server_tls(&identity));

    let client = tls_client("localhost", port, client_tls(&identity));
    client.open().unwrap();
    let id = accepted.recv_timeout(Duration::from_secs(5)).unwrap();

    // Larger than one TLS record, so it is sent as two
    let payload: Vec<u8> = (0..20_000).map(|i| (i % 251) as u8).collect();
    server.send_to_client(id, &payload).unwrap();

    let mut buf = [0u8; 1000];
    let (n, more) = client.read_with_more(&mut buf).unwrap();
    assert_eq!(n, buf.len());
    assert!(more, "Decrypted bytes left in the session were not reported");

    let mut received = buf[..n].to_vec();
    let mut last_more = more;
    while received.len() < payload.len() {
        let (n, more) = client.read_with_more(&mut buf).unwrap();
        received.extend_from_slice(&buf[..n]);
        last_more = more;
    }
    assert!(received == payload, "Client received corrupted data");
    assert!(!last_more, "Drained session still reported buffered bytes");
}
