//! Echo Example - Raw byte echo over TCP or TLS
//!
//! ## What it shows
//!
//! - Server reports received bytes through callbacks, an echo thread sends
//!   them back with `send_to_client`
//! - Client connects, writes one byte sequence and reads the echo
//!
//! Pass `--tls` to run the same exchange over TLS with a throwaway
//! self-signed certificate.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example echo
//! cargo run --example echo -- --tls
//! ```

use hubsock::prelude::*;
use hubsock::PemSource;
use std::str::from_utf8;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;

fn main() -> Result<(), Error> {
    let use_tls = std::env::args().any(|arg| arg == "--tls");

    let (server_tls, client_tls) = if use_tls {
        let certified_key = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .expect("Failed to generate certificate");
        let cert = certified_key.cert.pem().into_bytes();
        let key = certified_key.key_pair.serialize_pem().into_bytes();
        let server = TlsOptions {
            cert: Some(PemSource::Data(cert.clone())),
            key: Some(PemSource::Data(key)),
            ..TlsOptions::default()
        };
        let client = TlsOptions {
            ca: Some(PemSource::Data(cert)),
            ..TlsOptions::default()
        };
        (Some(server), Some(client))
    } else {
        (None, None)
    };

    // Start the server, received packets go to the echo thread
    let (tx, rx) = channel::<(ClientId, Vec<u8>)>();
    let callbacks = ServerCallbacks::new()
        .on_new_connection(|id, address, port| println!("Client {id} connected from {address}:{port}"))
        .on_packet_received(move |id, data| {
            let _ = tx.send((id, data.to_vec()));
        });
    let server = Arc::new(TcpServer::new(
        ServerOptions {
            tls: server_tls,
            ..ServerOptions::default()
        },
        callbacks,
    ));
    let server_addr = server.start_server("127.0.0.1", 0)?;
    println!("Server started on {server_addr}\n");

    let echo_server = Arc::clone(&server);
    thread::spawn(move || {
        for (id, data) in rx {
            if let Err(err) = echo_server.send_to_client(id, &data) {
                eprintln!("Echo to client {id} failed: {err}");
            }
        }
    });

    // Run the client in this thread
    let mut options = ClientOptions::new("localhost", server_addr.port());
    options.tls = client_tls;
    let client = TcpSocket::new(options)?;
    client.open()?;

    let data = b"Hello, hubsock!";
    println!("Sending: {:?}", from_utf8(data).unwrap_or("<binary>"));
    client.write(data)?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while received.len() < data.len() {
        let n = client.read(&mut buf)?;
        received.extend_from_slice(&buf[..n]);
    }
    println!("Received: {:?}", from_utf8(&received).unwrap_or("<binary>"));

    client.close();
    server.wait_for_server_stopped();
    Ok(())
}
