use super::ClientId;
use std::fmt;

type NewConnectionFn = dyn Fn(ClientId, String, u16) + Send + Sync;
type PacketReceivedFn = dyn Fn(ClientId, &[u8]) + Send + Sync;

/// Behavior injected into a [`TcpServer`](super::TcpServer).
///
/// Both callbacks run synchronously on the server thread and must not block
/// indefinitely. They receive only the client id and the payload; use
/// [`TcpServer::send_to_client`](super::TcpServer::send_to_client) to answer.
#[derive(Default)]
pub struct ServerCallbacks {
    pub(crate) new_connection: Option<Box<NewConnectionFn>>,
    pub(crate) packet_received: Option<Box<PacketReceivedFn>>,
}

impl ServerCallbacks {
    /// Callbacks that ignore every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with (id, remote address, remote port) once a client is
    /// accepted and, for TLS servers, has completed its handshake.
    pub fn on_new_connection<F>(mut self, callback: F) -> Self
    where
        F: Fn(ClientId, String, u16) + Send + Sync + 'static,
    {
        self.new_connection = Some(Box::new(callback));
        self
    }

    /// Called with (id, bytes) for every chunk read from a client.
    pub fn on_packet_received<F>(mut self, callback: F) -> Self
    where
        F: Fn(ClientId, &[u8]) + Send + Sync + 'static,
    {
        self.packet_received = Some(Box::new(callback));
        self
    }

    pub(crate) fn new_connection(&self, id: ClientId, address: String, port: u16) {
        if let Some(callback) = &self.new_connection {
            callback(id, address, port);
        }
    }

    pub(crate) fn packet_received(&self, id: ClientId, data: &[u8]) {
        if let Some(callback) = &self.packet_received {
            callback(id, data);
        }
    }
}

impl fmt::Debug for ServerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCallbacks")
            .field("new_connection", &self.new_connection.is_some())
            .field("packet_received", &self.packet_received.is_some())
            .finish()
    }
}
