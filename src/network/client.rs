use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info};

use super::{Connection, ConnectionHandler};
use crate::service::{ClientConfig, NetworkConfig};
use crate::{AppError, AppResult};

pub type ReceiveCallback = Arc<dyn Fn(&Connection, Bytes) + Send + Sync>;

struct ClientHandler {
    on_receive: ReceiveCallback,
}

impl ConnectionHandler for ClientHandler {
    fn on_connect(&self, _connection: Connection) {}

    fn on_receive(&self, connection: &Connection, data: Bytes) {
        (self.on_receive)(connection, data);
    }

    fn on_disconnect(&self, connection: &Connection) {
        info!(connection = %connection.uuid(), "disconnected from server");
    }
}

/// One outbound connection to `host:port`.
///
/// A failed `init` leaves the client closed but usable; `init` can be called
/// again later. `close` also returns the client to that state.
pub struct Client {
    host: String,
    port: u16,
    connect_timeout: Duration,
    buffer_size: usize,
    queue_capacity: usize,
    close_grace: Duration,
    handler: Arc<ClientHandler>,
    connection: RwLock<Option<Connection>>,
}

impl Client {
    pub fn new<F>(host: impl Into<String>, port: u16, on_receive: F) -> Self
    where
        F: Fn(&Connection, Bytes) + Send + Sync + 'static,
    {
        Self::from_config(
            &ClientConfig {
                host: host.into(),
                port,
                ..ClientConfig::default()
            },
            on_receive,
        )
    }

    pub fn from_config<F>(config: &ClientConfig, on_receive: F) -> Self
    where
        F: Fn(&Connection, Bytes) + Send + Sync + 'static,
    {
        let network = NetworkConfig::default();
        Client {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
            buffer_size: network.conn_read_buffer_size,
            queue_capacity: network.outbound_queue_capacity,
            close_grace: network.close_grace(),
            handler: Arc::new(ClientHandler {
                on_receive: Arc::new(on_receive),
            }),
            connection: RwLock::new(None),
        }
    }

    /// Connects to the target. Does nothing if already connected.
    pub async fn init(&self) -> AppResult<()> {
        if !self.is_closed() {
            return Ok(());
        }
        let addr = format!("{}:{}", self.host, self.port);
        let stream = match time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(AppError::Connect {
                    addr,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(AppError::Connect {
                    addr,
                    reason: format!("timed out after {:?}", self.connect_timeout),
                })
            }
        };

        let (connection, reader) = Connection::from_stream(stream, self.queue_capacity, self.close_grace);
        info!(connection = %connection.uuid(), "connected to {}", addr);
        connection.spawn_reader(reader, self.handler.clone(), self.buffer_size, None);
        if let Some(previous) = self.connection.write().replace(connection) {
            previous.close();
        }
        Ok(())
    }

    pub fn send(&self, data: impl Into<Bytes>) -> AppResult<()> {
        match self.connection.read().as_ref() {
            Some(connection) if !connection.is_closed() => connection.send(data),
            _ => Err(AppError::NotConnected),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.connection
            .read()
            .as_ref()
            .map_or(true, Connection::is_closed)
    }

    pub fn connection(&self) -> Option<Connection> {
        self.connection.read().clone()
    }

    pub fn close(&self) {
        if let Some(connection) = self.connection.write().take() {
            connection.close();
        }
    }

    /// Closes the connection and releases the client.
    pub fn destroy(self) {
        self.close();
        debug!("client to {}:{} destroyed", self.host, self.port);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
