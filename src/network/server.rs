use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use super::{Connection, ConnectionHandler};
use crate::service::NetworkConfig;
use crate::{AppError, AppResult, Shutdown};

/// Accepts inbound TCP connections and drives `handler` for each of them.
///
/// The server does not own the connections it accepts: `stop` only ends the
/// accept loop, whoever kept the handle from `on_connect` decides when to
/// close them.
pub struct Server {
    config: NetworkConfig,
    handler: Arc<dyn ConnectionHandler>,
    notify_shutdown: Option<broadcast::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

struct Acceptor {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    handler: Arc<dyn ConnectionHandler>,
    buffer_size: usize,
    queue_capacity: usize,
    close_grace: Duration,
}

impl Server {
    pub fn new(config: NetworkConfig, handler: Arc<dyn ConnectionHandler>) -> Self {
        Server {
            config,
            handler,
            notify_shutdown: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Binds the configured address and spawns the accept loop. Returns the
    /// bound address, which differs from the configured one when the port
    /// is 0.
    pub async fn start(&mut self) -> AppResult<SocketAddr> {
        if self.is_running() {
            return Err(AppError::IllegalStateError("server already started".into()));
        }
        let listen_address = self.config.listen_address();
        let listener = match TcpListener::bind(&listen_address).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(
                    "Failed to bind server to address: {} - Error: {}",
                    listen_address, source
                );
                return Err(AppError::Bind {
                    addr: listen_address,
                    source,
                });
            }
        };
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);

        let (notify_shutdown, _) = broadcast::channel(1);
        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        let acceptor = Acceptor {
            listener,
            limit_connections: Arc::new(Semaphore::new(self.config.max_connection)),
            handler: self.handler.clone(),
            buffer_size: self.config.conn_read_buffer_size,
            queue_capacity: self.config.outbound_queue_capacity,
            close_grace: self.config.close_grace(),
        };
        self.accept_task = Some(tokio::spawn(acceptor.run(shutdown)));
        self.notify_shutdown = Some(notify_shutdown);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stops accepting and waits for the accept loop to release the
    /// listener. Accepted connections stay open. Calling it on a stopped
    /// server does nothing.
    pub async fn stop(&mut self) {
        if let Some(notify_shutdown) = self.notify_shutdown.take() {
            let _ = notify_shutdown.send(());
        }
        if let Some(accept_task) = self.accept_task.take() {
            if let Err(err) = accept_task.await {
                error!("accept loop ended abnormally: {:?}", err);
            }
            info!("tcp server stopped");
        }
        self.local_addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.accept_task.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(notify_shutdown) = self.notify_shutdown.take() {
            let _ = notify_shutdown.send(());
        }
        debug!("tcp server dropped");
    }
}

impl Acceptor {
    /// Each connection holds a permit from `limit_connections` until its
    /// reader exits, so at most `max_connection` are served at once.
    async fn run(self, mut shutdown: Shutdown) {
        loop {
            let permit = tokio::select! {
                permit = self.limit_connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };

            let socket = tokio::select! {
                res = self.accept() => match res {
                    Ok(socket) => socket,
                    Err(err) => {
                        error!(cause = %err, "failed to accept");
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            };

            let (connection, reader) = Connection::from_stream(socket, self.queue_capacity, self.close_grace);
            info!(
                connection = %connection.uuid(),
                peer = ?connection.peer_addr(),
                "accepted new connection"
            );
            self.handler.on_connect(connection.clone());
            connection.spawn_reader(reader, self.handler.clone(), self.buffer_size, Some(permit));
        }
        debug!("accept loop exited");
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::IllegalStateError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    debug!("accept failed, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}
