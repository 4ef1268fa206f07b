use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::handshake::{HandshakeState, Step};
use crate::network::{Connection, ConnectionHandler, ConnectionId, ConnectionPool};
use crate::service::HandshakeConfig;
use crate::Shutdown;

/// Chat-style relay: every payload a peer sends is re-broadcast to all
/// other peers as `"<sender-uuid>: <payload>"`.
///
/// Peers may be raw TCP clients or browsers that open with a WebSocket
/// upgrade request. Handshake progress lives in `handshakes`, keyed by
/// connection id, and is dropped together with the pool entry when the
/// connection goes away.
pub struct RelayService {
    pool: Arc<ConnectionPool>,
    handshakes: DashMap<ConnectionId, HandshakeState>,
    config: HandshakeConfig,
}

impl RelayService {
    pub fn new(pool: Arc<ConnectionPool>, config: HandshakeConfig) -> Self {
        RelayService {
            pool,
            handshakes: DashMap::new(),
            config,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn pending_handshakes(&self) -> usize {
        self.handshakes
            .iter()
            .filter(|entry| entry.value().is_pending())
            .count()
    }

    /// Whether the peer was classified as a WebSocket client. `None` before
    /// its first byte or after it left.
    pub fn is_websocket(&self, id: &ConnectionId) -> Option<bool> {
        self.handshakes
            .get(id)
            .and_then(|entry| entry.value().is_websocket())
    }

    fn broadcast(&self, sender: &Connection, payload: &[u8]) -> usize {
        let id = sender.uuid().to_string();
        let mut message = BytesMut::with_capacity(id.len() + 2 + payload.len());
        message.put_slice(id.as_bytes());
        message.put_slice(b": ");
        message.put_slice(payload);
        self.pool.send_all_except(message.freeze(), &sender.uuid())
    }

    fn reject(&self, connection: &Connection, response: Bytes) {
        if let Err(err) = connection.send(response) {
            debug!(cause = %err, "could not deliver handshake rejection");
        }
        connection.close();
        self.pool.remove_member(connection);
    }

    /// Rejects every handshake that has been accumulating for longer than
    /// the configured timeout. Returns how many were rejected.
    pub fn expire_stale_handshakes(&self, now: Instant) -> usize {
        let timeout = self.config.timeout();
        let stale: Vec<ConnectionId> = self
            .handshakes
            .iter()
            .filter(|entry| entry.value().is_expired(now, timeout))
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0;
        for id in stale {
            let step = match self.handshakes.get_mut(&id) {
                Some(mut state) => state.expire(),
                None => None,
            };
            if let Some(Step::Reject { response, reason }) = step {
                warn!(connection = %id, cause = %reason, "closing stalled handshake");
                if let Some(connection) = self.pool.get(&id) {
                    self.reject(&connection, response);
                }
                expired += 1;
            }
        }
        expired
    }

    /// Periodically runs [`RelayService::expire_stale_handshakes`] until
    /// shutdown is signalled.
    pub fn spawn_handshake_reaper(
        self: &Arc<Self>,
        notify_shutdown: &broadcast::Sender<()>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            let mut interval = time::interval(service.config.reap_interval());
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("handshake reaper received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        let expired = service.expire_stale_handshakes(Instant::now());
                        if expired > 0 {
                            info!("expired {} stalled handshakes", expired);
                        }
                    }
                }
            }
        })
    }
}

impl ConnectionHandler for RelayService {
    fn on_connect(&self, connection: Connection) {
        let id = connection.uuid();
        info!("A new client has connected to the server: {}", id);
        if let Err(err) = self.pool.add_connection(connection.clone()) {
            error!(cause = %err, "refusing connection");
            connection.close();
            return;
        }
        self.handshakes.insert(id, HandshakeState::new());
    }

    fn on_receive(&self, connection: &Connection, data: Bytes) {
        let id = connection.uuid();
        // the entry guard must be released before touching the pool
        let step = {
            let mut state = self.handshakes.entry(id).or_default();
            state.feed(data, Instant::now(), self.config.max_header_bytes)
        };

        match step {
            Step::Wait => {}
            Step::Forward(payload) => {
                self.broadcast(connection, &payload);
            }
            Step::Upgrade {
                response,
                request,
                payload,
            } => {
                info!(connection = %id, request = %request.request_line, "websocket upgrade accepted");
                if let Err(err) = connection.send(response) {
                    warn!(cause = %err, "failed to answer websocket upgrade");
                    return;
                }
                if let Some(payload) = payload {
                    self.broadcast(connection, &payload);
                }
            }
            Step::Reject { response, reason } => {
                warn!(connection = %id, cause = %reason, "websocket upgrade rejected");
                self.reject(connection, response);
            }
        }
    }

    fn on_disconnect(&self, connection: &Connection) {
        let id = connection.uuid();
        // a refused duplicate must not take the member's state with it
        if self.pool.remove_member(connection) || !self.pool.contains(&id) {
            self.handshakes.remove(&id);
        }
        info!("client disconnected: {}", id);
    }
}
