use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::{runtime, signal};
use tracing::{error, info, trace};

use super::RelayConfig;
use crate::network::{ConnectionPool, Server};
use crate::relay::RelayService;
use crate::AppResult;

/// Process-level bootstrap for the relay server: owns the runtime-facing
/// pieces and runs them until ctrl-c.
pub struct RelayNode {
    config: RelayConfig,
}

impl RelayNode {
    pub fn new(config: RelayConfig) -> Self {
        RelayNode { config }
    }

    pub fn start(&mut self, rt: &runtime::Runtime) -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let pool = Arc::new(ConnectionPool::new());
        let relay = Arc::new(RelayService::new(
            pool.clone(),
            self.config.handshake.clone(),
        ));

        rt.block_on(Self::run_tcp_server(
            &self.config,
            relay,
            notify_shutdown.clone(),
            shutdown_complete_tx,
        ))?;

        // stop the reaper, then the connections the pool still holds
        let _ = notify_shutdown.send(());
        pool.close_all();
        trace!("waiting for shutdown complete...");
        rt.block_on(shutdown_complete_rx.recv());
        info!("relay shutdown complete");
        Ok(())
    }

    async fn run_tcp_server(
        config: &RelayConfig,
        relay: Arc<RelayService>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<()> {
        let mut server = Server::new(config.network.clone(), relay.clone());
        server.start().await?;
        info!("Server started");

        let reaper = relay.spawn_handshake_reaper(&notify_shutdown);
        tokio::spawn(async move {
            if let Err(err) = reaper.await {
                error!("handshake reaper ended abnormally: {:?}", err);
            }
            drop(shutdown_complete_tx);
        });

        match signal::ctrl_c().await {
            Ok(()) => info!("get shutdown signal"),
            Err(err) => error!(cause = %err, "failed to listen for shutdown signal"),
        }
        server.stop().await;
        Ok(())
    }
}
