pub mod control;
pub mod network;
pub mod relay;
pub mod service;

pub use control::{Control, ControlSnapshot};
pub use network::{Client, Connection, ConnectionHandler, ConnectionId, ConnectionPool, Server};
pub use relay::RelayService;
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, RelayConfig, RelayNode, Shutdown,
};
