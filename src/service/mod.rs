pub use app_error::{AppError, AppResult};
pub use config::{ClientConfig, HandshakeConfig, NetworkConfig, RelayConfig, DEFAULT_PORT};
pub use node::RelayNode;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod node;
mod shutdown;
mod tracing_config;
