pub use handshake::{accept_key, HandshakeState, Step, UpgradeRequest};
pub use service::RelayService;

pub mod handshake;
mod service;
