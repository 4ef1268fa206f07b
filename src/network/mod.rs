//! Connection/session layer.
//!
//! Plain TCP on top of tokio:
//! - `Connection`: handle to one byte stream, identified by a v4 UUID
//! - `ConnectionPool`: registry of live connections with broadcast-except-one
//! - `Server`: accept loop that drives a [`ConnectionHandler`]
//! - `Client`: a single outbound connection with a receive callback
//!
//! Inbound bytes are delivered as they come off the socket. No framing is
//! applied here; protocols built on top buffer whatever they need.

pub use client::{Client, ReceiveCallback};
pub use connection::{Connection, ConnectionHandler, ConnectionId};
pub use pool::ConnectionPool;
pub use server::Server;

mod client;
mod connection;
mod pool;
mod server;
