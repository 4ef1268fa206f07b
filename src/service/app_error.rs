// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;

use crate::network::ConnectionId;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// fatal for the server: the listener could not be created
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// per-connection errors, never fatal to the server
    #[error("write to connection {0} failed: {1}")]
    TransportWrite(ConnectionId, String),

    #[error("read from connection {0} failed: {1}")]
    TransportRead(ConnectionId, String),

    #[error("connection {0} is already in the pool")]
    DuplicateUuid(ConnectionId),

    #[error("websocket handshake rejected: {0}")]
    HandshakeValidation(String),

    #[error("client is not connected")]
    NotConnected,

    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),
}
