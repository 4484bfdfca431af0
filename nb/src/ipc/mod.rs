//! Unix Domain Socket transport for broker channels
//!
//! Each accepted connection becomes one broker channel. Messages travel as
//! newline-delimited JSON objects tagged by `type`.

use std::path::PathBuf;

pub mod client;
pub mod listener;
pub mod messages;
mod stream;

pub use client::connect;
pub use listener::{bind_socket, cleanup_socket, serve};
pub use messages::{BrokerMessage, ClientMessage, DEFAULT_RESOURCE_KIND};

/// Get the default socket path for the broker
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("nnbroker")
        .join("broker.sock")
}
