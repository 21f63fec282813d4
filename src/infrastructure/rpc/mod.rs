//! Local RPC Surface
//!
//! Newline-delimited JSON over a local socket:
//! - `protocol`: calls, replies and signal envelopes
//! - `server`: accept loop with one reader and one writer thread per client
//! - `client`: blocking caller used by `--call`

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RpcClient;
pub use protocol::{RpcCall, RpcInbound, ServerMessage};
pub use server::spawn_server;
