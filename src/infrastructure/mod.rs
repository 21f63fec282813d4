//! Infrastructure Layer
//!
//! Everything that touches the outside world:
//! - `mgmt`: the kernel Bluetooth management channel
//! - `rpc`: the local socket clients talk to
//! - `storage`: per-controller persisted settings
//! - `logging`: tracing subscriber setup

pub mod logging;
pub mod mgmt;
pub mod rpc;
pub mod storage;
