//! Bluetooth Management Interface
//!
//! This module talks to the kernel's Bluetooth management channel:
//! - `codec`: frame layout, command builders and event parsers
//! - `client`: command tracking, registry upkeep and event fan-out
//! - `socket`: the raw socket and its reactor registration

pub mod client;
pub mod codec;
pub mod socket;

pub use client::{FrameSink, MgmtClient, MgmtNotification};
pub use socket::MgmtSocket;
