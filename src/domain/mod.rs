pub mod adapter;
pub mod device;
pub mod discovery;
pub mod error;
pub mod models;
pub mod ops;
pub mod registry;
pub mod session;
pub mod settings;
pub mod timer;

#[cfg(test)]
pub mod testing;
