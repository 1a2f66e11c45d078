//! AeroSync for Linux: LAN discovery, secure sessions and file transfer
//! on top of the sans-I/O coordinator in `aero-core`.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod keystore;
pub mod node;
pub mod session;
pub mod transport;

pub use node::Node;
