//! Length-delimited JSON bridge from TCP clients onto the event bus.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::BridgeClient;
pub use protocol::Request;
pub use server::{process_connection, serve};

// Re-export Bytes for convenience
pub use bytes::Bytes;
