//! Moka-backed implementation of the carbon connection ports.
//!
//! Each configured server address becomes an in-process node, so the proxy
//! can run and be exercised end to end without a memcached cluster.

mod backend;
mod connection;
mod moka_cache;

pub use backend::MokaBackend;
pub use connection::{MokaConnection, MokaConnectionFactory};
pub use moka_cache::{Deadline, MokaNode, StoredItem};
