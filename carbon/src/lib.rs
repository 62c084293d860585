//! Core of the Carbon memcached proxy.
//!
//! A bus handler receives command envelopes, resolves them against the
//! closed command registry, submits the backend operation on a pooled
//! connection and reconciles the in-flight operations against a deadline.

pub mod bus;
pub mod codec;
pub mod domain;
pub mod planes;
pub mod ports;

#[cfg(test)]
pub(crate) mod testkit;
