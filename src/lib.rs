//! dnsgate: a host-level DNS filtering proxy.
//!
//! Flows arrive from the OS network-flow API, each query is classified
//! against the rule store, blocked queries are answered synthetically, and
//! the rest are forwarded upstream with flow-to-client mapping, DNS chain
//! preservation, and a TTL-aware response cache.

pub mod cache;
pub mod command;
pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod listen;
pub mod manifest;
pub mod rules;
pub mod stats;
pub mod upstream;

pub use config::{Config, ConfigHandle};
pub use error::{GateError, Result};
