#![forbid(unsafe_code)]

//! Cluster core of a horizontally scaled chat backend: connection registry, message router,
//! liveness monitor and per-user rate limiting over a shared store and a pub/sub bus.

pub mod bus;
pub mod config;
pub mod server;
pub mod store;
pub mod util;

pub use server::node::{AttachedSession, Node, NodeSettings};
