#![forbid(unsafe_code)]

pub mod health;
pub mod liveness;
pub mod node;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod session;

#[cfg(test)]
mod liveness_tests;
