//! Process-wide helpers: tracing bootstrap and backoff policies.

pub mod bootstrap;
pub mod retry;
