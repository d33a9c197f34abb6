//! HTTP API for host commands and object queries.

pub mod api;
pub mod channel;
