//! # Raceway Proto
//!
//! Request/response plumbing on top of `raceway-core` transports:
//!
//! - [`strategy::StreamCountStrategy`]: a reference-counted connection pool
//!   that coalesces concurrent dials and evicts connections once their last
//!   stream closes
//! - [`client::Client`]: strategy-backed dialing front end
//! - [`server::Server`]: a stream-accepting server with backoff, state
//!   observers, and graceful shutdown
//! - [`backoff`]: the exponential-with-jitter retry policy the server uses

pub mod backoff;
pub mod client;
pub mod server;
pub mod strategy;

pub use backoff::BackoffPolicy;
pub use client::Client;
pub use server::{handler_fn, Server, ServerBuilder, StreamHandler};
pub use strategy::{default_strategy, StreamCountStrategy};
