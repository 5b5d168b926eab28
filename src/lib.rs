// Outbound request budgets and the pipeline that obeys them
pub mod backoff;
pub mod http;
pub mod rate_limit;

// Entity cache with fetch coalescing and durable backing
pub mod cache;

// Streaming gateway session
pub mod gateway;

// Event model, dispatch and extensions
pub mod command;
pub mod context;
pub mod dispatch;
pub mod event;
pub mod registry;

// Ambient: configuration, errors, logging, status API
pub mod api;
pub mod config;
pub mod error;
pub mod telemetry;

pub mod client;

pub use client::Client;
pub use context::Context;
pub use error::{Error, Result};
