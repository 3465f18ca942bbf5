//! # Tether RPC - minimal multiplexed RPC core
//!
//! Unary and server-streaming calls over one long-lived connection:
//! - Length-prefixed frame codec with per-direction message size limits
//! - Stream multiplexing with bounded, FIFO stream slots
//! - Keepalive probing with dead-peer detection and ping abuse policing
//! - Client-side retry with exponential backoff and deadlines
//! - Server-side interceptor chain, worker pool and connection age/idle limits
//!
//! ## Architecture
//!
//! ```text
//!   Channel ──call──► LogicalStream ─┐                 ┌─► Router ─► handler
//!     │ retry, deadline              │   Connection    │     ▲
//!     ▼                              ├──► frames ──────┤   interceptors
//!   ResponseStream ◄── deliveries ───┘  (reader/writer │
//!                                        + keepalive)  └─► ResponseSink
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod hello;
pub mod payload;
pub mod server;
pub mod transport;
pub mod types;

// Internal utilities
pub mod observability;

pub use client::{Channel, ResponseStream, RetryPolicy};
pub use payload::{Codec, JsonCodec};
pub use server::{CallContext, Interceptor, InterceptorChain, LoggingInterceptor, Router, Server};
pub use types::{ClientConfig, Code, Config, Error, Result, ServerConfig};
