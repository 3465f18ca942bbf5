//! Core types shared by the client and server halves.
//!
//! - **IDs**: stream and connection identifiers
//! - **Errors**: the error taxonomy and status codes
//! - **Config**: explicit configuration values for connections and runtimes

mod config;
mod errors;
mod ids;

pub use config::{
    ClientConfig, Config, EnforcementPolicy, KeepaliveConfig, ObservabilityConfig, RetryConfig,
    ServerConfig, StreamOverflow, DEFAULT_MAX_MSG_SIZE,
};
pub use errors::{Code, Error, FrameError, Result};
pub(crate) use errors::WireError;
pub use ids::{ConnectionId, StreamId};
