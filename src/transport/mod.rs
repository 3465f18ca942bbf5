//! Connection-level machinery shared by client and server.
//!
//! - **codec**: frame encoding/decoding and payload layouts
//! - **keepalive**: liveness probing and ping policy enforcement
//! - **mux**: logical streams multiplexed over one connection
//! - **dialer**: establishing outbound byte streams

pub mod codec;
pub mod dialer;
pub mod keepalive;
pub mod mux;

pub use codec::{CallKind, Frame, FrameCodec, FrameKind, RequestHead};
pub use dialer::{BoxedTransport, Dialer, TcpDialer, Transport};
pub use keepalive::{PingEnforcer, PingViolation, ProbeState};
pub use mux::{Connection, ConnectionConfig, Liveness, LogicalStream, StreamSlots, StreamState};
