//! # Scry Transport
//!
//! Reliable-UDP request/response transport for the scry protocol.
//!
//! This crate provides:
//! - Timing and window parameters for the reliable-UDP layer
//! - Wire framing for requests, responses, and connect-back probes
//! - An async UDP transport with retransmission and response correlation
//! - Fresh-association probes for reachability testing
//!
//! The transport deliberately stays below stream semantics: callers exchange
//! whole datagrams and correlate them by request id. Retransmission runs on
//! the sender side until the caller's deadline expires, and duplicate
//! requests on the receiver side are answered from a replay cache so a
//! retransmitted request never reaches the handler twice.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frame;
pub mod params;
pub mod transport;
pub mod udp;

// Re-export commonly used types
pub use frame::{Frame, FrameError};
pub use params::{MAX_UDP_PAYLOAD, ConnectionType, ParameterError, TransportParameters};
pub use transport::{
    RequestHandler, Transport, TransportError, TransportResult, TransportStats,
};
pub use udp::UdpTransport;
