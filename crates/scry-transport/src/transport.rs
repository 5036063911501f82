//! Transport trait abstraction for the request/response layer.
//!
//! This module defines the `Transport` trait the detection protocol talks
//! through, and the `RequestHandler` trait a node registers to answer inbound
//! requests. Production code uses the UDP implementation in [`crate::udp`];
//! tests substitute scripted doubles without touching the protocol code.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::frame::FrameError;
use crate::params::ParameterError;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// No response arrived within the caller's deadline
    #[error("Request timed out")]
    Timeout,

    /// Frame encode/decode failure
    #[error("Codec error: {0}")]
    Codec(#[from] FrameError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ParameterError),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async request/response transport.
///
/// One method pair carries the whole protocol: `send_request` performs a
/// reliable round trip against a peer's listening endpoint, and `probe`
/// checks whether a fresh association can reach a peer at all. Sequential
/// use, retransmission, and correlation are the implementation's concern;
/// callers only choose deadlines.
///
/// # Examples
///
/// ```no_run
/// use scry_transport::{Transport, TransportParameters, UdpTransport};
/// use std::net::SocketAddr;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let transport = UdpTransport::bind(addr, TransportParameters::default()).await?;
///
/// let response = transport
///     .send_request("127.0.0.1:50000".parse()?, b"ping", Duration::from_secs(2))
///     .await?;
/// println!("got {} bytes back", response.len());
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the correlated response.
    ///
    /// Retransmits within `timeout` as the implementation sees fit; at most
    /// one response is delivered per request.
    ///
    /// # Arguments
    /// * `peer` - The peer's listening endpoint
    /// * `payload` - Opaque request bytes
    /// * `timeout` - Overall deadline for the round trip
    ///
    /// # Errors
    /// Returns [`TransportError::Timeout`] when no response arrives in time,
    /// or another `TransportError` if the send itself fails.
    async fn send_request(
        &self,
        peer: SocketAddr,
        payload: &[u8],
        timeout: Duration,
    ) -> TransportResult<Vec<u8>>;

    /// Probe a peer from a fresh association.
    ///
    /// Opens a new socket unrelated to any existing flow, sends a probe to
    /// `peer`, and waits for the acknowledgment. Success means an arbitrary
    /// new flow can reach the peer.
    ///
    /// # Returns
    /// The fresh association's local endpoint.
    ///
    /// # Errors
    /// Returns [`TransportError::Timeout`] when the peer never acknowledges,
    /// or another `TransportError` if the probe socket cannot be set up.
    async fn probe(&self, peer: SocketAddr, timeout: Duration) -> TransportResult<SocketAddr>;

    /// Get the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport and release resources.
    ///
    /// After calling this method, all subsequent operations return
    /// [`TransportError::Closed`].
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Inbound request handler.
///
/// Registered with the transport at bind time; invoked once per distinct
/// inbound request (retransmitted duplicates are answered from a replay
/// cache and never reach the handler). Runs on the transport's async
/// context and must not block.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one inbound request.
    ///
    /// # Arguments
    /// * `payload` - Opaque request bytes
    /// * `source` - Endpoint the datagram was observed to arrive from
    ///
    /// # Returns
    /// The response payload, or `None` to leave the request unanswered.
    async fn handle_request(&self, payload: Vec<u8>, source: SocketAddr) -> Option<Vec<u8>>;
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total datagrams sent, retransmissions included
    pub packets_sent: u64,
    /// Total datagrams received
    pub packets_received: u64,
    /// Requests that expired without a response
    pub requests_timed_out: u64,
    /// Inbound datagrams that failed to decode
    pub decode_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Transport is closed");

        let err = TransportError::Timeout;
        assert_eq!(err.to_string(), "Request timed out");

        let err = TransportError::BindFailed("test".to_string());
        assert!(err.to_string().contains("Failed to bind"));

        let err = TransportError::Other("test error".to_string());
        assert_eq!(err.to_string(), "Transport error: test error");
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "test");
        let transport_err = TransportError::from(io_err);

        assert!(matches!(transport_err, TransportError::Io(_)));
    }

    #[test]
    fn test_transport_error_from_codec() {
        let frame_err = FrameError::Decode("bad input".to_string());
        let transport_err = TransportError::from(frame_err);

        assert!(matches!(transport_err, TransportError::Codec(_)));
        assert!(transport_err.to_string().contains("bad input"));
    }

    #[test]
    fn test_transport_error_from_parameters() {
        let param_err = ParameterError::ZeroTimeout {
            field: "send_timeout",
        };
        let transport_err = TransportError::from(param_err);

        assert!(matches!(transport_err, TransportError::InvalidConfig(_)));
    }

    #[test]
    fn test_transport_stats_default() {
        let stats = TransportStats::default();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.requests_timed_out, 0);
    }
}
