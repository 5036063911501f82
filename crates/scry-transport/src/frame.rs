//! Wire framing for the request/response transport.
//!
//! Every datagram on the wire is one [`Frame`]. Requests and responses are
//! correlated by id; probes and their acks by token. Payload bytes are opaque
//! to this layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::MAX_UDP_PAYLOAD;

/// Framing errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Serialization failed
    #[error("frame encode failed: {0}")]
    Encode(String),

    /// Deserialization failed
    #[error("frame decode failed: {0}")]
    Decode(String),

    /// Encoded frame exceeds the UDP payload limit
    #[error("frame of {size} bytes exceeds limit {max}")]
    TooLarge {
        /// Encoded size
        size: usize,
        /// Hard limit ([`MAX_UDP_PAYLOAD`])
        max: usize,
    },
}

/// Transport envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    /// Caller request awaiting a correlated response
    Request {
        /// Correlation id, chosen by the sender
        id: u64,
        /// Opaque request payload
        payload: Vec<u8>,
    },

    /// Response to a prior request
    Response {
        /// Correlation id of the request being answered
        id: u64,
        /// Opaque response payload
        payload: Vec<u8>,
    },

    /// Connect-back probe from a fresh association
    Probe {
        /// Echo token, chosen by the prober
        token: u64,
    },

    /// Acknowledgment of a probe
    ProbeAck {
        /// Token copied from the probe
        token: u64,
    },
}

impl Frame {
    /// Serialize the frame to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] if the encoded frame would not fit in
    /// one UDP datagram, or [`FrameError::Encode`] on serializer failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let bytes = bincode::serialize(self).map_err(|e| FrameError::Encode(e.to_string()))?;
        if bytes.len() > MAX_UDP_PAYLOAD {
            return Err(FrameError::TooLarge {
                size: bytes.len(),
                max: MAX_UDP_PAYLOAD,
            });
        }
        Ok(bytes)
    }

    /// Deserialize a frame from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Decode`] for truncated or malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        bincode::deserialize(bytes).map_err(|e| FrameError::Decode(e.to_string()))
    }

    /// Get the frame type name
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "Request",
            Frame::Response { .. } => "Response",
            Frame::Probe { .. } => "Probe",
            Frame::ProbeAck { .. } => "ProbeAck",
        }
    }

    /// Correlation id for request/response frames, `None` for probes
    #[must_use]
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Frame::Request { id, .. } | Frame::Response { id, .. } => Some(*id),
            Frame::Probe { .. } | Frame::ProbeAck { .. } => None,
        }
    }
}
