//! Classification wire messages.
//!
//! Two messages carry the whole protocol. The request travels origin to
//! rendezvous, and rewritten, rendezvous to proxy; the result travels back
//! the same way. Both round-trip exactly through bincode.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire message errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Serialization failed
    #[error("message encode failed: {0}")]
    Encode(String),

    /// Deserialization failed
    #[error("message decode failed: {0}")]
    Decode(String),

    /// A successful result arrived without the responder endpoint
    #[error("successful result is missing the responder endpoint")]
    MissingEndpoint,

    /// A failed result claims a responder endpoint
    #[error("failed result must not carry a responder endpoint")]
    UnexpectedEndpoint,
}

/// Asks a witness how the sender is seen from outside.
///
/// `claimed_endpoint` is what the origin believes its outbound-observable
/// address to be on the first hop; when a rendezvous forwards the request,
/// it rewrites the field to the source it actually observed, so the proxy
/// probes the origin's real public mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassificationRequest {
    /// Endpoint the origin is believed to be reachable at
    pub claimed_endpoint: SocketAddr,
    /// This request already crossed the one permitted relay hop
    pub is_relayed: bool,
}

impl ClassificationRequest {
    /// Request as sent by the origin to a rendezvous candidate
    #[must_use]
    pub fn first_hop(claimed_endpoint: SocketAddr) -> Self {
        Self {
            claimed_endpoint,
            is_relayed: false,
        }
    }

    /// Request as rewritten by a rendezvous when forwarding to its proxy
    #[must_use]
    pub fn relayed(claimed_endpoint: SocketAddr) -> Self {
        Self {
            claimed_endpoint,
            is_relayed: true,
        }
    }

    /// Serialize to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] on serializer failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for truncated or malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Outcome of a witness's connect-back attempt.
///
/// A success always carries the endpoint the witness connected back from; a
/// failure never does. `relayed` records whether the answering attempt was
/// the forwarded one, which is what the orchestrator's classification rule
/// branches on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassificationResult {
    /// The connect-back attempt reached the origin
    pub succeeded: bool,
    /// Fresh-association endpoint the witness connected back from
    pub responder_endpoint: Option<SocketAddr>,
    /// The attempt was made by the proxy rather than the first hop
    pub relayed: bool,
}

impl ClassificationResult {
    /// A connect-back that reached the origin from `responder_endpoint`
    #[must_use]
    pub fn success(responder_endpoint: SocketAddr, relayed: bool) -> Self {
        Self {
            succeeded: true,
            responder_endpoint: Some(responder_endpoint),
            relayed,
        }
    }

    /// A connect-back that never reached the origin
    #[must_use]
    pub fn failure(relayed: bool) -> Self {
        Self {
            succeeded: false,
            responder_endpoint: None,
            relayed,
        }
    }

    /// Checks the success/endpoint pairing invariant.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MissingEndpoint`] or
    /// [`ProtocolError::UnexpectedEndpoint`] when `succeeded` and
    /// `responder_endpoint` disagree.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match (self.succeeded, self.responder_endpoint) {
            (true, None) => Err(ProtocolError::MissingEndpoint),
            (false, Some(_)) => Err(ProtocolError::UnexpectedEndpoint),
            _ => Ok(()),
        }
    }

    /// Serialize to bytes, validating first.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an inconsistent result, or
    /// [`ProtocolError::Encode`] on serializer failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        self.validate()?;
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from bytes, validating the decoded result.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for malformed input, or a
    /// validation error for a well-formed but inconsistent result.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let result: Self =
            bincode::deserialize(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        result.validate()?;
        Ok(result)
    }
}
