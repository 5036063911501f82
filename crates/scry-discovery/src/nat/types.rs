//! Classification outcomes and error taxonomy.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use scry_transport::TransportError;
use thiserror::Error;

use super::protocol::ProtocolError;

/// NAT classification
///
/// What the protocol learned about inbound reachability:
/// - FullCone: easiest case, any external endpoint can reach the node
/// - PortRestricted: only previously-contacted endpoints can reach it
/// - Symmetric: per-destination mappings; never emitted by this flow, which
///   cannot tell it apart from PortRestricted without a further round trip
/// - Undetermined: no candidate produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// Any external endpoint can send to the mapped port
    FullCone,
    /// Only endpoints the node has sent to can send back
    PortRestricted,
    /// Different external mapping per destination
    Symmetric,
    /// Detection exhausted every candidate without a verdict
    Undetermined,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullCone => write!(f, "Full Cone NAT"),
            Self::PortRestricted => write!(f, "Port Restricted NAT"),
            Self::Symmetric => write!(f, "Symmetric NAT"),
            Self::Undetermined => write!(f, "Undetermined"),
        }
    }
}

/// Final verdict of one detection run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    /// The classification reached
    pub nat_type: NatType,
    /// Endpoint to hand to peers that want to rendezvous with this node
    pub rendezvous_endpoint: SocketAddr,
}

impl Detection {
    /// Verdict when every candidate was exhausted.
    ///
    /// Carries the unspecified endpoint `0.0.0.0:0`, since no usable
    /// rendezvous endpoint was learned.
    #[must_use]
    pub fn undetermined() -> Self {
        Self {
            nat_type: NatType::Undetermined,
            rendezvous_endpoint: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }
}

/// Detection errors surfaced to the caller.
///
/// Candidate-level failures are not errors; the orchestrator absorbs them by
/// advancing to the next contact. Only caller misuse and local setup
/// failures surface here.
#[derive(Debug, Error)]
pub enum DetectionError {
    /// No candidate contacts to probe (empty list, or none willing to act
    /// as rendezvous)
    #[error("no candidate contacts to probe")]
    NoContacts,

    /// Local transport failure before any candidate was tried
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Outbound request could not be encoded
    #[error("message codec error: {0}")]
    Codec(#[from] ProtocolError),
}
