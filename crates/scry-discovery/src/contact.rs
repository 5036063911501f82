//! Candidate peer records for the detection protocol.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// A reachable peer, as supplied by the bootstrap directory.
///
/// Immutable once constructed; the protocol reads it, never updates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    /// Endpoint requests are sent to
    pub primary: SocketAddr,
    /// Other endpoints this peer is known under
    pub known_endpoints: Vec<SocketAddr>,
    /// Endpoint to hand out for rendezvous connections, if distinct
    pub rendezvous: Option<SocketAddr>,
    /// Peer is known to be directly reachable
    pub directly_reachable: bool,
    /// Peer is willing to act as a rendezvous
    pub can_rendezvous: bool,
}

impl Contact {
    /// Create a contact with just a primary endpoint
    #[must_use]
    pub fn new(primary: SocketAddr) -> Self {
        Self {
            primary,
            known_endpoints: Vec::new(),
            rendezvous: None,
            directly_reachable: false,
            can_rendezvous: true,
        }
    }

    /// Set the alternate endpoints
    #[must_use]
    pub fn with_known_endpoints(mut self, endpoints: Vec<SocketAddr>) -> Self {
        self.known_endpoints = endpoints;
        self
    }

    /// Set a dedicated rendezvous endpoint
    #[must_use]
    pub fn with_rendezvous(mut self, rendezvous: SocketAddr) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    /// Mark the peer as known directly reachable
    #[must_use]
    pub fn with_directly_reachable(mut self, directly_reachable: bool) -> Self {
        self.directly_reachable = directly_reachable;
        self
    }

    /// Set whether the peer is willing to act as a rendezvous
    #[must_use]
    pub fn with_can_rendezvous(mut self, can_rendezvous: bool) -> Self {
        self.can_rendezvous = can_rendezvous;
        self
    }

    /// Endpoint to use for rendezvous traffic, the primary if none is set
    #[must_use]
    pub fn rendezvous_endpoint(&self) -> SocketAddr {
        self.rendezvous.unwrap_or(self.primary)
    }
}
