//! NAT Classification Module
//!
//! This module determines how a node's NAT treats inbound traffic by driving
//! a three-party protocol between an origin, a rendezvous witness, and a
//! proxy witness.
//!
//! # Components
//!
//! - **Wire messages**: classification request and result, with validation
//! - **Detection service**: answers or relays inbound classification requests
//! - **Detection orchestrator**: drives candidates in order and blocks the
//!   caller until a verdict is reached
//!
//! # Classifications
//!
//! - **Full cone**: a fresh association reached the origin, so any external
//!   endpoint can
//! - **Port restricted**: only the rendezvous the origin already talks to
//!   could reach it; the proxy's fresh flow was dropped
//! - **Symmetric**: reserved; this flow never emits it (a further round trip
//!   would be needed to tell it apart from port restricted)
//! - **Undetermined**: every candidate was exhausted without a verdict

pub mod detector;
pub mod protocol;
pub mod service;
pub mod types;

// Re-exports
pub use detector::NatDetector;
pub use protocol::{ClassificationRequest, ClassificationResult, ProtocolError};
pub use service::{DetectionService, DetectionServiceConfig};
pub use types::{Detection, DetectionError, NatType};
