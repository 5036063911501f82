//! # Scry Discovery
//!
//! NAT classification layer for the scry protocol.
//!
//! This crate provides:
//! - The contact model for candidate rendezvous peers
//! - The classification wire messages and their validation
//! - The detection service (rendezvous / proxy witness role)
//! - The blocking detection orchestrator (origin role)
//!
//! ## Protocol
//!
//! An origin node asks a rendezvous contact how it is seen from outside. The
//! rendezvous compares the endpoint the origin claims against the endpoint
//! the request was observed to arrive from. On a match it probes the origin
//! from a fresh association and answers directly; on a mismatch it forwards
//! the question one hop to a proxy, which performs the same probe against the
//! origin's observed public mapping. The orchestrator turns the answer into a
//! NAT classification:
//!
//! - fresh association reached the origin: full cone
//! - only the proxy hop failed to reach it: port restricted
//! - nobody answered: undetermined
//!
//! ## Example
//!
//! ```rust,no_run
//! use scry_discovery::{Contact, NatDetector};
//! use scry_transport::{Transport, TransportParameters, UdpTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let params = TransportParameters::default();
//! let transport = UdpTransport::bind("0.0.0.0:0".parse()?, params.clone()).await?;
//! let local = transport.local_addr()?;
//!
//! let detector = NatDetector::new(
//!     Arc::new(transport),
//!     local,
//!     params,
//!     tokio::runtime::Handle::current(),
//! );
//! let contacts = vec![Contact::new("203.0.113.7:4200".parse()?)];
//!
//! // Blocking call; run it off the async runtime
//! let detection = tokio::task::spawn_blocking(move || detector.detect(&contacts, true)).await??;
//! println!("NAT type: {}", detection.nat_type);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod contact;
pub mod nat;

// Re-export commonly used types
pub use contact::Contact;
pub use nat::{
    ClassificationRequest, ClassificationResult, Detection, DetectionError, DetectionService,
    DetectionServiceConfig, NatDetector, NatType, ProtocolError,
};
