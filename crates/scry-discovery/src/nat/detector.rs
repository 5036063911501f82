//! Origin-side NAT detection.
//!
//! [`NatDetector`] walks a caller-supplied candidate list of rendezvous
//! contacts, asks each one to classify this node, and folds the answers
//! into a single [`Detection`]. The walk stops at the first conclusive
//! answer; an inconclusive candidate (dead peer, undecodable reply, or a
//! failure that never crossed the relay hop) just advances the walk.
//!
//! The public entry point blocks the calling thread. Async work runs on a
//! runtime handle captured at construction, so the caller does not need to
//! be inside a runtime; callers that are should wrap the call in
//! [`tokio::task::spawn_blocking`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info};

use scry_transport::{Transport, TransportError, TransportParameters};

use crate::contact::Contact;

use super::protocol::{ClassificationRequest, ClassificationResult};
use super::types::{Detection, DetectionError, NatType};

/// Extra grace on the blocking wait so the transport's own deadline, not
/// the channel's, is the one that normally fires
const CHANNEL_SLACK: Duration = Duration::from_millis(100);

/// Walks rendezvous candidates and reports this node's NAT classification.
pub struct NatDetector {
    transport: Arc<dyn Transport>,
    local_endpoint: SocketAddr,
    params: TransportParameters,
    handle: Handle,
}

impl NatDetector {
    /// Create a detector over an already-bound transport.
    ///
    /// `local_endpoint` is the endpoint this node believes it occupies; the
    /// candidates compare it against the source they observe. `handle` is
    /// the runtime that carries the async sends while [`detect`] blocks.
    ///
    /// [`detect`]: NatDetector::detect
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        local_endpoint: SocketAddr,
        params: TransportParameters,
        handle: Handle,
    ) -> Self {
        Self {
            transport,
            local_endpoint,
            params,
            handle,
        }
    }

    /// Classify this node's NAT against the given candidates, in order.
    ///
    /// With `use_rendezvous` set, contacts that cannot act as a rendezvous
    /// point are skipped before the walk starts. Blocks for up to one
    /// detection round per inconclusive candidate; see the module docs for
    /// how to call this from inside a runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DetectionError::NoContacts`] when no usable candidate
    /// remains after filtering, or a transport error when the parameter
    /// block fails validation. Unreachable candidates are not errors; a
    /// walk that exhausts them yields [`Detection::undetermined`].
    pub fn detect(
        &self,
        contacts: &[Contact],
        use_rendezvous: bool,
    ) -> Result<Detection, DetectionError> {
        self.params.validate().map_err(TransportError::from)?;

        let candidates: Vec<&Contact> = contacts
            .iter()
            .filter(|contact| !use_rendezvous || contact.can_rendezvous)
            .collect();
        if candidates.is_empty() {
            return Err(DetectionError::NoContacts);
        }

        let request = ClassificationRequest::first_hop(self.local_endpoint);
        let payload = request.to_bytes()?;

        for contact in candidates {
            let peer = contact.primary;
            debug!(%peer, "querying candidate");
            let result = match self.query(peer, payload.clone()) {
                Some(result) => result,
                None => continue,
            };

            if result.succeeded {
                // Encode invariant: a success always carries the endpoint
                let Some(endpoint) = result.responder_endpoint else {
                    continue;
                };
                let detection = Detection {
                    nat_type: NatType::FullCone,
                    rendezvous_endpoint: endpoint,
                };
                info!(
                    nat_type = %detection.nat_type,
                    endpoint = %endpoint,
                    relayed = result.relayed,
                    "detection complete"
                );
                return Ok(detection);
            }

            if result.relayed {
                // The proxy saw our mapping and still could not reach us,
                // so inbound flows must come through this candidate
                let detection = Detection {
                    nat_type: NatType::PortRestricted,
                    rendezvous_endpoint: contact.rendezvous_endpoint(),
                };
                info!(
                    nat_type = %detection.nat_type,
                    endpoint = %detection.rendezvous_endpoint,
                    "detection complete"
                );
                return Ok(detection);
            }

            debug!(%peer, "candidate inconclusive");
        }

        info!("candidates exhausted, classification undetermined");
        Ok(Detection::undetermined())
    }

    /// One candidate round: ship the request on the runtime, block for the
    /// answer, and decode it. `None` means inconclusive.
    fn query(&self, peer: SocketAddr, payload: Vec<u8>) -> Option<ClassificationResult> {
        let deadline = self.params.detection_timeout();
        let transport = Arc::clone(&self.transport);
        let (tx, rx) = mpsc::sync_channel(1);

        self.handle.spawn(async move {
            let response = transport.send_request(peer, &payload, deadline).await;
            // The receiver is gone once the blocking side gives up
            let _ = tx.send(response);
        });

        let response = match rx.recv_timeout(deadline + CHANNEL_SLACK) {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "candidate unreachable");
                return None;
            }
            Err(_) => {
                debug!(%peer, "candidate round overran its deadline");
                return None;
            }
        };

        match ClassificationResult::from_bytes(&response) {
            Ok(result) => Some(result),
            Err(e) => {
                debug!(%peer, error = %e, "undecodable candidate answer");
                None
            }
        }
    }
}
