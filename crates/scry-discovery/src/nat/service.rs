//! Detection service: the rendezvous and proxy witness role.
//!
//! Every node that may act as a witness registers one [`DetectionService`]
//! as its transport's request handler. The service answers each request in
//! one of two ways:
//!
//! - **probe**: when the sender's claimed endpoint matches the observed
//!   source (no address rewriting in play), or when the request already
//!   crossed its one permitted relay hop, connect back to the claimed
//!   endpoint from a fresh association and report the outcome
//! - **forward**: otherwise, pass the question one hop to the configured
//!   proxy with the claimed endpoint rewritten to the observed source, and
//!   relay the proxy's verdict back verbatim
//!
//! Internal failures always become a well-formed failure result; the peer is
//! never left hanging and never sees a transport-level error.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use scry_transport::{RequestHandler, Transport, TransportParameters, TransportResult, UdpTransport};

use crate::contact::Contact;

use super::protocol::{ClassificationRequest, ClassificationResult};

/// Detection service configuration
#[derive(Debug, Clone)]
pub struct DetectionServiceConfig {
    /// Proxy contact to forward unmatched first-hop requests to
    pub proxy: Option<Contact>,
    /// Timing parameters for probes and the proxy hop
    pub params: TransportParameters,
}

impl Default for DetectionServiceConfig {
    fn default() -> Self {
        Self {
            proxy: None, // forwarding answers failure until one is configured
            params: TransportParameters::default(),
        }
    }
}

/// Witness for NAT classification requests.
///
/// Register as the transport's request handler; distinct requests are
/// handled concurrently and each issues at most one outbound attempt.
pub struct DetectionService {
    config: DetectionServiceConfig,
    transport: OnceLock<Arc<dyn Transport>>,
}

impl DetectionService {
    /// Create a service that is not yet attached to a transport.
    ///
    /// Until [`attach_transport`] is called the service answers every
    /// request with a failure result, since it cannot probe or forward.
    ///
    /// [`attach_transport`]: DetectionService::attach_transport
    #[must_use]
    pub fn new(config: DetectionServiceConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport: OnceLock::new(),
        })
    }

    /// Attach the transport the service probes and forwards through.
    ///
    /// Only the first attachment takes effect.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        if self.transport.set(transport).is_err() {
            warn!("transport already attached");
        }
    }

    /// Bind a listening transport with a fresh service registered on it.
    ///
    /// This is the whole setup for a witness node: socket, handler
    /// registration, and transport attachment in one call.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the parameters fail validation or the
    /// socket cannot be bound.
    pub async fn serve(
        addr: SocketAddr,
        config: DetectionServiceConfig,
    ) -> TransportResult<(UdpTransport, Arc<Self>)> {
        let params = config.params.clone();
        let service = Self::new(config);
        let handler: Arc<dyn RequestHandler> = service.clone();
        let transport = UdpTransport::bind_with_handler(addr, params, handler).await?;
        service.attach_transport(Arc::new(transport.clone()));
        info!(addr = %transport.local_addr()?, "detection service listening");
        Ok((transport, service))
    }

    /// Whether the sender's NAT (if any) left this flow's address alone
    fn directly_connected(request: &ClassificationRequest, source: SocketAddr) -> bool {
        request.claimed_endpoint == source
    }

    async fn classify(
        &self,
        request: ClassificationRequest,
        source: SocketAddr,
    ) -> ClassificationResult {
        if Self::directly_connected(&request, source) || request.is_relayed {
            self.probe_claimed(&request).await
        } else {
            self.forward_to_proxy(&request, source).await
        }
    }

    /// Connect back to the claimed endpoint from a fresh association.
    async fn probe_claimed(&self, request: &ClassificationRequest) -> ClassificationResult {
        let Some(transport) = self.transport.get() else {
            warn!("no transport attached, answering failure");
            return ClassificationResult::failure(request.is_relayed);
        };
        let attempt = transport
            .probe(
                request.claimed_endpoint,
                self.config.params.client_connect_timeout,
            )
            .await;
        match attempt {
            Ok(endpoint) => {
                debug!(
                    claimed = %request.claimed_endpoint,
                    from = %endpoint,
                    relayed = request.is_relayed,
                    "connect-back reached the origin"
                );
                ClassificationResult::success(endpoint, request.is_relayed)
            }
            Err(e) => {
                debug!(
                    claimed = %request.claimed_endpoint,
                    relayed = request.is_relayed,
                    error = %e,
                    "connect-back failed"
                );
                ClassificationResult::failure(request.is_relayed)
            }
        }
    }

    /// Forward a first-hop request one hop and relay the verdict verbatim.
    ///
    /// Relayed requests never reach this path, so no request crosses more
    /// than one hop.
    async fn forward_to_proxy(
        &self,
        request: &ClassificationRequest,
        source: SocketAddr,
    ) -> ClassificationResult {
        debug_assert!(!request.is_relayed);
        let Some(proxy) = &self.config.proxy else {
            debug!(%source, "forwarding required but no proxy configured");
            return ClassificationResult::failure(false);
        };
        let Some(transport) = self.transport.get() else {
            warn!("no transport attached, answering failure");
            return ClassificationResult::failure(false);
        };

        // The proxy must probe the origin's public mapping, which is the
        // source observed here, not the endpoint the origin believes in
        let relayed = ClassificationRequest::relayed(source);
        let payload = match relayed.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "relayed request encode failed");
                return ClassificationResult::failure(false);
            }
        };

        debug!(
            proxy = %proxy.primary,
            origin = %source,
            claimed = %request.claimed_endpoint,
            "forwarding to proxy"
        );
        // A live proxy may spend a full connect-back before it can answer
        let deadline =
            self.config.params.client_connect_timeout + self.config.params.request_timeout();
        let response = transport
            .send_request(proxy.primary, &payload, deadline)
            .await;
        match response {
            Ok(bytes) => match ClassificationResult::from_bytes(&bytes) {
                Ok(result) => {
                    debug!(
                        proxy = %proxy.primary,
                        succeeded = result.succeeded,
                        "relaying proxy verdict"
                    );
                    result
                }
                Err(e) => {
                    debug!(proxy = %proxy.primary, error = %e, "undecodable proxy verdict");
                    ClassificationResult::failure(false)
                }
            },
            // The origin treats this like an unreachable candidate and moves on
            Err(e) => {
                debug!(proxy = %proxy.primary, error = %e, "proxy unreachable");
                ClassificationResult::failure(false)
            }
        }
    }
}

#[async_trait]
impl RequestHandler for DetectionService {
    async fn handle_request(&self, payload: Vec<u8>, source: SocketAddr) -> Option<Vec<u8>> {
        let request = match ClassificationRequest::from_bytes(&payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(%source, error = %e, "undecodable classification request");
                return None;
            }
        };
        let result = self.classify(request, source).await;
        match result.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "classification result encode failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::mock::MockTransport;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn service_with_transport(
        proxy: Option<Contact>,
    ) -> (Arc<DetectionService>, Arc<MockTransport>) {
        let service = DetectionService::new(DetectionServiceConfig {
            proxy,
            params: TransportParameters::default(),
        });
        let transport = Arc::new(MockTransport::new(addr("203.0.113.5:4200")));
        service.attach_transport(transport.clone());
        (service, transport)
    }

    async fn classify_raw(
        service: &DetectionService,
        request: ClassificationRequest,
        source: SocketAddr,
    ) -> ClassificationResult {
        let payload = request.to_bytes().unwrap();
        let bytes = service.handle_request(payload, source).await.unwrap();
        ClassificationResult::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_directly_connected_predicate() {
        let endpoint = addr("192.0.2.1:4200");
        let request = ClassificationRequest::first_hop(endpoint);

        assert!(DetectionService::directly_connected(&request, endpoint));
        // Different port
        assert!(!DetectionService::directly_connected(
            &request,
            addr("192.0.2.1:4201")
        ));
        // Different address
        assert!(!DetectionService::directly_connected(
            &request,
            addr("192.0.2.2:4200")
        ));
        // Both differ
        assert!(!DetectionService::directly_connected(
            &request,
            addr("192.0.2.2:4201")
        ));
    }

    #[tokio::test]
    async fn test_direct_request_probes_claimed_endpoint() {
        let (service, transport) = service_with_transport(None);
        let origin = addr("192.0.2.1:4200");
        let fresh = addr("203.0.113.5:61000");
        transport.expect_probe_success(fresh);

        let result = classify_raw(&service, ClassificationRequest::first_hop(origin), origin).await;

        assert_eq!(result, ClassificationResult::success(fresh, false));
        assert_eq!(transport.probes(), vec![origin]);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_direct_request_probe_failure_reports_failure() {
        let (service, transport) = service_with_transport(None);
        let origin = addr("192.0.2.1:4200");
        // No scripted probe result, so the probe times out

        let result = classify_raw(&service, ClassificationRequest::first_hop(origin), origin).await;

        assert_eq!(result, ClassificationResult::failure(false));
        assert_eq!(transport.probes().len(), 1);
    }

    #[tokio::test]
    async fn test_relayed_request_probes_and_never_forwards() {
        // Even with a proxy configured, a relayed request must not hop again
        let proxy = Contact::new(addr("198.51.100.7:4200"));
        let (service, transport) = service_with_transport(Some(proxy));
        let origin_mapping = addr("192.0.2.1:50123");
        let rendezvous = addr("198.51.100.2:4200");
        let fresh = addr("203.0.113.5:62000");
        transport.expect_probe_success(fresh);

        let result = classify_raw(
            &service,
            ClassificationRequest::relayed(origin_mapping),
            rendezvous,
        )
        .await;

        assert_eq!(result, ClassificationResult::success(fresh, true));
        assert_eq!(transport.probes(), vec![origin_mapping]);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_relayed_request_failure_keeps_relayed_flag() {
        let (service, transport) = service_with_transport(None);
        let origin_mapping = addr("192.0.2.1:50123");
        let rendezvous = addr("198.51.100.2:4200");

        let result = classify_raw(
            &service,
            ClassificationRequest::relayed(origin_mapping),
            rendezvous,
        )
        .await;

        assert_eq!(result, ClassificationResult::failure(true));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_request_forwards_with_source_rewrite() {
        let proxy_addr = addr("198.51.100.7:4200");
        let (service, transport) = service_with_transport(Some(Contact::new(proxy_addr)));
        let claimed = addr("10.0.0.17:4200"); // private address the origin believes in
        let observed = addr("192.0.2.88:50999"); // its actual public mapping
        transport.expect_response(
            proxy_addr,
            ClassificationResult::failure(true).to_bytes().unwrap(),
        );

        let result = classify_raw(
            &service,
            ClassificationRequest::first_hop(claimed),
            observed,
        )
        .await;

        // Proxy verdict relayed verbatim
        assert_eq!(result, ClassificationResult::failure(true));
        assert!(transport.probes().is_empty());

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, proxy_addr);
        let forwarded = ClassificationRequest::from_bytes(&requests[0].1).unwrap();
        assert_eq!(forwarded, ClassificationRequest::relayed(observed));
    }

    #[tokio::test]
    async fn test_forwarded_success_relayed_verbatim() {
        let proxy_addr = addr("198.51.100.7:4200");
        let (service, transport) = service_with_transport(Some(Contact::new(proxy_addr)));
        let proxy_fresh = addr("198.51.100.7:61500");
        transport.expect_response(
            proxy_addr,
            ClassificationResult::success(proxy_fresh, true)
                .to_bytes()
                .unwrap(),
        );

        let result = classify_raw(
            &service,
            ClassificationRequest::first_hop(addr("10.0.0.17:4200")),
            addr("192.0.2.88:50999"),
        )
        .await;

        assert_eq!(result, ClassificationResult::success(proxy_fresh, true));
    }

    #[tokio::test]
    async fn test_no_proxy_configured_answers_failure() {
        let (service, transport) = service_with_transport(None);

        let result = classify_raw(
            &service,
            ClassificationRequest::first_hop(addr("10.0.0.17:4200")),
            addr("192.0.2.88:50999"),
        )
        .await;

        // Not marked relayed: the origin should try its next candidate
        assert_eq!(result, ClassificationResult::failure(false));
        assert!(transport.requests().is_empty());
        assert!(transport.probes().is_empty());
    }

    #[tokio::test]
    async fn test_proxy_unreachable_answers_failure() {
        let proxy_addr = addr("198.51.100.7:4200");
        let (service, transport) = service_with_transport(Some(Contact::new(proxy_addr)));
        // No scripted proxy response, so the forward times out

        let result = classify_raw(
            &service,
            ClassificationRequest::first_hop(addr("10.0.0.17:4200")),
            addr("192.0.2.88:50999"),
        )
        .await;

        assert_eq!(result, ClassificationResult::failure(false));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_request_gets_no_answer() {
        let (service, _transport) = service_with_transport(None);

        let answer = service
            .handle_request(vec![0xde, 0xad], addr("192.0.2.1:1"))
            .await;

        assert!(answer.is_none());
    }

    #[tokio::test]
    async fn test_unattached_service_answers_failure() {
        let service = DetectionService::new(DetectionServiceConfig::default());
        let origin = addr("192.0.2.1:4200");

        let result = classify_raw(&service, ClassificationRequest::first_hop(origin), origin).await;

        assert_eq!(result, ClassificationResult::failure(false));
    }
}
