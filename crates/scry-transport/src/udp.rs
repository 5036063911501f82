//! Async UDP request/response transport implementation.
//!
//! One socket, one receive loop. Outbound requests are correlated to
//! responses by id and retransmitted every `send_timeout` until the caller's
//! deadline. Inbound requests are dispatched to the registered handler;
//! answered requests land in a replay cache so a retransmitted copy is
//! answered again without re-invoking the handler. Probes are answered
//! inline, and outbound probes run over a fresh socket so the peer's NAT sees
//! a brand-new flow.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, Semaphore, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::frame::{Frame, FrameError};
use crate::params::TransportParameters;
use crate::transport::{
    RequestHandler, Transport, TransportError, TransportResult, TransportStats,
};

/// How long an answered request stays replayable.
///
/// Must outlast any sender's retransmission deadline, otherwise a late
/// duplicate would reach the handler a second time.
const REPLAY_TTL: Duration = Duration::from_secs(30);

/// Receive buffer, large enough for any single frame
const RECV_BUF_SIZE: usize = 65536;

/// A response the receive loop may replay: when it was produced, and the
/// payload (`None` while the handler is still running, or if it declined)
type CachedResponse = (Instant, Option<Vec<u8>>);

/// Async UDP transport with request/response correlation.
///
/// Cloning is cheap and clones share the socket, the correlation state, and
/// the statistics.
///
/// # Examples
///
/// ```no_run
/// use scry_transport::{Transport, TransportParameters, UdpTransport};
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let params = TransportParameters::default();
/// let transport = UdpTransport::bind(addr, params.clone()).await?;
/// println!("listening on {}", transport.local_addr()?);
///
/// let reachable = transport
///     .probe("203.0.113.9:4000".parse()?, params.client_connect_timeout)
///     .await
///     .is_ok();
/// println!("reachable from a fresh association: {reachable}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    params: TransportParameters,
    handler: Option<Arc<dyn RequestHandler>>,
    pending: Arc<DashMap<u64, oneshot::Sender<Vec<u8>>>>,
    replayed: Arc<DashMap<(SocketAddr, u64), CachedResponse>>,
    window: Arc<Semaphore>,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    packets_sent: Arc<AtomicU64>,
    packets_received: Arc<AtomicU64>,
    requests_timed_out: Arc<AtomicU64>,
    decode_errors: Arc<AtomicU64>,
}

impl UdpTransport {
    /// Bind a transport that only issues requests and probes.
    ///
    /// Inbound requests are dropped; probes are still acknowledged.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` if `params` fail validation,
    /// or `TransportError::BindFailed` if the socket cannot be set up.
    pub async fn bind(addr: SocketAddr, params: TransportParameters) -> TransportResult<Self> {
        Self::bind_inner(addr, params, None).await
    }

    /// Bind a transport that answers inbound requests with `handler`.
    ///
    /// The handler is invoked once per distinct request; retransmitted
    /// duplicates are answered from the replay cache.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` if `params` fail validation,
    /// or `TransportError::BindFailed` if the socket cannot be set up.
    pub async fn bind_with_handler(
        addr: SocketAddr,
        params: TransportParameters,
        handler: Arc<dyn RequestHandler>,
    ) -> TransportResult<Self> {
        Self::bind_inner(addr, params, Some(handler)).await
    }

    async fn bind_inner(
        addr: SocketAddr,
        params: TransportParameters,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> TransportResult<Self> {
        params.validate()?;

        // Create socket using socket2 for advanced options
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket2 =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        // Buffer a full window of packets in each direction
        let buffer_size = params.max_window_size as usize * params.packet_size;
        socket2
            .set_recv_buffer_size(buffer_size)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_send_buffer_size(buffer_size)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        socket2
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        // Convert to std socket, then to tokio socket
        socket2
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let window = params.window_size as usize;
        let transport = Self {
            socket: Arc::new(socket),
            params,
            handler,
            pending: Arc::new(DashMap::new()),
            replayed: Arc::new(DashMap::new()),
            window: Arc::new(Semaphore::new(window)),
            shutdown: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            packets_sent: Arc::new(AtomicU64::new(0)),
            packets_received: Arc::new(AtomicU64::new(0)),
            requests_timed_out: Arc::new(AtomicU64::new(0)),
            decode_errors: Arc::new(AtomicU64::new(0)),
        };

        debug!(addr = %transport.local_addr()?, "transport listening");
        transport.spawn_recv_loop();
        transport.spawn_replay_cleanup();
        Ok(transport)
    }

    /// Parameters this transport was bound with
    #[must_use]
    pub fn params(&self) -> &TransportParameters {
        &self.params
    }

    fn spawn_recv_loop(&self) {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUF_SIZE];
            loop {
                if transport.is_closed() {
                    break;
                }
                let (len, source) = tokio::select! {
                    _ = transport.shutdown.notified() => break,
                    result = transport.socket.recv_from(&mut buf) => match result {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "receive failed");
                            continue;
                        }
                    },
                };
                transport
                    .bytes_received
                    .fetch_add(len as u64, Ordering::Relaxed);
                transport.packets_received.fetch_add(1, Ordering::Relaxed);

                match Frame::from_bytes(&buf[..len]) {
                    Ok(frame) => transport.handle_frame(frame, source).await,
                    Err(e) => {
                        transport.decode_errors.fetch_add(1, Ordering::Relaxed);
                        trace!(%source, error = %e, "undecodable datagram");
                    }
                }
            }
            trace!("receive loop stopped");
        });
    }

    /// Expires replay-cache entries old enough that no peer is still
    /// retransmitting them.
    fn spawn_replay_cleanup(&self) {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(REPLAY_TTL / 2);
            loop {
                interval.tick().await;
                if transport.is_closed() {
                    break;
                }
                if let Some(cutoff) = Instant::now().checked_sub(REPLAY_TTL) {
                    transport.replayed.retain(|_, (stamp, _)| *stamp > cutoff);
                }
            }
        });
    }

    async fn handle_frame(&self, frame: Frame, source: SocketAddr) {
        match frame {
            Frame::Request { id, payload } => {
                let key = (source, id);
                // Single receive task, so the lookup/insert pair cannot race
                let cached = self.replayed.get(&key).map(|entry| entry.value().1.clone());
                match cached {
                    Some(Some(response)) => {
                        trace!(%source, id, "replaying cached response");
                        self.send_response(id, response, source).await;
                    }
                    Some(None) => {
                        trace!(%source, id, "duplicate request, answer still pending");
                    }
                    None => {
                        if self.handler.is_none() {
                            trace!(%source, id, "no handler registered, dropping request");
                            return;
                        }
                        self.replayed.insert(key, (Instant::now(), None));
                        let transport = self.clone();
                        tokio::spawn(async move {
                            transport.dispatch_request(id, payload, source).await;
                        });
                    }
                }
            }
            Frame::Response { id, payload } => match self.pending.remove(&id) {
                Some((_, sender)) => {
                    // Receiver may have timed out and gone away
                    let _ = sender.send(payload);
                }
                None => trace!(%source, id, "response with no waiting request"),
            },
            Frame::Probe { token } => {
                trace!(%source, token, "acknowledging probe");
                let ack = Frame::ProbeAck { token };
                match ack.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = self.send_datagram(&bytes, source).await {
                            debug!(%source, error = %e, "probe ack send failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "probe ack encode failed"),
                }
            }
            Frame::ProbeAck { token } => {
                trace!(%source, token, "stray probe ack on listening socket");
            }
        }
    }

    async fn dispatch_request(&self, id: u64, payload: Vec<u8>, source: SocketAddr) {
        let Some(handler) = &self.handler else { return };
        let response = handler.handle_request(payload, source).await;
        self.replayed
            .insert((source, id), (Instant::now(), response.clone()));
        match response {
            Some(bytes) => self.send_response(id, bytes, source).await,
            None => trace!(%source, id, "handler declined to answer"),
        }
    }

    async fn send_response(&self, id: u64, payload: Vec<u8>, peer: SocketAddr) {
        let frame = Frame::Response { id, payload };
        match frame.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.send_datagram(&bytes, peer).await {
                    debug!(%peer, id, error = %e, "response send failed");
                }
            }
            Err(e) => warn!(%peer, id, error = %e, "response encode failed"),
        }
    }

    async fn send_datagram(&self, bytes: &[u8], peer: SocketAddr) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let sent = self.socket.send_to(bytes, peer).await?;
        self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Sends `bytes` and retransmits every `send_timeout` until a response
    /// arrives on `rx` or `timeout` elapses.
    async fn drive_request(
        &self,
        peer: SocketAddr,
        bytes: &[u8],
        mut rx: oneshot::Receiver<Vec<u8>>,
        timeout: Duration,
    ) -> TransportResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.send_datagram(bytes, peer).await?;
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            let wait = self
                .params
                .send_timeout
                .min(deadline.saturating_duration_since(now));
            match time::timeout(wait, &mut rx).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_)) => return Err(TransportError::Closed),
                Err(_) => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    trace!(%peer, "no response yet, retransmitting");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_request(
        &self,
        peer: SocketAddr,
        payload: &[u8],
        timeout: Duration,
    ) -> TransportResult<Vec<u8>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let _permit = self
            .window
            .acquire()
            .await
            .map_err(|_| TransportError::Closed)?;

        let (tx, rx) = oneshot::channel();
        let id = loop {
            let candidate = rand::random::<u64>();
            match self.pending.entry(candidate) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    entry.insert(tx);
                    break candidate;
                }
            }
        };

        let frame = Frame::Request {
            id,
            payload: payload.to_vec(),
        };
        let bytes = match frame.to_bytes() {
            Ok(bytes) if bytes.len() <= self.params.packet_size => bytes,
            Ok(bytes) => {
                self.pending.remove(&id);
                return Err(TransportError::Codec(FrameError::TooLarge {
                    size: bytes.len(),
                    max: self.params.packet_size,
                }));
            }
            Err(e) => {
                self.pending.remove(&id);
                return Err(e.into());
            }
        };

        trace!(%peer, id, len = payload.len(), "sending request");
        let result = self.drive_request(peer, &bytes, rx, timeout).await;
        self.pending.remove(&id);
        if matches!(result, Err(TransportError::Timeout)) {
            self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
            debug!(%peer, id, "request timed out");
        }
        result
    }

    async fn probe(&self, peer: SocketAddr, timeout: Duration) -> TransportResult<SocketAddr> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        // Fresh socket: the peer's NAT must see a flow it has no mapping for
        let local_ip = self.local_addr()?.ip();
        let probe_socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local = probe_socket.local_addr().map_err(TransportError::Io)?;

        let token = rand::random::<u64>();
        let probe = Frame::Probe { token };
        let bytes = probe.to_bytes()?;
        debug!(%peer, from = %local, "probing from fresh association");

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            if Instant::now() >= deadline {
                debug!(%peer, "probe timed out");
                return Err(TransportError::Timeout);
            }
            probe_socket
                .send_to(&bytes, peer)
                .await
                .map_err(TransportError::Io)?;
            self.bytes_sent
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            self.packets_sent.fetch_add(1, Ordering::Relaxed);

            let resend_at = Instant::now() + self.params.send_timeout;
            loop {
                let now = Instant::now();
                let wait_until = resend_at.min(deadline);
                if now >= wait_until {
                    break;
                }
                let wait = wait_until.saturating_duration_since(now);
                match time::timeout(wait, probe_socket.recv_from(&mut buf)).await {
                    Err(_) => break,
                    Ok(Err(e)) => return Err(TransportError::Io(e)),
                    Ok(Ok((len, from))) => {
                        self.bytes_received
                            .fetch_add(len as u64, Ordering::Relaxed);
                        self.packets_received.fetch_add(1, Ordering::Relaxed);
                        match Frame::from_bytes(&buf[..len]) {
                            Ok(Frame::ProbeAck { token: acked }) if acked == token => {
                                debug!(%peer, %from, "probe acknowledged");
                                return Ok(local);
                            }
                            Ok(frame) => {
                                trace!(%from, frame = frame.frame_type(),
                                    "ignoring stray frame on probe socket");
                            }
                            Err(_) => {
                                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        self.window.close();
        self.shutdown.notify_one();
        // Wake any caller still waiting on a response
        self.pending.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::timeout;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle_request(&self, payload: Vec<u8>, _source: SocketAddr) -> Option<Vec<u8>> {
            Some(payload)
        }
    }

    struct Counting {
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl RequestHandler for Counting {
        async fn handle_request(&self, _payload: Vec<u8>, _source: SocketAddr) -> Option<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Some(b"ok".to_vec())
        }
    }

    struct SourceRecorder {
        seen: Arc<Mutex<Option<SocketAddr>>>,
    }

    #[async_trait]
    impl RequestHandler for SourceRecorder {
        async fn handle_request(&self, payload: Vec<u8>, source: SocketAddr) -> Option<Vec<u8>> {
            *self.seen.lock().unwrap() = Some(source);
            Some(payload)
        }
    }

    fn fast_params() -> TransportParameters {
        TransportParameters {
            send_timeout: Duration::from_millis(100),
            ack_timeout: Duration::from_millis(100),
            client_connect_timeout: Duration::from_millis(300),
            ..TransportParameters::default()
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_bind_auto_port() {
        let transport = UdpTransport::bind(loopback(), fast_params()).await.unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.is_ipv4());
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_parameters() {
        let params = TransportParameters {
            packet_size: 1000,
            data_payload_size: 2000,
            ..TransportParameters::default()
        };
        let result = UdpTransport::bind(loopback(), params).await;
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let server = UdpTransport::bind_with_handler(loopback(), fast_params(), Arc::new(Echo))
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpTransport::bind(loopback(), fast_params()).await.unwrap();
        let response = client
            .send_request(server_addr, b"hello scry", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(response, b"hello scry");
    }

    #[tokio::test]
    async fn test_handler_sees_observed_source() {
        let seen = Arc::new(Mutex::new(None));
        let handler = Arc::new(SourceRecorder { seen: seen.clone() });
        let server = UdpTransport::bind_with_handler(loopback(), fast_params(), handler)
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpTransport::bind(loopback(), fast_params()).await.unwrap();
        client
            .send_request(server_addr, b"who am i", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(client.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn test_request_times_out_without_responder() {
        // A transport with no handler silently drops requests
        let sink = UdpTransport::bind(loopback(), fast_params()).await.unwrap();
        let sink_addr = sink.local_addr().unwrap();

        let client = UdpTransport::bind(loopback(), fast_params()).await.unwrap();
        let result = client
            .send_request(sink_addr, b"anyone there", Duration::from_millis(350))
            .await;

        assert!(matches!(result, Err(TransportError::Timeout)));
        assert_eq!(client.stats().requests_timed_out, 1);
        // Retransmissions happened while waiting
        assert!(client.stats().packets_sent > 1);
    }

    #[tokio::test]
    async fn test_duplicate_request_answered_from_cache() {
        let calls = Arc::new(AtomicU64::new(0));
        let handler = Arc::new(Counting {
            calls: calls.clone(),
        });
        let server = UdpTransport::bind_with_handler(loopback(), fast_params(), handler)
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = Frame::Request {
            id: 9,
            payload: b"dup".to_vec(),
        }
        .to_bytes()
        .unwrap();

        let mut buf = vec![0u8; 1500];
        for _ in 0..2 {
            raw.send_to(&request, server_addr).await.unwrap();
            let (len, _) = timeout(Duration::from_secs(1), raw.recv_from(&mut buf))
                .await
                .expect("no response")
                .unwrap();
            let frame = Frame::from_bytes(&buf[..len]).unwrap();
            assert_eq!(
                frame,
                Frame::Response {
                    id: 9,
                    payload: b"ok".to_vec()
                }
            );
        }

        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_probe_round_trip() {
        let server = UdpTransport::bind(loopback(), fast_params()).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpTransport::bind(loopback(), fast_params()).await.unwrap();
        let fresh = client
            .probe(server_addr, Duration::from_secs(1))
            .await
            .unwrap();

        // The probe ran over its own association, not the listening socket
        assert_ne!(fresh, client.local_addr().unwrap());
        assert_eq!(fresh.ip(), client.local_addr().unwrap().ip());
        assert_ne!(fresh.port(), 0);
    }

    #[tokio::test]
    async fn test_probe_times_out_against_silent_peer() {
        // Raw socket that never acknowledges anything
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let client = UdpTransport::bind(loopback(), fast_params()).await.unwrap();
        let result = client.probe(silent_addr, Duration::from_millis(250)).await;

        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let transport = UdpTransport::bind(loopback(), fast_params()).await.unwrap();
        assert!(!transport.is_closed());

        transport.close().await.unwrap();
        assert!(transport.is_closed());

        let peer: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        let send = transport
            .send_request(peer, b"test", Duration::from_millis(100))
            .await;
        assert!(matches!(send, Err(TransportError::Closed)));

        let probe = transport.probe(peer, Duration::from_millis(100)).await;
        assert!(matches!(probe, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_stats_track_round_trip() {
        let server = UdpTransport::bind_with_handler(loopback(), fast_params(), Arc::new(Echo))
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpTransport::bind(loopback(), fast_params()).await.unwrap();
        client
            .send_request(server_addr, b"count me", Duration::from_secs(1))
            .await
            .unwrap();

        let client_stats = client.stats();
        assert!(client_stats.packets_sent >= 1);
        assert!(client_stats.packets_received >= 1);
        assert!(client_stats.bytes_sent > 0);

        let server_stats = server.stats();
        assert!(server_stats.packets_received >= 1);
        assert!(server_stats.packets_sent >= 1);
    }
}
