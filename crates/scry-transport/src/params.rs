//! Timing and window parameters for the reliable-UDP layer
//!
//! All traffic-related knobs live in one explicitly constructed block that is
//! passed to the transport and to the detection orchestrator. Parameters are
//! configuration-at-rest: tuned before first use, read-only afterwards, never
//! global state.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest datagram the transport will place on the wire.
///
/// UDP over IPv4 allows 65507 payload bytes; staying below that leaves room
/// for lower layers that reserve a few bytes of the datagram for themselves.
pub const MAX_UDP_PAYLOAD: usize = 65500;

/// Errors from [`TransportParameters::validate`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParameterError {
    /// Window size is zero or exceeds the configured maximum
    #[error("window size {window} outside 1..={max}")]
    WindowSize {
        /// Configured window size
        window: u32,
        /// Configured maximum window size
        max: u32,
    },

    /// Packet size exceeds the UDP payload limit
    #[error("packet size {size} exceeds UDP payload limit {max}")]
    PacketSize {
        /// Configured packet size
        size: usize,
        /// Hard limit ([`MAX_UDP_PAYLOAD`])
        max: usize,
    },

    /// Data payload size exceeds the packet size
    #[error("data payload size {payload} exceeds packet size {packet}")]
    PayloadSize {
        /// Configured data payload size
        payload: usize,
        /// Configured packet size
        packet: usize,
    },

    /// A timeout that gates forward progress is zero
    #[error("{field} must be non-zero")]
    ZeroTimeout {
        /// Name of the offending field
        field: &'static str,
    },
}

/// Coarse link profile used to pick defaults for the timing fields.
///
/// The hint only influences [`TransportParameters::for_connection`]; once the
/// timing values are set it gates no runtime decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    /// Low-bandwidth, high-loss wireless link (most conservative profile)
    Wireless,
    /// T1 line, ~1.5 Mb/s
    T1,
    /// E1 line, ~2 Mb/s
    E1,
    /// 10 Mb/s wired Ethernet
    Ethernet10M,
    /// 100 Mb/s wired Ethernet
    Ethernet100M,
    /// Gigabit wired Ethernet (widest windows, tightest pacing)
    Ethernet1G,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Wireless => write!(f, "wireless"),
            ConnectionType::T1 => write!(f, "t1"),
            ConnectionType::E1 => write!(f, "e1"),
            ConnectionType::Ethernet10M => write!(f, "10m-ethernet"),
            ConnectionType::Ethernet100M => write!(f, "100m-ethernet"),
            ConnectionType::Ethernet1G => write!(f, "1g-ethernet"),
        }
    }
}

/// Traffic parameters for the reliable-UDP layer.
///
/// Read by the transport (retransmission, pacing, window bounds) and by the
/// detection orchestrator (timeout sizing via [`request_timeout`] and
/// [`detection_timeout`]). Construct with [`Default`], with
/// [`for_connection`], or with struct update syntax, then [`validate`] before
/// use; the bind and detect entry points validate on their own.
///
/// [`request_timeout`]: TransportParameters::request_timeout
/// [`detection_timeout`]: TransportParameters::detection_timeout
/// [`for_connection`]: TransportParameters::for_connection
/// [`validate`]: TransportParameters::validate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportParameters {
    /// Packets in flight before the sender stalls
    pub window_size: u32,

    /// Upper bound the window may grow to
    pub max_window_size: u32,

    /// Wire size of one packet, at most [`MAX_UDP_PAYLOAD`]
    pub packet_size: usize,

    /// Application payload per packet, at most `packet_size`
    pub data_payload_size: usize,

    /// How long an unacknowledged packet waits before retransmission
    pub send_timeout: Duration,

    /// How long the receiver waits on a gap before requesting a resend
    pub receive_timeout: Duration,

    /// Pacing delay between consecutive sends
    pub send_delay: Duration,

    /// Pacing delay between receive polls
    pub receive_delay: Duration,

    /// How long an acknowledgment waits before being resent
    pub ack_timeout: Duration,

    /// Fixed interval between acknowledgment packets
    pub ack_interval: Duration,

    /// Interval between throughput samples
    pub speed_sample_interval: Duration,

    /// Throughput floor in bits per second; a slower connection is closed
    pub slow_speed_threshold: u32,

    /// Timeout for establishing a fresh client association
    pub client_connect_timeout: Duration,

    /// Link profile this block was derived from
    pub connection_type: ConnectionType,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            window_size: 16,
            max_window_size: 512,
            packet_size: 1480,      // fits a standard 1500-byte MTU
            data_payload_size: 1450,
            send_timeout: Duration::from_millis(1000),
            receive_timeout: Duration::from_millis(200),
            send_delay: Duration::from_millis(1),
            receive_delay: Duration::from_millis(100),
            ack_timeout: Duration::from_millis(1000),
            ack_interval: Duration::from_millis(100),
            speed_sample_interval: Duration::from_millis(1000),
            slow_speed_threshold: 1024, // bits per second
            client_connect_timeout: Duration::from_millis(3000),
            connection_type: ConnectionType::Wireless,
        }
    }
}

impl TransportParameters {
    /// Builds a parameter block tuned for a link profile.
    ///
    /// Wireless keeps the conservative defaults; wired profiles widen the
    /// window and tighten pacing as link speed grows.
    #[must_use]
    pub fn for_connection(connection_type: ConnectionType) -> Self {
        let defaults = Self::default();
        match connection_type {
            ConnectionType::Wireless => defaults,
            ConnectionType::T1 | ConnectionType::E1 => Self {
                window_size: 32,
                connection_type,
                ..defaults
            },
            ConnectionType::Ethernet10M => Self {
                window_size: 64,
                send_delay: Duration::from_micros(500),
                connection_type,
                ..defaults
            },
            ConnectionType::Ethernet100M => Self {
                window_size: 128,
                send_delay: Duration::from_micros(100),
                receive_delay: Duration::from_millis(50),
                connection_type,
                ..defaults
            },
            ConnectionType::Ethernet1G => Self {
                window_size: 256,
                send_delay: Duration::from_micros(10),
                receive_delay: Duration::from_millis(10),
                ack_interval: Duration::from_millis(50),
                connection_type,
                ..defaults
            },
        }
    }

    /// Checks the documented bounds.
    ///
    /// # Errors
    ///
    /// Returns a [`ParameterError`] naming the first violated bound:
    /// `1 <= window_size <= max_window_size`,
    /// `data_payload_size <= packet_size <= MAX_UDP_PAYLOAD`, and the
    /// progress-gating timeouts must be non-zero.
    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.window_size == 0 || self.window_size > self.max_window_size {
            return Err(ParameterError::WindowSize {
                window: self.window_size,
                max: self.max_window_size,
            });
        }
        if self.packet_size > MAX_UDP_PAYLOAD {
            return Err(ParameterError::PacketSize {
                size: self.packet_size,
                max: MAX_UDP_PAYLOAD,
            });
        }
        if self.data_payload_size > self.packet_size {
            return Err(ParameterError::PayloadSize {
                payload: self.data_payload_size,
                packet: self.packet_size,
            });
        }
        for (field, value) in [
            ("send_timeout", self.send_timeout),
            ("receive_timeout", self.receive_timeout),
            ("ack_timeout", self.ack_timeout),
            ("client_connect_timeout", self.client_connect_timeout),
        ] {
            if value.is_zero() {
                return Err(ParameterError::ZeroTimeout { field });
            }
        }
        Ok(())
    }

    /// Expected upper bound for one reliable request/response round trip.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.send_timeout + self.ack_timeout
    }

    /// Wait bound for a classification answer that may cross one relay hop.
    ///
    /// Two round trips: origin to rendezvous, rendezvous to proxy. A
    /// legitimate relayed response arriving inside this bound must not be
    /// mistaken for non-responsiveness.
    #[must_use]
    pub fn detection_timeout(&self) -> Duration {
        self.request_timeout() * 2
    }
}
