//! Duplex channel contract and its WebSocket implementation.
use std::fmt;
use std::time::Duration;

use parley_protocol::{ClientMessage, Inbound};

mod ws;

pub use ws::{TransportConfig, TransportEvents, TransportHandle, TransportWorker, WsTransport};

/// Lifecycle of the one logical link to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; only reached through explicit teardown.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

/// Identity of one successful handshake.
///
/// Bumped on every connect so anything issued against an older link can be detected as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionGeneration(pub u64);

impl ConnectionGeneration {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ConnectionGeneration {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Bounded retry budget with exponential delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectAttempt {
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
}

/// Everything the transport reports to its owner, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged {
        state: ConnectionState,
        generation: ConnectionGeneration,
    },
    ReconnectScheduled(ReconnectAttempt),
    /// Retry budget exhausted; the link stays down until an explicit reconnect.
    GaveUp { attempts: u32 },
    Frame(Inbound),
}

/// Narrow send-side view of the channel the engine holds.
pub trait Channel {
    /// Returns `false` synchronously unless the link is connected at `generation`; nothing is
    /// queued for later.
    fn send(&self, generation: ConnectionGeneration, message: &ClientMessage) -> bool;

    /// Restarts the connect loop after the retry budget ran out.
    fn reconnect(&self);

    /// Explicit teardown into `Closed`.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_until_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };

        let delays = (1..=6)
            .map(|attempt| policy.delay_for(attempt))
            .collect::<Vec<_>>();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
        assert!(policy.allows(6));
        assert!(!policy.allows(7));
    }
}
