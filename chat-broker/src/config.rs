//! Capacity settings for the broker and the session layer.

/// Inbound queue capacity used when none is configured.
pub const DEFAULT_INBOUND_CAPACITY: usize = 100;

/// Per-session outbox capacity used when none is configured.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 32;

/// Settings for a [`Broker`](crate::broker::Broker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Number of messages the inbound queue holds before `send_message`
    /// starts applying backpressure.
    pub inbound_capacity: usize,
}

impl BrokerConfig {
    /// Builds a config with the given inbound capacity, raised to at least 1.
    pub fn with_inbound_capacity(capacity: usize) -> Self {
        Self {
            inbound_capacity: capacity.max(1),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

/// Settings for connections accepted by [`Server`](crate::server::Server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Capacity of the outbound channel each session registers.
    /// A session that falls this far behind starts losing messages.
    pub outbox_capacity: usize,
}

impl SessionConfig {
    pub fn with_outbox_capacity(capacity: usize) -> Self {
        Self {
            outbox_capacity: capacity.max(1),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}
