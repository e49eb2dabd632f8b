//! Single-process chat message broker.
//!
//! Producers push [`message::Message`] values into one bounded queue; a single
//! dispatcher fans each message out to the outbound channel of its recipient,
//! or to every registered subscriber for broadcasts. Delivery is best effort:
//! a full subscriber channel loses the message rather than stalling everyone
//! else. Modules:
//!
//! - [`broker`] owns the inbound queue, dispatch loop and lifecycle.
//! - [`registry`] maps identities to outbound channels.
//! - [`config`] and [`error`] hold capacities and error types.
//! - [`identity`] checks identities before they reach the broker.
//! - [`message`] defines the message value plus the JSON line protocol.
//! - [`server`] and [`client`] are a TCP session layer and terminal client
//!   built on the broker's public API; [`cli`] parses their arguments.

pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod message;
pub mod registry;
pub mod server;

pub use broker::{Broker, BrokerStats, LifecycleState};
pub use error::BrokerError;
pub use message::Message;
