//! Error types returned by the broker and the identity check.
//!
//! Lossy delivery outcomes (unknown recipient, full or closed subscriber
//! channel) are deliberately absent: they are counted in
//! [`BrokerStats`](crate::broker::BrokerStats), never reported to producers.

use thiserror::Error;

/// Errors produced by [`Broker`](crate::broker::Broker) operations.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The cancellation signal fired before the message was accepted.
    ///
    /// Terminal for the broker instance: every later send fails the same way.
    #[error("broker closed")]
    Closed,

    /// The dispatch loop has already been started on this broker.
    #[error("broker dispatch loop already started")]
    AlreadyStarted,

    /// `claim_user` found the identity already registered.
    #[error("identity '{id}' is already registered")]
    IdentityTaken { id: String },
}

impl BrokerError {
    /// Short stable label for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::Closed => "broker_closed",
            BrokerError::AlreadyStarted => "broker_already_started",
            BrokerError::IdentityTaken { .. } => "broker_identity_taken",
        }
    }
}

/// Reasons an identity string is rejected before it reaches the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity cannot be empty")]
    Empty,

    #[error("identity is longer than {max} characters")]
    TooLong { max: usize },

    #[error("identity cannot contain whitespace or control characters")]
    InvalidCharacter,

    #[error("identity '{0}' is reserved")]
    Reserved(String),
}
