//! Error types for queue management operations.
//!
//! Publishing and dispatch never surface errors to the storage engine; these
//! are returned only by the management surface (subscriptions, members,
//! configuration and queue images).

use crate::subscriptions::SubscriptionId;
use crate::types::{ClientId, MemberId};
use thiserror::Error;

/// Main error type for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subscription not found: {0:?}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Client not registered: {0}")]
    ClientNotFound(ClientId),

    #[error("Client already registered: {0}")]
    ClientExists(ClientId),

    #[error("Member not found: {0}")]
    MemberNotFound(MemberId),

    #[error("Member already exists: {0}")]
    MemberExists(MemberId),

    #[error("No live member hosts subscription {0:?}")]
    NoLiveMember(SubscriptionId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid interest pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Deserialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for QueueError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for QueueError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        QueueError::Deserialization(e.to_string())
    }
}

impl From<regex::Error> for QueueError {
    fn from(e: regex::Error) -> Self {
        QueueError::InvalidPattern(e.to_string())
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
