use super::types::UserId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Pool '{pool}' exhausted: no connection available within {waited:?}")]
    PoolExhausted { pool: String, waited: Duration },

    #[error("Pool '{0}' is closed")]
    PoolClosed(String),

    #[error("Pool '{0}' is not configured")]
    UnknownPool(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Data access error: {0}")]
    DataAccess(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Broker error: {0}")]
    BrokerError(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Feed unavailable for user {user_id}: {reason}")]
    FeedUnavailable { user_id: UserId, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl FeedError {
    pub fn feed_unavailable(user_id: UserId, reason: impl Into<String>) -> Self {
        Self::FeedUnavailable {
            user_id,
            reason: reason.into(),
        }
    }

    /// Errors caused by losing the broker rather than by the message itself.
    pub fn is_broker_unavailable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::CodecError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::CodecError(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FeedError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::CodecError(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for FeedError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::ExecutionError(err.to_string())
    }
}
