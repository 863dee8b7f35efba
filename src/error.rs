//! Error types for devicio-rs.
//!
//! One enum covers the queue, call, store and pool layers. Every variant is
//! classified as transient or permanent so the consumer can decide whether a
//! failed delivery is worth requeueing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to broker: {0}")]
    Connection(String),

    #[error("failed to declare queue {queue}: {reason}")]
    Declaration { queue: String, reason: String },

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to subscribe: {0}")]
    Subscription(String),

    #[error("failed to acknowledge delivery: {0}")]
    Acknowledgement(String),

    #[error("failed to decode routine payload: {0}")]
    Decode(String),

    #[error("the api is unstable")]
    Unstable,

    #[error("unknown error")]
    Unknown,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("unable to prepare the query {statement}: {reason}")]
    Preparation { statement: String, reason: String },

    #[error("statement not prepared: {0}")]
    StatementNotPrepared(String),

    #[error("encountered {failed} errors during processing of {total} jobs")]
    Aggregate { failed: u64, total: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// Whether retrying the same input can reasonably succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recoverability {
    Transient,
    Permanent,
}

impl Error {
    pub fn recoverability(&self) -> Recoverability {
        match self {
            Error::Publish(_)
            | Error::Acknowledgement(_)
            | Error::Unstable
            | Error::Unknown
            | Error::Storage(_)
            | Error::Cancelled => Recoverability::Transient,

            Error::Connection(_)
            | Error::Declaration { .. }
            | Error::Subscription(_)
            | Error::Decode(_)
            | Error::Preparation { .. }
            | Error::StatementNotPrepared(_)
            | Error::Aggregate { .. }
            | Error::Config(_)
            | Error::Other(_) => Recoverability::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.recoverability() == Recoverability::Transient
    }

    /// Short label used as a metric attribute.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Connection(_) => "connection",
            Error::Declaration { .. } => "declaration",
            Error::Publish(_) => "publish",
            Error::Subscription(_) => "subscription",
            Error::Acknowledgement(_) => "acknowledgement",
            Error::Decode(_) => "decode",
            Error::Unstable => "unstable",
            Error::Unknown => "unknown",
            Error::Storage(_) => "storage",
            Error::Preparation { .. } => "preparation",
            Error::StatementNotPrepared(_) => "statement_not_prepared",
            Error::Aggregate { .. } => "aggregate",
            Error::Cancelled => "cancelled",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
