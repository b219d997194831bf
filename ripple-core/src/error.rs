//! Error Types
//!
//! Every fallible operation in the crate reports a [`Error`]. The type is
//! `Clone` because a failed derivation caches its error as the node's result
//! and hands the same error to every caller until new input arrives.

use std::fmt;
use std::sync::Arc;

use crate::graph::NodeId;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStatus {
    /// Writes may still be staged.
    Open,
    /// Writes were applied and dependents invalidated.
    Committed,
    /// Writes were dropped without being applied.
    Discarded,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxStatus::Open => f.write_str("open"),
            TxStatus::Committed => f.write_str("committed"),
            TxStatus::Discarded => f.write_str("discarded"),
        }
    }
}

/// Errors produced by the runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A write was attempted with no transaction open on the calling thread.
    #[error("no transaction is open on the current thread")]
    NoTransaction,

    /// The transaction was already committed or discarded.
    #[error("transaction is already {0}")]
    TransactionClosed(TxStatus),

    /// A derivation tried to commit or to change declared edges.
    #[error("cannot commit or reshape the graph from inside a derivation")]
    CommitInsideDerivation,

    /// A node was used with a transaction or graph of another runtime.
    #[error("node belongs to a different runtime")]
    ForeignRuntime,

    /// A positional list operation addressed a missing element.
    #[error("index {index} is out of bounds for a list of length {len}")]
    IndexOutOfBounds {
        /// The requested position.
        index: usize,
        /// The length of the list at that point of the transaction.
        len: usize,
    },

    /// Adding the edge would make the graph cyclic.
    #[error("edge {producer} -> {consumer} would create a dependency cycle")]
    Cycle {
        /// The node that would read `producer`.
        consumer: NodeId,
        /// The node that would be read.
        producer: NodeId,
    },

    /// A derivation function reported a failure.
    #[error("derivation failed: {0}")]
    Derivation(Arc<dyn std::error::Error + Send + Sync>),

    /// A derivation function panicked.
    #[error("derivation panicked: {0}")]
    Panicked(String),

    /// The runtime configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wrap a user error raised inside a derivation.
    pub fn derivation<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Derivation(Arc::new(error))
    }

    /// Build a derivation failure from a plain message.
    pub fn message(msg: impl Into<String>) -> Self {
        Error::Derivation(Arc::new(Message(msg.into())))
    }

    /// Returns true for protocol misuse at a call site.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::NoTransaction
                | Error::TransactionClosed(_)
                | Error::CommitInsideDerivation
                | Error::ForeignRuntime
                | Error::IndexOutOfBounds { .. }
        )
    }

    /// Turn a caught panic payload into an error.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Error::Panicked(msg)
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
