//! # error
//!
//! why: give every engine failure a typed, matchable shape
//! relations: wraps busraft-storage errors, returned by all fallible operations
//! what: RaftError enum and the crate-wide Result alias

use busraft_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the consensus engine.
#[derive(Debug, Error)]
pub enum RaftError {
    /// the storage backend refused a read or write
    #[error("storage backend: {0}")]
    Storage(#[from] StorageError),

    /// the bounded log has no room for another allocation
    #[error("log is at capacity")]
    LogFull,

    /// an appended entry carried a term older than the last log entry
    #[error("entry term precedes the last log entry")]
    TermRegression,

    /// restored or in-flight persistent state violates a structural invariant
    #[error("persistent state integrity violation: {0}")]
    Integrity(&'static str),

    /// cluster size outside the supported set of odd sizes
    #[error("invalid cluster size {0}")]
    InvalidClusterSize(u8),

    /// no cluster size configured and none found in storage
    #[error("cluster size is not configured")]
    ClusterSizeUnknown,

    /// a node ID outside the unicast range was supplied at init
    #[error("invalid node id {0}")]
    InvalidNodeId(u8),
}

pub(crate) type Result<T> = std::result::Result<T, RaftError>;
