//! # busraft-core
//!
//! why: replicate dynamic node-ID allocations across a small embedded bus with
//! Raft, so a committed allocation is never lost or handed out twice
//! relations: persists through busraft-storage, drives an external bus
//! transport and allocator via the drained action queue
//! what: bounded allocation log, persistent state, cluster membership, RPC
//! facade, three-role tick-driven state machine, log traversal API

pub mod cluster;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod persistent;
pub mod rpc;
pub mod trace;

pub use cluster::{ClusterManager, CLUSTER_SIZE_UNKNOWN, MAX_CLUSTER_SIZE};
pub use error::RaftError;
pub use log::{Entry, Log, LOG_CAPACITY};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    MAX_ENTRIES_PER_REQUEST,
};
pub use node::{LogEntryInfo, NodeState, RaftConfig, RaftNode};
pub use persistent::PersistentState;
pub use rpc::Action;
pub use trace::{NullTracer, TraceEvent, Tracer};

/// Election epoch. At most one leader may be elected per term.
pub type Term = u32;

/// Position in the replicated log. Index 0 holds the sentinel entry.
pub type LogIndex = u32;

/// Bus node identifier. Unicast IDs occupy 1..=127; 0 means "unset".
pub type NodeId = u8;

/// 128-bit hardware unique ID carried by every allocation record.
pub type UniqueId = [u8; 16];

/// Highest valid unicast node ID on the bus.
pub const MAX_NODE_ID: NodeId = 127;
