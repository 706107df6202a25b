//! # message
//!
//! why: define the two consensus RPCs exchanged between cluster servers
//! relations: built and consumed by node.rs, carried to the bus by whatever
//! transport drains the action queue
//! what: AppendEntries and RequestVote request/response structs

use serde::{Deserialize, Serialize};

use crate::log::Entry;
use crate::{LogIndex, Term};

/// Max entries carried by one AppendEntries request; a catch-up spanning
/// more than this takes several round-robin visits.
pub const MAX_ENTRIES_PER_REQUEST: usize = 4;

/// Replicate log entries (serves as heartbeat when `entries` is empty).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
}

/// Ask for a vote during leader election.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}
