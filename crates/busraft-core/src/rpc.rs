//! # rpc
//!
//! why: adapt the bus transport's call/response machinery to the engine's
//! synchronous tick so stale responses can never reach a reducer
//! relations: node.rs issues calls through the two clients and emits Action
//! values for the driver to drain
//! what: Action queue items, AppendEntriesClient, RequestVoteClient

use crate::cluster::MAX_CLUSTER_SIZE;
use crate::log::Entry;
use crate::message::{AppendEntriesRequest, RequestVoteRequest};
use crate::NodeId;

/// Work the engine hands to its driver after each turn.
///
/// Send variants go out on the bus; the notify variants go to the allocator,
/// which may call back into `append_log` or `force_active_mode` once the
/// queue is drained.
#[derive(Debug, Clone)]
pub enum Action {
    SendAppendEntries {
        to: NodeId,
        request: AppendEntriesRequest,
    },
    SendRequestVote {
        to: NodeId,
        request: RequestVoteRequest,
    },
    /// the local server entered or left leadership
    LeadershipChange { is_leader: bool },
    /// a new entry was committed while this server leads; the allocation is
    /// complete at this point
    Committed { entry: Entry },
}

/// Client endpoint for AppendEntries: at most one call in flight.
///
/// Neither client keeps a timer. Every role transition and every leader tick
/// cancels outstanding calls before issuing new ones, so a response that
/// outlived its call is dropped by `complete` instead of timing out.
#[derive(Debug, Default)]
pub(crate) struct AppendEntriesClient {
    pending: Option<NodeId>,
}

impl AppendEntriesClient {
    /// issue a call; refused while another call is outstanding
    pub(crate) fn call(
        &mut self,
        to: NodeId,
        request: AppendEntriesRequest,
        actions: &mut Vec<Action>,
    ) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(to);
        actions.push(Action::SendAppendEntries { to, request });
        true
    }

    pub(crate) fn has_pending_calls(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn cancel_all_calls(&mut self) {
        self.pending = None;
    }

    /// mark the call to `from` answered; false means the response is stale
    /// (cancelled, duplicate, or never issued) and must be ignored
    pub(crate) fn complete(&mut self, from: NodeId) -> bool {
        if self.pending == Some(from) {
            self.pending = None;
            true
        } else {
            false
        }
    }
}

/// Client endpoint for RequestVote: one concurrent call per remote server.
#[derive(Debug, Default)]
pub(crate) struct RequestVoteClient {
    pending: Vec<NodeId>,
}

impl RequestVoteClient {
    pub(crate) fn call(
        &mut self,
        to: NodeId,
        request: RequestVoteRequest,
        actions: &mut Vec<Action>,
    ) -> bool {
        if self.pending.len() >= (MAX_CLUSTER_SIZE - 1) as usize || self.pending.contains(&to) {
            return false;
        }
        self.pending.push(to);
        actions.push(Action::SendRequestVote { to, request });
        true
    }

    pub(crate) fn has_pending_calls(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn cancel_all_calls(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn complete(&mut self, from: NodeId) -> bool {
        match self.pending.iter().position(|id| *id == from) {
            Some(position) => {
                self.pending.swap_remove(position);
                true
            }
            None => false,
        }
    }
}
