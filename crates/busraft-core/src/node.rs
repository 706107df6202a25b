//! # node
//!
//! why: drive the three-role consensus state machine that decides which
//! server may hand out node IDs and when an allocation is final
//! relations: owns persistent.rs and cluster.rs, uses rpc.rs for outbound
//! calls, message.rs for the wire types
//! what: NodeState enum, RaftConfig, RaftNode with tick/handlers/reducers,
//! append and traversal APIs

use std::time::{Duration, Instant};

use busraft_storage::Storage;
use tracing::{debug, warn};

use crate::cluster::{ClusterManager, CLUSTER_SIZE_UNKNOWN, MAX_CLUSTER_SIZE};
use crate::error::{RaftError, Result};
use crate::log::Entry;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    MAX_ENTRIES_PER_REQUEST,
};
use crate::persistent::PersistentState;
use crate::rpc::{Action, AppendEntriesClient, RequestVoteClient};
use crate::trace::{TraceEvent, Tracer};
use crate::{LogIndex, NodeId, Term, UniqueId, MAX_NODE_ID};

/// the three possible roles a server can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// listens for leader traffic, votes when asked
    Follower,
    /// transitional role while a campaign is in flight
    Candidate,
    /// replicates the log and advances the commit index
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// timing and bootstrap configuration
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// tick period, outbound request timeout, heartbeat spacing; one value
    pub update_interval: Duration,
    /// base of the per-node-staggered activity timeout
    pub base_activity_timeout: Duration,
    /// cluster size hint; `CLUSTER_SIZE_UNKNOWN` defers to storage
    pub cluster_size: u8,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_millis(100),
            base_activity_timeout: Duration::from_millis(400),
            cluster_size: CLUSTER_SIZE_UNKNOWN,
        }
    }
}

/// fields of the one AppendEntries call that may be in flight, kept so the
/// response reducer knows what the call carried
#[derive(Debug, Clone, Copy, Default)]
struct PendingAppendEntries {
    prev_log_index: LogIndex,
    num_entries: LogIndex,
}

/// one visited entry during a log traversal
#[derive(Debug, Clone)]
pub struct LogEntryInfo {
    pub entry: Entry,
    pub committed: bool,
}

/// The consensus engine for one server.
///
/// Everything runs synchronously on the caller's task: the periodic
/// [`tick`](RaftNode::tick), the inbound request handlers and the response
/// reducers all complete without suspension, and all time is caller-supplied
/// so behavior is deterministic under test. Outbound work accumulates as
/// [`Action`] values and is collected with
/// [`take_actions`](RaftNode::take_actions) after each turn.
pub struct RaftNode<S> {
    own_node_id: NodeId,
    update_interval: Duration,
    base_activity_timeout: Duration,
    tracer: Box<dyn Tracer>,

    persistent: PersistentState<S>,
    cluster: ClusterManager,
    commit_index: LogIndex,

    last_activity_timestamp: Instant,
    active_mode: bool,
    state: NodeState,

    /// round-robin cursor over the known servers, leader only
    next_server_index: u8,
    votes_received_in_campaign: u8,
    pending_append: PendingAppendEntries,

    append_entries_client: AppendEntriesClient,
    request_vote_client: RequestVoteClient,
    actions: Vec<Action>,
}

impl<S: Storage> RaftNode<S> {
    /// restore or initialize the engine; `now` seeds the activity timestamp
    pub fn new(
        own_node_id: NodeId,
        storage: S,
        tracer: Box<dyn Tracer>,
        config: RaftConfig,
        now: Instant,
    ) -> Result<Self> {
        if own_node_id == 0 || own_node_id > MAX_NODE_ID {
            return Err(RaftError::InvalidNodeId(own_node_id));
        }

        let mut node = Self {
            own_node_id,
            update_interval: config.update_interval,
            base_activity_timeout: config.base_activity_timeout,
            tracer,
            persistent: PersistentState::new(storage),
            cluster: ClusterManager::new(own_node_id),
            commit_index: 0,
            last_activity_timestamp: now,
            active_mode: true,
            state: NodeState::Follower,
            next_server_index: 0,
            votes_received_in_campaign: 0,
            pending_append: PendingAppendEntries::default(),
            append_entries_client: AppendEntriesClient::default(),
            request_vote_client: RequestVoteClient::default(),
            actions: Vec::new(),
        };

        node.persistent.init()?;
        let hint = config.cluster_size;
        node.cluster.init(hint, node.persistent.storage_mut())?;

        node.trace(TraceEvent::CoreInitialized, config.update_interval.as_millis() as i64);
        Ok(node)
    }

    // -- periodic update --

    /// one periodic update; call every `update_interval`
    pub fn tick(&mut self, now: Instant) {
        if self.cluster.had_discovery_activity() && self.is_leader() {
            self.set_active_mode(true);
        }

        match self.state {
            NodeState::Follower => self.update_follower(now),
            NodeState::Candidate => self.update_candidate(now),
            NodeState::Leader => self.update_leader(now),
        }
    }

    fn update_follower(&mut self, now: Instant) {
        if self.active_mode && self.is_activity_timed_out(now) {
            self.switch_state(NodeState::Candidate);
            self.register_activity(now);
        }
    }

    fn update_candidate(&mut self, now: Instant) {
        debug_assert!(self.active_mode);

        if self.votes_received_in_campaign > 0 {
            // the campaign armed on the previous tick; tally and move on
            self.trace(TraceEvent::ElectionComplete, i64::from(self.votes_received_in_campaign));
            let won = self.votes_received_in_campaign >= self.cluster.quorum_size();
            debug!(won, votes = self.votes_received_in_campaign, "election complete");
            self.switch_state(if won { NodeState::Leader } else { NodeState::Follower });
            return;
        }

        if let Err(err) = self.persistent.set_voted_for(self.own_node_id) {
            self.handle_persistent_state_update_error(&err, now);
            return;
        }
        let next_term = self.persistent.current_term() + 1;
        if let Err(err) = self.persistent.set_current_term(next_term) {
            self.handle_persistent_state_update_error(&err, now);
            return;
        }

        self.votes_received_in_campaign = 1; // own vote

        let request = RequestVoteRequest {
            term: self.persistent.current_term(),
            last_log_index: self.persistent.log().last_index(),
            last_log_term: self.persistent.log().last_entry().term,
        };

        for ordinal in 0..(MAX_CLUSTER_SIZE - 1) {
            let Some(node_id) = self.cluster.get_remote_server_node_id_at_index(ordinal) else {
                break;
            };
            debug!(peer = node_id, term = request.term, "requesting vote");
            self.trace(TraceEvent::VoteRequestInitiated, i64::from(node_id));
            if !self.request_vote_client.call(node_id, request, &mut self.actions) {
                self.trace(TraceEvent::Error, i64::from(node_id));
            }
        }
    }

    fn update_leader(&mut self, now: Instant) {
        if self.cluster.cluster_size() == 1 {
            self.set_active_mode(false); // nobody to replicate to
        }

        if self.append_entries_client.has_pending_calls() {
            // an unanswered call from the previous tick counts as a miss;
            // dropping it here keeps stale responses away from the reducer
            self.append_entries_client.cancel_all_calls();
        }

        // `next_server_index > 0` lets a round-robin sweep that already
        // started finish even after the engine went passive
        if self.active_mode || self.next_server_index > 0 {
            let peer = self.cluster.get_remote_server_node_id_at_index(self.next_server_index);
            debug_assert!(peer.is_some());
            if let Some(node_id) = peer {
                self.next_server_index += 1;
                if self.next_server_index >= self.cluster.num_known_servers() {
                    self.next_server_index = 0;
                }

                let prev_log_index = self.cluster.get_server_next_index(node_id) - 1;
                let Some(prev_log_term) = self.persistent.log().get(prev_log_index).map(|e| e.term)
                else {
                    self.handle_persistent_state_update_error(
                        &RaftError::Integrity("next index points past the log"),
                        now,
                    );
                    return;
                };

                let mut entries = Vec::new();
                let mut index = self.cluster.get_server_next_index(node_id);
                while let Some(entry) = self.persistent.log().get(index) {
                    entries.push(*entry);
                    if entries.len() == MAX_ENTRIES_PER_REQUEST {
                        break;
                    }
                    index += 1;
                }

                self.pending_append = PendingAppendEntries {
                    prev_log_index,
                    num_entries: entries.len() as LogIndex,
                };

                let request = AppendEntriesRequest {
                    term: self.persistent.current_term(),
                    prev_log_index,
                    prev_log_term,
                    leader_commit: self.commit_index,
                    entries,
                };
                if !self.append_entries_client.call(node_id, request, &mut self.actions) {
                    self.trace(TraceEvent::AppendEntriesCallFailure, i64::from(node_id));
                }
            }
        }

        self.propagate_commit_index();
    }

    /// decide whether the commit index can advance, or whether everything is
    /// replicated and the engine may stop heartbeating
    fn propagate_commit_index(&mut self) {
        debug_assert!(self.state == NodeState::Leader);
        debug_assert!(self.commit_index <= self.persistent.log().last_index());

        if self.commit_index == self.persistent.log().last_index() {
            // every local entry is committed; passive is safe once each
            // server's match index sits at the commit index, its next index
            // is past it, and the full cluster is known
            let mut all_done = self.cluster.is_cluster_discovered();
            for ordinal in 0..self.cluster.num_known_servers() {
                let Some(node_id) = self.cluster.get_remote_server_node_id_at_index(ordinal) else {
                    break;
                };
                if self.cluster.get_server_match_index(node_id) != self.commit_index
                    || self.cluster.get_server_next_index(node_id) <= self.commit_index
                {
                    all_done = false;
                    break;
                }
            }
            self.set_active_mode(!all_done);
        } else {
            // uncommitted local entries remain
            self.set_active_mode(true);

            let mut num_nodes_with_next_entry: u8 = 1; // the local server
            for ordinal in 0..self.cluster.num_known_servers() {
                let Some(node_id) = self.cluster.get_remote_server_node_id_at_index(ordinal) else {
                    break;
                };
                if self.cluster.get_server_match_index(node_id) > self.commit_index {
                    num_nodes_with_next_entry += 1;
                }
            }

            // advance one index per tick at most
            if num_nodes_with_next_entry >= self.cluster.quorum_size() {
                self.commit_index += 1;
                self.trace(TraceEvent::NewEntryCommitted, i64::from(self.commit_index));

                let committed = self.persistent.log().get(self.commit_index).copied();
                debug_assert!(committed.is_some());
                if let Some(entry) = committed {
                    // the allocation is final here
                    self.actions.push(Action::Committed { entry });
                }
            }
        }
    }

    // -- role and mode transitions --

    fn switch_state(&mut self, new_state: NodeState) {
        if self.state == new_state {
            return;
        }

        debug!(from = ?self.state, to = ?new_state, "state switch");
        self.trace(TraceEvent::StateSwitch, new_state as i64);

        let old_state = self.state;
        self.state = new_state;

        self.cluster.reset_all_server_indices(self.persistent.log().last_index());
        self.next_server_index = 0;
        self.votes_received_in_campaign = 0;

        self.request_vote_client.cancel_all_calls();
        self.append_entries_client.cancel_all_calls();

        if old_state == NodeState::Leader || new_state == NodeState::Leader {
            self.actions.push(Action::LeadershipChange {
                is_leader: new_state == NodeState::Leader,
            });
        }
    }

    fn set_active_mode(&mut self, new_active: bool) {
        if self.active_mode != new_active {
            debug!(from = self.active_mode, to = new_active, "active mode switch");
            self.trace(TraceEvent::ActiveSwitch, i64::from(new_active));
            self.active_mode = new_active;
        }
    }

    /// storage refused a write: fall back to passive follower and defer the
    /// next election so the medium has time to recover
    fn handle_persistent_state_update_error(&mut self, err: &RaftError, now: Instant) {
        warn!(%err, "persistent state update failed, stepping down");
        self.trace(TraceEvent::PersistStateUpdateError, 0);
        self.switch_state(NodeState::Follower);
        self.set_active_mode(false);
        self.register_activity(now);
    }

    /// a response revealed a newer term; adopt it and yield
    fn try_adopt_term_from_response(&mut self, new_term: Term, now: Instant) {
        self.trace(TraceEvent::NewerTermInResponse, i64::from(new_term));
        if let Err(err) = self.persistent.set_current_term(new_term) {
            warn!(%err, "failed to persist newer term from response");
            self.trace(TraceEvent::PersistStateUpdateError, 0);
        }
        self.register_activity(now);
        self.switch_state(NodeState::Follower);
        self.set_active_mode(false);
    }

    // -- activity tracking --

    fn register_activity(&mut self, now: Instant) {
        self.last_activity_timestamp = now;
    }

    fn activity_timeout(&self) -> Duration {
        // lower node IDs time out first, so simultaneous elections cannot
        // recur indefinitely
        self.base_activity_timeout + self.update_interval * u32::from(self.own_node_id - 1)
    }

    fn is_activity_timed_out(&self, now: Instant) -> bool {
        now > self.last_activity_timestamp + self.activity_timeout()
    }

    // -- inbound request handlers --

    /// handle an AppendEntries request; `None` means "do not reply"
    pub fn handle_append_entries_request(
        &mut self,
        from: NodeId,
        request: &AppendEntriesRequest,
        now: Instant,
    ) -> Option<AppendEntriesResponse> {
        if !self.cluster.is_known_server(from) {
            self.trace(TraceEvent::RequestIgnored, i64::from(from));
            return None;
        }

        if request.term > self.persistent.current_term() {
            if let Err(err) = self.persistent.set_current_term(request.term) {
                self.handle_persistent_state_update_error(&err, now);
                return None;
            }
            if let Err(err) = self.persistent.reset_voted_for() {
                self.handle_persistent_state_update_error(&err, now);
                return None;
            }
        }

        let mut response = AppendEntriesResponse {
            term: self.persistent.current_term(),
            success: false,
        };

        if request.term < self.persistent.current_term() {
            return Some(response);
        }

        self.register_activity(now);
        self.switch_state(NodeState::Follower);
        self.set_active_mode(false);

        // the assumed predecessor must exist locally
        let Some(prev_term) = self.persistent.log().get(request.prev_log_index).map(|e| e.term)
        else {
            return Some(response);
        };

        // conflicting predecessor: roll the log back and let the leader retry
        // one index earlier; a failed rollback gets no reply at all
        if prev_term != request.prev_log_term {
            match self
                .persistent
                .remove_log_entries_where_index_greater_or_equal(request.prev_log_index)
            {
                Ok(()) => return Some(response),
                Err(err) => {
                    warn!(%err, "log rollback failed");
                    self.trace(TraceEvent::PersistStateUpdateError, 0);
                    return None;
                }
            }
        }

        if request.prev_log_index != self.persistent.log().last_index() {
            if let Err(err) = self
                .persistent
                .remove_log_entries_where_index_greater(request.prev_log_index)
            {
                warn!(%err, "log truncation failed");
                self.trace(TraceEvent::PersistStateUpdateError, 0);
                return None;
            }
        }

        for entry in &request.entries {
            if let Err(err) = self.persistent.append_to_log(*entry) {
                // no reply; the leader will treat us as dead and retry
                warn!(%err, "log append failed");
                self.trace(TraceEvent::PersistStateUpdateError, 0);
                return None;
            }
        }

        if request.leader_commit > self.commit_index {
            self.commit_index = request.leader_commit.min(self.persistent.log().last_index());
            self.trace(TraceEvent::CommitIndexUpdate, i64::from(self.commit_index));
        }

        response.success = true;
        Some(response)
    }

    /// handle a RequestVote request; `None` means "do not reply"
    pub fn handle_request_vote_request(
        &mut self,
        from: NodeId,
        request: &RequestVoteRequest,
        now: Instant,
    ) -> Option<RequestVoteResponse> {
        self.trace(TraceEvent::VoteRequestReceived, i64::from(from));

        if !self.cluster.is_known_server(from) {
            self.trace(TraceEvent::RequestIgnored, i64::from(from));
            return None;
        }

        self.set_active_mode(true);

        if request.term > self.persistent.current_term() {
            self.switch_state(NodeState::Follower); // our term is stale, we cannot lead

            if let Err(err) = self.persistent.set_current_term(request.term) {
                self.handle_persistent_state_update_error(&err, now);
                return None;
            }
            if let Err(err) = self.persistent.reset_voted_for() {
                self.handle_persistent_state_update_error(&err, now);
                return None;
            }
        }

        let term = self.persistent.current_term();

        if request.term < term {
            return Some(RequestVoteResponse {
                term,
                vote_granted: false,
            });
        }

        let can_vote =
            self.persistent.voted_for().is_none() || self.persistent.voted_for() == Some(from);
        let log_is_up_to_date = self
            .persistent
            .log()
            .is_other_log_up_to_date(request.last_log_index, request.last_log_term);
        let vote_granted = can_vote && log_is_up_to_date;

        if vote_granted {
            self.switch_state(NodeState::Follower); // avoids racing our own campaign
            self.register_activity(now); // keeps elections from piling up

            if let Err(err) = self.persistent.set_voted_for(from) {
                warn!(%err, "failed to persist vote");
                self.trace(TraceEvent::PersistStateUpdateError, 0);
                return None;
            }
        }

        Some(RequestVoteResponse { term, vote_granted })
    }

    // -- response reducers --

    /// reduce an AppendEntries response into the replication indices
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        response: &AppendEntriesResponse,
        now: Instant,
    ) {
        if !self.append_entries_client.complete(from) {
            // the call was cancelled by a tick or a role switch
            return;
        }
        debug_assert!(self.state == NodeState::Leader);

        if response.term > self.persistent.current_term() {
            self.try_adopt_term_from_response(response.term, now);
        } else if response.success {
            self.cluster
                .increment_server_next_index_by(from, self.pending_append.num_entries);
            self.cluster.set_server_match_index(
                from,
                self.pending_append.prev_log_index + self.pending_append.num_entries,
            );
        } else {
            self.cluster.decrement_server_next_index(from);
            self.trace(TraceEvent::AppendEntriesRespUnsuccessful, i64::from(from));
        }

        self.pending_append = PendingAppendEntries::default();
        // the next tick picks up from the refreshed indices
    }

    /// reduce a RequestVote response into the campaign tally
    pub fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        response: &RequestVoteResponse,
        now: Instant,
    ) {
        if !self.request_vote_client.complete(from) {
            return;
        }
        debug_assert!(self.state == NodeState::Candidate);

        self.trace(TraceEvent::VoteRequestSucceeded, i64::from(from));

        if response.term > self.persistent.current_term() {
            self.try_adopt_term_from_response(response.term, now);
        } else if response.vote_granted {
            self.votes_received_in_campaign += 1;
        }
        // the tally happens on the next candidate tick
    }

    // -- allocator-facing API --

    /// append one allocation record; only the leader may call this
    pub fn append_log(&mut self, unique_id: UniqueId, node_id: NodeId, now: Instant) {
        assert!(self.is_leader(), "append_log requires leadership");

        let entry = Entry {
            term: self.persistent.current_term(),
            node_id,
            unique_id,
        };
        self.trace(TraceEvent::NewLogEntry, i64::from(node_id));
        if let Err(err) = self.persistent.append_to_log(entry) {
            self.handle_persistent_state_update_error(&err, now);
        }
    }

    /// signal allocation activity on the bus; wakes a passive engine
    pub fn force_active_mode(&mut self) {
        self.set_active_mode(true);
    }

    /// feed one observed discovery announcement into the membership table
    pub fn handle_discovery(&mut self, node_id: NodeId) {
        let log_last_index = self.persistent.log().last_index();
        self.cluster.add_remote_server(node_id, log_last_index);
    }

    /// walk the log from the newest entry towards the sentinel, returning the
    /// first entry the predicate accepts together with its committed flag
    pub fn traverse_log_from_end_until<F>(&self, mut predicate: F) -> Option<LogEntryInfo>
    where
        F: FnMut(&LogEntryInfo) -> bool,
    {
        for (index, entry) in self.persistent.log().entries().iter().enumerate().rev() {
            let info = LogEntryInfo {
                entry: *entry,
                committed: index as LogIndex <= self.commit_index,
            };
            if predicate(&info) {
                return Some(info);
            }
        }
        None
    }

    // -- accessors --

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// whether the log has been replicated since the last allocation
    pub fn are_all_log_entries_committed(&self) -> bool {
        self.commit_index == self.persistent.log().last_index()
    }

    pub fn is_in_active_mode(&self) -> bool {
        self.active_mode
    }

    pub fn last_activity_timestamp(&self) -> Instant {
        self.last_activity_timestamp
    }

    /// allocations recorded so far; the sentinel does not count
    pub fn num_allocations(&self) -> LogIndex {
        self.persistent.log().last_index()
    }

    pub fn persistent_state(&self) -> &PersistentState<S> {
        &self.persistent
    }

    pub fn cluster(&self) -> &ClusterManager {
        &self.cluster
    }

    /// drain the work produced since the last call
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    fn trace(&mut self, event: TraceEvent, argument: i64) {
        self.tracer.on_event(event, argument);
    }
}
