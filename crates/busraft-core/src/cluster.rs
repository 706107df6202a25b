//! # cluster
//!
//! why: track which servers form the cluster and how far each one's log has
//! been brought up to date
//! relations: populated by discovery events fed through node.rs, consulted by
//! the leader's replication loop and by both RPC handlers
//! what: ClusterManager with per-server next/match indices, quorum math,
//! edge-triggered discovery flag

use busraft_storage::Storage;
use tracing::debug;

use crate::error::{RaftError, Result};
use crate::{LogIndex, NodeId, MAX_NODE_ID};

/// Largest supported cluster. Sizes are odd; 3 and 5 are the deployment
/// configurations, 1 is the degenerate standalone server.
pub const MAX_CLUSTER_SIZE: u8 = 5;

/// Placeholder meaning "take the size from storage".
pub const CLUSTER_SIZE_UNKNOWN: u8 = 0;

const CLUSTER_SIZE_KEY: &str = "cluster_size";

#[derive(Debug, Clone, Copy)]
struct ServerTracker {
    node_id: NodeId,
    next_index: LogIndex,
    match_index: LogIndex,
}

/// Static cluster membership plus the leader's per-server replication
/// indices. Remote servers are learned one at a time from discovery traffic
/// until `cluster_size - 1` of them are known.
pub struct ClusterManager {
    own_node_id: NodeId,
    cluster_size: u8,
    servers: Vec<ServerTracker>,
    had_discovery_activity: bool,
}

impl ClusterManager {
    pub(crate) fn new(own_node_id: NodeId) -> Self {
        Self {
            own_node_id,
            cluster_size: CLUSTER_SIZE_UNKNOWN,
            servers: Vec::new(),
            had_discovery_activity: false,
        }
    }

    /// resolve the cluster size: a persisted value wins, otherwise the hint
    /// is validated and persisted, otherwise initialization fails
    pub(crate) fn init<S: Storage>(&mut self, hint: u8, storage: &mut S) -> Result<()> {
        let size = match storage.get(CLUSTER_SIZE_KEY)? {
            Some(raw) => {
                if raw.len() != 1 {
                    return Err(RaftError::Integrity("cluster size has wrong encoded length"));
                }
                raw[0]
            }
            None => {
                if hint == CLUSTER_SIZE_UNKNOWN {
                    return Err(RaftError::ClusterSizeUnknown);
                }
                Self::validate_size(hint)?;
                storage.set(CLUSTER_SIZE_KEY, &[hint])?;
                hint
            }
        };
        Self::validate_size(size)?;
        self.cluster_size = size;
        Ok(())
    }

    fn validate_size(size: u8) -> Result<()> {
        if size == 0 || size > MAX_CLUSTER_SIZE || size % 2 == 0 {
            return Err(RaftError::InvalidClusterSize(size));
        }
        Ok(())
    }

    pub fn cluster_size(&self) -> u8 {
        self.cluster_size
    }

    pub fn quorum_size(&self) -> u8 {
        self.cluster_size / 2 + 1
    }

    pub fn num_known_servers(&self) -> u8 {
        self.servers.len() as u8
    }

    /// true once every remote member of the configured cluster is known
    pub fn is_cluster_discovered(&self) -> bool {
        self.num_known_servers() == self.cluster_size - 1
    }

    pub fn is_known_server(&self, node_id: NodeId) -> bool {
        self.servers.iter().any(|s| s.node_id == node_id)
    }

    /// record one observed discovery announcement; returns true when it
    /// introduced a previously unknown member
    pub(crate) fn add_remote_server(&mut self, node_id: NodeId, log_last_index: LogIndex) -> bool {
        if node_id == 0 || node_id > MAX_NODE_ID || node_id == self.own_node_id {
            return false;
        }

        self.had_discovery_activity = true;

        if self.is_known_server(node_id) || self.is_cluster_discovered() {
            return false;
        }

        debug!(peer = node_id, "discovered cluster member");
        self.servers.push(ServerTracker {
            node_id,
            next_index: log_last_index + 1,
            match_index: 0,
        });
        true
    }

    /// read and clear the discovery-activity flag
    pub(crate) fn had_discovery_activity(&mut self) -> bool {
        std::mem::take(&mut self.had_discovery_activity)
    }

    /// the server at ordinal `index` in discovery order, if that many are known
    pub fn get_remote_server_node_id_at_index(&self, index: u8) -> Option<NodeId> {
        self.servers.get(index as usize).map(|s| s.node_id)
    }

    pub(crate) fn reset_all_server_indices(&mut self, log_last_index: LogIndex) {
        for server in &mut self.servers {
            server.next_index = log_last_index + 1;
            server.match_index = 0;
        }
    }

    pub(crate) fn increment_server_next_index_by(&mut self, node_id: NodeId, count: LogIndex) {
        if let Some(server) = self.tracker_mut(node_id) {
            server.next_index += count;
        }
    }

    /// walk the next index back one step; it never drops below 1 because the
    /// sentinel always matches
    pub(crate) fn decrement_server_next_index(&mut self, node_id: NodeId) {
        if let Some(server) = self.tracker_mut(node_id) {
            if server.next_index > 1 {
                server.next_index -= 1;
            }
        }
    }

    pub(crate) fn set_server_match_index(&mut self, node_id: NodeId, index: LogIndex) {
        if let Some(server) = self.tracker_mut(node_id) {
            server.match_index = index;
        }
    }

    pub fn get_server_next_index(&self, node_id: NodeId) -> LogIndex {
        self.tracker(node_id).map_or(0, |s| s.next_index)
    }

    pub fn get_server_match_index(&self, node_id: NodeId) -> LogIndex {
        self.tracker(node_id).map_or(0, |s| s.match_index)
    }

    fn tracker(&self, node_id: NodeId) -> Option<&ServerTracker> {
        self.servers.iter().find(|s| s.node_id == node_id)
    }

    fn tracker_mut(&mut self, node_id: NodeId) -> Option<&mut ServerTracker> {
        self.servers.iter_mut().find(|s| s.node_id == node_id)
    }
}
