//! # persistent
//!
//! why: keep the state that Raft requires to survive restarts (term, vote,
//! log) durably committed before any handler replies
//! relations: owns the storage backend; node.rs mutates consensus state only
//! through this type
//! what: PersistentState with one-durable-write-per-mutation discipline

use busraft_storage::Storage;

use crate::error::{RaftError, Result};
use crate::log::{decode_u32, Entry, Log};
use crate::{LogIndex, NodeId, Term, MAX_NODE_ID};

const CURRENT_TERM_KEY: &str = "current_term";
const VOTED_FOR_KEY: &str = "voted_for";

/// Durable server state: `current_term`, `voted_for` and the log.
///
/// Every mutator performs exactly one durable write and only then updates the
/// cached copy, so a storage failure can never leave memory ahead of the
/// medium.
pub struct PersistentState<S> {
    storage: S,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Log,
}

impl<S: Storage> PersistentState<S> {
    pub(crate) fn new(storage: S) -> Self {
        Self {
            storage,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
        }
    }

    /// load existing state or persist the defaults, validating that what came
    /// back is internally consistent
    pub(crate) fn init(&mut self) -> Result<()> {
        self.log.init(&mut self.storage)?;

        self.current_term = match self.storage.get(CURRENT_TERM_KEY)? {
            Some(raw) => decode_u32(&raw, "current term has wrong encoded length")?,
            None => {
                self.storage.set(CURRENT_TERM_KEY, &0u32.to_le_bytes())?;
                0
            }
        };
        if self.current_term < self.log.last_entry().term {
            return Err(RaftError::Integrity("current term precedes the last log entry"));
        }

        self.voted_for = match self.storage.get(VOTED_FOR_KEY)? {
            Some(raw) => {
                if raw.len() != 1 {
                    return Err(RaftError::Integrity("voted_for has wrong encoded length"));
                }
                match raw[0] {
                    0 => None,
                    id if id <= MAX_NODE_ID => Some(id),
                    _ => return Err(RaftError::Integrity("voted_for is not a unicast node id")),
                }
            }
            None => {
                self.storage.set(VOTED_FOR_KEY, &[0])?;
                None
            }
        };

        Ok(())
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    /// advance the durable term; moving strictly forward is the only
    /// legitimate transition
    pub(crate) fn set_current_term(&mut self, term: Term) -> Result<()> {
        debug_assert!(term >= self.current_term);
        self.storage.set(CURRENT_TERM_KEY, &term.to_le_bytes())?;
        self.current_term = term;
        Ok(())
    }

    pub(crate) fn set_voted_for(&mut self, node_id: NodeId) -> Result<()> {
        self.storage.set(VOTED_FOR_KEY, &[node_id])?;
        self.voted_for = Some(node_id);
        Ok(())
    }

    /// clear the vote; must accompany every term advance
    pub(crate) fn reset_voted_for(&mut self) -> Result<()> {
        self.storage.set(VOTED_FOR_KEY, &[0])?;
        self.voted_for = None;
        Ok(())
    }

    pub(crate) fn append_to_log(&mut self, entry: Entry) -> Result<()> {
        self.log.append(&mut self.storage, entry)
    }

    pub(crate) fn remove_log_entries_where_index_greater_or_equal(
        &mut self,
        index: LogIndex,
    ) -> Result<()> {
        self.log.remove_where_index_greater_or_equal(&mut self.storage, index)
    }

    pub(crate) fn remove_log_entries_where_index_greater(&mut self, index: LogIndex) -> Result<()> {
        self.log.remove_where_index_greater(&mut self.storage, index)
    }

    pub(crate) fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }
}
