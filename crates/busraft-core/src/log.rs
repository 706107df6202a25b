//! # log
//!
//! why: manage the bounded, append-only sequence of allocation records that
//! the cluster replicates
//! relations: owned by persistent.rs, mutated only through the storage
//! backend so memory never runs ahead of the medium
//! what: Entry struct, sentinel anchor, storage-backed Log with rollback

use busraft_storage::Storage;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::{LogIndex, NodeId, Term, UniqueId};

/// One allocation record: this unique ID now owns this node ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// term in which the leader appended this record
    pub term: Term,
    /// the allocated bus node ID
    pub node_id: NodeId,
    /// hardware unique ID of the node that received the allocation
    pub unique_id: UniqueId,
}

impl Entry {
    /// The permanently committed anchor at index 0. Carries no allocation;
    /// it exists so every real entry has a predecessor to match against.
    pub const SENTINEL: Entry = Entry {
        term: 0,
        node_id: 0,
        unique_id: [0; 16],
    };

    const ENCODED_LEN: usize = 21;

    fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.term.to_le_bytes());
        buf[4] = self.node_id;
        buf[5..21].copy_from_slice(&self.unique_id);
        buf
    }

    fn from_bytes(raw: &[u8]) -> Result<Entry> {
        if raw.len() != Self::ENCODED_LEN {
            return Err(RaftError::Integrity("log entry has wrong encoded length"));
        }
        let mut term = [0u8; 4];
        term.copy_from_slice(&raw[0..4]);
        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&raw[5..21]);
        Ok(Entry {
            term: Term::from_le_bytes(term),
            node_id: raw[4],
            unique_id,
        })
    }
}

/// Maximum number of log entries including the sentinel, derived from the
/// 7-bit node-ID space: one slot per allocatable ID plus the anchor.
pub const LOG_CAPACITY: usize = 128;

const LAST_INDEX_KEY: &str = "log_last_index";

fn entry_key(index: LogIndex) -> String {
    format!("log{index}")
}

pub(crate) fn decode_u32(raw: &[u8], what: &'static str) -> Result<u32> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| RaftError::Integrity(what))?;
    Ok(u32::from_le_bytes(bytes))
}

/// The replicated allocation log.
///
/// Always holds at least the sentinel. Every mutation writes through to the
/// storage backend before the in-memory copy changes; a failed write leaves
/// both sides on the previous state.
#[derive(Debug)]
pub struct Log {
    entries: Vec<Entry>,
}

impl Log {
    pub(crate) fn new() -> Self {
        Self {
            entries: vec![Entry::SENTINEL],
        }
    }

    /// restore from storage, or persist the sentinel-only log on first boot
    pub(crate) fn init<S: Storage>(&mut self, storage: &mut S) -> Result<()> {
        let Some(raw) = storage.get(LAST_INDEX_KEY)? else {
            storage.set(&entry_key(0), &Entry::SENTINEL.to_bytes())?;
            storage.set(LAST_INDEX_KEY, &0u32.to_le_bytes())?;
            self.entries = vec![Entry::SENTINEL];
            return Ok(());
        };

        let last_index = decode_u32(&raw, "log last index has wrong encoded length")?;
        if last_index as usize >= LOG_CAPACITY {
            return Err(RaftError::Integrity("log last index exceeds capacity"));
        }

        let mut entries = Vec::with_capacity(last_index as usize + 1);
        for index in 0..=last_index {
            let raw = storage
                .get(&entry_key(index))?
                .ok_or(RaftError::Integrity("log entry missing from storage"))?;
            entries.push(Entry::from_bytes(&raw)?);
        }

        if entries[0] != Entry::SENTINEL {
            return Err(RaftError::Integrity("log index 0 is not the sentinel"));
        }
        if entries.windows(2).any(|pair| pair[0].term > pair[1].term) {
            return Err(RaftError::Integrity("log terms are not non-decreasing"));
        }

        self.entries = entries;
        Ok(())
    }

    /// append one entry; fails on term regression, a full log, or a storage
    /// error, in which case the log is unchanged
    pub(crate) fn append<S: Storage>(&mut self, storage: &mut S, entry: Entry) -> Result<()> {
        if entry.term < self.last_entry().term {
            return Err(RaftError::TermRegression);
        }
        if self.entries.len() >= LOG_CAPACITY {
            return Err(RaftError::LogFull);
        }

        let index = self.last_index() + 1;
        storage.set(&entry_key(index), &entry.to_bytes())?;
        storage.set(LAST_INDEX_KEY, &index.to_le_bytes())?;
        self.entries.push(entry);
        Ok(())
    }

    /// drop every entry at `index` and above; the sentinel cannot be dropped
    pub(crate) fn remove_where_index_greater_or_equal<S: Storage>(
        &mut self,
        storage: &mut S,
        index: LogIndex,
    ) -> Result<()> {
        if index == 0 {
            return Err(RaftError::Integrity("sentinel entry is immutable"));
        }
        self.truncate(storage, index - 1)
    }

    /// drop every entry strictly above `index`
    pub(crate) fn remove_where_index_greater<S: Storage>(
        &mut self,
        storage: &mut S,
        index: LogIndex,
    ) -> Result<()> {
        self.truncate(storage, index)
    }

    fn truncate<S: Storage>(&mut self, storage: &mut S, keep_last: LogIndex) -> Result<()> {
        if keep_last >= self.last_index() {
            return Ok(());
        }
        storage.set(LAST_INDEX_KEY, &keep_last.to_le_bytes())?;
        self.entries.truncate(keep_last as usize + 1);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        self.entries.get(index as usize)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn last_index(&self) -> LogIndex {
        (self.entries.len() - 1) as LogIndex
    }

    pub fn last_entry(&self) -> &Entry {
        &self.entries[self.entries.len() - 1]
    }

    /// the §5.4.1 election restriction: a candidate's log wins when its last
    /// term is newer, or terms tie and its log is at least as long
    pub fn is_other_log_up_to_date(&self, other_last_index: LogIndex, other_last_term: Term) -> bool {
        let last = self.last_entry();
        other_last_term > last.term
            || (other_last_term == last.term && other_last_index >= self.last_index())
    }
}
