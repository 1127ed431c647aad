//! Per-shard consensus contract and the in-process log.
//!
//! The core depends on a narrow replicated-log surface: leader-only
//! `append`, a monotone `commit_index`, and immutable committed entries.
//! Leader election, heartbeats, and snapshotting live behind it and are
//! deliberately opaque. [`LocalLog`] implements the contract in process:
//! entries are kept as encoded wire frames (decoded on read, as a durable
//! transport would) and the commit index normally tracks the tail, but can
//! be paused to model an unreachable shard.

use std::sync::Mutex;

use crate::codec;
use crate::error::{Result, SceneError};
use crate::hlc::HlcTimestamp;
use crate::scene::SceneOp;
use crate::shard::ShardId;
use crate::txn::{TxnId, TxnRecord};

/// Replica identifier within the cluster.
pub type ReplicaId = usize;

/// Payload of a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A plain scene operation, applied directly when committed.
    Scene(SceneOp),
    /// Full transaction state on the coordinator shard.
    TxnIntent(TxnRecord),
    /// Participation stub on a non-coordinator shard.
    TxnCommit { txn_id: TxnId, hlc: HlcTimestamp },
    /// Durable abort decision.
    TxnAbort { txn_id: TxnId },
}

/// One replicated log entry. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub shard: ShardId,
    pub hlc: HlcTimestamp,
    pub cmd: Command,
}

/// The consensus surface the core consumes. Indices are 1-based.
pub trait ShardLog: Send + Sync {
    fn shard(&self) -> ShardId;

    /// Append an entry. Leader-only: a non-leader caller gets
    /// [`SceneError::NotLeader`] carrying the current leader. The entry's
    /// term is stamped by the log.
    fn append(&self, from: ReplicaId, entry: LogEntry) -> Result<u64>;

    /// Highest committed index. Monotonically non-decreasing.
    fn commit_index(&self) -> u64;

    /// Highest appended index (committed or not).
    fn last_index(&self) -> u64;

    /// Read a committed entry.
    fn entry(&self, index: u64) -> Result<LogEntry>;

    fn current_leader(&self) -> Option<ReplicaId>;

    fn current_term(&self) -> u64;

    /// Leader-change notification from the election layer.
    fn set_leader(&self, leader: Option<ReplicaId>);

    /// Decode the whole committed prefix.
    fn committed_entries(&self) -> Result<Vec<LogEntry>> {
        (1..=self.commit_index()).map(|i| self.entry(i)).collect()
    }
}

#[derive(Debug)]
struct LogInner {
    /// Encoded entry frames, in append order.
    frames: Vec<Vec<u8>>,
    commit_index: u64,
    /// While true, appends succeed but nothing new commits.
    paused: bool,
    leader: Option<ReplicaId>,
    term: u64,
}

/// In-process shard log.
#[derive(Debug)]
pub struct LocalLog {
    shard: ShardId,
    inner: Mutex<LogInner>,
}

impl LocalLog {
    pub fn new(shard: ShardId, leader: ReplicaId) -> Self {
        Self {
            shard,
            inner: Mutex::new(LogInner {
                frames: Vec::new(),
                commit_index: 0,
                paused: false,
                leader: Some(leader),
                term: 1,
            }),
        }
    }

    /// Freeze the commit index: the shard keeps accepting appends but
    /// nothing new becomes committed. Models an unreachable shard.
    pub fn pause_commits(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    /// Unfreeze and commit everything appended meanwhile.
    pub fn resume_commits(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.paused = false;
        inner.commit_index = inner.frames.len() as u64;
    }
}

impl ShardLog for LocalLog {
    fn shard(&self) -> ShardId {
        self.shard
    }

    fn append(&self, from: ReplicaId, mut entry: LogEntry) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        match inner.leader {
            None => return Err(SceneError::NoLeader(self.shard)),
            Some(leader) if leader != from => {
                return Err(SceneError::NotLeader {
                    shard: self.shard,
                    leader,
                })
            }
            Some(_) => {}
        }
        entry.term = inner.term;
        entry.shard = self.shard;
        let frame = codec::encode_entry(&entry)?;
        inner.frames.push(frame);
        let index = inner.frames.len() as u64;
        if !inner.paused {
            inner.commit_index = index;
        }
        Ok(index)
    }

    fn commit_index(&self) -> u64 {
        self.inner.lock().unwrap().commit_index
    }

    fn last_index(&self) -> u64 {
        self.inner.lock().unwrap().frames.len() as u64
    }

    fn entry(&self, index: u64) -> Result<LogEntry> {
        let inner = self.inner.lock().unwrap();
        if index == 0 || index > inner.commit_index {
            return Err(SceneError::IndexNotCommitted {
                shard: self.shard,
                index,
            });
        }
        codec::decode_entry(&inner.frames[index as usize - 1])
    }

    fn current_leader(&self) -> Option<ReplicaId> {
        self.inner.lock().unwrap().leader
    }

    fn current_term(&self) -> u64 {
        self.inner.lock().unwrap().term
    }

    fn set_leader(&self, leader: Option<ReplicaId>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.leader != leader {
            inner.term += 1;
            inner.leader = leader;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cmd: Command) -> LogEntry {
        LogEntry {
            term: 0,
            shard: 0,
            hlc: HlcTimestamp::new(1, 0),
            cmd,
        }
    }

    #[test]
    fn test_append_commits_and_reads_back() {
        let log = LocalLog::new(0, 0);
        let index = log
            .append(0, entry(Command::Scene(SceneOp::RemoveNode { node: 3 })))
            .unwrap();
        assert_eq!(index, 1);
        assert_eq!(log.commit_index(), 1);

        let read = log.entry(1).unwrap();
        assert_eq!(read.term, 1);
        assert_eq!(read.cmd, Command::Scene(SceneOp::RemoveNode { node: 3 }));
    }

    #[test]
    fn test_append_rejects_non_leader() {
        let log = LocalLog::new(0, 0);
        let err = log
            .append(2, entry(Command::TxnAbort { txn_id: 7 }))
            .unwrap_err();
        assert!(matches!(err, SceneError::NotLeader { leader: 0, .. }));
    }

    #[test]
    fn test_paused_log_withholds_commit() {
        let log = LocalLog::new(1, 0);
        log.pause_commits();
        let index = log
            .append(0, entry(Command::TxnAbort { txn_id: 7 }))
            .unwrap();
        assert_eq!(index, 1);
        assert_eq!(log.commit_index(), 0);
        assert!(log.entry(1).is_err());

        log.resume_commits();
        assert_eq!(log.commit_index(), 1);
        assert!(log.entry(1).is_ok());
    }

    #[test]
    fn test_leader_change_bumps_term() {
        let log = LocalLog::new(0, 0);
        let term = log.current_term();
        log.set_leader(Some(2));
        assert_eq!(log.current_leader(), Some(2));
        assert_eq!(log.current_term(), term + 1);

        log.set_leader(None);
        let err = log
            .append(2, entry(Command::TxnAbort { txn_id: 1 }))
            .unwrap_err();
        assert!(matches!(err, SceneError::NoLeader(0)));
    }
}
