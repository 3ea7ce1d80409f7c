mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Instant;

use crate::errors::{Result, TxnError};

pub type Key = u64;
pub type Value = u64;

/// Transaction identity, doubling as the logical timestamp under
/// multi-version timestamp ordering. Assigned by the processor,
/// strictly increasing, and replaced on every restart.
pub type TxnId = u64;

/// The commit/abort decision returned by a transaction body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Commit,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Not yet executed.
    Incomplete,
    /// Body finished with a commit vote; awaiting validation/commit.
    CompletedCommit,
    /// Body finished with an abort vote.
    CompletedAbort,
    Committed,
    Aborted,
}

impl TxnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }
}

/// The accessors handed to a transaction body while it runs.
///
/// Reads observe the snapshot captured before the body started; buffered
/// writes are not read back. Writes may only touch declared write-set keys.
pub struct TxnOps<'a> {
    reads: &'a HashMap<Key, Value>,
    writeset: &'a BTreeSet<Key>,
    writes: &'a mut BTreeMap<Key, Value>,
}

impl TxnOps<'_> {
    pub fn read(&self, key: Key) -> Option<Value> {
        self.reads.get(&key).copied()
    }

    pub fn write(&mut self, key: Key, value: Value) {
        debug_assert!(
            self.writeset.contains(&key),
            "write to undeclared key {key}"
        );
        self.writes.insert(key, value);
    }
}

pub type Body = Box<dyn Fn(&mut TxnOps<'_>) -> Vote + Send>;

/// A unit of work: declared read/write sets, buffered reads and writes,
/// and an opaque body that votes to commit or abort.
pub struct Txn {
    pub(crate) id: TxnId,
    pub(crate) readset: BTreeSet<Key>,
    pub(crate) writeset: BTreeSet<Key>,
    pub(crate) reads: HashMap<Key, Value>,
    pub(crate) writes: BTreeMap<Key, Value>,
    pub(crate) status: TxnStatus,
    pub(crate) occ_start: Option<Instant>,
    body: Body,
}

impl Txn {
    /// Builds a transaction over the given key sets. The sets are fixed for
    /// the life of the transaction; a key may not appear in both.
    pub fn new(
        readset: impl IntoIterator<Item = Key>,
        writeset: impl IntoIterator<Item = Key>,
        body: Body,
    ) -> Result<Txn> {
        let readset: BTreeSet<Key> = readset.into_iter().collect();
        let writeset: BTreeSet<Key> = writeset.into_iter().collect();
        if let Some(&key) = readset.intersection(&writeset).next() {
            return Err(TxnError::KeyInBothSets(key));
        }
        Ok(Self::build(readset, writeset, body))
    }

    pub(crate) fn build(readset: BTreeSet<Key>, writeset: BTreeSet<Key>, body: Body) -> Txn {
        Txn {
            id: 0,
            readset,
            writeset,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
            status: TxnStatus::Incomplete,
            occ_start: None,
            body,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn readset(&self) -> &BTreeSet<Key> {
        &self.readset
    }

    pub fn writeset(&self) -> &BTreeSet<Key> {
        &self.writeset
    }

    /// Values observed during the most recent execution attempt.
    pub fn reads(&self) -> &HashMap<Key, Value> {
        &self.reads
    }

    /// Values buffered by the most recent execution attempt.
    pub fn writes(&self) -> &BTreeMap<Key, Value> {
        &self.writes
    }

    pub fn occ_start(&self) -> Option<Instant> {
        self.occ_start
    }

    /// Total number of declared keys.
    pub fn footprint(&self) -> usize {
        self.readset.len() + self.writeset.len()
    }

    /// Runs the body against the buffered reads and records its vote.
    pub(crate) fn run(&mut self) {
        let mut ops = TxnOps {
            reads: &self.reads,
            writeset: &self.writeset,
            writes: &mut self.writes,
        };
        self.status = match (self.body)(&mut ops) {
            Vote::Commit => TxnStatus::CompletedCommit,
            Vote::Abort => TxnStatus::CompletedAbort,
        };
    }

    /// Resets the transaction for a fresh attempt under a new timestamp.
    /// The declared read and write sets are kept.
    pub(crate) fn restart(&mut self, id: TxnId) {
        self.id = id;
        self.reads.clear();
        self.writes.clear();
        self.status = TxnStatus::Incomplete;
        self.occ_start = None;
    }
}

impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("readset", &self.readset)
            .field("writeset", &self.writeset)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_records_reads_writes_and_vote() {
        let mut txn = Txn::new(
            [1],
            [2],
            Box::new(|ops| {
                let seen = ops.read(1).unwrap_or(0);
                ops.write(2, seen + 10);
                Vote::Commit
            }),
        )
        .unwrap();
        txn.reads.insert(1, 5);
        txn.run();
        assert_eq!(txn.status(), TxnStatus::CompletedCommit);
        assert_eq!(txn.writes().get(&2), Some(&15));
    }

    #[test]
    fn restart_clears_buffers_but_keeps_sets() {
        let mut txn = Txn::new([1], [2], Box::new(|_| Vote::Commit)).unwrap();
        txn.id = 7;
        txn.reads.insert(1, 1);
        txn.run();
        txn.restart(8);
        assert_eq!(txn.id(), 8);
        assert_eq!(txn.status(), TxnStatus::Incomplete);
        assert!(txn.reads().is_empty());
        assert!(txn.writes().is_empty());
        assert_eq!(txn.readset().len(), 1);
        assert_eq!(txn.writeset().len(), 1);
    }

    #[test]
    fn overlapping_sets_are_rejected() {
        let err = Txn::new([1, 2], [2, 3], Box::new(|_| Vote::Commit)).unwrap_err();
        assert!(matches!(err, TxnError::KeyInBothSets(2)));
    }
}
