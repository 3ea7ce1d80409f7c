//! Ready-made transaction bodies used by the tests and the workload
//! generators.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::errors::Result;
use crate::txn::{Body, Key, Txn, Value, Vote};

impl Txn {
    /// Immediately votes to commit. Reads and writes nothing.
    pub fn noop() -> Txn {
        Txn::build(BTreeSet::new(), BTreeSet::new(), Box::new(|_| Vote::Commit))
    }

    /// Writes every pair and commits.
    pub fn put(pairs: impl IntoIterator<Item = (Key, Value)>) -> Txn {
        let pairs: Vec<(Key, Value)> = pairs.into_iter().collect();
        let writeset: BTreeSet<Key> = pairs.iter().map(|&(k, _)| k).collect();
        let body: Body = Box::new(move |ops| {
            for &(key, value) in &pairs {
                ops.write(key, value);
            }
            Vote::Commit
        });
        Txn::build(BTreeSet::new(), writeset, body)
    }

    /// Reads every key and commits iff every observed value matches the
    /// expected one. A missing key counts as a mismatch.
    pub fn expect(pairs: impl IntoIterator<Item = (Key, Value)>) -> Txn {
        let pairs: Vec<(Key, Value)> = pairs.into_iter().collect();
        let readset: BTreeSet<Key> = pairs.iter().map(|&(k, _)| k).collect();
        let body: Body = Box::new(move |ops| {
            for &(key, want) in &pairs {
                if ops.read(key) != Some(want) {
                    return Vote::Abort;
                }
            }
            Vote::Commit
        });
        Txn::build(readset, BTreeSet::new(), body)
    }

    /// Read-modify-write: reads the read set, increments every write-set key,
    /// then spins for `duration` to simulate body work before committing.
    pub fn rmw(
        readset: impl IntoIterator<Item = Key>,
        writeset: impl IntoIterator<Item = Key>,
        duration: Duration,
    ) -> Result<Txn> {
        let readset: BTreeSet<Key> = readset.into_iter().collect();
        let writeset: BTreeSet<Key> = writeset.into_iter().collect();
        Txn::new(readset.clone(), writeset.clone(), rmw_body(readset, writeset, duration))
    }

    /// Read-modify-write over disjoint random key sets drawn from
    /// `[0, db_size)`.
    pub fn rmw_random(
        db_size: u64,
        readset_size: usize,
        writeset_size: usize,
        duration: Duration,
        rng: &mut impl Rng,
    ) -> Txn {
        assert!(
            db_size >= (readset_size + writeset_size) as u64,
            "cannot draw {} unique keys from {} records",
            readset_size + writeset_size,
            db_size
        );

        let mut readset = BTreeSet::new();
        while readset.len() < readset_size {
            readset.insert(rng.gen_range(0..db_size));
        }
        let mut writeset = BTreeSet::new();
        while writeset.len() < writeset_size {
            let key = rng.gen_range(0..db_size);
            if !readset.contains(&key) {
                writeset.insert(key);
            }
        }

        let body = rmw_body(readset.clone(), writeset.clone(), duration);
        Txn::build(readset, writeset, body)
    }
}

fn rmw_body(readset: BTreeSet<Key>, writeset: BTreeSet<Key>, duration: Duration) -> Body {
    Box::new(move |ops| {
        for &key in &readset {
            ops.read(key);
        }
        for &key in &writeset {
            let value = ops.read(key).unwrap_or(0);
            ops.write(key, value + 1);
        }
        let begin = Instant::now();
        while begin.elapsed() < duration {
            std::hint::spin_loop();
        }
        Vote::Commit
    })
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::txn::TxnStatus;

    #[test]
    fn noop_commits_with_empty_sets() {
        let mut txn = Txn::noop();
        txn.run();
        assert_eq!(txn.status(), TxnStatus::CompletedCommit);
        assert!(txn.reads().is_empty());
        assert!(txn.writes().is_empty());
    }

    #[test]
    fn expect_aborts_on_mismatch_or_missing() {
        let mut missing = Txn::expect([(1, 42)]);
        missing.run();
        assert_eq!(missing.status(), TxnStatus::CompletedAbort);

        let mut wrong = Txn::expect([(1, 42)]);
        wrong.reads.insert(1, 41);
        wrong.run();
        assert_eq!(wrong.status(), TxnStatus::CompletedAbort);

        let mut right = Txn::expect([(1, 42)]);
        right.reads.insert(1, 42);
        right.run();
        assert_eq!(right.status(), TxnStatus::CompletedCommit);
    }

    #[test]
    fn rmw_increments_missing_keys_from_zero() {
        let mut txn = Txn::rmw([], [3], Duration::ZERO).unwrap();
        txn.run();
        assert_eq!(txn.writes().get(&3), Some(&1));

        let mut seen = Txn::rmw([], [3], Duration::ZERO).unwrap();
        seen.reads.insert(3, 9);
        seen.run();
        assert_eq!(seen.writes().get(&3), Some(&10));
    }

    #[test]
    fn rmw_random_draws_disjoint_sets_of_requested_size() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..50 {
            let txn = Txn::rmw_random(30, 5, 10, Duration::ZERO, &mut rng);
            assert_eq!(txn.readset().len(), 5);
            assert_eq!(txn.writeset().len(), 10);
            assert!(txn.readset().is_disjoint(txn.writeset()));
        }
    }
}
