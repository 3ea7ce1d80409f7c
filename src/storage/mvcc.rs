//! Multi-version store with timestamp-ordering validation.
//!
//! Every key maps to a list of versions ordered by decreasing creation
//! timestamp. Per-key mutual exclusion is provided by lock striping, so
//! operations on distinct keys only serialize on a stripe collision.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::storage::Store;
use crate::txn::{Key, TxnId, Value};

const STRIPE_COUNT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub value: Value,
    /// Timestamp of the creating transaction. Unique within a key's list.
    pub version_id: TxnId,
    /// Largest timestamp that has observed this version.
    pub max_read_id: TxnId,
}

type VersionList = Vec<Version>;
type Shard = HashMap<Key, VersionList>;

pub struct MvccStore {
    stripes: Box<[Mutex<Shard>]>,
}

fn stripe_of(key: Key) -> usize {
    (key as usize) & (STRIPE_COUNT - 1)
}

/// A write at `ts` is admissible iff the version it would shadow has not
/// been observed by any later-stamped reader.
fn admissible(versions: Option<&VersionList>, ts: TxnId) -> bool {
    match versions.and_then(|list| list.iter().find(|v| v.version_id <= ts)) {
        Some(shadowed) => shadowed.max_read_id <= ts,
        None => true,
    }
}

fn insert_version(versions: &mut VersionList, value: Value, ts: TxnId) {
    let pos = versions.partition_point(|v| v.version_id > ts);
    debug_assert!(
        versions.get(pos).map_or(true, |v| v.version_id != ts),
        "duplicate version {ts}"
    );
    versions.insert(
        pos,
        Version {
            value,
            version_id: ts,
            max_read_id: 0,
        },
    );
}

impl MvccStore {
    pub fn new() -> Self {
        MvccStore {
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(Shard::new())).collect(),
        }
    }

    fn stripe(&self, key: Key) -> &Mutex<Shard> {
        &self.stripes[stripe_of(key)]
    }

    /// Checks a single key outside the commit path. The commit path uses
    /// [`try_apply`](Self::try_apply), which revalidates under the stripe
    /// locks it holds.
    pub fn check_write(&self, key: Key, ts: TxnId) -> bool {
        admissible(self.stripe(key).lock().get(&key), ts)
    }

    /// Validates every write-set key at `ts` and, iff all pass, applies the
    /// buffered writes. The affected stripe locks are held across both steps
    /// and acquired in ascending index order.
    pub fn try_apply(
        &self,
        writeset: &BTreeSet<Key>,
        writes: &BTreeMap<Key, Value>,
        ts: TxnId,
    ) -> bool {
        let mut stripes: Vec<usize> = writeset.iter().map(|&key| stripe_of(key)).collect();
        stripes.sort_unstable();
        stripes.dedup();
        let mut guards: HashMap<usize, MutexGuard<'_, Shard>> = stripes
            .iter()
            .map(|&index| (index, self.stripes[index].lock()))
            .collect();

        for &key in writeset {
            if !admissible(guards[&stripe_of(key)].get(&key), ts) {
                return false;
            }
        }
        for (&key, &value) in writes {
            let shard = guards
                .get_mut(&stripe_of(key))
                .expect("write-set stripe is locked");
            insert_version(shard.entry(key).or_default(), value, ts);
        }
        true
    }

    /// Snapshot of a key's version list, newest first.
    pub fn versions(&self, key: Key) -> Vec<Version> {
        self.stripe(key).lock().get(&key).cloned().unwrap_or_default()
    }
}

impl Default for MvccStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MvccStore {
    /// Returns the value of the version with the largest
    /// `version_id <= ts` and raises that version's `max_read_id` to `ts`.
    fn read(&self, key: Key, ts: TxnId) -> Option<Value> {
        let mut shard = self.stripe(key).lock();
        let version = shard
            .get_mut(&key)?
            .iter_mut()
            .find(|v| v.version_id <= ts)?;
        version.max_read_id = version.max_read_id.max(ts);
        Some(version.value)
    }

    fn write(&self, key: Key, value: Value, ts: TxnId) {
        let mut shard = self.stripe(key).lock();
        insert_version(shard.entry(key).or_default(), value, ts);
    }

    fn last_write(&self, _key: Key) -> Option<Instant> {
        None
    }

    fn seed(&self, size: u64) {
        for key in 0..size {
            self.write(key, 0, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::storage::tests::test_store!(MvccStore::new());

    fn ids(store: &MvccStore, key: Key) -> Vec<TxnId> {
        store.versions(key).iter().map(|v| v.version_id).collect()
    }

    #[test]
    fn version_lists_stay_strictly_decreasing() {
        let store = MvccStore::new();
        store.write(1, 50, 5);
        store.write(1, 10, 1);
        store.write(1, 30, 3);
        assert_eq!(ids(&store, 1), vec![5, 3, 1]);
        assert_eq!(
            store.versions(1).iter().map(|v| v.value).collect::<Vec<_>>(),
            vec![50, 30, 10]
        );
    }

    #[test]
    fn read_picks_largest_version_at_or_below_timestamp() {
        let store = MvccStore::new();
        store.write(1, 10, 2);
        store.write(1, 50, 5);
        assert_eq!(store.read(1, 1), None);
        assert_eq!(store.read(1, 2), Some(10));
        assert_eq!(store.read(1, 4), Some(10));
        assert_eq!(store.read(1, 5), Some(50));
        assert_eq!(store.read(1, 9), Some(50));
    }

    #[test]
    fn read_raises_max_read_id_without_lowering_it() {
        let store = MvccStore::new();
        store.write(1, 10, 2);
        store.read(1, 9);
        assert_eq!(store.versions(1)[0].max_read_id, 9);
        store.read(1, 4);
        assert_eq!(store.versions(1)[0].max_read_id, 9);
    }

    #[test]
    fn check_write_fails_once_a_later_reader_observed_the_shadowed_version() {
        let store = MvccStore::new();
        store.write(1, 0, 0);
        store.read(1, 10);
        assert!(!store.check_write(1, 5));
        assert!(store.check_write(1, 10));
        assert!(store.check_write(1, 11));
    }

    #[test]
    fn check_write_passes_when_nothing_would_be_shadowed() {
        let store = MvccStore::new();
        assert!(store.check_write(1, 3));
        store.write(1, 1, 5);
        assert!(store.check_write(1, 3));
    }

    #[test]
    fn try_apply_is_all_or_nothing() {
        let store = MvccStore::new();
        store.seed(2);
        store.read(1, 10);

        let writeset: BTreeSet<Key> = [0, 1].into();
        let writes: BTreeMap<Key, Value> = [(0, 7), (1, 8)].into();
        assert!(!store.try_apply(&writeset, &writes, 5));
        assert_eq!(ids(&store, 0), vec![0]);
        assert_eq!(ids(&store, 1), vec![0]);

        assert!(store.try_apply(&writeset, &writes, 11));
        assert_eq!(ids(&store, 0), vec![11, 0]);
        assert_eq!(ids(&store, 1), vec![11, 0]);
        assert_eq!(store.versions(0)[0].max_read_id, 0);
    }
}
