pub mod mvcc;

use std::time::Instant;

use dashmap::DashMap;

use crate::txn::{Key, TxnId, Value};

/// The keyed store consumed by the transaction processor.
///
/// The single-version [`ValueStore`] treats the timestamp argument as
/// cosmetic and tracks wall-clock last-write instants for optimistic
/// validation; the multi-version [`mvcc::MvccStore`] gives it
/// timestamp-ordering semantics.
pub trait Store: Send + Sync + 'static {
    /// Latest value visible to a reader at timestamp `ts`, if any.
    fn read(&self, key: Key, ts: TxnId) -> Option<Value>;

    /// Records `value` for `key` on behalf of the transaction stamped `ts`.
    fn write(&self, key: Key, value: Value, ts: TxnId);

    /// Wall-clock instant of the most recent committed write, `None` if the
    /// key is untouched since seeding.
    fn last_write(&self, key: Key) -> Option<Instant>;

    /// Seeds keys `0..size` with value 0 and no write timestamp.
    fn seed(&self, size: u64);
}

struct Record {
    value: Value,
    last_write: Option<Instant>,
}

/// Single-version value store used by the serial, locking, and optimistic
/// modes. Reads are concurrent; writes come from one committer at a time.
pub struct ValueStore {
    data: DashMap<Key, Record>,
}

impl ValueStore {
    pub fn new() -> Self {
        ValueStore {
            data: DashMap::new(),
        }
    }
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for ValueStore {
    fn read(&self, key: Key, _ts: TxnId) -> Option<Value> {
        self.data.get(&key).map(|record| record.value)
    }

    fn write(&self, key: Key, value: Value, _ts: TxnId) {
        self.data.insert(
            key,
            Record {
                value,
                last_write: Some(Instant::now()),
            },
        );
    }

    fn last_write(&self, key: Key) -> Option<Instant> {
        self.data.get(&key).and_then(|record| record.last_write)
    }

    fn seed(&self, size: u64) {
        for key in 0..size {
            self.data.insert(
                key,
                Record {
                    value: 0,
                    last_write: None,
                },
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    /// Exercises the [`Store`](super::Store) contract shared by every
    /// backend. Invoke inside a backend's test module.
    macro_rules! test_store {
        ($store:expr) => {
            #[test]
            fn seeded_keys_read_zero_and_carry_no_write_time() {
                use crate::storage::Store;
                let store = $store;
                store.seed(10);
                assert_eq!(store.read(0, 1), Some(0));
                assert_eq!(store.read(9, 1), Some(0));
                assert_eq!(store.read(10, 1), None);
                assert_eq!(store.last_write(3), None);
            }

            #[test]
            fn written_values_are_read_back() {
                use crate::storage::Store;
                let store = $store;
                store.seed(10);
                store.write(4, 77, 2);
                assert_eq!(store.read(4, 2), Some(77));
            }
        };
    }

    pub(crate) use test_store;

    mod value_store {
        crate::storage::tests::test_store!(crate::storage::ValueStore::new());

        #[test]
        fn write_stamps_monotonic_last_write_instants() {
            use crate::storage::Store;
            let store = crate::storage::ValueStore::new();
            store.seed(2);
            store.write(0, 1, 1);
            let first = store.last_write(0).unwrap();
            store.write(0, 2, 2);
            let second = store.last_write(0).unwrap();
            assert!(first <= second);
            assert_eq!(store.last_write(1), None);
        }
    }
}
