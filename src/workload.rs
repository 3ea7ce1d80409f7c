//! Transaction mixes for driving a processor from the benchmark harness.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::txn::Txn;

pub trait LoadGen: Send {
    fn next_txn(&mut self) -> Txn;
}

/// Uniform read-modify-write transactions over `[0, db_size)`.
pub struct RmwLoadGen {
    db_size: u64,
    read_keys: usize,
    write_keys: usize,
    duration: Duration,
    rng: StdRng,
}

impl RmwLoadGen {
    pub fn new(db_size: u64, read_keys: usize, write_keys: usize, duration: Duration) -> Self {
        Self::seeded(db_size, read_keys, write_keys, duration, rand::random())
    }

    pub fn seeded(
        db_size: u64,
        read_keys: usize,
        write_keys: usize,
        duration: Duration,
        seed: u64,
    ) -> Self {
        RmwLoadGen {
            db_size,
            read_keys,
            write_keys,
            duration,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl LoadGen for RmwLoadGen {
    fn next_txn(&mut self) -> Txn {
        Txn::rmw_random(
            self.db_size,
            self.read_keys,
            self.write_keys,
            self.duration,
            &mut self.rng,
        )
    }
}

/// 80% long read-only transactions, 20% fast high-contention updates.
pub struct RmwMixLoadGen {
    db_size: u64,
    read_keys: usize,
    write_keys: usize,
    duration: Duration,
    rng: StdRng,
}

impl RmwMixLoadGen {
    pub fn new(db_size: u64, read_keys: usize, write_keys: usize, duration: Duration) -> Self {
        RmwMixLoadGen {
            db_size,
            read_keys,
            write_keys,
            duration,
            rng: StdRng::seed_from_u64(rand::random()),
        }
    }
}

impl LoadGen for RmwMixLoadGen {
    fn next_txn(&mut self) -> Txn {
        if self.rng.gen_range(0..100) < 80 {
            Txn::rmw_random(self.db_size, self.read_keys, 0, self.duration, &mut self.rng)
        } else {
            Txn::rmw_random(
                self.db_size,
                0,
                self.write_keys,
                Duration::ZERO,
                &mut self.rng,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmw_gen_produces_requested_shapes() {
        let mut gen = RmwLoadGen::seeded(1000, 5, 3, Duration::ZERO, 42);
        for _ in 0..20 {
            let txn = gen.next_txn();
            assert_eq!(txn.readset().len(), 5);
            assert_eq!(txn.writeset().len(), 3);
        }
    }

    #[test]
    fn mix_gen_produces_read_only_and_write_only_txns() {
        let mut gen = RmwMixLoadGen::new(50, 30, 10, Duration::from_millis(1));
        let mut read_only = 0;
        let mut write_only = 0;
        for _ in 0..200 {
            let txn = gen.next_txn();
            if txn.writeset().is_empty() {
                read_only += 1;
            } else {
                assert!(txn.readset().is_empty());
                write_only += 1;
            }
        }
        assert!(read_only > write_only);
        assert!(write_only > 0);
    }
}
