//! The transaction processor: a background scheduler thread driving one of
//! six concurrency-control protocols over a worker pool.
//!
//! Clients hand transactions to [`TxnProcessor::submit`] and collect
//! terminal transactions from [`TxnProcessor::next_result`]. Conflict
//! restarts never surface to the client; a restarted transaction re-enters
//! the request queue under a fresh timestamp.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::errors::{Result, TxnError};
use crate::lock::{ExclusiveLockManager, LockManager, SharedExclusiveLockManager};
use crate::pool::{pin_to_cores, StaticThreadPool, WORKER_CORES};
use crate::storage::mvcc::MvccStore;
use crate::storage::{Store, ValueStore};
use crate::txn::{Key, Txn, TxnId, TxnStatus};

/// The concurrency-control protocol a processor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One transaction at a time on the scheduler thread.
    Serial,
    /// Two-phase locking, exclusive locks only.
    LockingExclusive,
    /// Two-phase locking with shared/exclusive locks.
    LockingShared,
    /// Optimistic execution, serial validation on the scheduler thread.
    Occ,
    /// Optimistic execution, parallel validation on the workers.
    OccParallel,
    /// Multi-version timestamp ordering.
    Mvcc,
}

impl Mode {
    pub const ALL: [Mode; 6] = [
        Mode::Serial,
        Mode::LockingExclusive,
        Mode::LockingShared,
        Mode::Occ,
        Mode::OccParallel,
        Mode::Mvcc,
    ];
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Serial => "serial",
            Mode::LockingExclusive => "2pl-x",
            Mode::LockingShared => "2pl-sx",
            Mode::Occ => "occ",
            Mode::OccParallel => "p-occ",
            Mode::Mvcc => "mvcc",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = TxnError;

    fn from_str(s: &str) -> Result<Mode> {
        match s {
            "serial" => Ok(Mode::Serial),
            "2pl-x" => Ok(Mode::LockingExclusive),
            "2pl-sx" => Ok(Mode::LockingShared),
            "occ" => Ok(Mode::Occ),
            "p-occ" => Ok(Mode::OccParallel),
            "mvcc" => Ok(Mode::Mvcc),
            other => Err(TxnError::Internal(format!("unknown mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    /// Worker threads in the pool.
    pub threads: usize,
    /// Keys seeded into the store at startup.
    pub db_size: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            threads: 8,
            db_size: 1_000_000,
        }
    }
}

/// Timestamp source. A single mutex keeps assignment strictly monotonic.
pub(crate) struct IdGen {
    next: Mutex<TxnId>,
}

impl IdGen {
    fn new() -> Self {
        IdGen { next: Mutex::new(1) }
    }

    pub(crate) fn next(&self) -> TxnId {
        let mut next = self.next.lock();
        let id = *next;
        *next += 1;
        id
    }

    /// Guarantees future ids are greater than `ts`.
    pub(crate) fn ensure_above(&self, ts: TxnId) {
        let mut next = self.next.lock();
        if *next <= ts {
            *next = ts + 1;
        }
    }
}

enum Backend {
    Plain(Arc<ValueStore>),
    Mvcc(Arc<MvccStore>),
}

impl Backend {
    fn store(&self) -> Arc<dyn Store> {
        match self {
            Backend::Plain(store) => store.clone(),
            Backend::Mvcc(store) => store.clone(),
        }
    }
}

pub struct TxnProcessor {
    requests: Sender<Txn>,
    results: Receiver<Txn>,
    stop: Sender<()>,
    ids: Arc<IdGen>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl TxnProcessor {
    /// Starts a processor with the default configuration: 8 workers and a
    /// store seeded with 1,000,000 zeroed keys.
    pub fn new(mode: Mode) -> Result<TxnProcessor> {
        Self::with_config(mode, ProcessorConfig::default())
    }

    pub fn with_config(mode: Mode, config: ProcessorConfig) -> Result<TxnProcessor> {
        if config.threads == 0 {
            return Err(TxnError::Internal(
                "thread pool needs at least one worker".into(),
            ));
        }

        let backend = match mode {
            Mode::Mvcc => Backend::Mvcc(Arc::new(MvccStore::new())),
            _ => Backend::Plain(Arc::new(ValueStore::new())),
        };
        backend.store().seed(config.db_size);

        let (requests_tx, requests_rx) = unbounded();
        let (completed_tx, completed_rx) = unbounded();
        let (results_tx, results_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();
        let ids = Arc::new(IdGen::new());

        let scheduler = Scheduler {
            mode,
            backend,
            pool: StaticThreadPool::new(config.threads),
            ids: ids.clone(),
            requests: requests_rx,
            loopback: requests_tx.clone(),
            completed_tx,
            completed: completed_rx,
            results: results_tx,
            stop: stop_rx,
        };
        let handle = std::thread::spawn(move || scheduler.run());

        Ok(TxnProcessor {
            requests: requests_tx,
            results: results_rx,
            stop: stop_tx,
            ids,
            scheduler: Mutex::new(Some(handle)),
        })
    }

    /// Hands ownership of `txn` to the processor under the next timestamp.
    pub fn submit(&self, mut txn: Txn) -> Result<TxnId> {
        let id = self.ids.next();
        txn.id = id;
        self.requests.send(txn).map_err(|_| TxnError::Closed)?;
        Ok(id)
    }

    /// Submits `txn` under a caller-chosen timestamp. Only call this in
    /// test cases; the caller is responsible for keeping ids unique.
    pub fn submit_with_ts(&self, mut txn: Txn, ts: TxnId) -> Result<TxnId> {
        self.ids.ensure_above(ts);
        txn.id = ts;
        self.requests.send(txn).map_err(|_| TxnError::Closed)?;
        Ok(ts)
    }

    /// Blocks until the next transaction reaches a terminal status and
    /// returns it to the caller.
    pub fn next_result(&self) -> Result<Txn> {
        self.results.recv().map_err(|_| TxnError::Closed)
    }

    /// Stops the scheduler and joins it; queued work is abandoned, workers
    /// drain their queues and exit.
    pub fn close(&self) {
        self.stop.send(()).ok();
        if let Some(handle) = self.scheduler.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TxnProcessor {
    fn drop(&mut self) {
        self.close();
    }
}

struct Scheduler {
    mode: Mode,
    backend: Backend,
    pool: StaticThreadPool,
    ids: Arc<IdGen>,
    requests: Receiver<Txn>,
    /// Re-enqueues restarted transactions into the request stream.
    loopback: Sender<Txn>,
    completed_tx: Sender<Txn>,
    completed: Receiver<Txn>,
    results: Sender<Txn>,
    stop: Receiver<()>,
}

/// Stamps the start time, copies the declared keys' current values into the
/// read buffer, and runs the body.
fn execute_txn(store: &dyn Store, txn: &mut Txn) {
    txn.occ_start = Some(Instant::now());
    for &key in txn.readset.iter().chain(txn.writeset.iter()) {
        if let Some(value) = store.read(key, txn.id) {
            txn.reads.insert(key, value);
        }
    }
    txn.run();
}

/// Optimistic validation: no declared key may have been written since this
/// transaction stamped its start time.
fn occ_valid(store: &dyn Store, txn: &Txn) -> bool {
    let start = txn
        .occ_start
        .expect("completed transaction was never executed");
    txn.readset
        .iter()
        .chain(txn.writeset.iter())
        .all(|&key| store.last_write(key).map_or(true, |ts| ts <= start))
}

impl Scheduler {
    fn run(self) {
        pin_to_cores(WORKER_CORES);
        debug!(mode = %self.mode, "scheduler running");
        match self.mode {
            Mode::Serial => self.run_serial(),
            Mode::LockingExclusive | Mode::LockingShared => self.run_locking(),
            Mode::Occ => self.run_occ(),
            Mode::OccParallel => self.run_occ_parallel(),
            Mode::Mvcc => self.run_mvcc(),
        }
        debug!(mode = %self.mode, "scheduler stopped");
    }

    /// Applies buffered writes and marks the terminal status for a
    /// completed transaction whose protocol work is already done.
    fn commit_or_abort(&self, mut txn: Txn) -> Txn {
        match txn.status {
            TxnStatus::CompletedCommit => {
                self.apply_writes(&txn);
                txn.status = TxnStatus::Committed;
            }
            TxnStatus::CompletedAbort => txn.status = TxnStatus::Aborted,
            other => {
                error!(id = txn.id, status = ?other, "invalid completion status");
                panic!("transaction {} completed with invalid status {other:?}", txn.id);
            }
        }
        txn
    }

    fn apply_writes(&self, txn: &Txn) {
        let store = self.backend.store();
        for (&key, &value) in &txn.writes {
            store.write(key, value, txn.id);
        }
    }

    fn restart(&self, mut txn: Txn) {
        let fresh = self.ids.next();
        debug!(old = txn.id, new = fresh, "restarting transaction");
        txn.restart(fresh);
        self.loopback.send(txn).ok();
    }

    fn run_serial(&self) {
        let store = self.backend.store();
        loop {
            crossbeam_channel::select! {
                recv(self.requests) -> msg => {
                    let Ok(mut txn) = msg else { break };
                    execute_txn(store.as_ref(), &mut txn);
                    let txn = self.commit_or_abort(txn);
                    self.results.send(txn).ok();
                }
                recv(self.stop) -> _ => break,
            }
        }
    }

    /// Hands a transaction to the pool for execution; the finished
    /// transaction comes back on the completed queue.
    fn dispatch(&self, mut txn: Txn) {
        let store = self.backend.store();
        let completed = self.completed_tx.clone();
        self.pool.execute(Box::new(move || {
            execute_txn(store.as_ref(), &mut txn);
            completed.send(txn).ok();
        }));
    }

    fn run_locking(&self) {
        let mut lm: Box<dyn LockManager> = match self.mode {
            Mode::LockingExclusive => Box::new(ExclusiveLockManager::new()),
            _ => Box::new(SharedExclusiveLockManager::new()),
        };
        // Single-key transactions waiting for their lock, by id.
        let mut parked: HashMap<TxnId, Txn> = HashMap::new();

        loop {
            crossbeam_channel::select! {
                recv(self.requests) -> msg => {
                    let Ok(txn) = msg else { break };
                    self.admit(lm.as_mut(), &mut parked, txn);
                }
                recv(self.completed) -> msg => {
                    let Ok(txn) = msg else { break };
                    let txn = self.commit_or_abort(txn);
                    for &key in txn.readset.iter().chain(txn.writeset.iter()) {
                        lm.release(txn.id, key);
                    }
                    self.results.send(txn).ok();
                }
                recv(self.stop) -> _ => break,
            }

            while let Some(id) = lm.pop_ready() {
                if let Some(txn) = parked.remove(&id) {
                    self.dispatch(txn);
                }
            }
        }
    }

    /// Requests every declared lock in ascending key order. A transaction
    /// that would block while touching more than one key gives its locks
    /// back and retries under a fresh timestamp instead of waiting.
    fn admit(&self, lm: &mut dyn LockManager, parked: &mut HashMap<TxnId, Txn>, txn: Txn) {
        let id = txn.id;
        let mut acquired: Vec<Key> = Vec::with_capacity(txn.footprint());
        let mut blocked = false;

        for &key in &txn.readset {
            acquired.push(key);
            if !lm.read_lock(id, key) {
                blocked = true;
                break;
            }
        }
        if !blocked {
            for &key in &txn.writeset {
                acquired.push(key);
                if !lm.write_lock(id, key) {
                    blocked = true;
                    break;
                }
            }
        }

        if !blocked {
            self.dispatch(txn);
        } else if txn.footprint() > 1 {
            for &key in &acquired {
                lm.release(id, key);
            }
            self.restart(txn);
        } else {
            parked.insert(id, txn);
        }
    }

    fn run_occ(&self) {
        let store = self.backend.store();
        loop {
            crossbeam_channel::select! {
                recv(self.requests) -> msg => {
                    let Ok(txn) = msg else { break };
                    self.dispatch(txn);
                }
                recv(self.completed) -> msg => {
                    let Ok(txn) = msg else { break };
                    self.validate_completed(store.as_ref(), txn);
                }
                recv(self.stop) -> _ => break,
            }
        }
    }

    fn validate_completed(&self, store: &dyn Store, mut txn: Txn) {
        match txn.status {
            TxnStatus::CompletedAbort => {
                txn.status = TxnStatus::Aborted;
                self.results.send(txn).ok();
            }
            TxnStatus::CompletedCommit if occ_valid(store, &txn) => {
                self.apply_writes(&txn);
                txn.status = TxnStatus::Committed;
                self.results.send(txn).ok();
            }
            TxnStatus::CompletedCommit => self.restart(txn),
            other => {
                error!(id = txn.id, status = ?other, "invalid completion status");
                panic!("transaction {} completed with invalid status {other:?}", txn.id);
            }
        }
    }

    fn run_occ_parallel(&self) {
        // Write sets of transactions currently validating or committing.
        let active: Arc<Mutex<HashMap<TxnId, Arc<BTreeSet<Key>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        loop {
            crossbeam_channel::select! {
                recv(self.requests) -> msg => {
                    let Ok(txn) = msg else { break };
                    self.dispatch_parallel(&active, txn);
                }
                recv(self.stop) -> _ => break,
            }
        }
    }

    /// P-OCC worker: execute, then validate against the store and against
    /// every transaction that was mid-validation when this one registered.
    fn dispatch_parallel(
        &self,
        active: &Arc<Mutex<HashMap<TxnId, Arc<BTreeSet<Key>>>>>,
        mut txn: Txn,
    ) {
        let store = self.backend.store();
        let results = self.results.clone();
        let requests = self.loopback.clone();
        let ids = self.ids.clone();
        let active = active.clone();

        self.pool.execute(Box::new(move || {
            execute_txn(store.as_ref(), &mut txn);
            match txn.status {
                TxnStatus::CompletedAbort => {
                    txn.status = TxnStatus::Aborted;
                    results.send(txn).ok();
                    return;
                }
                TxnStatus::CompletedCommit => {}
                other => {
                    error!(id = txn.id, status = ?other, "invalid completion status");
                    panic!(
                        "transaction {} completed with invalid status {other:?}",
                        txn.id
                    );
                }
            }

            // Register before validating so a concurrent committer is seen
            // either in the snapshot or through the store timestamps.
            let snapshot: Vec<Arc<BTreeSet<Key>>> = {
                let mut set = active.lock();
                let snapshot = set.values().cloned().collect();
                set.insert(txn.id, Arc::new(txn.writeset.clone()));
                snapshot
            };

            let valid = occ_valid(store.as_ref(), &txn)
                && snapshot.iter().all(|writeset| {
                    writeset.is_disjoint(&txn.readset) && writeset.is_disjoint(&txn.writeset)
                });

            if valid {
                for (&key, &value) in &txn.writes {
                    store.write(key, value, txn.id);
                }
                txn.status = TxnStatus::Committed;
                active.lock().remove(&txn.id);
                results.send(txn).ok();
            } else {
                active.lock().remove(&txn.id);
                let fresh = ids.next();
                debug!(old = txn.id, new = fresh, "restarting transaction");
                txn.restart(fresh);
                requests.send(txn).ok();
            }
        }));
    }

    fn run_mvcc(&self) {
        loop {
            crossbeam_channel::select! {
                recv(self.requests) -> msg => {
                    let Ok(txn) = msg else { break };
                    self.dispatch_mvcc(txn);
                }
                recv(self.stop) -> _ => break,
            }
        }
    }

    /// MVCC worker: versioned reads, body, then an atomic
    /// validate-and-apply of the write set under the per-key locks.
    fn dispatch_mvcc(&self, mut txn: Txn) {
        let Backend::Mvcc(store) = &self.backend else {
            unreachable!("mvcc scheduler over a single-version store");
        };
        let store = store.clone();
        let results = self.results.clone();
        let requests = self.loopback.clone();
        let ids = self.ids.clone();

        self.pool.execute(Box::new(move || {
            execute_txn(&*store, &mut txn);
            match txn.status {
                TxnStatus::CompletedAbort => {
                    txn.status = TxnStatus::Aborted;
                    results.send(txn).ok();
                }
                TxnStatus::CompletedCommit => {
                    if store.try_apply(&txn.writeset, &txn.writes, txn.id) {
                        txn.status = TxnStatus::Committed;
                        results.send(txn).ok();
                    } else {
                        let fresh = ids.next();
                        debug!(old = txn.id, new = fresh, "restarting transaction");
                        txn.restart(fresh);
                        requests.send(txn).ok();
                    }
                }
                other => {
                    error!(id = txn.id, status = ?other, "invalid completion status");
                    panic!(
                        "transaction {} completed with invalid status {other:?}",
                        txn.id
                    );
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let ids = IdGen::new();
        let a = ids.next();
        let b = ids.next();
        let c = ids.next();
        assert!(a < b && b < c);
        assert_eq!(a, 1);
    }

    #[test]
    fn ensure_above_skips_reserved_timestamps() {
        let ids = IdGen::new();
        ids.ensure_above(10);
        assert_eq!(ids.next(), 11);
        ids.ensure_above(5);
        assert_eq!(ids.next(), 12);
    }

    #[test]
    fn mode_names_round_trip() {
        for mode in Mode::ALL {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert!("paxos".parse::<Mode>().is_err());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = ProcessorConfig {
            threads: 0,
            db_size: 10,
        };
        assert!(TxnProcessor::with_config(Mode::Serial, config).is_err());
    }
}
