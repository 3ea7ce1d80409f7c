//! Fixed pool of worker threads executing transaction bodies.
//!
//! Each worker owns one unbounded task queue; dispatch picks a queue at
//! random. Workers block on their queue, drain whatever remains once the
//! pool shuts down, and exit.

use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use rand::Rng;
use tracing::debug;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cores the worker and scheduler threads are confined to; the benchmark
/// harness keeps the remaining core for itself.
pub const WORKER_CORES: &[usize] = &[0, 1, 2, 3, 4, 5, 6];

pub struct StaticThreadPool {
    queues: Vec<Sender<Task>>,
    threads: Vec<JoinHandle<()>>,
}

impl StaticThreadPool {
    pub fn new(thread_count: usize) -> Self {
        let mut queues = Vec::with_capacity(thread_count);
        let mut threads = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            let (tx, rx) = unbounded::<Task>();
            queues.push(tx);
            threads.push(std::thread::spawn(move || {
                pin_to_cores(WORKER_CORES);
                while let Ok(task) = rx.recv() {
                    task();
                }
            }));
        }
        debug!(workers = thread_count, "thread pool started");
        StaticThreadPool { queues, threads }
    }

    /// Hands `task` to a randomly chosen worker.
    pub fn execute(&self, task: Task) {
        let slot = rand::thread_rng().gen_range(0..self.queues.len());
        self.queues[slot].send(task).ok();
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

impl Drop for StaticThreadPool {
    fn drop(&mut self) {
        self.queues.clear();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Restricts the calling thread to the given cores. Best effort; a no-op
/// off Linux or when the machine has fewer cores than requested.
#[cfg(target_os = "linux")]
pub fn pin_to_cores(cores: &[usize]) {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        let mut any = false;
        for &core in cores {
            if core < available {
                libc::CPU_SET(core, &mut set);
                any = true;
            }
        }
        if any {
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_cores(_cores: &[usize]) {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn executes_every_task() {
        let pool = StaticThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = unbounded();
        for _ in 0..100 {
            let counter = counter.clone();
            let done = done_tx.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                done.send(()).ok();
            }));
        }
        for _ in 0..100 {
            done_rx.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn drop_drains_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = StaticThreadPool::new(1);
            for _ in 0..50 {
                let counter = counter.clone();
                pool.execute(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
