//! Fixed-size worker pools fed by a private FIFO queue.
//!
//! Every pipeline stage owns one pool. A job is a closure returning
//! `Result<(), AppError>`; errors and panics are captured per job, logged,
//! counted, and the worker moves on to the next job.

use crate::error::AppError;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

pub type Job = Box<dyn FnOnce() -> Result<(), AppError> + Send + 'static>;

/// What `submit` does when the queue is at capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until a worker frees a slot.
    #[default]
    Block,
    /// Discard the oldest queued job to make room.
    DropOldest,
    /// Refuse the new job with `AppError::QueueFull`.
    Reject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            capacity: 1024,
            overflow: OverflowPolicy::Block,
        }
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed,
    Failed(AppError),
    Panicked(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

/// Present while the pool accepts jobs. Dropping it closes the pool: the
/// job sender goes away and `closed` disconnects, waking every worker.
struct OpenQueue {
    jobs: Sender<Job>,
    _closed: Sender<()>,
}

struct PoolShared {
    name: String,
    overflow: OverflowPolicy,
    // Held for the whole of a send, so no job can slip in after shutdown.
    open: Mutex<Option<OpenQueue>>,
    // Kept so DropOldest can evict from the head of the queue.
    receiver: Receiver<Job>,
    closed: Receiver<()>,
    counters: Counters,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle to a running pool. Clones share the same queue and workers.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(name: &str, config: PoolConfig) -> Result<Self, AppError> {
        if config.workers == 0 {
            return Err(AppError::Config(format!("pool '{}' needs at least one worker", name)));
        }
        if config.capacity == 0 {
            return Err(AppError::Config(format!("pool '{}' needs a queue capacity of at least one", name)));
        }

        let (sender, receiver) = crossbeam_channel::bounded::<Job>(config.capacity);
        let (closed_tx, closed_rx) = crossbeam_channel::bounded::<()>(0);
        let shared = Arc::new(PoolShared {
            name: name.to_string(),
            overflow: config.overflow,
            open: Mutex::new(Some(OpenQueue {
                jobs: sender,
                _closed: closed_tx,
            })),
            receiver,
            closed: closed_rx,
            counters: Counters::default(),
            handles: Mutex::new(Vec::with_capacity(config.workers)),
        });

        let mut handles = Vec::with_capacity(config.workers);
        for n in 0..config.workers {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, n))
                .spawn(move || worker_loop(worker_shared))?;
            handles.push(handle);
        }
        *lock(&shared.handles) = handles;

        Ok(Self { shared })
    }

    /// Single worker, default capacity, blocking on overflow.
    pub fn single(name: &str) -> Result<Self, AppError> {
        Self::new(name, PoolConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn submit<F>(&self, job: F) -> Result<(), AppError>
    where
        F: FnOnce() -> Result<(), AppError> + Send + 'static,
    {
        self.submit_boxed(Box::new(job))
    }

    pub fn submit_boxed(&self, job: Job) -> Result<(), AppError> {
        let shared = &self.shared;
        let open = lock(&shared.open);
        let sender = &open
            .as_ref()
            .ok_or_else(|| AppError::PoolClosed(shared.name.clone()))?
            .jobs;

        let result = match shared.overflow {
            OverflowPolicy::Block => sender
                .send(job)
                .map_err(|_| AppError::PoolClosed(shared.name.clone())),
            OverflowPolicy::Reject => match sender.try_send(job) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(pool = %shared.name, "queue full, job rejected");
                    Err(AppError::QueueFull(shared.name.clone()))
                }
                Err(TrySendError::Disconnected(_)) => Err(AppError::PoolClosed(shared.name.clone())),
            },
            OverflowPolicy::DropOldest => {
                let mut job = job;
                loop {
                    match sender.try_send(job) {
                        Ok(()) => break Ok(()),
                        Err(TrySendError::Full(back)) => {
                            job = back;
                            if shared.receiver.try_recv().is_ok() {
                                shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                                warn!(pool = %shared.name, "queue full, oldest job dropped");
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            break Err(AppError::PoolClosed(shared.name.clone()))
                        }
                    }
                }
            }
        };

        if result.is_ok() {
            shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            queued: self.shared.receiver.len(),
        }
    }

    /// Stops accepting jobs, lets the workers drain what is queued and joins them.
    /// Every job whose `submit` returned `Ok` runs before this returns.
    /// Safe to call from any clone; later calls are no-ops.
    pub fn shutdown(&self) {
        lock(&self.shared.open).take();
        let handles: Vec<JoinHandle<()>> = lock(&self.shared.handles).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!(pool = %self.shared.name, "worker thread exited abnormally");
            }
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        crossbeam_channel::select! {
            recv(shared.receiver) -> job => match job {
                Ok(job) => record(&shared, run_job(job)),
                Err(_) => break,
            },
            recv(shared.closed) -> _ => {
                // Closed: nothing new can arrive, finish what is queued.
                while let Ok(job) = shared.receiver.try_recv() {
                    record(&shared, run_job(job));
                }
                break;
            }
        }
    }
    debug!(pool = %shared.name, "worker stopped");
}

fn record(shared: &PoolShared, outcome: JobOutcome) {
    match outcome {
        JobOutcome::Completed => {
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        JobOutcome::Failed(err) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(pool = %shared.name, "job failed: {}", err);
        }
        JobOutcome::Panicked(msg) => {
            shared.counters.panicked.fetch_add(1, Ordering::Relaxed);
            error!(pool = %shared.name, "job panicked: {}", msg);
        }
    }
}

pub fn run_job(job: Job) -> JobOutcome {
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => JobOutcome::Completed,
        Ok(Err(err)) => JobOutcome::Failed(err),
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "non-string panic payload".to_string()
            };
            JobOutcome::Panicked(msg)
        }
    }
}

// A job panicking never happens while one of these locks is held, but a
// poisoned lock must not take the pool down with it.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_single_worker_runs_jobs_in_submission_order() {
        let pool = WorkerPool::single("fifo").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..1000 {
            let order = Arc::clone(&order);
            pool.submit(move || {
                order.lock().unwrap().push(i);
                Ok(())
            })
            .unwrap();
        }
        pool.shutdown();

        let order = order.lock().unwrap();
        assert_eq!(*order, (0..1000).collect::<Vec<_>>());
        assert_eq!(pool.stats().completed, 1000);
    }

    #[test]
    fn test_failed_job_does_not_stop_worker() {
        let pool = WorkerPool::single("failing").unwrap();
        let (tx, rx) = mpsc::channel();

        pool.submit(|| Err(AppError::from("boom"))).unwrap();
        pool.submit(move || {
            tx.send("after").unwrap();
            Ok(())
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "after");
        pool.shutdown();
        let stats = pool.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_panicking_job_does_not_stop_worker() {
        let pool = WorkerPool::single("panicking").unwrap();
        let (tx, rx) = mpsc::channel();

        pool.submit(|| panic!("bad image")).unwrap();
        pool.submit(move || {
            tx.send(42).unwrap();
            Ok(())
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        pool.shutdown();
        assert_eq!(pool.stats().panicked, 1);
    }

    #[test]
    fn test_run_job_reports_panic_message() {
        match run_job(Box::new(|| -> Result<(), AppError> { panic!("decoder exploded") })) {
            JobOutcome::Panicked(msg) => assert_eq!(msg, "decoder exploded"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    /// Occupies the single worker until the returned sender is used.
    fn hold_worker(pool: &WorkerPool) -> mpsc::Sender<()> {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        pool.submit(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            Ok(())
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx
    }

    #[test]
    fn test_reject_policy_refuses_when_full() {
        let pool = WorkerPool::new(
            "reject",
            PoolConfig {
                workers: 1,
                capacity: 1,
                overflow: OverflowPolicy::Reject,
            },
        )
        .unwrap();
        let release = hold_worker(&pool);

        pool.submit(|| Ok(())).unwrap();
        let err = pool.submit(|| Ok(())).unwrap_err();
        assert!(matches!(err, AppError::QueueFull(ref name) if name == "reject"));

        release.send(()).unwrap();
        pool.shutdown();
        let stats = pool.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.completed, 2);
    }

    #[test]
    fn test_drop_oldest_policy_evicts_head_of_queue() {
        let pool = WorkerPool::new(
            "drop",
            PoolConfig {
                workers: 1,
                capacity: 2,
                overflow: OverflowPolicy::DropOldest,
            },
        )
        .unwrap();
        let release = hold_worker(&pool);
        let ran = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let ran = Arc::clone(&ran);
            pool.submit(move || {
                ran.lock().unwrap().push(i);
                Ok(())
            })
            .unwrap();
        }

        release.send(()).unwrap();
        pool.shutdown();
        assert_eq!(*ran.lock().unwrap(), vec![2, 3]);
        assert_eq!(pool.stats().dropped, 2);
    }

    #[test]
    fn test_block_policy_waits_for_space() {
        let pool = WorkerPool::new(
            "block",
            PoolConfig {
                workers: 1,
                capacity: 1,
                overflow: OverflowPolicy::Block,
            },
        )
        .unwrap();
        let release = hold_worker(&pool);
        pool.submit(|| Ok(())).unwrap();

        let producer_pool = pool.clone();
        let (done_tx, done_rx) = mpsc::channel();
        let producer = thread::spawn(move || {
            producer_pool.submit(|| Ok(())).unwrap();
            done_tx.send(()).unwrap();
        });

        // Queue is full and the worker is held, so the producer stays blocked.
        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());

        release.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        producer.join().unwrap();
        pool.shutdown();
        assert_eq!(pool.stats().completed, 3);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::single("closed").unwrap();
        pool.shutdown();
        let err = pool.submit(|| Ok(())).unwrap_err();
        assert!(matches!(err, AppError::PoolClosed(_)));
    }

    #[test]
    fn test_zero_workers_is_a_config_error() {
        let result = WorkerPool::new(
            "empty",
            PoolConfig {
                workers: 0,
                ..PoolConfig::default()
            },
        );
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_multiple_workers_run_concurrently() {
        let pool = WorkerPool::new(
            "wide",
            PoolConfig {
                workers: 2,
                ..PoolConfig::default()
            },
        )
        .unwrap();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let (tx, rx) = mpsc::channel();

        for _ in 0..2 {
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            pool.submit(move || {
                barrier.wait();
                tx.send(()).unwrap();
                Ok(())
            })
            .unwrap();
        }

        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        pool.shutdown();
    }

    #[test]
    fn test_every_accepted_job_runs_when_shutdown_races_submit() {
        let pool = WorkerPool::new(
            "racing",
            PoolConfig {
                workers: 2,
                capacity: 16,
                overflow: OverflowPolicy::Block,
            },
        )
        .unwrap();
        let ran = Arc::new(AtomicU64::new(0));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let ran = Arc::clone(&ran);
                thread::spawn(move || {
                    let mut accepted = 0u64;
                    for _ in 0..500 {
                        let ran = Arc::clone(&ran);
                        let submitted = pool.submit(move || {
                            ran.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                        if submitted.is_ok() {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(5));
        pool.shutdown();
        let accepted: u64 = producers.into_iter().map(|p| p.join().unwrap()).sum();

        assert_eq!(ran.load(Ordering::SeqCst), accepted);
        assert_eq!(pool.stats().submitted, accepted);
        assert_eq!(pool.stats().completed, accepted);
        assert_eq!(pool.stats().queued, 0);
    }
}
