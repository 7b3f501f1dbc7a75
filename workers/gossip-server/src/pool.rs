//! The bounded worker pool outbound pushes run on
//!
//! The producer never blocks: when the queue is full the oldest pending job
//! is discarded to make room. A stale push is worse than a missed one; the
//! peer it was bound for will be picked again within a period or two.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Mutex,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, warn};

use crate::errors::GossipError;

/// The number of jobs the pool queues before discarding the oldest
pub const POOL_CAPACITY: usize = 1024;
/// The number of worker threads serving the queue
pub const POOL_WORKERS: usize = 30;
/// How long a worker sleeps between drain checks during shutdown
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// A unit of push work
type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded pool with drop-oldest overflow
pub struct WorkerPool {
    /// The producer half of the job queue; taken (and dropped) at shutdown
    /// to disconnect the workers
    sender: Mutex<Option<Sender<Job>>>,
    /// A producer-side handle on the queue, used to discard the oldest
    /// pending job when the queue is full
    overflow: Receiver<Job>,
    /// The worker threads
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn a pool with the given queue capacity and worker count
    pub fn new(name: &str, capacity: usize, n_workers: usize) -> Result<Self, GossipError> {
        let (sender, receiver) = bounded::<Job>(capacity);

        let mut workers = Vec::with_capacity(n_workers);
        for index in 0..n_workers {
            let jobs = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || Self::worker_loop(jobs))
                .map_err(|err| GossipError::Setup(err.to_string()))?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            overflow: receiver,
            workers: Mutex::new(workers),
        })
    }

    /// Submit a job, discarding the oldest pending job if the queue is full
    ///
    /// Submission after shutdown is a silent no-op
    pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) {
        let sender = self.sender.lock().expect("pool sender lock poisoned");
        let sender = match sender.as_ref() {
            Some(sender) => sender,
            None => return,
        };

        let mut job: Job = Box::new(job);
        loop {
            match sender.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(bounced)) => {
                    // Make room by discarding the oldest queued job; a racing
                    // worker may have already taken it, in which case the
                    // retry simply succeeds
                    if self.overflow.try_recv().is_ok() {
                        debug!("worker pool full, discarded oldest pending push");
                    }
                    job = bounced;
                },
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Drain and stop the pool, waiting up to `grace` for queued jobs
    ///
    /// Jobs still queued when the grace expires are discarded
    pub fn shutdown(&self, grace: Duration) {
        // Disconnect producers so workers exit once the queue drains
        drop(self.sender.lock().expect("pool sender lock poisoned").take());

        let deadline = Instant::now() + grace;
        while !self.overflow.is_empty() && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL);
        }

        // Discard whatever outlived the grace period
        let mut discarded = 0;
        while self.overflow.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!("discarded {discarded} queued pushes at pool shutdown");
        }

        let mut workers = self.workers.lock().expect("pool workers lock poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// The loop each worker thread runs
    ///
    /// A panicking job is logged and the worker keeps serving; the pool is
    /// never poisoned by one bad push
    fn worker_loop(jobs: Receiver<Job>) {
        for job in jobs.iter() {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("push job panicked, worker continuing");
            }
        }
    }
}
