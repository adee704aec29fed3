//! Background job queue.
//!
//! Moves slow work off the reactor thread. There is one worker thread per
//! [`JobClass`], each draining its own FIFO queue:
//! - `close`: closing descriptors whose last reference may trigger an unlink
//! - `fsync`: flushing files to stable storage
//! - `lazyfree`: dropping large values and whole keyspaces
//!
//! Submitters never learn when a particular job finished; they can only wait
//! for a class to make progress ([`BackgroundJobs::wait_step`]) or to drain
//! ([`BackgroundJobs::wait_drained`]).

pub mod job;

use std::collections::VecDeque;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::BioConfig;

pub use self::job::{Job, JobClass, JobKind, LazyFree};

#[derive(Error, Debug)]
pub enum BioError {
    #[error("failed to spawn {class} worker: {source}")]
    Spawn {
        class: JobClass,
        #[source]
        source: io::Error,
    },
}

#[derive(Default)]
struct ClassState {
    jobs: VecDeque<Job>,
    /// Queued plus running.
    pending: u64,
    processed: u64,
    failed: u64,
    panicked: u64,
    shutdown: bool,
}

#[derive(Default)]
struct ClassQueue {
    state: Mutex<ClassState>,
    new_job: Condvar,
    step_done: Condvar,
}

/// Counters since start.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BioStats {
    pub closed: u64,
    pub fsynced: u64,
    pub lazy_freed: u64,
    pub fsync_failures: u64,
    /// Jobs of any class that panicked. The worker survives them.
    pub panicked: u64,
    pub pending: u64,
}

pub struct BackgroundJobs {
    queues: [Arc<ClassQueue>; 3],
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundJobs {
    /// Spawn one worker per class.
    pub fn start(config: &BioConfig) -> Result<Self, BioError> {
        let jobs = Self {
            queues: Default::default(),
            workers: Mutex::new(Vec::with_capacity(JobClass::ALL.len())),
        };

        for class in JobClass::ALL {
            let queue = Arc::clone(&jobs.queues[class.index()]);
            let handle = thread::Builder::new()
                .name(format!("bio-{}", class.name()))
                .stack_size(config.thread_stack_size)
                .spawn(move || worker_loop(class, queue))
                // Dropping `jobs` joins the workers spawned so far.
                .map_err(|source| BioError::Spawn { class, source })?;
            jobs.workers.lock().push(handle);
        }

        info!(
            workers = JobClass::ALL.len(),
            stack_size = config.thread_stack_size,
            "Background jobs started"
        );
        Ok(jobs)
    }

    fn queue(&self, class: JobClass) -> &ClassQueue {
        &self.queues[class.index()]
    }

    /// Queue `job` on its class. After shutdown the job runs inline.
    pub fn submit(&self, job: Job) {
        let class = job.class();
        let queue = self.queue(class);
        let mut state = queue.state.lock();
        if state.shutdown {
            drop(state);
            warn!(class = %class, "Job submitted after shutdown, running inline");
            if let Err(e) = job.run() {
                warn!(class = %class, error = %e, "Background job failed");
            }
            return;
        }
        state.jobs.push_back(job);
        state.pending += 1;
        queue.new_job.notify_one();
        debug!(class = %class, pending = state.pending, "Job queued");
    }

    /// Jobs of `class` queued or running.
    pub fn pending(&self, class: JobClass) -> u64 {
        self.queue(class).state.lock().pending
    }

    /// Block until one job of `class` completes, or return at once if none is
    /// pending. Returns the pending count afterwards.
    pub fn wait_step(&self, class: JobClass) -> u64 {
        let queue = self.queue(class);
        let mut state = queue.state.lock();
        if state.pending > 0 {
            queue.step_done.wait(&mut state);
        }
        state.pending
    }

    /// Block until every job of `class` submitted so far has completed.
    pub fn wait_drained(&self, class: JobClass) {
        let queue = self.queue(class);
        let mut state = queue.state.lock();
        while state.pending > 0 {
            queue.step_done.wait(&mut state);
        }
    }

    pub fn stats(&self) -> BioStats {
        let mut stats = BioStats::default();
        for class in JobClass::ALL {
            let state = self.queue(class).state.lock();
            stats.pending += state.pending;
            stats.panicked += state.panicked;
            match class {
                JobClass::CloseFile => stats.closed = state.processed,
                JobClass::Fsync => {
                    stats.fsynced = state.processed;
                    stats.fsync_failures = state.failed;
                }
                JobClass::LazyFree => stats.lazy_freed = state.processed,
            }
        }
        stats
    }

    /// Let workers finish what is queued, then join them. Idempotent.
    pub fn shutdown(&self) {
        for queue in &self.queues {
            queue.state.lock().shutdown = true;
            queue.new_job.notify_all();
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            if handle.join().is_err() {
                warn!("Background worker panicked");
            }
        }
        info!("Background jobs stopped");
    }
}

impl Drop for BackgroundJobs {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BackgroundJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundJobs")
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(class: JobClass, queue: Arc<ClassQueue>) {
    debug!(class = %class, "Background worker running");
    loop {
        let job = {
            let mut state = queue.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break Some(job);
                }
                if state.shutdown {
                    break None;
                }
                queue.new_job.wait(&mut state);
            }
        };
        let Some(job) = job else {
            break;
        };

        // A panicking job still completes its step.
        let (failed, panicked) = match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
            Ok(Ok(())) => (false, false),
            Ok(Err(e)) => {
                warn!(class = %class, error = %e, "Background job failed");
                (true, false)
            }
            Err(payload) => {
                error!(class = %class, panic = panic_message(payload.as_ref()), "Background job panicked");
                (true, true)
            }
        };

        let mut state = queue.state.lock();
        state.pending -= 1;
        state.processed += 1;
        if failed {
            state.failed += 1;
        }
        if panicked {
            state.panicked += 1;
        }
        queue.step_done.notify_all();
    }
    debug!(class = %class, "Background worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
