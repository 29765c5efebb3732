// Execution contexts - where completions and list patches run

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere a job can be scheduled.
pub trait ExecutionContext: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs every job inline on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Immediate;

impl ExecutionContext for Immediate {
    fn execute(&self, job: Job) {
        job();
    }
}

/// A queue of jobs pumped by its owner, typically a UI main loop.
///
/// Jobs run in the order they were scheduled, on whichever thread calls
/// [`QueueContext::run_pending`].
#[derive(Default)]
pub struct QueueContext {
    jobs: Mutex<VecDeque<Job>>,
}

impl QueueContext {
    pub fn new() -> Arc<Self> {
        Arc::new(QueueContext::default())
    }

    /// Run every queued job, including jobs scheduled by the jobs themselves.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }
}

impl ExecutionContext for QueueContext {
    fn execute(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }
}
