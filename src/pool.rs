use crate::error::ProcessingError;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

type Job = BoxFuture<'static, ()>;

/// What a bounded pool does with work submitted while its queue is full.
///
/// `Discard` and `DiscardOldest` drop work silently; that is their documented
/// behavior, not a lost-failure bug. Every other policy either runs the work
/// or surfaces a rejection failure to the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RejectionPolicy {
    /// Fail the submission with a rejection error.
    #[default]
    Abort,
    /// Run the job inline on the submitting task.
    CallerRuns,
    /// Wait until queue space frees up.
    Block,
    /// Drop the new job.
    Discard,
    /// Drop the oldest queued job, enqueue the new one.
    DiscardOldest,
}

/// Named configuration for a [`TaskExecutor`], loadable from serialized
/// route configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolProfile {
    pub name: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub rejection: RejectionPolicy,
}

impl PoolProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: 4,
            queue_capacity: 64,
            rejection: RejectionPolicy::default(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn rejection(mut self, rejection: RejectionPolicy) -> Self {
        self.rejection = rejection;
        self
    }
}

struct PoolInner {
    name: String,
    queue: Mutex<VecDeque<Job>>,
    capacity: usize,
    rejection: RejectionPolicy,
    work_ready: Notify,
    space_ready: Notify,
    shutdown: AtomicBool,
}

/// A bounded worker pool for fan-out branch execution.
///
/// Workers are plain tokio tasks pulling jobs off a bounded queue, so the
/// executor must be created inside a runtime. Dropping the executor stops
/// the workers once the queue drains.
pub struct TaskExecutor {
    inner: Arc<PoolInner>,
}

impl TaskExecutor {
    pub fn new(profile: PoolProfile) -> Self {
        let inner = Arc::new(PoolInner {
            name: profile.name,
            queue: Mutex::new(VecDeque::new()),
            capacity: profile.queue_capacity,
            rejection: profile.rejection,
            work_ready: Notify::new(),
            space_ready: Notify::new(),
            shutdown: AtomicBool::new(false),
        });
        for _ in 0..profile.workers.max(1) {
            let worker = inner.clone();
            tokio::spawn(async move {
                loop {
                    let job = worker.queue.lock().expect("pool queue poisoned").pop_front();
                    match job {
                        Some(job) => {
                            worker.space_ready.notify_one();
                            job.await;
                        }
                        None => {
                            if worker.shutdown.load(Ordering::Acquire) {
                                return;
                            }
                            worker.work_ready.notified().await;
                        }
                    }
                }
            });
        }
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Submits a job, applying the pool's rejection policy when the queue is
    /// full. `Err` is only returned under the `Abort` policy.
    pub async fn submit<F>(&self, job: F) -> Result<(), ProcessingError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(job);
        loop {
            {
                let mut queue = self.inner.queue.lock().expect("pool queue poisoned");
                if queue.len() < self.inner.capacity {
                    queue.push_back(job);
                    drop(queue);
                    self.inner.work_ready.notify_one();
                    return Ok(());
                }
                match self.inner.rejection {
                    RejectionPolicy::Abort => {
                        return Err(ProcessingError::rejected(format!(
                            "pool '{}' queue full",
                            self.inner.name
                        )));
                    }
                    RejectionPolicy::Discard => {
                        log::debug!("pool '{}' discarding submitted job", self.inner.name);
                        return Ok(());
                    }
                    RejectionPolicy::DiscardOldest => {
                        log::debug!("pool '{}' discarding oldest queued job", self.inner.name);
                        queue.pop_front();
                        queue.push_back(job);
                        drop(queue);
                        self.inner.work_ready.notify_one();
                        return Ok(());
                    }
                    RejectionPolicy::CallerRuns | RejectionPolicy::Block => {}
                }
            }
            match self.inner.rejection {
                RejectionPolicy::CallerRuns => {
                    job.await;
                    return Ok(());
                }
                RejectionPolicy::Block => {
                    self.inner.space_ready.notified().await;
                }
                _ => unreachable!("terminal policies handled under the lock"),
            }
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.work_ready.notify_waiters();
    }
}
