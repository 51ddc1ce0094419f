use crate::executors::JobHandle;
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use std::{
    fmt,
    marker::PhantomData,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, Error, PartialEq)]
/// Failures delivered through a [`JobFuture`]
pub enum JobError {
    /// the task itself failed on the remote host
    #[error("Remote exception:\n{}", trimmed(.0))]
    RemoteException(String),
    /// the scheduler reported the job as finished but it never wrote a result
    #[error("Cluster job {job} finished without writing a result")]
    JobDied { job: JobHandle },
    /// the result exists but can't be read as the requested type
    #[error("Failed to decode job result: {0}")]
    Decode(String),
    /// only the local wait gave up, the remote job keeps running
    #[error("Timed out waiting for the job result")]
    Timeout,
}

fn trimmed(trace: &str) -> &str {
    trace.trim()
}

pub(crate) type Resolution = Result<serde_yaml::Value, JobError>;
type Listener = Box<dyn FnOnce() + Send>;

/// Completion listeners of a settled promise which still have to run
#[must_use]
pub(crate) struct Listeners(Vec<Listener>);

impl Listeners {
    /// Run the listeners, never with the slot lock held so they are free to inspect the future
    pub(crate) fn notify(self) {
        for listener in self.0 {
            listener();
        }
    }
}

#[derive(Default)]
struct Slot {
    resolution: Option<Resolution>,
    listeners: Vec<Listener>,
}

#[derive(Default)]
/// Write-once container shared between the executor and all future handles
pub(crate) struct Promise {
    slot: Mutex<Slot>,
    resolved: Condvar,
}

impl Promise {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store the resolution, wake all waiters and run the listeners, returns false if the
    /// promise was resolved before
    #[cfg(test)]
    fn resolve(&self, resolution: Resolution) -> bool {
        match self.settle(resolution) {
            Some(listeners) => {
                listeners.notify();
                true
            }
            None => false,
        }
    }

    /// Store the resolution and wake all waiters but leave running the completion listeners
    /// to the caller, so a resolution can happen under a lock the listeners may take
    pub(crate) fn settle(&self, resolution: Resolution) -> Option<Listeners> {
        let mut slot = self.slot.lock();

        if slot.resolution.is_some() {
            return None;
        }

        slot.resolution = Some(resolution);
        self.resolved.notify_all();

        Some(Listeners(std::mem::take(&mut slot.listeners)))
    }

    fn is_resolved(&self) -> bool {
        self.slot.lock().resolution.is_some()
    }

    fn wait(&self, deadline: Option<Instant>) -> Option<Resolution> {
        let mut slot = self.slot.lock();

        loop {
            if let Some(resolution) = slot.resolution.as_ref() {
                return Some(resolution.clone());
            }

            match deadline {
                Some(deadline) => {
                    if self.resolved.wait_until(&mut slot, deadline).timed_out() {
                        return slot.resolution.clone();
                    }
                }
                None => self.resolved.wait(&mut slot),
            }
        }
    }

    fn on_resolve(&self, listener: Listener) {
        {
            let mut slot = self.slot.lock();

            if slot.resolution.is_none() {
                slot.listeners.push(listener);
                return;
            }
        }

        listener()
    }
}

/// Handle to the result of a submitted task
///
/// Handles are cheap to clone and all of them observe the same result, which can be read any
/// number of times.
pub struct JobFuture<T> {
    job: JobHandle,
    promise: Arc<Promise>,
    _output: PhantomData<fn() -> T>,
}

impl<T> Clone for JobFuture<T> {
    fn clone(&self) -> Self {
        Self {
            job: self.job,
            promise: self.promise.clone(),
            _output: PhantomData,
        }
    }
}

impl<T> fmt::Debug for JobFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobFuture")
            .field("job", &self.job)
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> JobFuture<T> {
    pub(crate) fn new(job: JobHandle, promise: Arc<Promise>) -> Self {
        Self {
            job,
            promise,
            _output: PhantomData,
        }
    }

    /// The scheduler's handle of the job computing this result
    pub fn job(&self) -> JobHandle {
        self.job
    }

    pub fn is_done(&self) -> bool {
        self.promise.is_resolved()
    }

    /// Call `listener` once the future is resolved, immediately if it already is
    ///
    /// Listeners run on the thread resolving the future and must not block.
    pub fn on_complete(&self, listener: impl FnOnce() + Send + 'static) {
        self.promise.on_resolve(Box::new(listener))
    }
}

impl<T: DeserializeOwned> JobFuture<T> {
    /// Block until the job finished
    pub fn wait(&self) -> Result<T, JobError> {
        match self.promise.wait(None) {
            Some(resolution) => decode(resolution),
            // waiting without a deadline only returns once resolved
            None => Err(JobError::Timeout),
        }
    }

    /// Block until the job finished or `timeout` passed, the job itself is not affected by
    /// the timeout
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, JobError> {
        match self.promise.wait(Some(Instant::now() + timeout)) {
            Some(resolution) => decode(resolution),
            None => {
                trace!(job = %self.job, "Wait timed out");
                Err(JobError::Timeout)
            }
        }
    }

    /// The result if the job already finished
    pub fn try_get(&self) -> Option<Result<T, JobError>> {
        self.promise
            .wait(Some(Instant::now()))
            .map(decode)
    }
}

fn decode<T: DeserializeOwned>(resolution: Resolution) -> Result<T, JobError> {
    serde_yaml::from_value(resolution?).map_err(|error| JobError::Decode(error.to_string()))
}
