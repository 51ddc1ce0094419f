//! Completion detection
//!
//! A single background thread ticks at a fixed interval and evaluates a list of
//! [`WaitStrategy`]s against the set of outstanding jobs. Whenever a strategy reports a job as
//! finished, the job is removed from the wait set and the completion callback is invoked for
//! it, so each job is delivered at most once.

pub mod condor_log;
pub mod marker;
pub mod slurm_queue;

use crate::{executors::JobHandle, shell::ShellError};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

pub use condor_log::CondorLogStrategy;
pub use marker::MarkerStrategy;
pub use slurm_queue::SlurmQueueStrategy;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Status query failed: {0}")]
    Shell(#[from] ShellError),
    #[error("Failed to read scheduler log: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Output marker -> job of every job which has not completed yet
pub struct WaitSet {
    waiting: BTreeMap<PathBuf, JobHandle>,
}

impl WaitSet {
    pub fn insert(&mut self, marker: PathBuf, job: JobHandle) {
        self.waiting.insert(marker, job);
    }

    /// remove `job`, returns its marker if the job was still waited upon
    pub fn remove_job(&mut self, job: JobHandle) -> Option<PathBuf> {
        let marker = self
            .waiting
            .iter()
            .find_map(|(marker, waiting)| (*waiting == job).then(|| marker.clone()))?;

        self.waiting.remove(&marker);
        Some(marker)
    }

    pub fn contains_job(&self, job: JobHandle) -> bool {
        self.waiting.values().any(|waiting| *waiting == job)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, JobHandle)> + '_ {
        self.waiting
            .iter()
            .map(|(marker, job)| (marker.as_path(), *job))
    }

    pub fn jobs(&self) -> impl Iterator<Item = JobHandle> + '_ {
        self.waiting.values().copied()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// One way of finding out that jobs have finished
pub trait WaitStrategy: Send {
    fn name(&self) -> &'static str;

    /// Report the jobs of `waiting` which finished
    ///
    /// `tick` counts the iterations of the detection loop, strategies which are expensive to
    /// evaluate use it to only run every Nth tick.
    fn check(&mut self, tick: u64, waiting: &WaitSet) -> Result<Vec<JobHandle>, StrategyError>;

    /// `job` was delivered, by this or any other strategy
    fn delivered(&mut self, _job: JobHandle) {}
}

/// invoked on the detection thread for every finished job
pub type Completion = Arc<dyn Fn(JobHandle) + Send + Sync>;

#[derive(Default)]
struct State {
    waiting: WaitSet,
    stopped: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

/// Handle to the detection thread
pub struct Watcher {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Start the detection thread, strategies are evaluated in the given order on every tick
    pub fn spawn(
        strategies: Vec<Box<dyn WaitStrategy>>,
        interval: Duration,
        completion: Completion,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let thread = {
            let shared = shared.clone();

            thread::Builder::new()
                .name("cfut-watcher".to_owned())
                .spawn(move || run(shared, strategies, interval, completion))?
        };

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Wait for `marker` to appear (or a backend specific signal) for `job`
    pub fn wait(&self, marker: PathBuf, job: JobHandle) {
        trace!(job = %job, marker = ?marker, "Watching job");
        self.shared.state.lock().waiting.insert(marker, job);
    }

    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().waiting.len()
    }

    /// Stop the detection thread and wait for it to exit, jobs still outstanding are no longer
    /// observed
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            self.shared.wake.notify_all();
        }

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("Completion detection thread panicked");
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[instrument(skip_all, name = "watcher")]
fn run(
    shared: Arc<Shared>,
    mut strategies: Vec<Box<dyn WaitStrategy>>,
    interval: Duration,
    completion: Completion,
) {
    info!(
        strategies = ?strategies.iter().map(|strategy| strategy.name()).collect::<Vec<_>>(),
        "Completion detection started"
    );

    let mut tick: u64 = 0;

    loop {
        // strategies work on a snapshot, submissions are not blocked by slow status queries
        let mut snapshot = {
            let state = shared.state.lock();

            if state.stopped {
                break;
            }
            state.waiting.clone()
        };

        let mut delivered = Vec::new();

        for strategy in strategies.iter_mut() {
            if snapshot.is_empty() {
                break;
            }

            let finished = match strategy.check(tick, &snapshot) {
                Ok(finished) => finished,
                Err(error) => {
                    // transient failures must not abandon outstanding jobs, retry next tick
                    warn!(strategy = strategy.name(), error = %error, "Completion check failed");
                    continue;
                }
            };

            for job in finished {
                // removal under the lock decides which strategy delivers the job
                let removed = shared.state.lock().waiting.remove_job(job);

                if removed.is_some() {
                    snapshot.remove_job(job);
                    debug!(strategy = strategy.name(), job = %job, "Job finished");
                    completion(job);
                    delivered.push(job);
                }
            }
        }

        for job in delivered {
            for strategy in strategies.iter_mut() {
                strategy.delivered(job);
            }
        }

        tick = tick.wrapping_add(1);

        let mut state = shared.state.lock();
        if !state.stopped {
            shared.wake.wait_for(&mut state, interval);
        }
    }

    info!("Completion detection stopped");
}
