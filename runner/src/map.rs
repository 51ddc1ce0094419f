use crate::{
    executor::{ClusterExecutor, ExecutorError},
    future::{JobError, JobFuture},
    task::Task,
};
use serde::de::DeserializeOwned;
use std::{
    collections::VecDeque,
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    time::Duration,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    /// yield results in submission order instead of completion order
    pub ordered: bool,
    /// give up waiting for a single result after this long
    pub timeout: Option<Duration>,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            timeout: None,
        }
    }
}

enum Pending<O> {
    Ordered(VecDeque<JobFuture<O>>),
    Unordered {
        futures: Vec<JobFuture<O>>,
        // indices into `futures` in the order the jobs finished
        completed: Receiver<usize>,
        remaining: usize,
    },
}

/// Results of [`map`], the iterator ends after the first failure
pub struct MapResults<O> {
    pending: Pending<O>,
    timeout: Option<Duration>,
    failed: bool,
}

/// Submit every task and iterate over their results
///
/// All tasks are submitted before this returns. A failing submission aborts the map, jobs
/// submitted before it keep running and are still tracked by the executor.
pub fn map<T, I>(
    executor: &ClusterExecutor,
    tasks: I,
    options: MapOptions,
) -> Result<MapResults<T::Output>, ExecutorError>
where
    T: Task,
    I: IntoIterator<Item = T>,
{
    let futures = tasks
        .into_iter()
        .map(|task| executor.submit(&task))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(jobs = futures.len(), ordered = options.ordered, "Mapped tasks");

    let pending = if options.ordered {
        Pending::Ordered(futures.into())
    } else {
        let (sender, completed) = mpsc::channel();

        for (index, future) in futures.iter().enumerate() {
            let sender = sender.clone();
            future.on_complete(move || {
                // the receiver is gone once the results were dropped
                let _ = sender.send(index);
            });
        }

        Pending::Unordered {
            remaining: futures.len(),
            futures,
            completed,
        }
    };

    Ok(MapResults {
        pending,
        timeout: options.timeout,
        failed: false,
    })
}

impl<O: DeserializeOwned> MapResults<O> {
    fn next_result(&mut self) -> Option<Result<O, JobError>> {
        match &mut self.pending {
            Pending::Ordered(futures) => {
                let future = futures.pop_front()?;

                Some(match self.timeout {
                    Some(timeout) => future.wait_timeout(timeout),
                    None => future.wait(),
                })
            }
            Pending::Unordered {
                futures,
                completed,
                remaining,
            } => {
                if *remaining == 0 {
                    return None;
                }

                let index = match self.timeout {
                    Some(timeout) => match completed.recv_timeout(timeout) {
                        Ok(index) => index,
                        Err(RecvTimeoutError::Timeout) => return Some(Err(JobError::Timeout)),
                        Err(RecvTimeoutError::Disconnected) => return None,
                    },
                    None => completed.recv().ok()?,
                };
                *remaining -= 1;

                Some(futures[index].wait())
            }
        }
    }
}

impl<O: DeserializeOwned> Iterator for MapResults<O> {
    type Item = Result<O, JobError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let result = self.next_result()?;
        self.failed = result.is_err();

        Some(result)
    }
}

