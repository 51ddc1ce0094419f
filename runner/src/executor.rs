//! Job lifecycle management
//!
//! [`ClusterExecutor`] turns task submissions into [`JobFuture`]s. Every submitted job gets an
//! entry in the registry which lives until the completion detection thread reports the job as
//! finished, at which point the output marker is read, the future resolved and the scheduler
//! artifacts removed.

use crate::{
    config::{ConfigErrors, ExecutorConfig},
    executors::{Backend, BackendError, Backends, JobHandle},
    future::{JobError, JobFuture, Promise, Resolution},
    handshake::{self, HandshakeError, Outcome, WorkerId, Workdir},
    shell::Shell,
    task::{envelope, Task},
    wait::{MarkerStrategy, WaitStrategy, Watcher},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::BTreeMap,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Failed to write the task for the remote worker: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Failed to submit the job: {0}")]
    Backend(#[from] BackendError),
    #[error("Failed to serialize the task: {0}")]
    Encode(#[from] serde_yaml::Error),
    #[error("The executor was shut down")]
    ShutDown,
    #[error("The scheduler handed out job {0} twice")]
    DuplicateJob(JobHandle),
    #[error("Failed to set up the executor: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Per submission overrides of the executor configuration
pub struct SubmitOptions {
    /// replaces the configured setup lines of the job script (Slurm only)
    pub setup_lines: Option<Vec<String>>,
}

struct Entry {
    worker: WorkerId,
    promise: Arc<Promise>,
}

struct Inner {
    jobs: Mutex<BTreeMap<JobHandle, Entry>>,
    // signalled whenever the last outstanding job leaves the registry
    drained: Condvar,
    backend: Backends,
    workdir: Workdir,
    shut_down: AtomicBool,
}

impl Inner {
    #[instrument(skip_all, fields(job = %job))]
    fn complete(&self, job: JobHandle) {
        let (worker, promise) = match self.jobs.lock().get(&job) {
            Some(entry) => (entry.worker.clone(), entry.promise.clone()),
            None => {
                warn!("Completion for unknown job, ignoring it");
                return;
            }
        };

        let resolution = self.collect(job, &worker);

        for marker in [self.workdir.output(&worker), self.workdir.input(&worker)] {
            if let Err(error) = handshake::remove_file(&marker) {
                warn!(path = ?marker, error = %error, "Failed to remove marker file");
            }
        }

        if let Err(error) = self.backend.cleanup(job) {
            warn!(error = %error, "Failed to clean up after job");
        }

        // leaving the registry and resolving the future form one step for every observer
        let listeners = {
            let mut jobs = self.jobs.lock();
            jobs.remove(&job);
            let listeners = promise.settle(resolution);

            if jobs.is_empty() {
                self.drained.notify_all();
            }
            listeners
        };

        if let Some(listeners) = listeners {
            listeners.notify();
        }
    }

    fn collect(&self, job: JobHandle, worker: &WorkerId) -> Resolution {
        match handshake::read_output(&self.workdir, worker) {
            Ok(Some(Outcome::Value(value))) => {
                debug!("Job succeeded");
                Ok(value)
            }
            Ok(Some(Outcome::Error(trace))) => {
                debug!("Task failed on the remote host");
                Err(JobError::RemoteException(trace))
            }
            Ok(None) => {
                warn!(worker = %worker, "Job finished without writing a result");
                Err(JobError::JobDied { job })
            }
            Err(error) => {
                error!(error = %error, "Failed to read job result");
                Err(JobError::Decode(error.to_string()))
            }
        }
    }
}

/// Runs tasks as jobs of a cluster scheduler
pub struct ClusterExecutor {
    inner: Arc<Inner>,
    watcher: Watcher,
}

impl ClusterExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        config.preflight_checks()?;

        let workdir = Workdir::create(&config.base_dir)?;
        let shell = Shell::new(config.command_timeout());
        let backend = Backends::load(&config, workdir.clone(), shell)?;

        // the marker check is the cheapest and works for every backend
        let mut strategies: Vec<Box<dyn WaitStrategy>> = vec![Box::new(MarkerStrategy)];
        strategies.extend(backend.strategies());

        info!(
            backend = backend.name(),
            base_dir = ?workdir.base(),
            "Starting cluster executor"
        );

        let inner = Arc::new(Inner {
            jobs: Mutex::new(BTreeMap::new()),
            drained: Condvar::new(),
            backend,
            workdir,
            shut_down: AtomicBool::new(false),
        });

        let watcher = {
            let inner = inner.clone();
            Watcher::spawn(
                strategies,
                config.poll_interval(),
                Arc::new(move |job: JobHandle| inner.complete(job)),
            )?
        };

        Ok(Self { inner, watcher })
    }

    pub fn submit<T: Task>(&self, task: &T) -> Result<JobFuture<T::Output>, ExecutorError> {
        self.submit_with(task, &SubmitOptions::default())
    }

    /// Submit `task`, the returned future resolves once the job finished
    ///
    /// Failures to hand the job to the scheduler are reported here, no future exists for them.
    #[instrument(skip_all, fields(task = T::NAME))]
    pub fn submit_with<T: Task>(
        &self,
        task: &T,
        options: &SubmitOptions,
    ) -> Result<JobFuture<T::Output>, ExecutorError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(ExecutorError::ShutDown);
        }

        let worker = WorkerId::random();
        let envelope = envelope(task)?;
        handshake::write_input(&self.inner.workdir, &worker, &envelope)?;

        let started = self
            .inner
            .backend
            .start(&worker, options.setup_lines.as_deref());
        let job = match started {
            Ok(job) => job,
            Err(error) => {
                self.discard_input(&worker);
                return Err(error.into());
            }
        };

        let promise = Promise::new();
        {
            let mut jobs = self.inner.jobs.lock();

            if jobs.contains_key(&job) {
                drop(jobs);
                self.discard_input(&worker);
                return Err(ExecutorError::DuplicateJob(job));
            }

            jobs.insert(
                job,
                Entry {
                    worker: worker.clone(),
                    promise: promise.clone(),
                },
            );
        }

        // the registry entry exists before detection can report the job
        self.watcher.wait(self.inner.workdir.output(&worker), job);
        debug!(job = %job, worker = %worker, "Job submitted");

        Ok(JobFuture::new(job, promise))
    }

    fn discard_input(&self, worker: &WorkerId) {
        let input = self.inner.workdir.input(worker);

        if let Err(error) = handshake::remove_file(&input) {
            warn!(path = ?input, error = %error, "Failed to remove input marker");
        }
    }

    /// Stop accepting submissions, with `wait` block until every outstanding job finished
    ///
    /// Jobs which are still running when `wait` is false keep running on the cluster but
    /// their futures never resolve. Shutting down twice is a no-op.
    pub fn shutdown(&self, wait: bool) -> Result<(), ExecutorError> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if wait {
            let mut jobs = self.inner.jobs.lock();
            while !jobs.is_empty() {
                debug!(outstanding = jobs.len(), "Waiting for outstanding jobs");
                self.inner.drained.wait(&mut jobs);
            }
        }

        self.watcher.stop();

        let abandoned = self.outstanding();
        if abandoned > 0 {
            warn!(abandoned, "Shut down with jobs still running");
        }

        self.inner.backend.shutdown()?;
        info!("Cluster executor shut down");

        Ok(())
    }

    /// Number of submitted jobs which have not completed yet
    pub fn outstanding(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    pub fn workdir(&self) -> &Workdir {
        &self.inner.workdir
    }

    pub fn backend(&self) -> &Backends {
        &self.inner.backend
    }
}

impl Drop for ClusterExecutor {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown(false) {
            error!(error = %error, "Failed to shut down executor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BackendConfig, SlurmConfig},
        remote,
        task::{TaskFailure, TaskRegistry},
    };
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path, sync::mpsc, time::Duration};

    #[derive(Serialize, Deserialize)]
    struct Double(i64);

    impl Task for Double {
        const NAME: &'static str = "test.double";
        type Output = i64;

        fn run(self) -> Result<i64, TaskFailure> {
            Ok(self.0 * 2)
        }
    }

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register::<Double>().unwrap();
        registry
    }

    // job ids count up from 1, squeue reports every job as running
    fn executor(dir: &Path) -> ClusterExecutor {
        let counter = dir.join("counter");
        let sbatch = dir.join("sbatch");
        fs::write(
            &sbatch,
            format!(
                "n=$(cat {counter} 2>/dev/null || echo 0)\nn=$((n + 1))\necho $n > {counter}\necho $n",
                counter = counter.display()
            ),
        )
        .unwrap();
        let squeue = dir.join("squeue");
        fs::write(
            &squeue,
            "for arg; do jobs=$arg; done\necho $jobs | tr ',' '\\n' | sed 's/$/ RUNNING/'",
        )
        .unwrap();

        let mut config = ExecutorConfig::new(BackendConfig::Slurm(SlurmConfig {
            sbatch: format!("sh {}", sbatch.display()),
            squeue: format!("sh {}", squeue.display()),
            status_interval_ms: 10,
            ..SlurmConfig::default()
        }));
        config.base_dir = dir.join("cfut");
        config.poll_interval_ms = 10;

        ClusterExecutor::new(config).unwrap()
    }

    #[test]
    fn resolves_after_the_worker_ran() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let future = executor.submit(&Double(21)).unwrap();
        assert_eq!(future.job(), JobHandle(1));
        assert_eq!(executor.outstanding(), 1);
        assert_eq!(
            future.wait_timeout(Duration::from_millis(50)),
            Err(JobError::Timeout)
        );

        assert_eq!(remote::run_outstanding(&registry(), executor.workdir()).unwrap(), 1);

        assert_eq!(future.wait_timeout(Duration::from_secs(5)), Ok(42));
        executor.shutdown(true).unwrap();
        assert_eq!(executor.outstanding(), 0);
        assert_eq!(fs::read_dir(executor.workdir().base()).unwrap().count(), 0);
    }

    #[test]
    fn finished_jobs_leave_the_registry_before_listeners_run() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let future = executor.submit(&Double(4)).unwrap();
        let (tx, rx) = mpsc::channel();
        let inner = executor.inner.clone();
        future.on_complete(move || {
            tx.send(inner.jobs.lock().len()).unwrap();
        });

        remote::run_outstanding(&registry(), executor.workdir()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(0));
        assert_eq!(future.try_get(), Some(Ok(8)));
    }

    #[test]
    fn waiters_never_see_their_job_outstanding() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let future = executor.submit(&Double(5)).unwrap();
        remote::run_outstanding(&registry(), executor.workdir()).unwrap();

        assert_eq!(future.wait_timeout(Duration::from_secs(5)), Ok(10));
        assert_eq!(executor.outstanding(), 0);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        executor.shutdown(true).unwrap();
        executor.shutdown(false).unwrap();

        assert!(matches!(
            executor.submit(&Double(1)),
            Err(ExecutorError::ShutDown)
        ));
    }
}
