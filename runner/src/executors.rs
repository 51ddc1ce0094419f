pub mod condor;
pub mod slurm;

use crate::{
    config::{BackendConfig, ExecutorConfig, WorkerConfig},
    handshake::{WorkerId, Workdir},
    shell::{Shell, ShellError},
    wait::WaitStrategy,
};
use serde::{Deserialize, Serialize};
use std::{fmt, io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Scheduler assigned id of a submitted job, the cluster id for Condor and the job id for Slurm
pub struct JobHandle(pub u64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Scheduler command failed: {0}")]
    Shell(#[from] ShellError),
    #[error("Failed to understand the scheduler reply {0:?}")]
    MalformedReply(String),
    #[error("Failed to manage scheduler files: {0}")]
    Io(#[from] io::Error),
}

/// Command line a cluster node runs to start a remote worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Resolve the configured worker, falling back to `<current executable> worker`
    pub fn resolve(config: &WorkerConfig) -> io::Result<Self> {
        match &config.program {
            Some(program) => Ok(Self {
                program: program.clone(),
                args: config.args.clone(),
            }),
            None => Ok(Self {
                program: std::env::current_exe()?,
                args: vec!["worker".to_owned()],
            }),
        }
    }

    /// Arguments for running the worker `worker` against `workdir`
    pub fn arguments(
        &self,
        worker: &WorkerId,
        workdir: &Workdir,
        search_paths: &[String],
    ) -> Vec<String> {
        let mut arguments = self.args.clone();

        arguments.push(worker.to_string());
        arguments.push("--base-dir".to_owned());
        arguments.push(workdir.base().to_string_lossy().into_owned());

        for path in search_paths {
            arguments.push("--search-path".to_owned());
            arguments.push(path.clone());
        }

        arguments
    }
}

/// Capability interface of a cluster scheduler
pub trait Backend {
    /// Submit a job running the remote worker for `worker`, `setup_lines` replaces the
    /// configured setup for this job only
    fn start(
        &self,
        worker: &WorkerId,
        setup_lines: Option<&[String]>,
    ) -> Result<JobHandle, BackendError>;

    /// Remove scheduler artifacts of a finished job
    fn cleanup(&self, job: JobHandle) -> Result<(), BackendError>;

    /// Backend specific completion detection, polled after the marker file check
    fn strategies(&self) -> Vec<Box<dyn WaitStrategy>>;

    /// Remove artifacts shared by all jobs of an executor
    fn shutdown(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[derive(Debug)]
/// All supported schedulers, selected by `ExecutorConfig::backend`
/// (kept as an enum to avoid boxing the backend of every executor)
pub enum Backends {
    Condor(condor::CondorBackend),
    Slurm(slurm::SlurmBackend),
}

impl Backends {
    pub fn load(
        config: &ExecutorConfig,
        workdir: Workdir,
        shell: Shell,
    ) -> Result<Self, BackendError> {
        let worker = WorkerCommand::resolve(&config.worker)?;

        Ok(match &config.backend {
            BackendConfig::Condor(condor) => Self::Condor(condor::CondorBackend::load(
                condor,
                workdir,
                shell,
                worker,
                config.keep_logs,
            )),
            BackendConfig::Slurm(slurm) => Self::Slurm(slurm::SlurmBackend::load(
                slurm,
                config.poll_interval(),
                workdir,
                shell,
                worker,
                config.keep_logs,
            )),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Condor(_) => "condor",
            Self::Slurm(_) => "slurm",
        }
    }

    pub fn as_condor(&self) -> Option<&condor::CondorBackend> {
        match self {
            Self::Condor(backend) => Some(backend),
            _ => None,
        }
    }
}

impl Backend for Backends {
    fn start(
        &self,
        worker: &WorkerId,
        setup_lines: Option<&[String]>,
    ) -> Result<JobHandle, BackendError> {
        match self {
            Self::Condor(backend) => backend.start(worker, setup_lines),
            Self::Slurm(backend) => backend.start(worker, setup_lines),
        }
    }

    fn cleanup(&self, job: JobHandle) -> Result<(), BackendError> {
        match self {
            Self::Condor(backend) => backend.cleanup(job),
            Self::Slurm(backend) => backend.cleanup(job),
        }
    }

    fn strategies(&self) -> Vec<Box<dyn WaitStrategy>> {
        match self {
            Self::Condor(backend) => backend.strategies(),
            Self::Slurm(backend) => backend.strategies(),
        }
    }

    fn shutdown(&self) -> Result<(), BackendError> {
        match self {
            Self::Condor(backend) => backend.shutdown(),
            Self::Slurm(backend) => backend.shutdown(),
        }
    }
}
