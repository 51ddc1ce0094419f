use super::{Backend, BackendError, JobHandle, WorkerCommand};
use crate::{
    config::SlurmConfig,
    handshake::{random_string, remove_file, WorkerId, Workdir},
    shell::{join_words, quote, Shell},
    wait::{SlurmQueueStrategy, WaitStrategy},
};
use std::{fs, path::PathBuf, time::Duration};
use tracing::{info, trace, warn};

const OUTPUT_PREFIX: &str = "slurmpy.stdout.";

/// Job id printed by `sbatch --parsable`, which is `<id>` or `<id>;<cluster>`
pub fn parse_job_id(stdout: &str) -> Option<JobHandle> {
    stdout
        .trim()
        .split(';')
        .next()
        .and_then(|id| id.trim().parse().ok())
        .map(JobHandle)
}

#[derive(Debug)]
pub struct SlurmBackend {
    sbatch: String,
    squeue: String,
    setup_lines: Vec<String>,
    search_paths: Vec<String>,
    // squeue runs on every n-th tick of the completion loop
    every: u64,
    workdir: Workdir,
    shell: Shell,
    worker: WorkerCommand,
    keep_logs: bool,
}

impl SlurmBackend {
    pub fn load(
        config: &SlurmConfig,
        poll_interval: Duration,
        workdir: Workdir,
        shell: Shell,
        worker: WorkerCommand,
        keep_logs: bool,
    ) -> Self {
        let poll_ms = poll_interval.as_millis().max(1) as u64;

        Self {
            sbatch: config.sbatch.clone(),
            squeue: config.squeue.clone(),
            setup_lines: config.setup_lines.clone(),
            search_paths: config.search_paths.clone(),
            every: (config.status_interval_ms / poll_ms).max(1),
            workdir,
            shell,
            worker,
            keep_logs,
        }
    }

    pub fn status_every(&self) -> u64 {
        self.every
    }

    fn output_file(&self, job: &str) -> PathBuf {
        self.workdir.file(format!("{OUTPUT_PREFIX}{job}.log"))
    }

    /// Batch script running the remote worker for `worker`, `setup_lines` replaces the
    /// configured setup lines
    pub fn script(&self, worker: &WorkerId, setup_lines: Option<&[String]>) -> String {
        let mut command = vec![
            "srun".to_owned(),
            self.worker.program.to_string_lossy().into_owned(),
        ];
        command.extend(
            self.worker
                .arguments(worker, &self.workdir, &self.search_paths),
        );

        let mut lines = vec![
            "#!/bin/sh".to_owned(),
            format!("#SBATCH --output={}", self.output_file("%j").display()),
        ];
        lines.extend(
            setup_lines
                .unwrap_or(self.setup_lines.as_slice())
                .iter()
                .cloned(),
        );
        lines.push(join_words(&command));

        lines.join("\n")
    }

    fn submit_script(&self, script: &str) -> Result<JobHandle, BackendError> {
        let path = self
            .workdir
            .file(format!("_temp_{}.sh", random_string(32)));
        fs::write(&path, script)?;
        trace!(path = ?path, "Wrote batch script");

        let submitted = self.shell.check_call(
            &format!(
                "{} --parsable {}",
                self.sbatch,
                quote(&path.to_string_lossy())
            ),
            None,
        );

        // sbatch copies the script, it is not needed past submission
        if let Err(error) = remove_file(&path) {
            warn!(path = ?path, error = %error, "Failed to remove batch script");
        }

        let stdout = submitted?.stdout_lossy();
        parse_job_id(&stdout).ok_or(BackendError::MalformedReply(stdout))
    }
}

impl Backend for SlurmBackend {
    fn start(
        &self,
        worker: &WorkerId,
        setup_lines: Option<&[String]>,
    ) -> Result<JobHandle, BackendError> {
        let job = self.submit_script(&self.script(worker, setup_lines))?;
        info!(job = %job, worker = %worker, "Submitted Slurm job");

        Ok(job)
    }

    fn cleanup(&self, job: JobHandle) -> Result<(), BackendError> {
        if self.keep_logs {
            return Ok(());
        }

        let output = self.output_file(&job.to_string());
        // the output file lives on a shared file system which might lag behind
        if let Err(error) = remove_file(&output) {
            warn!(path = ?output, error = %error, "Failed to remove job output");
        }

        Ok(())
    }

    fn strategies(&self) -> Vec<Box<dyn WaitStrategy>> {
        vec![Box::new(SlurmQueueStrategy::new(
            self.shell.clone(),
            self.squeue.clone(),
            self.every,
        ))]
    }
}
