use super::{Backend, BackendError, JobHandle, WorkerCommand};
use crate::{
    config::CondorConfig,
    handshake::{random_string, remove_file, WorkerId, Workdir},
    shell::Shell,
    wait::{CondorLogStrategy, WaitStrategy},
};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// `condor_submit -v` prints `** Proc <cluster>.0:` for the single queued process
static PROC_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Proc (\d+)\.0").expect("proc id pattern is valid"));

const STDOUT_PREFIX: &str = "condorpy.stdout.";
const STDERR_PREFIX: &str = "condorpy.stderr.";

/// Cluster id of the job submitted by `condor_submit -v`
pub fn parse_cluster_id(stdout: &str) -> Option<JobHandle> {
    PROC_ID
        .captures(stdout)
        .and_then(|captures| captures[1].parse().ok())
        .map(JobHandle)
}

/// Quote arguments in the double quoted syntax of the `Arguments` command
pub fn condor_arguments<S: AsRef<str>>(arguments: &[S]) -> String {
    let words = arguments
        .iter()
        .map(|argument| {
            let argument = argument.as_ref().replace('"', "\"\"");

            if argument.is_empty() || argument.contains(|c: char| c.is_whitespace() || c == '\'') {
                format!("'{}'", argument.replace('\'', "''"))
            } else {
                argument
            }
        })
        .join(" ");

    format!("\"{words}\"")
}

#[derive(Debug)]
pub struct CondorBackend {
    submit: String,
    universe: String,
    workdir: Workdir,
    shell: Shell,
    worker: WorkerCommand,
    keep_logs: bool,
    // user log shared by all jobs of this executor
    log: PathBuf,
}

impl CondorBackend {
    pub fn load(
        config: &CondorConfig,
        workdir: Workdir,
        shell: Shell,
        worker: WorkerCommand,
        keep_logs: bool,
    ) -> Self {
        let log = workdir.file(format!("cfut.log.{}.txt", random_string(32)));

        Self {
            submit: config.submit.clone(),
            universe: config.universe.clone(),
            workdir,
            shell,
            worker,
            keep_logs,
            log,
        }
    }

    pub fn log(&self) -> &Path {
        &self.log
    }

    fn stdout_file(&self, cluster: &str) -> PathBuf {
        self.workdir.file(format!("{STDOUT_PREFIX}{cluster}.log"))
    }

    fn stderr_file(&self, cluster: &str) -> PathBuf {
        self.workdir.file(format!("{STDERR_PREFIX}{cluster}.log"))
    }

    /// Submit description running the remote worker for `worker`
    pub fn description(&self, worker: &WorkerId) -> String {
        let arguments = self.worker.arguments(worker, &self.workdir, &[]);

        [
            format!("Executable = {}", self.worker.program.display()),
            format!("Universe = {}", self.universe),
            format!("Log = {}", self.log.display()),
            format!("output = {}", self.stdout_file("$(Cluster)").display()),
            format!("error = {}", self.stderr_file("$(Cluster)").display()),
            format!("Arguments = {}", condor_arguments(&arguments)),
            "Queue".to_owned(),
        ]
        .join("\n")
    }
}

impl Backend for CondorBackend {
    fn start(
        &self,
        worker: &WorkerId,
        setup_lines: Option<&[String]>,
    ) -> Result<JobHandle, BackendError> {
        if setup_lines.is_some() {
            // submit descriptions have no notion of a job script
            debug!("Condor ignores additional setup lines");
        }

        let description = self.description(worker);
        let output = self
            .shell
            .check_call(&format!("{} -v", self.submit), Some(description.as_bytes()))?;
        let stdout = output.stdout_lossy();

        let job = parse_cluster_id(&stdout).ok_or(BackendError::MalformedReply(stdout))?;
        info!(job = %job, worker = %worker, "Submitted Condor job");

        Ok(job)
    }

    fn cleanup(&self, job: JobHandle) -> Result<(), BackendError> {
        if self.keep_logs {
            return Ok(());
        }

        let cluster = job.to_string();
        remove_file(&self.stdout_file(&cluster))?;
        remove_file(&self.stderr_file(&cluster))?;

        Ok(())
    }

    fn strategies(&self) -> Vec<Box<dyn WaitStrategy>> {
        vec![Box::new(CondorLogStrategy::new(self.log.clone()))]
    }

    fn shutdown(&self) -> Result<(), BackendError> {
        if self.keep_logs {
            return Ok(());
        }

        if let Err(error) = remove_file(&self.log) {
            warn!(log = ?self.log, error = %error, "Failed to remove Condor user log");
            return Err(error.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;

    fn backend(dir: &Path, submit: String, keep_logs: bool) -> CondorBackend {
        let config = CondorConfig {
            submit,
            ..CondorConfig::default()
        };
        let worker = WorkerCommand {
            program: PathBuf::from("/opt/cfut/bin/cfut"),
            args: vec!["worker".to_owned()],
        };

        CondorBackend::load(
            &config,
            Workdir::new(dir),
            Shell::default(),
            worker,
            keep_logs,
        )
    }

    #[rstest]
    #[case("Submitting job(s).\n1 job(s) submitted to cluster 12.\n\n** Proc 12.0:\n", Some(12))]
    #[case("Proc 0.0", Some(0))]
    #[case("ERROR: Failed to connect to local queue manager", None)]
    fn cluster_ids(#[case] stdout: &str, #[case] job: Option<u64>) {
        assert_eq!(parse_cluster_id(stdout), job.map(JobHandle));
    }

    #[rstest]
    #[case(&["worker", "abc"], r#""worker abc""#)]
    #[case(&["with space"], r#""'with space'""#)]
    #[case(&["it's"], r#""'it''s'""#)]
    #[case(&["say \"hi\""], r#""'say ""hi""'""#)]
    #[case(&[""], r#""''""#)]
    fn arguments_are_quoted(#[case] arguments: &[&str], #[case] expected: &str) {
        assert_eq!(condor_arguments(arguments), expected);
    }

    #[test]
    fn description_runs_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), "condor_submit".to_owned(), false);
        let worker = WorkerId::new("abc").unwrap();

        let description = backend.description(&worker);
        let base = dir.path().display();

        assert_eq!(
            description,
            format!(
                "Executable = /opt/cfut/bin/cfut\n\
                 Universe = vanilla\n\
                 Log = {}\n\
                 output = {base}/condorpy.stdout.$(Cluster).log\n\
                 error = {base}/condorpy.stderr.$(Cluster).log\n\
                 Arguments = \"worker abc --base-dir {base}\"\n\
                 Queue",
                backend.log().display()
            )
        );
    }

    #[test]
    fn start_submits_the_description() {
        let dir = tempfile::tempdir().unwrap();
        let received = dir.path().join("received");
        let script = dir.path().join("condor_submit");
        fs::write(
            &script,
            format!(
                "cat > {}\necho \"$@\" >> {}\necho '** Proc 42.0:'",
                received.display(),
                received.with_extension("args").display()
            ),
        )
        .unwrap();
        let backend = backend(dir.path(), format!("sh {}", script.display()), false);
        let worker = WorkerId::new("abc").unwrap();

        assert_eq!(backend.start(&worker, None).unwrap(), JobHandle(42));
        assert_eq!(
            fs::read_to_string(&received).unwrap(),
            backend.description(&worker)
        );
        assert_eq!(
            fs::read_to_string(received.with_extension("args")).unwrap(),
            "-v\n"
        );
    }

    #[test]
    fn unexpected_replies_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), "echo submitted".to_owned(), false);

        assert!(matches!(
            backend.start(&WorkerId::random(), None),
            Err(BackendError::MalformedReply(_))
        ));
    }

    #[test]
    fn cleanup_removes_job_output() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), "condor_submit".to_owned(), false);
        fs::write(dir.path().join("condorpy.stdout.3.log"), "").unwrap();
        fs::write(dir.path().join("condorpy.stderr.3.log"), "").unwrap();
        fs::write(backend.log(), "").unwrap();

        backend.cleanup(JobHandle(3)).unwrap();
        // files already gone are fine
        backend.cleanup(JobHandle(3)).unwrap();
        assert!(!dir.path().join("condorpy.stdout.3.log").exists());
        assert!(!dir.path().join("condorpy.stderr.3.log").exists());

        backend.shutdown().unwrap();
        assert!(!backend.log().exists());
    }

    #[test]
    fn keep_logs_leaves_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), "condor_submit".to_owned(), true);
        fs::write(dir.path().join("condorpy.stdout.3.log"), "").unwrap();
        fs::write(backend.log(), "").unwrap();

        backend.cleanup(JobHandle(3)).unwrap();
        backend.shutdown().unwrap();

        assert!(dir.path().join("condorpy.stdout.3.log").exists());
        assert!(backend.log().exists());
    }
}
