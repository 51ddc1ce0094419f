//! Entry point of the process a cluster job runs
//!
//! The worker reads the input marker of its worker id, runs the task through a
//! [`TaskRegistry`] and publishes the outcome as output marker. Every failure after the worker
//! id is known ends up in the output marker, the submitting side must never wait for a worker
//! which gave up silently.

use crate::{
    config::default_base_dir,
    handshake::{self, HandshakeError, Outcome, WorkerId, Workdir},
    task::{capture_panic_backtraces, format_failure, TaskRegistry},
};
use clap::Args;
use std::{env, ffi::OsString, path::PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("Invalid search path: {0}")]
    SearchPath(#[from] env::JoinPathsError),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    /// Worker id naming the marker files of the task to run
    pub worker_id: String,
    /// Directory prepended to PATH before running the task, may be repeated
    #[arg(long = "search-path")]
    pub search_paths: Vec<PathBuf>,
    /// Directory holding the marker files [default: $CFUT_DIR or .cfut]
    #[arg(long)]
    pub base_dir: Option<PathBuf>,
}

/// Run the task of `worker` and publish its outcome
#[instrument(skip_all, fields(worker = %worker))]
pub fn run_worker(
    registry: &TaskRegistry,
    workdir: &Workdir,
    worker: &WorkerId,
) -> Result<(), HandshakeError> {
    let outcome = match handshake::read_input(workdir, worker) {
        Ok(envelope) => {
            info!(task = %envelope.task, "Running task");
            registry.run(envelope)
        }
        Err(error) => {
            error!(error = %error, "Failed to read task");
            Outcome::Error(format_failure(&error))
        }
    };

    if let Outcome::Error(ref trace) = outcome {
        debug!(trace = %trace, "Task failed");
    }

    handshake::write_output(workdir, worker, &outcome)
}

/// Run every task in `workdir` which has no outcome yet, returns how many ran
pub fn run_outstanding(registry: &TaskRegistry, workdir: &Workdir) -> Result<usize, HandshakeError> {
    let pending = workdir.pending()?;

    for worker in pending.iter() {
        run_worker(registry, workdir, worker)?;
    }

    Ok(pending.len())
}

/// Prepend `paths` to PATH of this process so tasks find tools installed next to the worker
pub fn prepend_search_paths(paths: &[PathBuf]) -> Result<(), env::JoinPathsError> {
    if paths.is_empty() {
        return Ok(());
    }

    let current = env::var_os("PATH").unwrap_or_default();
    let joined = env::join_paths(
        paths
            .iter()
            .cloned()
            .chain(env::split_paths(&current)),
    )?;

    debug!(path = ?joined, "Extended search path");
    env::set_var("PATH", joined);

    Ok(())
}

fn hostname() -> OsString {
    nix::unistd::gethostname().unwrap_or_else(|_| OsString::from("<unknown>"))
}

/// `cfut worker` subcommand
pub fn worker_main(registry: &TaskRegistry, args: WorkerArgs) -> Result<(), WorkerError> {
    capture_panic_backtraces();

    let worker = WorkerId::new(args.worker_id)?;
    let workdir = Workdir::new(args.base_dir.unwrap_or_else(default_base_dir));

    info!(
        host = ?hostname(),
        worker = %worker,
        base_dir = ?workdir.base(),
        "Remote worker started"
    );

    prepend_search_paths(&args.search_paths)?;
    run_worker(registry, &workdir, &worker)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handshake::TaskEnvelope,
        task::{envelope, Task, TaskFailure},
    };
    use serde::{Deserialize, Serialize};
    use serde_yaml::Value;
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    struct WordCount {
        text: String,
    }

    impl Task for WordCount {
        const NAME: &'static str = "test.word_count";
        type Output = BTreeMap<String, usize>;

        fn run(self) -> Result<Self::Output, TaskFailure> {
            if self.text.is_empty() {
                return Err("nothing to count".into());
            }

            let mut counts = BTreeMap::new();
            for word in self.text.split_whitespace() {
                *counts.entry(word.to_owned()).or_insert(0) += 1;
            }
            Ok(counts)
        }
    }

    fn setup() -> (tempfile::TempDir, Workdir, TaskRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(dir.path()).unwrap();
        let mut registry = TaskRegistry::new();
        registry.register::<WordCount>().unwrap();

        (dir, workdir, registry)
    }

    #[test]
    fn publishes_the_task_result() {
        let (_dir, workdir, registry) = setup();
        let worker = WorkerId::random();
        let task = WordCount {
            text: "a b a".to_owned(),
        };
        handshake::write_input(&workdir, &worker, &envelope(&task).unwrap()).unwrap();

        run_worker(&registry, &workdir, &worker).unwrap();

        let expected = BTreeMap::from([("a".to_owned(), 2usize), ("b".to_owned(), 1)]);
        assert_eq!(
            handshake::read_output(&workdir, &worker).unwrap(),
            Some(Outcome::Value(serde_yaml::to_value(expected).unwrap()))
        );
    }

    #[test]
    fn task_errors_become_error_outcomes() {
        let (_dir, workdir, registry) = setup();
        let worker = WorkerId::random();
        let task = WordCount {
            text: String::new(),
        };
        handshake::write_input(&workdir, &worker, &envelope(&task).unwrap()).unwrap();

        run_worker(&registry, &workdir, &worker).unwrap();

        match handshake::read_output(&workdir, &worker).unwrap() {
            Some(Outcome::Error(trace)) => assert!(trace.contains("nothing to count")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn missing_input_still_writes_an_outcome() {
        let (_dir, workdir, registry) = setup();
        let worker = WorkerId::random();

        run_worker(&registry, &workdir, &worker).unwrap();

        assert!(matches!(
            handshake::read_output(&workdir, &worker).unwrap(),
            Some(Outcome::Error(_))
        ));
    }

    #[test]
    fn runs_all_outstanding_tasks_once() {
        let (_dir, workdir, registry) = setup();
        let unknown = TaskEnvelope {
            task: "test.unknown".to_owned(),
            payload: Value::Null,
        };
        handshake::write_input(&workdir, &WorkerId::random(), &unknown).unwrap();
        for text in ["x", "y y"] {
            let task = envelope(&WordCount {
                text: text.to_owned(),
            })
            .unwrap();
            handshake::write_input(&workdir, &WorkerId::random(), &task).unwrap();
        }

        assert_eq!(run_outstanding(&registry, &workdir).unwrap(), 3);
        assert_eq!(run_outstanding(&registry, &workdir).unwrap(), 0);
    }

    #[test]
    fn parses_worker_arguments() {
        use clap::Parser;

        #[derive(Parser)]
        struct Cli {
            #[command(flatten)]
            worker: WorkerArgs,
        }

        let cli = Cli::parse_from([
            "cfut",
            "abc",
            "--search-path",
            "/opt/a",
            "--search-path",
            "/opt/b",
            "--base-dir",
            "/shared/cfut",
        ]);

        assert_eq!(
            cli.worker,
            WorkerArgs {
                worker_id: "abc".to_owned(),
                search_paths: vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")],
                base_dir: Some(PathBuf::from("/shared/cfut")),
            }
        );
    }
}
