#![allow(dead_code)]

use cluster_futures::{
    config::{BackendConfig, CondorConfig, ExecutorConfig, SlurmConfig},
    Task, TaskFailure, TaskRegistry,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Once,
    time::Duration,
};
use tempfile::TempDir;
use tracing_subscriber::{fmt, EnvFilter};

pub const TIMEOUT: Duration = Duration::from_secs(5);

static INIT: Once = Once::new();

/// Capture logs per test, shown for failing tests only
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("CFUT_LOG").unwrap_or_else(|_| EnvFilter::new("debug"));

        fmt().with_env_filter(filter).with_test_writer().init();
    });
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Square(pub i64);

impl Task for Square {
    const NAME: &'static str = "test.square";
    type Output = i64;

    fn run(self) -> Result<i64, TaskFailure> {
        Ok(self.0 * self.0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Fail {
    pub message: String,
}

impl Task for Fail {
    const NAME: &'static str = "test.fail";
    type Output = ();

    fn run(self) -> Result<(), TaskFailure> {
        Err(self.message.into())
    }
}

pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register::<Square>().unwrap();
    registry.register::<Fail>().unwrap();
    registry
}

/// Temporary directory holding mock scheduler tools and the executor's working directory
pub struct MockCluster {
    dir: TempDir,
}

impl MockCluster {
    pub fn new() -> Self {
        init_tracing();

        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a mock tool, the returned command line runs it through `sh`
    pub fn tool(&self, name: &str, body: &str) -> String {
        let path = self.file(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();

        format!("sh {}", path.display())
    }

    /// Body printing `<prefix><n><suffix>` with `n` counting up from 0, safe to run
    /// concurrently
    pub fn counter(&self, prefix: &str, suffix: &str) -> String {
        let counter = self.file("counter");
        let lock = self.file("counter.lock");

        format!(
            "until mkdir {lock} 2>/dev/null; do sleep 0.01; done\n\
             n=$(cat {counter} 2>/dev/null || echo 0)\n\
             echo $((n + 1)) > {counter}\n\
             rmdir {lock}\n\
             echo \"{prefix}$n{suffix}\"",
            counter = counter.display(),
            lock = lock.display()
        )
    }

    /// squeue reporting every queried job in the state stored in the file `state`
    pub fn squeue(&self) -> String {
        self.set_state("RUNNING");

        self.tool(
            "squeue",
            &format!(
                "state=$(cat {})\nfor arg; do jobs=$arg; done\necho $jobs | tr ',' '\\n' | sed \"s/$/ $state/\"",
                self.file("state").display()
            ),
        )
    }

    pub fn set_state(&self, state: &str) {
        fs::write(self.file("state"), state).unwrap();
    }

    fn config(&self, backend: BackendConfig) -> ExecutorConfig {
        let mut config = ExecutorConfig::new(backend);
        config.base_dir = self.file("cfut");
        config.poll_interval_ms = 10;
        config.command_timeout_ms = Some(5_000);
        config
    }

    pub fn slurm(&self, sbatch: String, squeue: String) -> ExecutorConfig {
        self.config(BackendConfig::Slurm(SlurmConfig {
            sbatch,
            squeue,
            status_interval_ms: 20,
            ..SlurmConfig::default()
        }))
    }

    pub fn condor(&self, submit: String) -> ExecutorConfig {
        self.config(BackendConfig::Condor(CondorConfig {
            submit,
            ..CondorConfig::default()
        }))
    }

    /// Marker files left in the working directory
    pub fn leftovers(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.file("cfut"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}
