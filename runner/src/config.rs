use serde::{Deserialize, Serialize};
use std::{env, fs, io::Error, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{error, warn};

/// environment variable overriding the default working directory
pub const BASE_DIR_ENV: &str = "CFUT_DIR";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file: {0}")]
    ReadConfig(#[from] Error),
    #[error("Failed to parse config file: {0}")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Config failed the preflight checks, see the log for details")]
    PreflightFailed,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // shared directory for marker files and scheduler logs, has to be visible to all nodes
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    // tick of the completion detection loop
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    // keep scheduler stdout/stderr/log files around for debugging
    #[serde(default)]
    pub keep_logs: bool,
    #[serde(default)]
    pub debug: bool,
    // kill scheduler commands running longer than this
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
    #[serde(default)]
    pub worker: WorkerConfig,
    pub backend: BackendConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    // program started on the cluster node, defaults to this executable
    pub program: Option<PathBuf>,
    // arguments placed before the worker id
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum BackendConfig {
    Condor(CondorConfig),
    Slurm(SlurmConfig),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CondorConfig {
    #[serde(default = "default_condor_submit")]
    pub submit: String,
    #[serde(default = "default_universe")]
    pub universe: String,
}

impl Default for CondorConfig {
    fn default() -> Self {
        Self {
            submit: default_condor_submit(),
            universe: default_universe(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SlurmConfig {
    #[serde(default = "default_sbatch")]
    pub sbatch: String,
    #[serde(default = "default_squeue")]
    pub squeue: String,
    // squeue spawns a process and hits the controller, so it runs less often than the tick
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,
    // lines added to every job script, e.g. `#SBATCH --mem=4G` or `export OMP_NUM_THREADS=1`
    #[serde(default)]
    pub setup_lines: Vec<String>,
    // prepended to the PATH of remote workers
    #[serde(default)]
    pub search_paths: Vec<String>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            sbatch: default_sbatch(),
            squeue: default_squeue(),
            status_interval_ms: default_status_interval(),
            setup_lines: Vec::new(),
            search_paths: Vec::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            base_dir: default_base_dir(),
            poll_interval_ms: default_poll_interval(),
            keep_logs: false,
            debug: false,
            command_timeout_ms: None,
            worker: WorkerConfig::default(),
            backend,
        }
    }

    pub fn condor() -> Self {
        Self::new(BackendConfig::Condor(CondorConfig::default()))
    }

    pub fn slurm() -> Self {
        Self::new(BackendConfig::Slurm(SlurmConfig::default()))
    }

    /// load a YAML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path)?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn preflight_checks(&self) -> Result<(), ConfigErrors> {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.poll_interval_ms == 0 {
            error!("poll_interval_ms cannot be 0, the completion loop would spin");
            contains_error = true;
        }

        if self.command_timeout_ms == Some(0) {
            error!("command_timeout_ms cannot be 0, every scheduler command would time out");
            contains_error = true;
        }

        if let Some(ref program) = self.worker.program {
            if program.as_os_str().is_empty() {
                error!("worker.program cannot be empty, omit it to use this executable");
                contains_error = true;
            }
        }

        match &self.backend {
            BackendConfig::Condor(condor) => {
                if condor.submit.trim().is_empty() {
                    error!("backend.submit must name the condor_submit executable");
                    contains_error = true;
                }
                if condor.universe.trim().is_empty() {
                    error!("backend.universe cannot be empty");
                    contains_error = true;
                }
            }
            BackendConfig::Slurm(slurm) => {
                if slurm.sbatch.trim().is_empty() || slurm.squeue.trim().is_empty() {
                    error!("backend.sbatch and backend.squeue must name the Slurm executables");
                    contains_error = true;
                }
                if slurm.status_interval_ms < self.poll_interval_ms {
                    error!(
                        "backend.status_interval_ms ({}) cannot be shorter than poll_interval_ms ({})",
                        slurm.status_interval_ms, self.poll_interval_ms
                    );
                    contains_error = true;
                }
                for line in slurm.setup_lines.iter() {
                    if line.contains('\n') {
                        error!("backend.setup_lines entry {line:?} spans multiple lines");
                        contains_error = true;
                    }
                }
            }
        }

        if self.keep_logs {
            warn!("keep_logs is set, scheduler logs in {:?} have to be removed manually", self.base_dir);
        }

        if contains_error {
            Err(ConfigErrors::PreflightFailed)
        } else {
            Ok(())
        }
    }
}

/// `CFUT_DIR` if set, `.cfut` otherwise
pub fn default_base_dir() -> PathBuf {
    env::var_os(BASE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".cfut"))
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_status_interval() -> u64 {
    30_000
}

fn default_condor_submit() -> String {
    "condor_submit".to_owned()
}

fn default_universe() -> String {
    "vanilla".to_owned()
}

fn default_sbatch() -> String {
    "sbatch".to_owned()
}

fn default_squeue() -> String {
    "squeue".to_owned()
}
