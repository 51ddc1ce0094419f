//! File based handshake between the submitting process and remote workers
//!
//! Every task gets a random [`WorkerId`] which names two marker files in the shared working
//! directory: the input marker holding the serialized task, written once before the job is
//! submitted, and the output marker holding the [`Outcome`]. The output marker is only ever
//! made visible through a rename, its existence alone signals completion.

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace};

pub const WORKER_ID_LENGTH: usize = 32;

const INFILE_PREFIX: &str = "cfut.in.";
const OUTFILE_PREFIX: &str = "cfut.out.";
const MARKER_SUFFIX: &str = ".yaml";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Failed to access marker file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to (de)serialize marker file {path:?}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid worker id {0:?}, only ASCII letters and digits are allowed")]
    InvalidWorkerId(String),
}

/// generate a random alphanumeric string
pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Random token naming the marker files of a single task
pub struct WorkerId(String);

impl WorkerId {
    pub fn random() -> Self {
        Self(random_string(WORKER_ID_LENGTH))
    }

    pub fn new(id: impl Into<String>) -> Result<Self, HandshakeError> {
        let id = id.into();

        if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(Self(id))
        } else {
            Err(HandshakeError::InvalidWorkerId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Content of the input marker: which task to run and its serialized arguments
pub struct TaskEnvelope {
    pub task: String,
    pub payload: serde_yaml::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Content of the output marker
pub enum Outcome {
    /// the task returned normally
    Value(serde_yaml::Value),
    /// the task failed, carries the formatted error trace of the remote side
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The shared working directory holding marker files and scheduler logs
pub struct Workdir {
    base: PathBuf,
}

impl Workdir {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Create the directory if necessary and resolve it to an absolute path, remote workers
    /// might not start in the same directory as the submitting process
    pub fn create(base: impl AsRef<Path>) -> io::Result<Self> {
        fs::create_dir_all(base.as_ref())?;

        Ok(Self::new(fs::canonicalize(base)?))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn file(&self, name: impl AsRef<Path>) -> PathBuf {
        self.base.join(name)
    }

    pub fn input(&self, worker: &WorkerId) -> PathBuf {
        self.file(format!("{INFILE_PREFIX}{worker}{MARKER_SUFFIX}"))
    }

    pub fn output(&self, worker: &WorkerId) -> PathBuf {
        self.file(format!("{OUTFILE_PREFIX}{worker}{MARKER_SUFFIX}"))
    }

    fn temp_output(&self, worker: &WorkerId) -> PathBuf {
        self.file(format!("{OUTFILE_PREFIX}{worker}{MARKER_SUFFIX}.tmp"))
    }

    /// Worker ids with an input marker but no output marker yet
    pub fn pending(&self) -> Result<Vec<WorkerId>, HandshakeError> {
        let io_error = |source| HandshakeError::Io {
            path: self.base.clone(),
            source,
        };
        let mut pending = Vec::new();

        for entry in fs::read_dir(&self.base).map_err(io_error)? {
            let name = entry.map_err(io_error)?.file_name();

            if let Some(worker) = name
                .to_str()
                .and_then(|name| name.strip_prefix(INFILE_PREFIX))
                .and_then(|name| name.strip_suffix(MARKER_SUFFIX))
                .and_then(|id| WorkerId::new(id).ok())
            {
                if !self.output(&worker).exists() {
                    pending.push(worker);
                }
            }
        }

        pending.sort();
        Ok(pending)
    }
}

pub fn write_input(
    workdir: &Workdir,
    worker: &WorkerId,
    envelope: &TaskEnvelope,
) -> Result<(), HandshakeError> {
    let path = workdir.input(worker);
    let data = serde_yaml::to_string(envelope).map_err(|source| HandshakeError::Serialization {
        path: path.clone(),
        source,
    })?;

    trace!(path = ?path, "Writing input marker");
    fs::write(&path, data).map_err(|source| HandshakeError::Io { path, source })
}

pub fn read_input(workdir: &Workdir, worker: &WorkerId) -> Result<TaskEnvelope, HandshakeError> {
    let path = workdir.input(worker);
    let data = fs::read(&path).map_err(|source| HandshakeError::Io {
        path: path.clone(),
        source,
    })?;

    serde_yaml::from_slice(&data).map_err(|source| HandshakeError::Serialization { path, source })
}

/// Write the outcome to a temporary file and rename it into place, the final name must never
/// refer to a partially written file
pub fn write_output(
    workdir: &Workdir,
    worker: &WorkerId,
    outcome: &Outcome,
) -> Result<(), HandshakeError> {
    let destination = workdir.output(worker);
    let temporary = workdir.temp_output(worker);

    let data = serde_yaml::to_string(outcome).map_err(|source| HandshakeError::Serialization {
        path: destination.clone(),
        source,
    })?;

    let write = || -> io::Result<()> {
        let mut file = fs::File::create(&temporary)?;
        file.write_all(data.as_bytes())?;
        file.sync_all()
    };
    write().map_err(|source| HandshakeError::Io {
        path: temporary.clone(),
        source,
    })?;

    fs::rename(&temporary, &destination).map_err(|source| HandshakeError::Io {
        path: destination.clone(),
        source,
    })?;

    debug!(path = ?destination, "Published output marker");
    Ok(())
}

/// Read the output marker, `None` if the worker never wrote one
pub fn read_output(workdir: &Workdir, worker: &WorkerId) -> Result<Option<Outcome>, HandshakeError> {
    let path = workdir.output(worker);

    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(HandshakeError::Io { path, source }),
    };

    serde_yaml::from_slice(&data)
        .map(Some)
        .map_err(|source| HandshakeError::Serialization { path, source })
}

/// Remove a file, a file which is already gone counts as removed
pub fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            trace!(path = ?path, "File was already removed");
            Ok(())
        }
        result => result,
    }
}
