//! Futures backed by jobs of a Condor or Slurm cluster
//!
//! Tasks are handed to the scheduler through its command line tools and exchange their input
//! and output with the submitting process through marker files in a shared directory.

pub mod builtin;
pub mod config;
pub mod executor;
pub mod executors;
pub mod future;
pub mod handshake;
pub mod logging;
pub mod map;
pub mod remote;
pub mod shell;
pub mod task;
pub mod wait;

pub use executor::{ClusterExecutor, ExecutorError, SubmitOptions};
pub use executors::JobHandle;
pub use future::{JobError, JobFuture};
pub use map::{map, MapOptions, MapResults};
pub use task::{Task, TaskFailure, TaskRegistry};
