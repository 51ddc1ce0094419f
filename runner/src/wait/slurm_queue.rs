use super::{StrategyError, WaitSet, WaitStrategy};
use crate::{
    executors::JobHandle,
    shell::{quote, Shell, ShellError},
};
use itertools::Itertools;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Job states after which Slurm will not run a job any further
pub const TERMINAL_STATES: [&str; 10] = [
    "BOOT_FAIL",
    "CANCELLED",
    "COMPLETED",
    "DEADLINE",
    "FAILED",
    "NODE_FAIL",
    "OUT_OF_MEMORY",
    "PREEMPTED",
    "SPECIAL_EXIT",
    "TIMEOUT",
];

// squeue refuses the whole query once every listed job left its history
const INVALID_JOB_ID: &str = "Invalid job id specified";

pub fn is_terminal(state: &str) -> bool {
    // states like `CANCELLED+` or `CANCELLED by 1234` carry extra detail
    let state = state
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches('+');

    TERMINAL_STATES.contains(&state)
}

/// Parse `<id> <state>` lines as printed by `squeue --format "%i %T"`
pub fn parse_states(output: &str) -> BTreeMap<JobHandle, String> {
    output
        .lines()
        .filter_map(|line| {
            let (id, state) = line.trim().split_once(char::is_whitespace)?;
            // array tasks (`123_4`) report for their parent job
            let id = id.split('_').next()?.parse().ok()?;

            Some((JobHandle(id), state.trim().to_owned()))
        })
        .collect()
}

/// Periodically asks `squeue` for the state of all outstanding jobs at once
///
/// Jobs missing from the reply have dropped out of the scheduler's history and are treated
/// as finished.
#[derive(Debug)]
pub struct SlurmQueueStrategy {
    shell: Shell,
    squeue: String,
    every: u64,
}

impl SlurmQueueStrategy {
    /// query on every `every`-th tick, starting with the first, `squeue` is the command line
    /// prefix invoking squeue
    pub fn new(shell: Shell, squeue: String, every: u64) -> Self {
        Self {
            shell,
            squeue,
            every: every.max(1),
        }
    }

    fn command(&self, jobs: &[JobHandle]) -> String {
        format!(
            "{} --noheader --format {} --jobs {}",
            self.squeue,
            quote("%i %T"),
            jobs.iter().join(",")
        )
    }

    fn query(&self, jobs: &[JobHandle]) -> Result<BTreeMap<JobHandle, String>, StrategyError> {
        let command = self.command(jobs);
        let output = self.shell.call(&command, None)?;

        if output.success() {
            return Ok(parse_states(&output.stdout_lossy()));
        }

        let stderr = output.stderr_lossy();
        if stderr.contains(INVALID_JOB_ID) {
            debug!("None of the queried jobs is known to Slurm anymore");
            return Ok(BTreeMap::new());
        }

        Err(ShellError::CommandFailed {
            command,
            code: output.code,
            stderr,
        }
        .into())
    }
}

impl WaitStrategy for SlurmQueueStrategy {
    fn name(&self) -> &'static str {
        "slurm-queue"
    }

    fn check(&mut self, tick: u64, waiting: &WaitSet) -> Result<Vec<JobHandle>, StrategyError> {
        if tick % self.every != 0 || waiting.is_empty() {
            return Ok(Vec::new());
        }

        let jobs: Vec<JobHandle> = waiting.jobs().sorted().dedup().collect();
        let states = self.query(&jobs)?;
        trace!(states = ?states, "Slurm job states");

        Ok(jobs
            .into_iter()
            .filter(|job| states.get(job).map_or(true, |state| is_terminal(state)))
            .collect())
    }
}
