use super::{StrategyError, WaitSet, WaitStrategy};
use crate::executors::JobHandle;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::PathBuf,
};
use tracing::trace;

const TERMINATED: &str = "Job terminated.";

// checks a termination of an already known job is kept around for a registration racing it
const REGISTRATION_GRACE_TICKS: u64 = 20;

// event lines look like `005 (123.000.000) 2023-05-12 12:00:00 Job terminated.`
static CLUSTER_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d+)\.").expect("cluster id pattern is valid"));

/// Cluster id of a termination event line
pub fn parse_terminated(line: &str) -> Option<JobHandle> {
    if !line.contains(TERMINATED) {
        return None;
    }

    CLUSTER_ID
        .captures(line)
        .and_then(|captures| captures[1].parse().ok())
        .map(JobHandle)
}

/// Tails the user log shared by all jobs of an executor for termination events
#[derive(Debug)]
pub struct CondorLogStrategy {
    log: PathBuf,
    offset: u64,
    // incomplete last line of the previous read
    partial: String,
    // terminations seen before the job was registered, with the tick they were read at
    terminated: BTreeMap<JobHandle, u64>,
    // largest job ever waited for or delivered, cluster ids only grow
    high_water: Option<JobHandle>,
}

impl CondorLogStrategy {
    pub fn new(log: PathBuf) -> Self {
        Self {
            log,
            offset: 0,
            partial: String::new(),
            terminated: BTreeMap::new(),
            high_water: None,
        }
    }

    fn read_new_lines(&mut self) -> io::Result<Vec<String>> {
        let mut file = match File::open(&self.log) {
            Ok(file) => file,
            // condor creates the log with the first event
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };

        if file.metadata()?.len() < self.offset {
            trace!(log = ?self.log, "Log was truncated, reading from the start");
            self.offset = 0;
            self.partial.clear();
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buffer = Vec::new();
        self.offset += file.read_to_end(&mut buffer)? as u64;

        self.partial.push_str(&String::from_utf8_lossy(&buffer));

        let mut lines: Vec<String> = self.partial.split('\n').map(str::to_owned).collect();
        // the last element is either empty or a line condor is still writing
        self.partial = lines.pop().unwrap_or_default();

        Ok(lines)
    }
}

impl WaitStrategy for CondorLogStrategy {
    fn name(&self) -> &'static str {
        "condor-log"
    }

    fn check(&mut self, tick: u64, waiting: &WaitSet) -> Result<Vec<JobHandle>, StrategyError> {
        self.high_water = self.high_water.max(waiting.jobs().max());

        for line in self.read_new_lines()? {
            if let Some(job) = parse_terminated(&line) {
                trace!(job = %job, "Condor reported termination");
                self.terminated.entry(job).or_insert(tick);
            }
        }

        let finished: Vec<JobHandle> = self
            .terminated
            .keys()
            .copied()
            .filter(|job| waiting.contains_job(*job))
            .collect();

        for job in finished.iter() {
            self.terminated.remove(job);
        }

        // jobs at or below the high water mark were registered already, their terminations
        // belong to jobs another strategy delivered
        let high_water = self.high_water;
        self.terminated.retain(|job, seen| {
            Some(*job) > high_water || tick.wrapping_sub(*seen) < REGISTRATION_GRACE_TICKS
        });

        Ok(finished)
    }

    fn delivered(&mut self, job: JobHandle) {
        self.high_water = self.high_water.max(Some(job));
        self.terminated.remove(&job);
    }
}
