use super::{StrategyError, WaitSet, WaitStrategy};
use crate::executors::JobHandle;

/// Fires once the output marker of a job exists, works for every backend
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerStrategy;

impl WaitStrategy for MarkerStrategy {
    fn name(&self) -> &'static str {
        "marker"
    }

    fn check(&mut self, _tick: u64, waiting: &WaitSet) -> Result<Vec<JobHandle>, StrategyError> {
        Ok(waiting
            .iter()
            .filter(|(marker, _)| marker.exists())
            .map(|(_, job)| job)
            .collect())
    }
}
