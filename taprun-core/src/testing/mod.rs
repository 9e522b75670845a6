// Testing Module
// Test-mode fixtures, output assertions and the job test harness

pub mod assertions;
pub mod fixtures;
pub mod runner;

// Re-export key types
pub use assertions::{AssertionResult, OutputAssertion};
pub use fixtures::FixtureRegistry;
pub use runner::JobTest;

use crate::error::ContextResult;
use crate::job::JobState;

/// A started test run: the identifier plus the registry holding its fixtures
#[derive(Debug, Clone)]
pub struct TestRun {
    run_id: String,
    registry: FixtureRegistry,
}

impl TestRun {
    /// Wrap a run that has already been started on `registry`
    pub fn new(run_id: impl Into<String>, registry: FixtureRegistry) -> Self {
        Self {
            run_id: run_id.into(),
            registry,
        }
    }

    /// Start a fresh run on `registry`
    pub fn start(run_id: impl Into<String>, registry: FixtureRegistry) -> ContextResult<Self> {
        let run = Self::new(run_id, registry);
        run.registry.start(&run.run_id)?;
        Ok(run)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn registry(&self) -> &FixtureRegistry {
        &self.registry
    }

    /// Verify the run against the job's terminal state and tear it down
    pub fn finish(&self, state: JobState) -> ContextResult<()> {
        self.registry.finish(&self.run_id, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ContextError;

    #[test]
    fn test_start_registers_run() {
        let registry = FixtureRegistry::new();
        let run = TestRun::start("t1", registry.clone()).unwrap();
        assert_eq!(run.run_id(), "t1");
        assert!(registry.is_started("t1"));

        let duplicate = TestRun::start("t1", registry.clone());
        assert!(matches!(duplicate, Err(ContextError::DuplicateRunId(_))));

        run.finish(JobState::Done).unwrap();
        assert!(!registry.is_started("t1"));
    }
}
