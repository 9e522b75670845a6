// Runners Module
// Submission interface to the runner that actually executes a job graph

pub mod direct;

// Re-export key types
pub use direct::{DirectRunHandle, DirectRunner};

use crate::config::ContextOptions;
use crate::error::{ContextError, ContextResult};
use crate::graph::JobGraph;
use crate::job::JobState;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Handle to a submitted job
#[async_trait::async_trait]
pub trait RunHandle: Send + Sync {
    /// Identifier assigned by the runner
    fn job_id(&self) -> &str;

    /// Non-blocking poll of the job state
    fn current_state(&self) -> JobState;

    /// Wait until the job reaches a terminal state and return it
    async fn observe_terminal_state(&self) -> JobState;
}

/// Runner accepting job graphs for execution
pub trait PipelineRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Submit a job; failures here happen before any background work starts
    fn submit(&self, graph: JobGraph, plan: &SubmissionPlan) -> ContextResult<Arc<dyn RunHandle>>;
}

/// Options and artifacts prepared for one submission
#[derive(Debug, Clone)]
pub struct SubmissionPlan {
    pub options: Arc<ContextOptions>,
    pub files_to_stage: Vec<PathBuf>,
}

/// Runner-specific preparation applied right before submission
pub trait SubmissionStrategy: Send + Sync {
    fn prepare_submission(
        &self,
        options: &Arc<ContextOptions>,
        artifacts: &[PathBuf],
    ) -> ContextResult<SubmissionPlan>;
}

/// Local execution: nothing is staged
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectStrategy;

impl SubmissionStrategy for DirectStrategy {
    fn prepare_submission(
        &self,
        options: &Arc<ContextOptions>,
        _artifacts: &[PathBuf],
    ) -> ContextResult<SubmissionPlan> {
        Ok(SubmissionPlan {
            options: Arc::clone(options),
            files_to_stage: Vec::new(),
        })
    }
}

/// Remote execution: artifacts are uploaded to the staging location
#[derive(Debug, Clone, Copy, Default)]
pub struct StagedStrategy;

impl SubmissionStrategy for StagedStrategy {
    fn prepare_submission(
        &self,
        options: &Arc<ContextOptions>,
        artifacts: &[PathBuf],
    ) -> ContextResult<SubmissionPlan> {
        if options.staging_location.is_none() {
            return Err(ContextError::Submission(
                "stagingLocation is required for cluster submission".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut files_to_stage = Vec::new();
        for artifact in artifacts {
            if !seen.insert(artifact.clone()) {
                continue;
            }
            if !artifact.exists() {
                return Err(ContextError::Submission(format!(
                    "artifact to stage does not exist: {}",
                    artifact.display()
                )));
            }
            files_to_stage.push(artifact.clone());
        }

        Ok(SubmissionPlan {
            options: Arc::clone(options),
            files_to_stage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_direct_strategy_stages_nothing() {
        let options = Arc::new(ContextOptions::default());
        let plan = DirectStrategy
            .prepare_submission(&options, &[PathBuf::from("/does/not/matter")])
            .unwrap();
        assert!(plan.files_to_stage.is_empty());
    }

    #[test]
    fn test_staged_strategy_requires_staging_location() {
        let options = Arc::new(ContextOptions::default());
        let result = StagedStrategy.prepare_submission(&options, &[]);
        assert!(matches!(result, Err(ContextError::Submission(_))));
    }

    #[test]
    fn test_staged_strategy_dedups_artifacts() {
        let temp = tempfile::tempdir().unwrap();
        let jar = temp.path().join("udfs.bin");
        fs::write(&jar, b"bytes").unwrap();

        let options = Arc::new(ContextOptions::default().with_staging_location("gs://b/stage"));
        let plan = StagedStrategy
            .prepare_submission(&options, &[jar.clone(), jar.clone()])
            .unwrap();
        assert_eq!(plan.files_to_stage, vec![jar]);
    }

    #[test]
    fn test_staged_strategy_rejects_missing_artifact() {
        let options = Arc::new(ContextOptions::default().with_staging_location("gs://b/stage"));
        let result =
            StagedStrategy.prepare_submission(&options, &[PathBuf::from("/missing/lookup.csv")]);
        assert!(matches!(result, Err(ContextError::Submission(_))));
    }
}
