// Direct Runner
// Executes a job graph in-process on the blocking thread pool

use crate::descriptor::Record;
use crate::error::{ContextError, ContextResult};
use crate::graph::{JobGraph, NodeKind};
use crate::job::JobState;
use crate::runners::{PipelineRunner, RunHandle, SubmissionPlan};

use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Runner executing jobs on the local machine
#[derive(Debug, Clone, Default)]
pub struct DirectRunner;

impl DirectRunner {
    pub fn new() -> Self {
        Self
    }

    /// Check the graph can be executed at all
    fn validate(graph: &JobGraph) -> ContextResult<()> {
        if graph.is_empty() {
            return Err(ContextError::Submission("job graph is empty".to_string()));
        }
        if graph.sink_count() == 0 {
            return Err(ContextError::Submission(
                "job graph has no outputs".to_string(),
            ));
        }
        Ok(())
    }
}

impl PipelineRunner for DirectRunner {
    fn name(&self) -> &str {
        "direct"
    }

    fn submit(&self, graph: JobGraph, plan: &SubmissionPlan) -> ContextResult<Arc<dyn RunHandle>> {
        Self::validate(&graph)?;
        let runtime = Handle::try_current().map_err(|_| {
            ContextError::Submission("direct runner requires a tokio runtime".to_string())
        })?;

        let job_id = format!("direct-{}", Uuid::new_v4());
        let (state_tx, state_rx) = watch::channel(JobState::Running);

        info!(
            job_id = %job_id,
            job = %plan.options.job_name,
            nodes = graph.len(),
            "job submitted to direct runner"
        );

        let task_job_id = job_id.clone();
        runtime.spawn(async move {
            let start = Instant::now();
            let state = match tokio::task::spawn_blocking(move || execute_graph(&graph)).await {
                Ok(Ok(())) => JobState::Done,
                Ok(Err(err)) => {
                    warn!(job_id = %task_job_id, error = %err, "job failed");
                    JobState::Failed
                }
                Err(err) => {
                    warn!(job_id = %task_job_id, error = %err, "job panicked");
                    JobState::Failed
                }
            };
            debug!(
                job_id = %task_job_id,
                state = %state,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "direct job finished"
            );
            state_tx.send_replace(state);
        });

        Ok(Arc::new(DirectRunHandle {
            job_id,
            state: state_rx,
        }))
    }
}

/// Run every node in insertion order, keeping each node's output in memory
fn execute_graph(graph: &JobGraph) -> ContextResult<()> {
    let mut outputs: Vec<Option<Vec<Record>>> = vec![None; graph.len()];

    for node in graph.nodes() {
        let produced = match &node.kind {
            NodeKind::Source { read, .. } => read()?,
            NodeKind::Transform { input, apply } => {
                let records = input_of(&outputs, *input)?;
                let mut produced = Vec::with_capacity(records.len());
                for record in records {
                    produced.extend(apply(record)?);
                }
                produced
            }
            NodeKind::Sink { input, write, .. } => {
                write(input_of(&outputs, *input)?)?;
                Vec::new()
            }
        };
        debug!(node = %node.label, records = produced.len(), "node executed");
        outputs[node.id] = Some(produced);
    }

    Ok(())
}

fn input_of(outputs: &[Option<Vec<Record>>], input: usize) -> ContextResult<Vec<Record>> {
    outputs
        .get(input)
        .and_then(|o| o.clone())
        .ok_or_else(|| ContextError::Submission(format!("node {} has not executed", input)))
}

/// Handle to a job running on the direct runner
#[derive(Debug)]
pub struct DirectRunHandle {
    job_id: String,
    state: watch::Receiver<JobState>,
}

#[async_trait::async_trait]
impl RunHandle for DirectRunHandle {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn current_state(&self) -> JobState {
        *self.state.borrow()
    }

    async fn observe_terminal_state(&self) -> JobState {
        let mut state = self.state.clone();
        let terminal = match state.wait_for(|s| s.is_terminal()).await {
            Ok(terminal) => *terminal,
            // The execution task went away without reporting
            Err(_) => JobState::Unknown,
        };
        terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextOptions;
    use crate::descriptor::SourceDescriptor;

    use parking_lot::Mutex;
    use serde_json::json;

    fn plan() -> SubmissionPlan {
        SubmissionPlan {
            options: Arc::new(ContextOptions::new("direct-test")),
            files_to_stage: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_runs_graph_to_done() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink_collected = Arc::clone(&collected);

        let mut graph = JobGraph::new("double");
        let input = graph.add_source(
            SourceDescriptor::local_file("in"),
            Arc::new(|| Ok(vec![json!(1), json!(2), json!(3)])),
        );
        let doubled = graph
            .add_transform(
                "double",
                input,
                Arc::new(|r: Record| Ok(vec![json!(r.as_i64().unwrap_or(0) * 2)])),
            )
            .unwrap();
        graph
            .add_sink(
                doubled,
                SourceDescriptor::local_file("out"),
                Arc::new(move |records| {
                    sink_collected.lock().extend(records);
                    Ok(())
                }),
            )
            .unwrap();

        let handle = DirectRunner::new().submit(graph, &plan()).unwrap();
        assert_eq!(handle.observe_terminal_state().await, JobState::Done);
        assert_eq!(handle.current_state(), JobState::Done);
        assert_eq!(*collected.lock(), vec![json!(2), json!(4), json!(6)]);
    }

    #[tokio::test]
    async fn test_source_error_fails_job() {
        let mut graph = JobGraph::new("broken");
        let input = graph.add_source(
            SourceDescriptor::local_file("in"),
            Arc::new(|| Err(ContextError::Connector("bucket not found".to_string()))),
        );
        graph
            .add_sink(input, SourceDescriptor::local_file("out"), Arc::new(|_| Ok(())))
            .unwrap();

        let handle = DirectRunner::new().submit(graph, &plan()).unwrap();
        assert_eq!(handle.observe_terminal_state().await, JobState::Failed);
    }

    #[tokio::test]
    async fn test_panicking_transform_fails_job() {
        let mut graph = JobGraph::new("panics");
        let input = graph.add_source(
            SourceDescriptor::local_file("in"),
            Arc::new(|| Ok(vec![json!(1)])),
        );
        let boom = graph
            .add_transform(
                "boom",
                input,
                Arc::new(|_: Record| -> ContextResult<Vec<Record>> { panic!("transform blew up") }),
            )
            .unwrap();
        graph
            .add_sink(boom, SourceDescriptor::local_file("out"), Arc::new(|_| Ok(())))
            .unwrap();

        let handle = DirectRunner::new().submit(graph, &plan()).unwrap();
        assert_eq!(handle.observe_terminal_state().await, JobState::Failed);
    }

    #[tokio::test]
    async fn test_rejects_graph_without_outputs() {
        let mut graph = JobGraph::new("no-sink");
        graph.add_source(SourceDescriptor::local_file("in"), Arc::new(|| Ok(vec![])));
        let result = DirectRunner::new().submit(graph, &plan());
        assert!(matches!(result, Err(ContextError::Submission(_))));

        let result = DirectRunner::new().submit(JobGraph::new("empty"), &plan());
        assert!(matches!(result, Err(ContextError::Submission(_))));
    }

    #[test]
    fn test_submit_outside_runtime_fails() {
        let mut graph = JobGraph::new("no-runtime");
        let input = graph.add_source(SourceDescriptor::local_file("in"), Arc::new(|| Ok(vec![])));
        graph
            .add_sink(input, SourceDescriptor::local_file("out"), Arc::new(|_| Ok(())))
            .unwrap();
        let result = DirectRunner::new().submit(graph, &plan());
        assert!(matches!(result, Err(ContextError::Submission(_))));
    }
}
