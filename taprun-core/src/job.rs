// Job Result
// Terminal-state observation, metrics snapshot and deferred-result settlement

use crate::counters::CounterSet;
use crate::deferred::PendingResults;
use crate::error::{ContextError, ContextResult};
use crate::runners::RunHandle;
use crate::testing::TestRun;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// State of a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Unknown,
    Stopped,
    Running,
    Done,
    Failed,
    Cancelled,
    Updated,
    Drained,
}

impl JobState {
    /// The job will not progress any further
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done
                | JobState::Failed
                | JobState::Cancelled
                | JobState::Updated
                | JobState::Drained
        )
    }

    /// Terminal states whose outputs are valid
    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Done | JobState::Updated)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Unknown => "UNKNOWN",
            JobState::Stopped => "STOPPED",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Updated => "UPDATED",
            JobState::Drained => "DRAINED",
        };
        write!(f, "{}", name)
    }
}

/// Final metrics of a job, written once when the terminal state is known
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub job_name: String,
    pub job_id: String,
    pub state: JobState,
    pub counters: BTreeMap<String, i64>,
}

impl MetricsSnapshot {
    pub async fn write_to(&self, path: &Path) -> ContextResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> ContextResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Everything known once the job has settled
#[derive(Debug)]
struct Completion {
    state: JobState,
    fixture_outcome: Option<ContextResult<()>>,
}

/// Inputs for starting terminal-state observation of a submitted job
pub(crate) struct Launch {
    pub handle: Arc<dyn RunHandle>,
    pub job_name: String,
    pub pending: PendingResults,
    pub counters: CounterSet,
    pub metrics_location: Option<PathBuf>,
    pub test_run: Option<TestRun>,
}

/// Result of a submitted job
///
/// Observation of the terminal state starts as soon as the result is
/// created. Deferred results are settled before [`JobResult::terminal_state`]
/// resolves, and in test mode the fixture run is verified and torn down
/// before that as well.
pub struct JobResult {
    handle: Arc<dyn RunHandle>,
    job_name: String,
    test_run_id: Option<String>,
    settled: watch::Receiver<Option<Arc<Completion>>>,
    runtime: Handle,
}

impl JobResult {
    /// Start observing the job in the background on the given runtime
    pub(crate) fn launch(runtime: Handle, launch: Launch) -> Self {
        let (settled_tx, settled_rx) = watch::channel(None);
        let handle = Arc::clone(&launch.handle);
        let job_name = launch.job_name.clone();
        let test_run_id = launch.test_run.as_ref().map(|run| run.run_id().to_string());

        runtime.spawn(async move {
            let completion = settle(launch).await;
            settled_tx.send_replace(Some(Arc::new(completion)));
        });

        Self {
            handle,
            job_name,
            test_run_id,
            settled: settled_rx,
            runtime,
        }
    }

    pub fn job_id(&self) -> &str {
        self.handle.job_id()
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Whether the job ran against test fixtures
    pub fn is_test(&self) -> bool {
        self.test_run_id.is_some()
    }

    /// Non-blocking poll of the runner's view of the job
    pub fn current_state(&self) -> JobState {
        self.handle.current_state()
    }

    /// Whether the terminal state is known and every deferred result settled
    pub fn is_completed(&self) -> bool {
        self.settled.borrow().is_some()
    }

    /// Wait for the terminal state
    pub async fn terminal_state(&self) -> JobState {
        self.completion()
            .await
            .map(|c| c.state)
            .unwrap_or(JobState::Unknown)
    }

    /// Wait for the terminal state, up to `timeout` when given
    ///
    /// Returns [`JobState::Running`] if the job has not settled in time. The
    /// job itself keeps running.
    pub async fn await_completion(&self, timeout: Option<Duration>) -> JobState {
        match timeout {
            None => self.terminal_state().await,
            Some(limit) => match tokio::time::timeout(limit, self.terminal_state()).await {
                Ok(state) => state,
                Err(_) => {
                    debug!(
                        job = %self.job_name,
                        timeout_ms = limit.as_millis() as u64,
                        "job still running after timeout"
                    );
                    JobState::Running
                }
            },
        }
    }

    /// Block the calling thread in [`JobResult::await_completion`]
    ///
    /// Must be called from outside the async runtime, and the job must have
    /// been closed on a multi-threaded runtime: a current-thread runtime does
    /// not run the background observer while its handle blocks, so the wait
    /// could never finish. Both cases are rejected with an error.
    pub fn blocking_await_completion(&self, timeout: Option<Duration>) -> ContextResult<JobState> {
        if Handle::try_current().is_ok() {
            return Err(ContextError::BlockingInRuntime);
        }
        if self.runtime.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(ContextError::BlockingOnCurrentThread);
        }
        Ok(self.runtime.block_on(self.await_completion(timeout)))
    }

    /// Fixture verification outcome, once settled; `None` outside test mode
    pub fn fixture_outcome(&self) -> Option<ContextResult<()>> {
        self.settled
            .borrow()
            .as_ref()
            .and_then(|c| c.fixture_outcome.clone())
    }

    /// Wait for the job and require it to have succeeded
    ///
    /// In test mode a fixture assertion failure is reported as
    /// [`ContextError::AssertionFailed`], distinct from a job failure.
    pub async fn verify(&self) -> ContextResult<JobState> {
        let completion = self.completion().await.ok_or(ContextError::JobFailed {
            state: JobState::Unknown,
        })?;
        if !completion.state.is_success() {
            return Err(ContextError::JobFailed {
                state: completion.state,
            });
        }
        if let Some(Err(err)) = &completion.fixture_outcome {
            return Err(err.clone());
        }
        Ok(completion.state)
    }

    async fn completion(&self) -> Option<Arc<Completion>> {
        let mut settled = self.settled.clone();
        let completion = match settled.wait_for(|c| c.is_some()).await {
            Ok(completion) => completion.clone(),
            Err(_) => None,
        };
        completion
    }
}

impl fmt::Debug for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobResult")
            .field("job_id", &self.job_id())
            .field("job_name", &self.job_name)
            .field("test_run_id", &self.test_run_id)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Observe the terminal state, then write metrics, settle deferred results
/// and tear down test fixtures, in that order
async fn settle(launch: Launch) -> Completion {
    let Launch {
        handle,
        job_name,
        pending,
        counters,
        metrics_location,
        test_run,
    } = launch;

    let observer = Arc::clone(&handle);
    let state = match tokio::spawn(async move { observer.observe_terminal_state().await }).await {
        Ok(state) => state,
        Err(err) => {
            warn!(job = %job_name, error = %err, "terminal state observation aborted");
            JobState::Unknown
        }
    };
    info!(job = %job_name, job_id = %handle.job_id(), state = %state, "job reached terminal state");

    if let Some(path) = &metrics_location {
        let snapshot = MetricsSnapshot {
            job_name: job_name.clone(),
            job_id: handle.job_id().to_string(),
            state,
            counters: counters.snapshot(),
        };
        match snapshot.write_to(path).await {
            Ok(()) => debug!(path = %path.display(), "metrics snapshot written"),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to write metrics snapshot")
            }
        }
    }

    let settled = pending.settle(state);
    debug!(job = %job_name, settled, "deferred results settled");

    let fixture_outcome = test_run.map(|run| {
        let outcome = run.finish(state);
        match &outcome {
            Ok(()) => info!(run_id = %run.run_id(), "test fixtures verified"),
            Err(err) => {
                warn!(run_id = %run.run_id(), error = %err, "test fixture verification failed")
            }
        }
        outcome
    });

    Completion {
        state,
        fixture_outcome,
    }
}
