// Job Test Harness
// Runs a job-building closure against fixtures and reports the verification result

use crate::config::ContextOptions;
use crate::context::ExecutionContext;
use crate::descriptor::{to_records, CacheDescriptor, Record, SourceDescriptor};
use crate::error::{ContextError, ContextResult};
use crate::job::{JobResult, JobState};
use crate::runners::PipelineRunner;
use crate::testing::assertions::OutputAssertion;
use crate::testing::fixtures::FixtureRegistry;
use crate::testing::TestRun;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

type Registration = Box<dyn FnOnce(&FixtureRegistry, &str) -> ContextResult<()> + Send>;

/// One test-mode run of a job
///
/// ```ignore
/// let state = JobTest::new("double")
///     .input(SourceDescriptor::local_file("in"), [1, 2, 3])
///     .output(
///         SourceDescriptor::local_file("out"),
///         OutputAssertion::contains_in_any_order([json!(2), json!(4), json!(6)]),
///     )
///     .run(|ctx| build_double_job(ctx))
///     .await?;
/// ```
pub struct JobTest {
    run_id: String,
    registry: FixtureRegistry,
    options: ContextOptions,
    runner: Option<Arc<dyn PipelineRunner>>,
    registrations: Vec<Registration>,
    timeout: Option<Duration>,
}

impl JobTest {
    /// Test of `job_name` with a unique run id on the global registry
    pub fn new(job_name: &str) -> Self {
        Self {
            run_id: format!("{}-{}", job_name, Uuid::new_v4()),
            registry: FixtureRegistry::global().clone(),
            options: ContextOptions::new(job_name),
            runner: None,
            registrations: Vec::new(),
            timeout: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_registry(mut self, registry: FixtureRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Options for the test context; the job name is kept
    pub fn with_options(mut self, options: ContextOptions) -> Self {
        let job_name = std::mem::take(&mut self.options.job_name);
        self.options = ContextOptions { job_name, ..options };
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn PipelineRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Fail with [`ContextError::JobFailed`] if the job has not finished in time
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Input fixture for `descriptor`, serialised from typed values
    pub fn input<T, I>(self, descriptor: SourceDescriptor, items: I) -> Self
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        let records = to_records(items);
        self.register(move |registry, run_id| registry.register_input(run_id, descriptor, records?))
    }

    /// Input fixture for `descriptor` given as raw records
    pub fn input_records(self, descriptor: SourceDescriptor, records: Vec<Record>) -> Self {
        self.register(move |registry, run_id| registry.register_input(run_id, descriptor, records))
    }

    pub fn output(self, descriptor: SourceDescriptor, assertion: OutputAssertion) -> Self {
        self.register(move |registry, run_id| {
            registry.register_output_assertion(run_id, descriptor, assertion)
        })
    }

    pub fn dist_cache<T>(self, descriptor: CacheDescriptor, mock: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.register(move |registry, run_id| registry.register_dist_cache(run_id, descriptor, mock))
    }

    fn register<R>(mut self, registration: R) -> Self
    where
        R: FnOnce(&FixtureRegistry, &str) -> ContextResult<()> + Send + 'static,
    {
        self.registrations.push(Box::new(registration));
        self
    }

    /// Start the run, build the job with `build`, submit it and verify it
    ///
    /// Returns the terminal state on success. A job that did not succeed is
    /// reported as [`ContextError::JobFailed`], a failed output check as
    /// [`ContextError::AssertionFailed`].
    pub async fn run<B>(self, build: B) -> ContextResult<JobState>
    where
        B: FnOnce(&mut ExecutionContext) -> ContextResult<()>,
    {
        let JobTest {
            run_id,
            registry,
            options,
            runner,
            registrations,
            timeout,
        } = self;

        let run = TestRun::start(run_id.clone(), registry.clone())?;
        let submitted = (|| -> ContextResult<JobResult> {
            for registration in registrations {
                registration(&registry, &run_id)?;
            }
            let mut ctx = ExecutionContext::for_test(options, run);
            if let Some(runner) = runner {
                ctx = ctx.with_runner(runner);
            }
            build(&mut ctx)?;
            ctx.close()
        })();

        let result = match submitted {
            Ok(result) => result,
            Err(err) => {
                // No job result will tear the run down
                registry.discard(&run_id);
                debug!(run_id = %run_id, error = %err, "test run aborted before submission");
                return Err(err);
            }
        };

        if let Some(limit) = timeout {
            let state = result.await_completion(Some(limit)).await;
            if !state.is_terminal() {
                return Err(ContextError::JobFailed { state });
            }
        }
        result.verify().await
    }
}

impl std::fmt::Debug for JobTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTest")
            .field("run_id", &self.run_id)
            .field("job", &self.options.job_name)
            .field("registrations", &self.registrations.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
