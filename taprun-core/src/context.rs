// Execution Context
// Builds one job graph, submits it exactly once and hands out deferred results

use crate::cache::{local_path, DistributedCache, LocalFileFetcher, ResourceFetcher};
use crate::config::ContextOptions;
use crate::connectors::{ConnectorRegistry, Tap};
use crate::counters::{Counter, CounterSet};
use crate::deferred::{Deferred, PendingResults};
use crate::descriptor::{CacheDescriptor, Record, SourceDescriptor};
use crate::error::{ContextError, ContextResult};
use crate::graph::{Collection, JobGraph, SinkFn, SourceFn};
use crate::job::{JobResult, Launch};
use crate::runners::PipelineRunner;
use crate::testing::TestRun;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info};

type PreSubmissionHook = Box<dyn FnOnce(&mut JobGraph) -> ContextResult<()> + Send>;

/// Lifecycle of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Graph mutation and hook registration allowed
    Open,
    /// Inside `close()`, running hooks and submitting
    Closing,
    /// Submitted (or submission attempted); nothing may be mutated
    Closed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextState::Open => write!(f, "open"),
            ContextState::Closing => write!(f, "closing"),
            ContextState::Closed => write!(f, "closed"),
        }
    }
}

/// Where reads, writes and caches are routed
#[derive(Debug, Clone)]
enum Mode {
    Real,
    Test(TestRun),
}

/// Owner of a job graph from construction to submission
///
/// The context is single-writer: every graph mutation happens through
/// `&mut self` on the submitting task. [`ExecutionContext::close`] submits
/// the graph once; every later mutation fails with
/// [`ContextError::AlreadyClosed`].
pub struct ExecutionContext {
    options: Arc<ContextOptions>,
    mode: Mode,
    state: ContextState,
    graph: Option<JobGraph>,
    pending: PendingResults,
    hooks: Vec<PreSubmissionHook>,
    counters: CounterSet,
    memo: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    artifacts: Vec<PathBuf>,
    runner: Option<Arc<dyn PipelineRunner>>,
    connectors: ConnectorRegistry,
}

impl ExecutionContext {
    /// Context reading and writing real data
    pub fn new(options: ContextOptions) -> Self {
        Self::with_mode(options, Mode::Real)
    }

    /// Context routed through the fixtures of a started test run
    pub fn for_test(options: ContextOptions, run: TestRun) -> Self {
        Self::with_mode(options, Mode::Test(run))
    }

    fn with_mode(options: ContextOptions, mode: Mode) -> Self {
        match &mode {
            Mode::Real => info!(job = %options.job_name, runner = %options.runner, "execution context created"),
            Mode::Test(run) => info!(
                job = %options.job_name,
                run_id = %run.run_id(),
                "execution context created in test mode"
            ),
        }
        Self {
            options: Arc::new(options),
            mode,
            state: ContextState::Open,
            graph: None,
            pending: PendingResults::new(),
            hooks: Vec::new(),
            counters: CounterSet::new(),
            memo: HashMap::new(),
            artifacts: Vec::new(),
            runner: None,
            connectors: ConnectorRegistry::default(),
        }
    }

    /// Submit to `runner` instead of the default for the configured kind
    pub fn with_runner(mut self, runner: Arc<dyn PipelineRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ContextState::Closed
    }

    pub fn is_test(&self) -> bool {
        matches!(self.mode, Mode::Test(_))
    }

    /// Identifier of the test run, in test mode
    pub fn run_id(&self) -> Option<&str> {
        match &self.mode {
            Mode::Real => None,
            Mode::Test(run) => Some(run.run_id()),
        }
    }

    pub fn counters(&self) -> &CounterSet {
        &self.counters
    }

    /// The graph built so far, if anything has been added
    ///
    /// After [`ExecutionContext::close`] this is the graph as submitted,
    /// including the changes made by pre-submission hooks.
    pub fn graph(&self) -> Option<&JobGraph> {
        self.graph.as_ref()
    }

    /// Add a source reading `descriptor`
    ///
    /// In test mode the registered input fixture is used and a missing one
    /// fails here, while the graph is built.
    pub fn read(&mut self, descriptor: SourceDescriptor) -> ContextResult<Collection> {
        self.ensure_open()?;
        let read: SourceFn = match &self.mode {
            Mode::Test(run) => {
                let records = run.registry().lookup_input(run.run_id(), &descriptor)?;
                Arc::new(move || Ok(records.clone()))
            }
            Mode::Real => {
                let connector = self.connectors.for_descriptor(&descriptor)?;
                let source = descriptor.clone();
                Arc::new(move || connector.read(&source))
            }
        };
        debug!(descriptor = %descriptor, "source added");
        Ok(self.graph_mut().add_source(descriptor, read))
    }

    /// Sink for `descriptor`: the connector's writer, or the test collector
    pub fn register_output_sink(&mut self, descriptor: &SourceDescriptor) -> ContextResult<SinkFn> {
        self.ensure_open()?;
        match &self.mode {
            Mode::Test(run) => run.registry().lookup_output_sink(run.run_id(), descriptor),
            Mode::Real => self.connectors.for_descriptor(descriptor)?.writer(descriptor),
        }
    }

    /// Write `input` to `descriptor`
    pub fn write(&mut self, input: Collection, descriptor: SourceDescriptor) -> ContextResult<()> {
        let sink = self.register_output_sink(&descriptor)?;
        self.graph_mut().add_sink(input, descriptor, sink)?;
        Ok(())
    }

    /// Write `input` to `descriptor` and get a tap on it once the job succeeds
    pub fn save(&mut self, input: Collection, descriptor: SourceDescriptor) -> ContextResult<Deferred<Tap>> {
        let sink = self.register_output_sink(&descriptor)?;
        let (sink, tap) = match &self.mode {
            Mode::Test(_) => {
                let collected = Arc::new(Mutex::new(Vec::new()));
                let captured = Arc::clone(&collected);
                let sink: SinkFn = Arc::new(move |records: Vec<Record>| {
                    captured.lock().extend(records.iter().cloned());
                    sink(records)
                });
                (sink, Tap::from_collected(descriptor.clone(), collected))
            }
            Mode::Real => {
                let connector = self.connectors.for_descriptor(&descriptor)?;
                (sink, Tap::from_connector(descriptor.clone(), connector))
            }
        };
        self.graph_mut().add_sink(input, descriptor, sink)?;
        self.request_deferred(tap)
    }

    pub fn map<F>(&mut self, label: &str, input: Collection, f: F) -> ContextResult<Collection>
    where
        F: Fn(Record) -> ContextResult<Record> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.graph_mut()
            .add_transform(label, input, Arc::new(move |record| f(record).map(|r| vec![r])))
    }

    pub fn flat_map<F>(&mut self, label: &str, input: Collection, f: F) -> ContextResult<Collection>
    where
        F: Fn(Record) -> ContextResult<Vec<Record>> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.graph_mut().add_transform(label, input, Arc::new(f))
    }

    pub fn filter<F>(&mut self, label: &str, input: Collection, predicate: F) -> ContextResult<Collection>
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.graph_mut().add_transform(
            label,
            input,
            Arc::new(move |record| {
                if predicate(&record) {
                    Ok(vec![record])
                } else {
                    Ok(Vec::new())
                }
            }),
        )
    }

    /// Future yielding `payload` if the job succeeds
    pub fn request_deferred<T: Send + 'static>(&mut self, payload: T) -> ContextResult<Deferred<T>> {
        self.ensure_open()?;
        Ok(self.pending.register(payload))
    }

    /// Run `hook` on the graph right before submission, in registration order
    pub fn add_pre_submission_hook<H>(&mut self, hook: H) -> ContextResult<()>
    where
        H: FnOnce(&mut JobGraph) -> ContextResult<()> + Send + 'static,
    {
        self.ensure_open()?;
        self.hooks.push(Box::new(hook));
        Ok(())
    }

    /// Register a counter reported in the metrics snapshot
    pub fn init_counter(&mut self, name: &str) -> ContextResult<Counter> {
        self.ensure_open()?;
        let counter = self.counters.register(name);
        let declared = name.to_string();
        self.add_pre_submission_hook(move |graph| {
            graph.declare_counter(declared);
            Ok(())
        })?;
        Ok(counter)
    }

    /// Register a local file to stage with the job
    pub fn add_artifact(&mut self, path: impl Into<PathBuf>) -> ContextResult<()> {
        self.ensure_open()?;
        self.artifacts.push(path.into());
        Ok(())
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    /// One value per type, built by `init` on first request
    pub fn memoize<T, F>(&mut self, init: F) -> ContextResult<&T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.memo
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(init()))
            .downcast_ref::<T>()
            .ok_or_else(|| ContextError::Config("memoized value has an unexpected type".to_string()))
    }

    /// Distributed cache fetched with the local file fetcher
    pub fn dist_cache<F, I>(&mut self, descriptor: CacheDescriptor, init: I) -> ContextResult<DistributedCache<F>>
    where
        F: Send + Sync + 'static,
        I: Fn(&[PathBuf]) -> ContextResult<F> + Send + Sync + 'static,
    {
        self.dist_cache_with_fetcher(descriptor, Arc::new(LocalFileFetcher), init)
    }

    /// Distributed cache over `descriptor`
    ///
    /// In test mode the registered mock is returned and nothing is fetched.
    /// In real mode the local source files are staged as artifacts.
    pub fn dist_cache_with_fetcher<F, I>(
        &mut self,
        descriptor: CacheDescriptor,
        fetcher: Arc<dyn ResourceFetcher>,
        init: I,
    ) -> ContextResult<DistributedCache<F>>
    where
        F: Send + Sync + 'static,
        I: Fn(&[PathBuf]) -> ContextResult<F> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        if let Mode::Test(run) = &self.mode {
            let mock = run.registry().lookup_dist_cache::<F>(run.run_id(), &descriptor)?;
            return Ok(DistributedCache::mocked(descriptor, mock));
        }

        for uri in &descriptor.uris {
            if let Some(path) = local_path(uri) {
                self.artifacts.push(path);
            }
        }
        Ok(DistributedCache::new(
            descriptor,
            self.options.cache_dir.clone(),
            fetcher,
            Box::new(init),
        ))
    }

    /// Run the pre-submission hooks and submit the graph
    ///
    /// Must be called within a tokio runtime, which then drives observation
    /// of the job. A second call fails with [`ContextError::AlreadyClosed`];
    /// the context is closed even when submission fails, and deferred results
    /// requested so far then fail with [`JobState::Unknown`]. A test run whose
    /// job was never submitted is removed from its fixture registry.
    ///
    /// [`JobState::Unknown`]: crate::job::JobState::Unknown
    pub fn close(&mut self) -> ContextResult<JobResult> {
        self.ensure_open()?;
        self.state = ContextState::Closing;
        let result = self.submit();
        self.state = ContextState::Closed;
        if let Err(err) = &result {
            // Nothing will settle these; their futures report the job as lost
            drop(mem::take(&mut self.pending));
            self.hooks.clear();
            if let Mode::Test(run) = &self.mode {
                debug!(run_id = %run.run_id(), error = %err, "discarding fixtures of unsubmitted run");
                run.registry().discard(run.run_id());
            }
        }
        result
    }

    fn submit(&mut self) -> ContextResult<JobResult> {
        let runtime = Handle::try_current().map_err(|_| {
            ContextError::Submission("close() must be called within a tokio runtime".to_string())
        })?;

        let mut graph = self
            .graph
            .take()
            .unwrap_or_else(|| JobGraph::new(self.options.job_name.clone()));
        let hooked = mem::take(&mut self.hooks)
            .into_iter()
            .enumerate()
            .try_for_each(|(index, hook)| {
                debug!(hook = index, "running pre-submission hook");
                hook(&mut graph)
            });
        // Counters declared by hooks are reported even if never incremented
        for name in graph.declared_counters() {
            self.counters.register(name);
        }
        self.graph = Some(graph.clone());
        hooked?;

        let runner = self
            .runner
            .clone()
            .or_else(|| self.options.runner.default_runner())
            .ok_or_else(|| {
                ContextError::Submission(format!(
                    "no runner supplied for runner kind '{}'",
                    self.options.runner
                ))
            })?;
        let plan = self
            .options
            .runner
            .strategy()
            .prepare_submission(&self.options, &self.artifacts)?;
        let handle = runner.submit(graph, &plan)?;

        info!(
            job = %self.options.job_name,
            job_id = %handle.job_id(),
            runner = %runner.name(),
            staged = plan.files_to_stage.len(),
            deferred = self.pending.len(),
            "job submitted"
        );

        let test_run = match &self.mode {
            Mode::Real => None,
            Mode::Test(run) => Some(run.clone()),
        };
        Ok(JobResult::launch(
            runtime,
            Launch {
                handle,
                job_name: self.options.job_name.clone(),
                pending: mem::take(&mut self.pending),
                counters: self.counters.clone(),
                metrics_location: self.options.metrics_location.clone(),
                test_run,
            },
        ))
    }

    fn ensure_open(&self) -> ContextResult<()> {
        match self.state {
            ContextState::Open => Ok(()),
            ContextState::Closing | ContextState::Closed => Err(ContextError::AlreadyClosed),
        }
    }

    fn graph_mut(&mut self) -> &mut JobGraph {
        let job_name = &self.options.job_name;
        self.graph.get_or_insert_with(|| JobGraph::new(job_name.clone()))
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("job", &self.options.job_name)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("nodes", &self.graph.as_ref().map(|g| g.len()).unwrap_or(0))
            .field("pending", &self.pending.len())
            .finish()
    }
}
