// Taprun Core Library
// Execution-context control layer for batch jobs: single submission, deferred results,
// test fixtures and distributed caches

pub mod cache;
pub mod config;
pub mod connectors;
pub mod context;
pub mod counters;
pub mod deferred;
pub mod descriptor;
pub mod error;
pub mod graph;
pub mod job;
pub mod runners;
pub mod testing;

// Re-export commonly used types
pub use error::{ContextError, ContextResult};

// Re-export context types
pub use config::{ContextOptions, RunnerKind};
pub use context::{ContextState, ExecutionContext};
pub use deferred::Deferred;
pub use job::{JobResult, JobState, MetricsSnapshot};

// Re-export graph types
pub use counters::{Counter, CounterSet};
pub use descriptor::{to_records, CacheDescriptor, ConnectorKind, Record, SourceDescriptor};
pub use graph::{Collection, JobGraph, SinkFn};

// Re-export I/O types
pub use cache::{DistributedCache, LocalFileFetcher, ResourceFetcher};
pub use connectors::{Connector, ConnectorRegistry, LocalFileConnector, Tap};

// Re-export runner types
pub use runners::{DirectRunner, PipelineRunner, RunHandle, SubmissionPlan, SubmissionStrategy};

// Re-export testing types
pub use testing::{FixtureRegistry, JobTest, OutputAssertion, TestRun};
