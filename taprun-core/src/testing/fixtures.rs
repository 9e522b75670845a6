// Fixture Registry
// Per-run store of input fixtures, output collectors and distributed-cache mocks

use crate::descriptor::{CacheDescriptor, Record, SourceDescriptor};
use crate::error::{ContextError, ContextResult};
use crate::graph::SinkFn;
use crate::job::JobState;
use crate::testing::assertions::OutputAssertion;

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, warn};

static GLOBAL: Lazy<FixtureRegistry> = Lazy::new(FixtureRegistry::new);

/// An input fixture and whether the job has read it
#[derive(Debug)]
struct InputFixture {
    records: Vec<Record>,
    consumed: bool,
}

/// An output assertion and everything written to the descriptor so far
#[derive(Debug)]
struct OutputFixture {
    assertion: OutputAssertion,
    collected: Option<Vec<Record>>,
}

/// Fixtures registered for one test run
#[derive(Default)]
struct FixtureSet {
    inputs: HashMap<SourceDescriptor, InputFixture>,
    outputs: HashMap<SourceDescriptor, OutputFixture>,
    dist_caches: HashMap<CacheDescriptor, Arc<dyn Any + Send + Sync>>,
}

/// Store of test fixtures keyed by run identifier
///
/// Cloning yields another handle to the same store. Every lookup requires the
/// run to have been started and the descriptor to be registered; nothing is
/// silently defaulted.
#[derive(Clone, Default)]
pub struct FixtureRegistry {
    runs: Arc<RwLock<HashMap<String, FixtureSet>>>,
}

impl FixtureRegistry {
    /// Create an isolated registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry shared by every test in the binary
    pub fn global() -> &'static FixtureRegistry {
        &GLOBAL
    }

    /// Register an empty fixture set for `run_id`
    pub fn start(&self, run_id: &str) -> ContextResult<()> {
        let mut runs = self.runs.write();
        if runs.contains_key(run_id) {
            return Err(ContextError::DuplicateRunId(run_id.to_string()));
        }
        runs.insert(run_id.to_string(), FixtureSet::default());
        debug!(run_id = %run_id, "test run started");
        Ok(())
    }

    pub fn is_started(&self, run_id: &str) -> bool {
        self.runs.read().contains_key(run_id)
    }

    /// Drop a run's fixtures without verifying them
    pub fn discard(&self, run_id: &str) -> bool {
        self.runs.write().remove(run_id).is_some()
    }

    pub fn register_input(
        &self,
        run_id: &str,
        descriptor: SourceDescriptor,
        records: Vec<Record>,
    ) -> ContextResult<()> {
        self.with_run(run_id, |set| {
            set.inputs.insert(
                descriptor,
                InputFixture {
                    records,
                    consumed: false,
                },
            );
        })
    }

    /// Register the assertion checked against everything written to `descriptor`
    pub fn register_output_assertion(
        &self,
        run_id: &str,
        descriptor: SourceDescriptor,
        assertion: OutputAssertion,
    ) -> ContextResult<()> {
        self.with_run(run_id, |set| {
            set.outputs.insert(
                descriptor,
                OutputFixture {
                    assertion,
                    collected: None,
                },
            );
        })
    }

    /// Register the value a distributed cache returns in this run
    pub fn register_dist_cache<T>(
        &self,
        run_id: &str,
        descriptor: CacheDescriptor,
        mock: T,
    ) -> ContextResult<()>
    where
        T: Send + Sync + 'static,
    {
        self.with_run(run_id, |set| {
            set.dist_caches.insert(descriptor, Arc::new(mock));
        })
    }

    /// Records registered for `descriptor`; marks the fixture as consumed
    pub fn lookup_input(&self, run_id: &str, descriptor: &SourceDescriptor) -> ContextResult<Vec<Record>> {
        let mut runs = self.runs.write();
        let set = runs
            .get_mut(run_id)
            .ok_or_else(|| not_started(run_id))?;
        let fixture = set
            .inputs
            .get_mut(descriptor)
            .ok_or_else(|| ContextError::missing_fixture(run_id, format!("input {}", descriptor)))?;
        fixture.consumed = true;
        Ok(fixture.records.clone())
    }

    /// Sink appending everything written to `descriptor` to the run's collector
    pub fn lookup_output_sink(
        &self,
        run_id: &str,
        descriptor: &SourceDescriptor,
    ) -> ContextResult<SinkFn> {
        {
            let runs = self.runs.read();
            let set = runs.get(run_id).ok_or_else(|| not_started(run_id))?;
            if !set.outputs.contains_key(descriptor) {
                return Err(ContextError::missing_fixture(
                    run_id,
                    format!("output {}", descriptor),
                ));
            }
        }

        let registry = self.clone();
        let run_id = run_id.to_string();
        let descriptor = descriptor.clone();
        Ok(Arc::new(move |records: Vec<Record>| {
            let mut runs = registry.runs.write();
            let output = runs
                .get_mut(&run_id)
                .and_then(|set| set.outputs.get_mut(&descriptor))
                .ok_or_else(|| {
                    ContextError::missing_fixture(&run_id, format!("output {}", descriptor))
                })?;
            output.collected.get_or_insert_with(Vec::new).extend(records);
            Ok(())
        }))
    }

    /// Mock registered for `descriptor`, which must have been registered as a `T`
    pub fn lookup_dist_cache<T>(&self, run_id: &str, descriptor: &CacheDescriptor) -> ContextResult<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let runs = self.runs.read();
        let set = runs.get(run_id).ok_or_else(|| not_started(run_id))?;
        let mock = set.dist_caches.get(descriptor).cloned().ok_or_else(|| {
            ContextError::missing_fixture(run_id, format!("distributed cache {}", descriptor))
        })?;
        mock.downcast::<T>().map_err(|_| {
            ContextError::missing_fixture(
                run_id,
                format!("distributed cache {} of type {}", descriptor, type_name::<T>()),
            )
        })
    }

    /// Records written to `descriptor` so far, if any
    pub fn collected_output(&self, run_id: &str, descriptor: &SourceDescriptor) -> Option<Vec<Record>> {
        self.runs
            .read()
            .get(run_id)
            .and_then(|set| set.outputs.get(descriptor))
            .and_then(|output| output.collected.clone())
    }

    /// Verify a run that reached `state` and remove its fixture set
    ///
    /// Assertions only run when the job succeeded; a failed job is already
    /// reported through its terminal state. The run is removed in every case.
    pub fn finish(&self, run_id: &str, state: JobState) -> ContextResult<()> {
        let set = self
            .runs
            .write()
            .remove(run_id)
            .ok_or_else(|| not_started(run_id))?;

        if !state.is_success() {
            debug!(run_id = %run_id, state = %state, "skipping fixture assertions for unsuccessful job");
            return Ok(());
        }

        let mut failures = Vec::new();

        let mut outputs: Vec<_> = set.outputs.into_iter().collect();
        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        for (descriptor, output) in outputs {
            match output.collected {
                Some(records) => {
                    let result = output.assertion.evaluate(&records);
                    if !result.passed {
                        let detail = result.failure_detail.unwrap_or_default();
                        failures.push(ContextError::assertion(
                            descriptor.to_string(),
                            format!("{}: {}", result.assertion, detail),
                        ));
                    }
                }
                None => failures.push(ContextError::assertion(
                    descriptor.to_string(),
                    "output was never written",
                )),
            }
        }

        let mut unused: Vec<_> = set
            .inputs
            .into_iter()
            .filter(|(_, input)| !input.consumed)
            .map(|(descriptor, _)| descriptor)
            .collect();
        unused.sort();
        for descriptor in unused {
            failures.push(ContextError::assertion(
                descriptor.to_string(),
                "unused input fixture",
            ));
        }

        for failure in &failures {
            warn!(run_id = %run_id, error = %failure, "fixture check failed");
        }
        match failures.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    fn with_run<F>(&self, run_id: &str, register: F) -> ContextResult<()>
    where
        F: FnOnce(&mut FixtureSet),
    {
        let mut runs = self.runs.write();
        let set = runs.get_mut(run_id).ok_or_else(|| not_started(run_id))?;
        register(set);
        Ok(())
    }
}

impl std::fmt::Debug for FixtureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let runs = self.runs.read();
        let mut ids: Vec<&String> = runs.keys().collect();
        ids.sort();
        f.debug_struct("FixtureRegistry").field("runs", &ids).finish()
    }
}

fn not_started(run_id: &str) -> ContextError {
    ContextError::missing_fixture(run_id, "any descriptor (run not started)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input() -> SourceDescriptor {
        SourceDescriptor::local_file("in.json")
    }

    fn output() -> SourceDescriptor {
        SourceDescriptor::local_file("out.json")
    }

    #[test]
    fn test_duplicate_run_id_rejected() {
        let registry = FixtureRegistry::new();
        registry.start("t1").unwrap();
        assert_eq!(
            registry.start("t1"),
            Err(ContextError::DuplicateRunId("t1".to_string()))
        );
    }

    #[test]
    fn test_lookup_before_start_fails() {
        let registry = FixtureRegistry::new();
        let result = registry.lookup_input("nope", &input());
        assert!(matches!(result, Err(ContextError::MissingFixture { .. })));
        assert!(registry.register_input("nope", input(), vec![]).is_err());
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = FixtureRegistry::new();
        registry.start("t1").unwrap();
        registry.register_input("t1", input(), vec![json!(1)]).unwrap();
        registry.register_input("t1", input(), vec![json!(2)]).unwrap();
        assert_eq!(registry.lookup_input("t1", &input()).unwrap(), vec![json!(2)]);
    }

    #[test]
    fn test_descriptors_with_same_name_are_distinct() {
        let registry = FixtureRegistry::new();
        registry.start("t1").unwrap();
        let plain = SourceDescriptor::local_file("data");
        let gzipped = SourceDescriptor::local_file("data").with_param("compression", "gzip");
        registry.register_input("t1", plain.clone(), vec![json!("plain")]).unwrap();

        assert_eq!(registry.lookup_input("t1", &plain).unwrap(), vec![json!("plain")]);
        assert!(matches!(
            registry.lookup_input("t1", &gzipped),
            Err(ContextError::MissingFixture { .. })
        ));
    }

    #[test]
    fn test_output_sink_collects_and_finish_verifies() {
        let registry = FixtureRegistry::new();
        registry.start("t1").unwrap();
        registry.register_input("t1", input(), vec![json!(1)]).unwrap();
        registry
            .register_output_assertion(
                "t1",
                output(),
                OutputAssertion::contains_in_any_order([json!(1), json!(2)]),
            )
            .unwrap();

        registry.lookup_input("t1", &input()).unwrap();
        let sink = registry.lookup_output_sink("t1", &output()).unwrap();
        sink(vec![json!(2)]).unwrap();
        sink(vec![json!(1)]).unwrap();
        assert_eq!(
            registry.collected_output("t1", &output()),
            Some(vec![json!(2), json!(1)])
        );

        assert_eq!(registry.finish("t1", JobState::Done), Ok(()));
        assert!(!registry.is_started("t1"));
        assert!(matches!(
            registry.lookup_input("t1", &input()),
            Err(ContextError::MissingFixture { .. })
        ));
    }

    #[test]
    fn test_output_sink_requires_registration() {
        let registry = FixtureRegistry::new();
        registry.start("t1").unwrap();
        assert!(matches!(
            registry.lookup_output_sink("t1", &output()),
            Err(ContextError::MissingFixture { .. })
        ));
    }

    #[test]
    fn test_failed_assertion_reported() {
        let registry = FixtureRegistry::new();
        registry.start("t1").unwrap();
        registry
            .register_output_assertion("t1", output(), OutputAssertion::HasLen(3))
            .unwrap();
        registry.lookup_output_sink("t1", &output()).unwrap()(vec![json!(1)]).unwrap();

        let err = registry.finish("t1", JobState::Done).unwrap_err();
        assert!(matches!(
            err,
            ContextError::AssertionFailed { ref descriptor, .. } if descriptor == "local_file:out.json"
        ));
    }

    #[test]
    fn test_unwritten_output_and_unused_input_fail() {
        let registry = FixtureRegistry::new();
        registry.start("t1").unwrap();
        registry
            .register_output_assertion("t1", output(), OutputAssertion::IsEmpty)
            .unwrap();
        let err = registry.finish("t1", JobState::Done).unwrap_err();
        assert_eq!(
            err,
            ContextError::assertion("local_file:out.json", "output was never written")
        );

        registry.start("t2").unwrap();
        registry.register_input("t2", input(), vec![json!(1)]).unwrap();
        let err = registry.finish("t2", JobState::Done).unwrap_err();
        assert_eq!(
            err,
            ContextError::assertion("local_file:in.json", "unused input fixture")
        );
    }

    #[test]
    fn test_failed_job_skips_assertions() {
        let registry = FixtureRegistry::new();
        registry.start("t1").unwrap();
        registry
            .register_output_assertion("t1", output(), OutputAssertion::HasLen(1))
            .unwrap();
        assert_eq!(registry.finish("t1", JobState::Failed), Ok(()));
        assert!(!registry.is_started("t1"));
    }

    #[test]
    fn test_dist_cache_mock_is_typed() {
        let registry = FixtureRegistry::new();
        registry.start("t1").unwrap();
        let descriptor = CacheDescriptor::single("gs://bucket/lookup.csv");
        registry
            .register_dist_cache("t1", descriptor.clone(), vec!["a".to_string()])
            .unwrap();

        let mock = registry
            .lookup_dist_cache::<Vec<String>>("t1", &descriptor)
            .unwrap();
        assert_eq!(*mock, vec!["a".to_string()]);
        assert!(registry.lookup_dist_cache::<u32>("t1", &descriptor).is_err());
        assert!(registry
            .lookup_dist_cache::<Vec<String>>("t1", &CacheDescriptor::single("other"))
            .is_err());
    }

    #[test]
    fn test_global_registry_is_shared() {
        let run_id = format!("global-{}", uuid::Uuid::new_v4());
        FixtureRegistry::global().start(&run_id).unwrap();
        assert!(FixtureRegistry::global().is_started(&run_id));
        assert!(FixtureRegistry::global().discard(&run_id));
    }
}
