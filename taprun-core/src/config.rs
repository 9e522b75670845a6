// Context Options
// Immutable configuration handed to an execution context at construction

use crate::error::{ContextError, ContextResult};
use crate::runners::{DirectRunner, DirectStrategy, PipelineRunner, StagedStrategy, SubmissionStrategy};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Runner selected for a job
///
/// The tag is mapped statically to the submission strategy and default
/// runner; there is no lookup by name at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// In-process execution on the local machine
    #[default]
    Direct,
    /// A remote cluster runner supplied by the caller
    Cluster,
}

impl RunnerKind {
    /// Submission strategy for this runner kind
    pub fn strategy(&self) -> Box<dyn SubmissionStrategy> {
        match self {
            RunnerKind::Direct => Box::new(DirectStrategy),
            RunnerKind::Cluster => Box::new(StagedStrategy),
        }
    }

    /// Runner used when the caller did not supply one
    pub fn default_runner(&self) -> Option<Arc<dyn PipelineRunner>> {
        match self {
            RunnerKind::Direct => Some(Arc::new(DirectRunner::new())),
            RunnerKind::Cluster => None,
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerKind::Direct => write!(f, "direct"),
            RunnerKind::Cluster => write!(f, "cluster"),
        }
    }
}

impl std::str::FromStr for RunnerKind {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(RunnerKind::Direct),
            "cluster" => Ok(RunnerKind::Cluster),
            other => Err(ContextError::Config(format!("unknown runner '{}'", other))),
        }
    }
}

/// Options for an execution context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextOptions {
    /// Name reported for the submitted job
    pub job_name: String,

    /// Runner the job is submitted to
    pub runner: RunnerKind,

    /// File receiving the final metrics snapshot
    pub metrics_location: Option<PathBuf>,

    /// Worker-local directory for distributed cache materialization
    pub cache_dir: PathBuf,

    /// Remote location that staged artifacts are uploaded to
    pub staging_location: Option<String>,

    /// Free-form options passed through to runners and connectors
    pub extra: BTreeMap<String, String>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("taprun")
            .join("dist-cache");

        Self {
            job_name: "taprun-job".to_string(),
            runner: RunnerKind::Direct,
            metrics_location: None,
            cache_dir,
            staging_location: None,
            extra: BTreeMap::new(),
        }
    }
}

impl ContextOptions {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Default::default()
        }
    }

    /// Load options from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ContextResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parse options from YAML text
    pub fn from_yaml_str(content: &str) -> ContextResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Merge `--key=value` (or `key=value`) pairs on top of these options
    ///
    /// Recognised keys update the typed fields, everything else lands in
    /// `extra`.
    pub fn merge_args<I, S>(mut self, args: I) -> ContextResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            let arg = arg.as_ref();
            let pair = arg.trim_start_matches("--");
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ContextError::Config(format!("invalid option '{}'. Expected key=value", arg))
            })?;
            if key.is_empty() {
                return Err(ContextError::Config(format!("invalid option '{}'", arg)));
            }

            match key {
                "jobName" => self.job_name = value.to_string(),
                "runner" => self.runner = value.parse()?,
                "metricsLocation" => self.metrics_location = Some(PathBuf::from(value)),
                "cacheDir" => self.cache_dir = PathBuf::from(value),
                "stagingLocation" => self.staging_location = Some(value.to_string()),
                _ => {
                    self.extra.insert(key.to_string(), value.to_string());
                }
            }
        }
        Ok(self)
    }

    pub fn with_runner(mut self, runner: RunnerKind) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_metrics_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_location = Some(path.into());
        self
    }

    pub fn with_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = path.into();
        self
    }

    pub fn with_staging_location(mut self, location: impl Into<String>) -> Self {
        self.staging_location = Some(location.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Look up a free-form option
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(|s| s.as_str())
    }
}
