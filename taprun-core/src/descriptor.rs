// Data Source Descriptors
// Structural keys identifying sources, sinks and distributed cache resources

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ContextResult;

use serde::{Deserialize, Serialize};

/// A single record flowing through a job graph
pub type Record = serde_json::Value;

/// Convert typed values into records
pub fn to_records<T, I>(items: I) -> ContextResult<Vec<Record>>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    items
        .into_iter()
        .map(|item| serde_json::to_value(item).map_err(Into::into))
        .collect()
}

/// Kind of external system a descriptor points at
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    /// Newline-delimited JSON files on the local filesystem
    LocalFile,
    ObjectStore,
    PubSub,
    KeyValue,
    Custom(String),
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorKind::LocalFile => write!(f, "local_file"),
            ConnectorKind::ObjectStore => write!(f, "object_store"),
            ConnectorKind::PubSub => write!(f, "pubsub"),
            ConnectorKind::KeyValue => write!(f, "key_value"),
            ConnectorKind::Custom(name) => write!(f, "custom({})", name),
        }
    }
}

/// Structural description of a data source or sink
///
/// Fixtures are keyed by the whole descriptor, so two descriptors that share
/// a name but differ in kind or parameters are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub kind: ConnectorKind,
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl SourceDescriptor {
    pub fn new(kind: ConnectorKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Descriptor for a newline-delimited JSON file
    pub fn local_file(path: impl Into<String>) -> Self {
        Self::new(ConnectorKind::LocalFile, path)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)?;
        if !self.params.is_empty() {
            let params: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "[{}]", params.join(","))?;
        }
        Ok(())
    }
}

/// Identifies a distributed cache by its source locators
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheDescriptor {
    pub uris: Vec<String>,
}

impl CacheDescriptor {
    pub fn single(uri: impl Into<String>) -> Self {
        Self {
            uris: vec![uri.into()],
        }
    }

    pub fn many<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            uris: uris.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CacheDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dist_cache:[{}]", self.uris.join(","))
    }
}
