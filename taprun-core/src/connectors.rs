// Connectors
// Readers and writers for external data, and taps reading job output back

use crate::descriptor::{ConnectorKind, Record, SourceDescriptor};
use crate::error::{ContextError, ContextResult};
use crate::graph::SinkFn;

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Access to one kind of external system
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    /// Read every record behind `descriptor`
    fn read(&self, descriptor: &SourceDescriptor) -> ContextResult<Vec<Record>>;

    /// Sink writing records to `descriptor`
    fn writer(&self, descriptor: &SourceDescriptor) -> ContextResult<SinkFn>;
}

/// Connectors by the kind of descriptor they serve
#[derive(Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<ConnectorKind, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Registry without any connector
    pub fn empty() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Register (or replace) the connector for `kind`
    pub fn register(&mut self, kind: ConnectorKind, connector: Arc<dyn Connector>) {
        self.connectors.insert(kind, connector);
    }

    pub fn with(mut self, kind: ConnectorKind, connector: Arc<dyn Connector>) -> Self {
        self.register(kind, connector);
        self
    }

    pub fn get(&self, kind: &ConnectorKind) -> ContextResult<Arc<dyn Connector>> {
        self.connectors
            .get(kind)
            .cloned()
            .ok_or_else(|| ContextError::Connector(format!("no connector registered for {}", kind)))
    }

    /// Connector serving `descriptor`
    pub fn for_descriptor(&self, descriptor: &SourceDescriptor) -> ContextResult<Arc<dyn Connector>> {
        self.get(&descriptor.kind)
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::empty().with(ConnectorKind::LocalFile, Arc::new(LocalFileConnector::new()))
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<String> = self.connectors.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("ConnectorRegistry").field("kinds", &kinds).finish()
    }
}

/// Newline-delimited JSON files; the descriptor name is the path
#[derive(Debug, Clone, Default)]
pub struct LocalFileConnector {
    root: Option<PathBuf>,
}

impl LocalFileConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative descriptor names against `root`
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    fn path_of(&self, descriptor: &SourceDescriptor) -> PathBuf {
        match &self.root {
            Some(root) => root.join(&descriptor.name),
            None => PathBuf::from(&descriptor.name),
        }
    }
}

impl Connector for LocalFileConnector {
    fn name(&self) -> &str {
        "local_file"
    }

    fn read(&self, descriptor: &SourceDescriptor) -> ContextResult<Vec<Record>> {
        let path = self.path_of(descriptor);
        let file = fs::File::open(&path)
            .map_err(|e| ContextError::Connector(format!("{}: {}", path.display(), e)))?;

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| {
                ContextError::Connector(format!("{}:{}: {}", path.display(), index + 1, e))
            })?;
            records.push(record);
        }
        debug!(path = %path.display(), records = records.len(), "read local file");
        Ok(records)
    }

    fn writer(&self, descriptor: &SourceDescriptor) -> ContextResult<SinkFn> {
        let path = self.path_of(descriptor);
        Ok(Arc::new(move |records: Vec<Record>| {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let mut out = BufWriter::new(fs::File::create(&path)?);
            for record in &records {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            debug!(path = %path.display(), records = records.len(), "wrote local file");
            Ok(())
        }))
    }
}

/// Where a tap reads materialised output from
#[derive(Clone)]
enum TapSource {
    Connector(Arc<dyn Connector>),
    /// Records captured in memory by a test-mode sink
    Collected(Arc<Mutex<Vec<Record>>>),
}

/// Readable handle to a job output, valid once the job succeeded
#[derive(Clone)]
pub struct Tap {
    descriptor: SourceDescriptor,
    source: TapSource,
}

impl Tap {
    pub(crate) fn from_connector(descriptor: SourceDescriptor, connector: Arc<dyn Connector>) -> Self {
        Self {
            descriptor,
            source: TapSource::Connector(connector),
        }
    }

    pub(crate) fn from_collected(descriptor: SourceDescriptor, collected: Arc<Mutex<Vec<Record>>>) -> Self {
        Self {
            descriptor,
            source: TapSource::Collected(collected),
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// Read every record written to the output
    pub fn read(&self) -> ContextResult<Vec<Record>> {
        match &self.source {
            TapSource::Connector(connector) => connector.read(&self.descriptor),
            TapSource::Collected(collected) => Ok(collected.lock().clone()),
        }
    }

    /// Read the output and deserialise each record as a `T`
    pub fn read_as<T: DeserializeOwned>(&self) -> ContextResult<Vec<T>> {
        self.read()?
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(Into::into))
            .collect()
    }
}

impl std::fmt::Debug for Tap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            TapSource::Connector(connector) => connector.name().to_string(),
            TapSource::Collected(_) => "memory".to_string(),
        };
        f.debug_struct("Tap")
            .field("descriptor", &self.descriptor)
            .field("source", &source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_local_file_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let connector = LocalFileConnector::new().with_root(temp.path());
        let descriptor = SourceDescriptor::local_file("nested/out.jsonl");

        let write = connector.writer(&descriptor).unwrap();
        write(vec![json!({"word": "a"}), json!({"word": "b"})]).unwrap();

        let content = fs::read_to_string(temp.path().join("nested/out.jsonl")).unwrap();
        assert_eq!(content, "{\"word\":\"a\"}\n{\"word\":\"b\"}\n");
        assert_eq!(connector.read(&descriptor).unwrap().len(), 2);
    }

    #[test]
    fn test_read_skips_blank_lines_and_reports_bad_ones() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("in.jsonl"), "1\n\n2\nnot json\n").unwrap();
        let connector = LocalFileConnector::new().with_root(temp.path());

        let err = connector
            .read(&SourceDescriptor::local_file("in.jsonl"))
            .unwrap_err();
        assert!(matches!(err, ContextError::Connector(ref msg) if msg.contains(":4:")));
    }

    #[test]
    fn test_read_missing_file_fails() {
        let connector = LocalFileConnector::new();
        let result = connector.read(&SourceDescriptor::local_file("/no/such/file.jsonl"));
        assert!(matches!(result, Err(ContextError::Connector(_))));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ConnectorRegistry::default();
        assert!(registry
            .for_descriptor(&SourceDescriptor::local_file("a"))
            .is_ok());
        let pubsub = SourceDescriptor::new(ConnectorKind::PubSub, "topic");
        assert!(matches!(
            registry.for_descriptor(&pubsub),
            Err(ContextError::Connector(_))
        ));
    }

    #[test]
    fn test_tap_reads_collected_records() {
        let collected = Arc::new(Mutex::new(vec![json!(1), json!(2)]));
        let tap = Tap::from_collected(SourceDescriptor::local_file("out"), collected);
        let values: Vec<i64> = tap.read_as().unwrap();
        assert_eq!(values, vec![1, 2]);
    }
}
