// Job Graph
// Append-only description of the computation handed to a runner

use crate::descriptor::{Record, SourceDescriptor};
use crate::error::{ContextError, ContextResult};

use std::fmt;
use std::sync::Arc;

/// Produces the records of a source when the job executes
pub type SourceFn = Arc<dyn Fn() -> ContextResult<Vec<Record>> + Send + Sync>;

/// Applies a transform to one record, yielding zero or more records
pub type TransformFn = Arc<dyn Fn(Record) -> ContextResult<Vec<Record>> + Send + Sync>;

/// Consumes the records reaching a sink
pub type SinkFn = Arc<dyn Fn(Vec<Record>) -> ContextResult<()> + Send + Sync>;

/// Index of a node inside its graph
pub type NodeId = usize;

/// Handle to the output of a graph node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Collection {
    node: NodeId,
}

impl Collection {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

/// Operation performed by a node
#[derive(Clone)]
pub enum NodeKind {
    Source {
        descriptor: SourceDescriptor,
        read: SourceFn,
    },
    Transform {
        input: NodeId,
        apply: TransformFn,
    },
    Sink {
        input: NodeId,
        descriptor: SourceDescriptor,
        write: SinkFn,
    },
}

/// A labelled node of the job graph
#[derive(Clone)]
pub struct Node {
    pub id: NodeId,
    pub label: String,
    pub kind: NodeKind,
}

impl Node {
    /// Node whose output feeds this one, if any
    pub fn input(&self) -> Option<NodeId> {
        match &self.kind {
            NodeKind::Source { .. } => None,
            NodeKind::Transform { input, .. } | NodeKind::Sink { input, .. } => Some(*input),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            NodeKind::Source { .. } => "source",
            NodeKind::Transform { .. } => "transform",
            NodeKind::Sink { .. } => "sink",
        };
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("kind", &kind)
            .field("input", &self.input())
            .finish()
    }
}

/// Job graph built by an execution context
///
/// Nodes only reference nodes added before them, so insertion order is a
/// valid execution order.
#[derive(Debug, Clone)]
pub struct JobGraph {
    name: String,
    nodes: Vec<Node>,
    counters: Vec<String>,
}

impl JobGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            counters: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Counters declared on the graph before submission
    pub fn declared_counters(&self) -> &[String] {
        &self.counters
    }

    pub fn declare_counter(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.counters.contains(&name) {
            self.counters.push(name);
        }
    }

    pub fn add_source(&mut self, descriptor: SourceDescriptor, read: SourceFn) -> Collection {
        let label = format!("read({})", descriptor);
        self.push(label, NodeKind::Source { descriptor, read })
    }

    pub fn add_transform(
        &mut self,
        label: impl Into<String>,
        input: Collection,
        apply: TransformFn,
    ) -> ContextResult<Collection> {
        self.check_input(input)?;
        Ok(self.push(
            label.into(),
            NodeKind::Transform {
                input: input.node,
                apply,
            },
        ))
    }

    pub fn add_sink(
        &mut self,
        input: Collection,
        descriptor: SourceDescriptor,
        write: SinkFn,
    ) -> ContextResult<Collection> {
        self.check_input(input)?;
        let label = format!("write({})", descriptor);
        Ok(self.push(
            label,
            NodeKind::Sink {
                input: input.node,
                descriptor,
                write,
            },
        ))
    }

    /// Number of sink nodes
    pub fn sink_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Sink { .. }))
            .count()
    }

    fn push(&mut self, label: String, kind: NodeKind) -> Collection {
        let id = self.nodes.len();
        self.nodes.push(Node { id, label, kind });
        Collection { node: id }
    }

    fn check_input(&self, input: Collection) -> ContextResult<()> {
        match self.nodes.get(input.node) {
            Some(Node {
                kind: NodeKind::Sink { .. },
                ..
            }) => Err(ContextError::Submission(format!(
                "node {} is a sink and has no output",
                input.node
            ))),
            Some(_) => Ok(()),
            None => Err(ContextError::Submission(format!(
                "unknown collection (node {})",
                input.node
            ))),
        }
    }
}
