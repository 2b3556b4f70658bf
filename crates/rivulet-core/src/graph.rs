//! Execution graph: the arena of physical operator nodes and the values flowing between them.
//!
//! The graph is the sole owner of nodes and value slots; everything else refers to them by
//! integer handle ([`NodeId`], [`ValueId`]), so producer back-links cannot form ownership
//! cycles. Nodes are appended in dispatch order, which is a topological order by construction:
//! an operator can only consume values that already have a slot.
//!
//! Node lifecycle: `Pending` until every input value is materialized, then `Ready`, `Running`
//! while its kernel or collective executes, and finally `Done` or `Failed`. A failure cascades:
//! every transitive dependent of a `Failed` node is marked `Failed` without its kernel running.

use std::fmt::Display;

use thiserror::Error;

use crate::boxing::BoxingStep;
use crate::placement::Placement;
use crate::registry::AttrMap;
use crate::tensor::TensorMeta;
use crate::types::Buffer;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for graph bookkeeping.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum GraphError {
    /// Error returned when a node handle does not belong to this graph.
    #[error("node {node} does not belong to this graph")]
    UnknownNode { node: NodeId },

    /// Error returned when a value handle does not belong to this graph.
    #[error("value {value} does not belong to this graph")]
    UnknownValue { value: ValueId },

    /// Error returned when a value's shards are read before its producer has run.
    #[error("value {value} has not been materialized")]
    ValueNotMaterialized { value: ValueId },

    /// Error returned when a node is executed out of lifecycle order.
    #[error("node {node} is {state} and cannot run")]
    NotRunnable { node: NodeId, state: NodeState },

    /// Error returned when a node cannot run because an upstream node failed.
    #[error("node `{name}` failed because an upstream node failed")]
    UpstreamFailure { name: String },
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Handle to a node owned by an execution graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Handle to a value slot owned by an execution graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ValueId(pub(crate) usize);

impl Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Lifecycle state of a node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Done | NodeState::Failed)
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Done => "done",
            NodeState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// What a node executes.
#[derive(Clone, Debug)]
pub enum NodeKind {
    /// A registered operator's per-rank kernel.
    Compute { op_kind: String, attrs: AttrMap },
    /// One boxing step converting its input value's distribution into its output's.
    Boxing { step: BoxingStep },
}

/// One physical operator node.
#[derive(Clone, Debug)]
pub struct Node {
    name: String,
    kind: NodeKind,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    placement: Placement,
    state: NodeState,
}

impl Node {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[ValueId] {
        self.inputs.as_slice()
    }

    pub fn outputs(&self) -> &[ValueId] {
        self.outputs.as_slice()
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn state(&self) -> NodeState {
        self.state
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            NodeKind::Compute { op_kind, .. } => write!(f, "{}[{}]", self.name, op_kind),
            NodeKind::Boxing { step } => write!(f, "{}[{}]", self.name, step),
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// One value slot: logical metadata plus, once its producer has run, the per-rank shards.
#[derive(Clone, Debug)]
pub struct Value {
    meta: TensorMeta,
    producer: Option<NodeId>,
    shards: Option<Vec<Buffer>>,
}

impl Value {
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    pub fn producer(&self) -> Option<NodeId> {
        self.producer
    }

    pub fn is_materialized(&self) -> bool {
        self.shards.is_some()
    }
}

// ---------------------------------------------------------------------------
// Execution graph
// ---------------------------------------------------------------------------

/// Arena of nodes and value slots, appended to by the dispatcher and driven by the executor.
#[derive(Clone, Debug, Default)]
pub struct ExecutionGraph {
    nodes: Vec<Node>,
    values: Vec<Value>,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value slot with no producer (an externally fed input).
    pub fn add_input_value(&mut self, meta: TensorMeta, shards: Vec<Buffer>) -> ValueId {
        self.values.push(Value { meta, producer: None, shards: Some(shards) });
        ValueId(self.values.len() - 1)
    }

    /// Adds an unmaterialized value slot; its producer is stamped by [`Self::add_node`].
    pub fn add_value(&mut self, meta: TensorMeta) -> ValueId {
        self.values.push(Value { meta, producer: None, shards: None });
        ValueId(self.values.len() - 1)
    }

    /// Appends a node producing `outputs` from `inputs`. The node starts `Pending` and is
    /// promoted to `Ready` immediately if all inputs are already materialized.
    pub fn add_node(
        &mut self,
        name: String,
        kind: NodeKind,
        inputs: Vec<ValueId>,
        outputs: Vec<ValueId>,
        placement: Placement,
    ) -> Result<NodeId, GraphError> {
        for value in inputs.iter().chain(outputs.iter()) {
            if value.0 >= self.values.len() {
                return Err(GraphError::UnknownValue { value: *value });
            }
        }
        let id = NodeId(self.nodes.len());
        for output in &outputs {
            self.values[output.0].producer = Some(id);
        }
        let state = if inputs.iter().all(|input| self.values[input.0].shards.is_some()) {
            NodeState::Ready
        } else {
            NodeState::Pending
        };
        self.nodes.push(Node { name, kind, inputs, outputs, placement, state });
        log::trace!("appended {} as {}", self.nodes[id.0], state);
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(id.0).ok_or(GraphError::UnknownNode { node: id })
    }

    pub fn value(&self, id: ValueId) -> Result<&Value, GraphError> {
        self.values.get(id.0).ok_or(GraphError::UnknownValue { value: id })
    }

    /// Number of nodes appended so far.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Node handles in append (topological) order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// The materialized per-rank shards of `id`.
    pub fn shards(&self, id: ValueId) -> Result<&[Buffer], GraphError> {
        let value = self.value(id)?;
        value
            .shards
            .as_deref()
            .ok_or(GraphError::ValueNotMaterialized { value: id })
    }

    /// Stores the per-rank shards of `id` and promotes consumers whose inputs are now complete.
    pub fn materialize(&mut self, id: ValueId, shards: Vec<Buffer>) -> Result<(), GraphError> {
        if id.0 >= self.values.len() {
            return Err(GraphError::UnknownValue { value: id });
        }
        self.values[id.0].shards = Some(shards);
        for node_index in 0..self.nodes.len() {
            let node = &self.nodes[node_index];
            if node.state == NodeState::Pending
                && node.inputs.contains(&id)
                && node.inputs.iter().all(|input| self.values[input.0].shards.is_some())
            {
                self.set_state(NodeId(node_index), NodeState::Ready)?;
            }
        }
        Ok(())
    }

    pub fn set_state(&mut self, id: NodeId, state: NodeState) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(id.0).ok_or(GraphError::UnknownNode { node: id })?;
        log::trace!("{}: {} -> {}", node, node.state, state);
        node.state = state;
        Ok(())
    }

    /// Nodes consuming any output of `id`, in append order.
    pub fn consumers(&self, id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let outputs = self.node(id)?.outputs.clone();
        Ok(self
            .node_ids()
            .filter(|candidate| {
                self.nodes[candidate.0].inputs.iter().any(|input| outputs.contains(input))
            })
            .collect())
    }

    /// Marks `id` `Failed` and cascades the failure to every transitive dependent.
    ///
    /// Cascaded nodes never run their kernel; their outputs stay unmaterialized.
    pub fn fail_cascade(&mut self, id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        self.node(id)?;
        let mut failed = vec![id];
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            self.set_state(current, NodeState::Failed)?;
            for dependent in self.consumers(current)? {
                if !failed.contains(&dependent) && !self.nodes[dependent.0].state.is_terminal() {
                    failed.push(dependent);
                    frontier.push(dependent);
                }
            }
        }
        failed.sort_by_key(|node| node.0);
        Ok(failed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
