//! Operator dispatch: from a logical invocation to physical nodes in the execution graph.
//!
//! A dispatch call validates shapes and dtypes against the operator's signature, picks the
//! distribution signature that needs the least boxing, inserts the boxing nodes that reconcile
//! each input's current distribution with the required one, then appends the compute node and
//! (in eager mode) executes everything immediately. Signature selection works one grid axis at
//! a time, since every distribution entry acts on a single grid axis; the tie-break among
//! usable signatures is the context's configurable [`TieBreak`] policy.
//!
//! Dispatch calls from one logical thread of control are totally ordered, and that order is
//! what defines the graph's data-dependency edges.

use std::collections::HashMap;

use crate::boxing::convert_entry;
use crate::context::{Context, TieBreak};
use crate::executor;
use crate::graph::{ExecutionGraph, NodeId, NodeKind};
use crate::placement::Placement;
use crate::registry::{AttrMap, DispatchError, DistributionSignature};
use crate::sbp::{Distribution, SbpEntry};
use crate::tensor::{LogicalTensor, TensorDesc, TensorMeta};
use crate::types::Buffer;

// ---------------------------------------------------------------------------
// Execution mode
// ---------------------------------------------------------------------------

/// When appended nodes run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Every node executes the moment it is appended.
    Eager,
    /// Nodes accumulate and run together on [`Dispatcher::run`] (or a host-visible fetch).
    Graph,
}

// ---------------------------------------------------------------------------
// Gradient tape
// ---------------------------------------------------------------------------

/// Tape record of one compute node, used to replay it backward.
///
/// Inputs are the handles as passed to `dispatch`, before any boxing: gradient rules dispatch
/// ordinary operators, so boxing inserted during the forward pass stays out of the backward
/// walk entirely.
#[derive(Clone, Debug)]
pub(crate) struct TapeEntry {
    pub(crate) op_kind: String,
    pub(crate) attrs: AttrMap,
    pub(crate) inputs: Vec<LogicalTensor>,
    pub(crate) outputs: Vec<LogicalTensor>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Entry point of the engine: feeds inputs, dispatches operators, owns the execution graph.
#[derive(Debug)]
pub struct Dispatcher<'ctx> {
    context: &'ctx Context,
    graph: ExecutionGraph,
    mode: ExecutionMode,
    pub(crate) tape: HashMap<NodeId, TapeEntry>,
}

impl<'ctx> Dispatcher<'ctx> {
    /// Creates an eager-mode dispatcher.
    pub fn new(context: &'ctx Context) -> Self {
        Self::with_mode(context, ExecutionMode::Eager)
    }

    /// Creates a graph-mode dispatcher; nodes run on [`Self::run`].
    pub fn lazy(context: &'ctx Context) -> Self {
        Self::with_mode(context, ExecutionMode::Graph)
    }

    pub fn with_mode(context: &'ctx Context, mode: ExecutionMode) -> Self {
        Self { context, graph: ExecutionGraph::new(), mode, tape: HashMap::new() }
    }

    pub fn context(&self) -> &'ctx Context {
        self.context
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    /// Feeds an input tensor from explicit per-rank shards.
    pub fn feed(
        &mut self,
        desc: TensorDesc,
        placement: Placement,
        distribution: Distribution,
        shards: Vec<Buffer>,
        requires_grad: bool,
    ) -> Result<LogicalTensor, DispatchError> {
        let meta = TensorMeta::new(desc, placement, distribution);
        let local_shape = meta.local_shape()?;
        let local_len = local_shape.iter().product::<usize>();
        if shards.len() != meta.placement().rank_count() {
            return Err(DispatchError::ShapeMismatch {
                op_kind: "feed".to_string(),
                details: format!(
                    "{} shard(s) fed for a {}-rank placement",
                    shards.len(),
                    meta.placement().rank_count(),
                ),
            });
        }
        for shard in &shards {
            if shard.dtype() != meta.dtype() {
                return Err(DispatchError::DtypeMismatch {
                    op_kind: "feed".to_string(),
                    expected: meta.dtype(),
                    actual: shard.dtype(),
                });
            }
            if shard.len() != local_len {
                return Err(DispatchError::ShapeMismatch {
                    op_kind: "feed".to_string(),
                    details: format!("shard has {} element(s), local shape {local_shape:?} implies {local_len}", shard.len()),
                });
            }
        }
        let value = self.graph.add_input_value(meta.clone(), shards);
        Ok(LogicalTensor { value, meta, producer: None, requires_grad })
    }

    /// Feeds an input tensor from its global view, sharding it per the distribution.
    ///
    /// Partial-sum grid axes use the canonical zero-fill encoding: the rank at coordinate 0 of
    /// the axis holds the value, its peers hold zeros.
    pub fn feed_global(
        &mut self,
        desc: TensorDesc,
        placement: Placement,
        distribution: Distribution,
        global: Buffer,
        requires_grad: bool,
    ) -> Result<LogicalTensor, DispatchError> {
        if global.dtype() != desc.dtype() {
            return Err(DispatchError::DtypeMismatch {
                op_kind: "feed".to_string(),
                expected: desc.dtype(),
                actual: global.dtype(),
            });
        }
        if global.len() != desc.element_count() {
            return Err(DispatchError::ShapeMismatch {
                op_kind: "feed".to_string(),
                details: format!("global buffer has {} element(s), shape {:?} implies {}", global.len(), desc.shape(), desc.element_count()),
            });
        }

        let rank_count = placement.rank_count();
        let mut shards = Vec::with_capacity(rank_count);
        for rank_index in 0..rank_count {
            let ranges = distribution.shard_ranges(desc.shape(), &placement, rank_index)?;
            let mut shard = global.clone();
            let mut shape = desc.shape().to_vec();
            for (axis, range) in ranges.iter().enumerate() {
                if range.len() != shape[axis] {
                    shard = shard.slice_axis(shape.as_slice(), axis, range.start, range.end)?;
                    shape[axis] = range.len();
                }
            }
            let zero_filled = distribution.entries().iter().enumerate().any(|(grid_axis, entry)| {
                matches!(entry, SbpEntry::PartialSum)
                    && placement.coordinate(rank_index).is_some_and(|coordinate| coordinate[grid_axis] != 0)
            });
            if zero_filled {
                shard = Buffer::zeros(desc.dtype(), shard.len());
            }
            shards.push(shard);
        }
        self.feed(desc, placement, distribution, shards, requires_grad)
    }

    /// Converts `tensor` to `target`, inserting (and in eager mode executing) boxing nodes.
    ///
    /// Boxing is transparent to the gradient tape: the returned handle keeps the source
    /// tensor's producer link and gradient requirement.
    pub fn box_to(&mut self, tensor: &LogicalTensor, target: &Distribution) -> Result<LogicalTensor, DispatchError> {
        if tensor.distribution() == target {
            return Ok(tensor.clone());
        }
        let placement = tensor.placement().clone();
        let plan = self.context.boxing_plan(tensor.distribution(), target, &placement)?;

        let mut value = tensor.value;
        let mut meta = tensor.meta.clone();
        for step in plan.steps() {
            let mut entries = meta.distribution().entries().to_vec();
            entries[step.grid_axis] = target.entries()[step.grid_axis];
            let next_meta = meta.with_distribution(Distribution::new(entries));
            // Validates divisibility of the post-step layout before any data moves.
            next_meta.local_shape()?;

            let output = self.graph.add_value(next_meta.clone());
            let node = self.graph.add_node(
                self.context.unique_name("boxing"),
                NodeKind::Boxing { step: *step },
                vec![value],
                vec![output],
                placement.clone(),
            )?;
            if self.mode == ExecutionMode::Eager {
                executor::execute_node(self.context, &mut self.graph, node)?;
            }
            value = output;
            meta = next_meta;
        }
        Ok(LogicalTensor { value, meta, producer: tensor.producer, requires_grad: tensor.requires_grad })
    }

    /// Dispatches one logical operator invocation.
    pub fn dispatch(
        &mut self,
        op_kind: &str,
        inputs: &[&LogicalTensor],
        attrs: AttrMap,
    ) -> Result<Vec<LogicalTensor>, DispatchError> {
        let operator = self.context.registry().get(op_kind)?;

        let placement = match inputs.first() {
            Some(first) => first.placement().clone(),
            None => {
                return Err(DispatchError::ArityMismatch { op_kind: op_kind.to_string(), expected: 1, actual: 0 })
            }
        };
        if inputs.iter().any(|input| input.placement() != &placement) {
            return Err(DispatchError::PlacementMismatch { op_kind: op_kind.to_string() });
        }

        let descs = inputs.iter().map(|input| input.meta().desc().clone()).collect::<Vec<_>>();
        let output_descs = operator.infer(descs.as_slice(), &attrs)?;

        let signatures = operator
            .distribution_signatures(descs.as_slice(), &attrs)
            .into_iter()
            .filter(|signature| {
                signature.inputs().len() == inputs.len() && signature.outputs().len() == output_descs.len()
            })
            .collect::<Vec<_>>();

        // Pick one signature per grid axis; the axes compose independently.
        let mut input_entries = vec![Vec::with_capacity(placement.ndim()); inputs.len()];
        let mut output_entries = vec![Vec::with_capacity(placement.ndim()); output_descs.len()];
        for grid_axis in 0..placement.ndim() {
            let axis_size = placement.grid()[grid_axis];
            let selected = select_signature(
                signatures.as_slice(),
                inputs,
                &descs,
                &output_descs,
                grid_axis,
                axis_size,
                self.context.tie_break(),
            )
            .ok_or_else(|| DispatchError::NoUsableSignature { op_kind: op_kind.to_string() })?;
            for (input_index, entry) in selected.inputs().iter().enumerate() {
                input_entries[input_index].push(*entry);
            }
            for (output_index, entry) in selected.outputs().iter().enumerate() {
                output_entries[output_index].push(*entry);
            }
        }

        let mut bound_values = Vec::with_capacity(inputs.len());
        for (input, entries) in inputs.iter().zip(input_entries) {
            let required = Distribution::new(entries);
            let bound = self.box_to(input, &required)?;
            bound_values.push(bound.value);
        }

        let mut output_values = Vec::with_capacity(output_descs.len());
        let mut output_metas = Vec::with_capacity(output_descs.len());
        for (desc, entries) in output_descs.into_iter().zip(output_entries) {
            let meta = TensorMeta::new(desc, placement.clone(), Distribution::new(entries));
            meta.local_shape()?;
            output_values.push(self.graph.add_value(meta.clone()));
            output_metas.push(meta);
        }

        let node = self.graph.add_node(
            self.context.unique_name(op_kind),
            NodeKind::Compute { op_kind: op_kind.to_string(), attrs: attrs.clone() },
            bound_values,
            output_values.clone(),
            placement,
        )?;
        if self.mode == ExecutionMode::Eager {
            executor::execute_node(self.context, &mut self.graph, node)?;
        }

        let requires_grad = inputs.iter().any(|input| input.requires_grad);
        let outputs = output_values
            .into_iter()
            .zip(output_metas)
            .map(|(value, meta)| LogicalTensor { value, meta, producer: Some(node), requires_grad })
            .collect::<Vec<_>>();
        self.tape.insert(
            node,
            TapeEntry {
                op_kind: op_kind.to_string(),
                attrs,
                inputs: inputs.iter().map(|input| (*input).clone()).collect(),
                outputs: outputs.clone(),
            },
        );
        Ok(outputs)
    }

    /// Runs every deferred node. A no-op in eager mode.
    pub fn run(&mut self) -> Result<(), DispatchError> {
        executor::run(self.context, &mut self.graph)
    }

    /// The materialized per-rank shards of `tensor`.
    pub fn shards(&self, tensor: &LogicalTensor) -> Result<&[Buffer], DispatchError> {
        Ok(self.graph.shards(tensor.value)?)
    }

    /// Assembles the global view of `tensor` from its shards.
    ///
    /// This is a host-visible read, so it is a synchronization point: deferred nodes run first.
    pub fn fetch_global(&mut self, tensor: &LogicalTensor) -> Result<Buffer, DispatchError> {
        if self.mode == ExecutionMode::Graph {
            self.run()?;
        }
        let placement = tensor.placement();
        let mut shards = self.graph.shards(tensor.value)?.to_vec();
        let mut local_shape = tensor.meta().local_shape()?;

        // Fold out grid axes from last to first; in row-major order the groups of the last
        // remaining axis are consecutive runs of the shard list.
        let grid = placement.grid();
        for grid_axis in (0..grid.len()).rev() {
            let axis_size = grid[grid_axis];
            let mut folded = Vec::with_capacity(shards.len() / axis_size);
            for group in shards.chunks(axis_size) {
                let members = group.iter().collect::<Vec<_>>();
                let combined = match tensor.distribution().entries()[grid_axis] {
                    SbpEntry::Broadcast => group[0].clone(),
                    SbpEntry::PartialSum => crate::types::sum_buffers(members.as_slice())?,
                    SbpEntry::Split(tensor_axis) => {
                        let shapes = vec![local_shape.as_slice(); group.len()];
                        Buffer::concat_axis(members.as_slice(), shapes.as_slice(), tensor_axis)?
                    }
                };
                folded.push(combined);
            }
            if let SbpEntry::Split(tensor_axis) = tensor.distribution().entries()[grid_axis] {
                local_shape[tensor_axis] *= axis_size;
            }
            shards = folded;
        }
        Ok(shards.remove(0))
    }
}

// ---------------------------------------------------------------------------
// Signature selection
// ---------------------------------------------------------------------------

fn select_signature<'a>(
    signatures: &'a [DistributionSignature],
    inputs: &[&LogicalTensor],
    descs: &[TensorDesc],
    output_descs: &[TensorDesc],
    grid_axis: usize,
    axis_size: usize,
    tie_break: TieBreak,
) -> Option<&'a DistributionSignature> {
    let mut best: Option<(usize, usize, usize, &DistributionSignature)> = None;
    for (declaration_index, signature) in signatures.iter().enumerate() {
        let Some((steps, collectives)) =
            signature_cost(signature, inputs, descs, output_descs, grid_axis, axis_size)
        else {
            continue;
        };
        match tie_break {
            TieBreak::DeclarationOrder => return Some(signature),
            TieBreak::PreferNoBoxing => {
                let key = (steps.min(1), collectives, declaration_index);
                let improves = match best {
                    Some((s, c, d, _)) => key < (s, c, d),
                    None => true,
                };
                if improves {
                    best = Some((key.0, key.1, key.2, signature));
                }
            }
        }
    }
    best.map(|(_, _, _, signature)| signature)
}

/// Boxing cost of using `signature` on `grid_axis`, or `None` if it is unusable there.
fn signature_cost(
    signature: &DistributionSignature,
    inputs: &[&LogicalTensor],
    descs: &[TensorDesc],
    output_descs: &[TensorDesc],
    grid_axis: usize,
    axis_size: usize,
) -> Option<(usize, usize)> {
    for (desc, entry) in descs.iter().zip(signature.inputs()).chain(output_descs.iter().zip(signature.outputs())) {
        if let SbpEntry::Split(tensor_axis) = entry {
            if *tensor_axis >= desc.rank() || desc.shape()[*tensor_axis] % axis_size != 0 {
                return None;
            }
        }
    }
    let mut steps = 0usize;
    let mut collectives = 0usize;
    for (input, required) in inputs.iter().zip(signature.inputs()) {
        let current = input.distribution().entries()[grid_axis];
        match convert_entry(current, *required, grid_axis) {
            Ok(None) => {}
            Ok(Some(kind)) => {
                steps += 1;
                if kind.is_collective() {
                    collectives += 1;
                }
            }
            Err(_) => return None,
        }
    }
    Some((steps, collectives))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::DeviceKind;
    use crate::types::DType;

    fn context() -> Context {
        Context::new()
    }

    fn two_ranks() -> Placement {
        Placement::linear(DeviceKind::Cpu, vec![0, 1]).unwrap()
    }

    fn f32_desc(shape: &[usize]) -> TensorDesc {
        TensorDesc::new(shape.to_vec(), DType::F32)
    }

    fn boxing_node_count(dispatcher: &Dispatcher<'_>) -> usize {
        dispatcher
            .graph()
            .node_ids()
            .filter(|id| matches!(dispatcher.graph().node(*id).unwrap().kind(), NodeKind::Boxing { .. }))
            .count()
    }

    #[test]
    fn test_matching_distributions_need_no_boxing() {
        let context = context();
        let mut dispatcher = Dispatcher::new(&context);
        let placement = two_ranks();
        let a = dispatcher
            .feed_global(f32_desc(&[4]), placement.clone(), Distribution::split(0), Buffer::F32(vec![1.0, 2.0, 3.0, 4.0]), false)
            .unwrap();
        let b = dispatcher
            .feed_global(f32_desc(&[4]), placement, Distribution::split(0), Buffer::F32(vec![10.0, 20.0, 30.0, 40.0]), false)
            .unwrap();
        let sum = dispatcher.dispatch("add", &[&a, &b], AttrMap::new()).unwrap().remove(0);
        assert_eq!(boxing_node_count(&dispatcher), 0);
        assert_eq!(sum.distribution(), &Distribution::split(0));
        assert_eq!(dispatcher.fetch_global(&sum).unwrap(), Buffer::F32(vec![11.0, 22.0, 33.0, 44.0]));
    }

    #[test]
    fn test_mixed_broadcast_split_inserts_exactly_one_boxing_node() {
        let context = context();
        let mut dispatcher = Dispatcher::new(&context);
        let placement = two_ranks();
        let broadcast = dispatcher
            .feed_global(f32_desc(&[4]), placement.clone(), Distribution::broadcast(1), Buffer::F32(vec![1.0, 2.0, 3.0, 4.0]), false)
            .unwrap();
        let split = dispatcher
            .feed_global(f32_desc(&[4]), placement, Distribution::split(0), Buffer::F32(vec![10.0, 20.0, 30.0, 40.0]), false)
            .unwrap();
        let sum = dispatcher.dispatch("add", &[&broadcast, &split], AttrMap::new()).unwrap().remove(0);
        assert_eq!(boxing_node_count(&dispatcher), 1);
        assert_eq!(dispatcher.fetch_global(&sum).unwrap(), Buffer::F32(vec![11.0, 22.0, 33.0, 44.0]));
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let context = context();
        let mut dispatcher = Dispatcher::new(&context);
        let placement = two_ranks();
        let a = dispatcher
            .feed_global(f32_desc(&[2]), placement, Distribution::broadcast(1), Buffer::F32(vec![1.0, 2.0]), false)
            .unwrap();
        assert!(matches!(
            dispatcher.dispatch("frobnicate", &[&a], AttrMap::new()),
            Err(DispatchError::UnknownOperator { .. }),
        ));
    }

    #[test]
    fn test_mismatched_placements_are_rejected() {
        let context = context();
        let mut dispatcher = Dispatcher::new(&context);
        let a = dispatcher
            .feed_global(f32_desc(&[2]), Placement::single(DeviceKind::Cpu, 0), Distribution::broadcast(1), Buffer::F32(vec![1.0, 2.0]), false)
            .unwrap();
        let b = dispatcher
            .feed_global(f32_desc(&[2]), Placement::single(DeviceKind::Cpu, 1), Distribution::broadcast(1), Buffer::F32(vec![1.0, 2.0]), false)
            .unwrap();
        assert!(matches!(
            dispatcher.dispatch("add", &[&a, &b], AttrMap::new()),
            Err(DispatchError::PlacementMismatch { .. }),
        ));
    }

    #[test]
    fn test_box_to_round_trip_preserves_data() {
        let context = context();
        let mut dispatcher = Dispatcher::new(&context);
        let placement = two_ranks();
        let global = Buffer::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let split = dispatcher
            .feed_global(f32_desc(&[2, 3]), placement, Distribution::split(1), global.clone(), false)
            .unwrap();
        let broadcast = dispatcher.box_to(&split, &Distribution::broadcast(1)).unwrap();
        let back = dispatcher.box_to(&broadcast, &Distribution::split(1)).unwrap();
        assert_eq!(dispatcher.shards(&back).unwrap(), dispatcher.shards(&split).unwrap());
        assert_eq!(dispatcher.fetch_global(&back).unwrap(), global);
    }

    #[test]
    fn test_partial_sum_zero_fill_round_trip() {
        let context = context();
        let mut dispatcher = Dispatcher::new(&context);
        let placement = two_ranks();
        let global = Buffer::F32(vec![1.5, -2.0, 0.25, 4.0]);
        let partial = dispatcher
            .feed_global(f32_desc(&[4]), placement, Distribution::partial_sum(1), global.clone(), false)
            .unwrap();
        let broadcast = dispatcher.box_to(&partial, &Distribution::broadcast(1)).unwrap();
        assert_eq!(dispatcher.fetch_global(&broadcast).unwrap(), global);
    }

    #[test]
    fn test_graph_mode_defers_until_run() {
        let context = context();
        let mut dispatcher = Dispatcher::lazy(&context);
        let placement = two_ranks();
        let a = dispatcher
            .feed_global(f32_desc(&[4]), placement.clone(), Distribution::split(0), Buffer::F32(vec![1.0, 2.0, 3.0, 4.0]), false)
            .unwrap();
        let b = dispatcher
            .feed_global(f32_desc(&[4]), placement, Distribution::split(0), Buffer::F32(vec![1.0, 1.0, 1.0, 1.0]), false)
            .unwrap();
        let sum = dispatcher.dispatch("add", &[&a, &b], AttrMap::new()).unwrap().remove(0);
        assert!(dispatcher.shards(&sum).is_err());
        dispatcher.run().unwrap();
        assert_eq!(dispatcher.fetch_global(&sum).unwrap(), Buffer::F32(vec![2.0, 3.0, 4.0, 5.0]));
    }

    #[test]
    fn test_diamond_dependency_executes_in_order() {
        let context = context();
        let mut dispatcher = Dispatcher::new(&context);
        let placement = two_ranks();
        let x = dispatcher
            .feed_global(f32_desc(&[4]), placement, Distribution::split(0), Buffer::F32(vec![1.0, 2.0, 3.0, 4.0]), false)
            .unwrap();
        let left = dispatcher.dispatch("neg", &[&x], AttrMap::new()).unwrap().remove(0);
        let right = dispatcher.dispatch("relu", &[&x], AttrMap::new()).unwrap().remove(0);
        let sum = dispatcher.dispatch("add", &[&left, &right], AttrMap::new()).unwrap().remove(0);

        for producer in [left.producer(), right.producer()] {
            let state = dispatcher.graph().node(producer.unwrap()).unwrap().state();
            assert_eq!(state, crate::graph::NodeState::Done);
        }
        assert_eq!(dispatcher.fetch_global(&sum).unwrap(), Buffer::F32(vec![0.0, 0.0, 0.0, 0.0]));
    }
}
