//! Node execution: driving compute kernels and boxing steps over every rank's shards.
//!
//! Execution simulates the SPMD run: a compute node invokes its kernel once per rank on that
//! rank's local shards, and a boxing node applies its step to every rank group of the
//! converting grid axis. Eager dispatch executes each node the moment it is appended; lazy
//! (graph) mode defers to [`run`], which drives the whole graph in append order.
//!
//! Failures are fail-fast. The first failing node raises on the backend's fault channel (so
//! peers surface the same failure instead of deadlocking at their next collective), is marked
//! `Failed`, and cascades to its transitive dependents, whose kernels never run.

use crate::boxing::{BoxingStep, BoxingStepKind};
use crate::context::Context;
use crate::graph::{ExecutionGraph, GraphError, NodeId, NodeKind, NodeState, ValueId};
use crate::placement::Placement;
use crate::registry::{AttrMap, DispatchError, LocalArg};
use crate::types::Buffer;

/// Runs every non-terminal node of `graph` in append order, stopping at the first failure.
pub fn run(context: &Context, graph: &mut ExecutionGraph) -> Result<(), DispatchError> {
    let ids = graph.node_ids().collect::<Vec<_>>();
    for id in ids {
        if !graph.node(id)?.state().is_terminal() {
            execute_node(context, graph, id)?;
        }
    }
    Ok(())
}

/// Executes one node, materializing its outputs.
///
/// A `Pending` node whose producer has failed is cascaded instead of run; a `Pending` node with
/// live producers cannot be executed yet and is a caller ordering error.
pub fn execute_node(context: &Context, graph: &mut ExecutionGraph, id: NodeId) -> Result<(), DispatchError> {
    let node = graph.node(id)?;
    match node.state() {
        NodeState::Done => return Ok(()),
        NodeState::Pending => {
            let name = node.name().to_string();
            let upstream_failed = node.inputs().iter().any(|input| {
                graph
                    .value(*input)
                    .ok()
                    .and_then(|value| value.producer())
                    .and_then(|producer| graph.node(producer).ok())
                    .is_some_and(|producer| producer.state() == NodeState::Failed)
            });
            if upstream_failed {
                graph.fail_cascade(id)?;
                return Err(GraphError::UpstreamFailure { name }.into());
            }
            return Err(GraphError::NotRunnable { node: id, state: NodeState::Pending }.into());
        }
        NodeState::Running | NodeState::Failed => {
            return Err(GraphError::NotRunnable { node: id, state: node.state() }.into());
        }
        NodeState::Ready => {}
    }

    let name = node.name().to_string();
    let kind = node.kind().clone();
    let inputs = node.inputs().to_vec();
    let outputs = node.outputs().to_vec();
    let placement = node.placement().clone();

    graph.set_state(id, NodeState::Running)?;
    let result = match &kind {
        NodeKind::Compute { op_kind, attrs } => {
            execute_compute(context, graph, op_kind, attrs, &inputs, &outputs, &placement)
        }
        NodeKind::Boxing { step } => execute_boxing(context, graph, *step, inputs[0], &placement),
    };
    match result {
        Ok(materialized) => {
            for (output, shards) in outputs.iter().zip(materialized) {
                graph.materialize(*output, shards)?;
            }
            graph.set_state(id, NodeState::Done)?;
            Ok(())
        }
        Err(error) => {
            log::warn!("node `{name}` failed: {error}");
            context.backend().fault_channel().raise(format!("node `{name}`: {error}"));
            graph.fail_cascade(id)?;
            Err(error)
        }
    }
}

fn execute_compute(
    context: &Context,
    graph: &ExecutionGraph,
    op_kind: &str,
    attrs: &AttrMap,
    inputs: &[ValueId],
    outputs: &[ValueId],
    placement: &Placement,
) -> Result<Vec<Vec<Buffer>>, DispatchError> {
    let operator = context.registry().get(op_kind)?;

    let mut input_shards = Vec::with_capacity(inputs.len());
    let mut input_shapes = Vec::with_capacity(inputs.len());
    for input in inputs {
        input_shards.push(graph.shards(*input)?);
        input_shapes.push(graph.value(*input)?.meta().local_shape()?);
    }
    let mut output_shapes = Vec::with_capacity(outputs.len());
    for output in outputs {
        output_shapes.push(graph.value(*output)?.meta().local_shape()?);
    }

    // One kernel invocation per rank, each seeing only that rank's shards.
    let mut materialized = vec![Vec::with_capacity(placement.rank_count()); outputs.len()];
    for rank_index in 0..placement.rank_count() {
        let args = input_shards
            .iter()
            .zip(input_shapes.iter())
            .map(|(shards, shape)| LocalArg { buffer: &shards[rank_index], shape: shape.as_slice() })
            .collect::<Vec<_>>();
        let results = operator.compute(args.as_slice(), attrs, output_shapes.as_slice())?;
        for (slot, buffer) in materialized.iter_mut().zip(results) {
            slot.push(buffer);
        }
    }
    Ok(materialized)
}

fn execute_boxing(
    context: &Context,
    graph: &ExecutionGraph,
    step: BoxingStep,
    input: ValueId,
    placement: &Placement,
) -> Result<Vec<Vec<Buffer>>, DispatchError> {
    let shards = graph.shards(input)?;
    let local_shape = graph.value(input)?.meta().local_shape()?;
    let dtype = graph.value(input)?.meta().dtype();
    let backend = context.backend();

    let mut converted = vec![Buffer::zeros(dtype, 0); placement.rank_count()];
    match step.kind {
        BoxingStepKind::LocalSlice { tensor_axis } => {
            let axis_size = placement.axis_size(step.grid_axis)?;
            let extent = local_shape[tensor_axis] / axis_size;
            for (rank_index, coordinate) in
                (0..placement.rank_count()).filter_map(|index| placement.coordinate(index).map(|c| (index, c)))
            {
                let start = coordinate[step.grid_axis] * extent;
                converted[rank_index] =
                    shards[rank_index].slice_axis(local_shape.as_slice(), tensor_axis, start, start + extent)?;
            }
        }
        _ => {
            for group in placement.rank_groups(step.grid_axis)? {
                let members = group.iter().map(|rank_index| &shards[*rank_index]).collect::<Vec<_>>();
                let results = match step.kind {
                    BoxingStepKind::AllGather { tensor_axis } => {
                        backend.all_gather(members.as_slice(), local_shape.as_slice(), tensor_axis)?
                    }
                    BoxingStepKind::AllReduce => backend.all_reduce(members.as_slice())?,
                    BoxingStepKind::ReduceScatter { tensor_axis } => {
                        backend.reduce_scatter(members.as_slice(), local_shape.as_slice(), tensor_axis)?
                    }
                    BoxingStepKind::AllToAll { from_axis, to_axis } => {
                        backend.all_to_all(members.as_slice(), local_shape.as_slice(), from_axis, to_axis)?
                    }
                    BoxingStepKind::LocalSlice { .. } => Vec::new(),
                };
                for (rank_index, buffer) in group.iter().zip(results) {
                    converted[*rank_index] = buffer;
                }
            }
        }
    }
    Ok(vec![converted])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fmt::Display;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::boxing::{BoxingStep, BoxingStepKind};
    use crate::dispatch::Dispatcher;
    use crate::placement::DeviceKind;
    use crate::registry::{DispatchError, DistributionSignature, Operator};
    use crate::sbp::{Distribution, SbpEntry};
    use crate::tensor::{TensorDesc, TensorMeta};
    use crate::types::DType;

    fn meta(shape: Vec<usize>, placement: &Placement, distribution: Distribution) -> TensorMeta {
        TensorMeta::new(TensorDesc::new(shape, DType::F32), placement.clone(), distribution)
    }

    #[test]
    fn test_all_gather_boxing_node_broadcasts_full_tensor() {
        let context = Context::new();
        let mut graph = ExecutionGraph::new();
        let placement = Placement::linear(DeviceKind::Cpu, vec![0, 1]).unwrap();
        let input = graph.add_input_value(
            meta(vec![4, 3], &placement, Distribution::split(0)),
            vec![
                Buffer::F32(vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]),
                Buffer::F32(vec![3.0, 3.0, 3.0, 4.0, 4.0, 4.0]),
            ],
        );
        let output = graph.add_value(meta(vec![4, 3], &placement, Distribution::broadcast(1)));
        let step = BoxingStep { grid_axis: 0, kind: BoxingStepKind::AllGather { tensor_axis: 0 } };
        let node = graph
            .add_node("boxing-0".to_string(), NodeKind::Boxing { step }, vec![input], vec![output], placement)
            .unwrap();

        execute_node(&context, &mut graph, node).unwrap();
        assert_eq!(graph.node(node).unwrap().state(), NodeState::Done);
        let full = Buffer::F32(vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 4.0, 4.0, 4.0]);
        let shards = graph.shards(output).unwrap();
        assert_eq!(shards, &[full.clone(), full]);
    }

    #[test]
    fn test_compute_node_runs_kernel_per_rank() {
        let context = Context::new();
        let mut graph = ExecutionGraph::new();
        let placement = Placement::linear(DeviceKind::Cpu, vec![0, 1]).unwrap();
        let lhs = graph.add_input_value(
            meta(vec![4], &placement, Distribution::split(0)),
            vec![Buffer::F32(vec![1.0, 2.0]), Buffer::F32(vec![3.0, 4.0])],
        );
        let rhs = graph.add_input_value(
            meta(vec![4], &placement, Distribution::split(0)),
            vec![Buffer::F32(vec![10.0, 10.0]), Buffer::F32(vec![20.0, 20.0])],
        );
        let output = graph.add_value(meta(vec![4], &placement, Distribution::split(0)));
        let kind = NodeKind::Compute { op_kind: "add".to_string(), attrs: AttrMap::new() };
        let node = graph
            .add_node("add-0".to_string(), kind, vec![lhs, rhs], vec![output], placement)
            .unwrap();

        execute_node(&context, &mut graph, node).unwrap();
        let shards = graph.shards(output).unwrap();
        assert_eq!(shards, &[Buffer::F32(vec![11.0, 12.0]), Buffer::F32(vec![23.0, 24.0])]);
    }

    #[test]
    fn test_pending_node_with_failed_upstream_cascades() {
        let context = Context::new();
        let mut graph = ExecutionGraph::new();
        let placement = Placement::single(DeviceKind::Cpu, 0);
        let upstream_out = graph.add_value(meta(vec![2], &placement, Distribution::broadcast(1)));
        let kind = NodeKind::Compute { op_kind: "neg".to_string(), attrs: AttrMap::new() };
        let upstream = graph
            .add_node("neg-0".to_string(), kind.clone(), vec![], vec![upstream_out], placement.clone())
            .unwrap();
        let downstream_out = graph.add_value(meta(vec![2], &placement, Distribution::broadcast(1)));
        let downstream = graph
            .add_node("neg-1".to_string(), kind, vec![upstream_out], vec![downstream_out], placement)
            .unwrap();

        graph.fail_cascade(upstream).unwrap();
        // The dependent was already cascaded; re-driving it must keep it failed and error out.
        assert_eq!(graph.node(downstream).unwrap().state(), NodeState::Failed);
        let result = execute_node(&context, &mut graph, downstream);
        assert!(result.is_err());
    }

    #[derive(Copy, Clone, Debug)]
    struct FailingOp;

    impl Display for FailingOp {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "failing")
        }
    }

    impl Operator for FailingOp {
        fn kind(&self) -> &str {
            "failing"
        }

        fn infer(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
            Ok(vec![inputs[0].clone()])
        }

        fn distribution_signatures(&self, _inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
            vec![DistributionSignature::new(vec![SbpEntry::Broadcast], vec![SbpEntry::Broadcast])]
        }

        fn compute(
            &self,
            _inputs: &[LocalArg<'_>],
            _attrs: &AttrMap,
            _output_shapes: &[Vec<usize>],
        ) -> Result<Vec<Buffer>, DispatchError> {
            Err(DispatchError::ShapeMismatch { op_kind: "failing".to_string(), details: "injected".to_string() })
        }
    }

    #[derive(Clone, Debug)]
    struct ProbeOp {
        invoked: Arc<AtomicBool>,
    }

    impl Display for ProbeOp {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "probe")
        }
    }

    impl Operator for ProbeOp {
        fn kind(&self) -> &str {
            "probe"
        }

        fn infer(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
            Ok(vec![inputs[0].clone()])
        }

        fn distribution_signatures(&self, _inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
            vec![DistributionSignature::new(vec![SbpEntry::Broadcast], vec![SbpEntry::Broadcast])]
        }

        fn compute(
            &self,
            inputs: &[LocalArg<'_>],
            _attrs: &AttrMap,
            _output_shapes: &[Vec<usize>],
        ) -> Result<Vec<Buffer>, DispatchError> {
            self.invoked.store(true, Ordering::SeqCst);
            Ok(vec![inputs[0].buffer.clone()])
        }
    }

    #[test]
    fn test_failed_node_cascades_without_invoking_dependent_kernel() {
        let invoked = Arc::new(AtomicBool::new(false));
        let mut context = Context::new();
        context.register_operator(Box::new(FailingOp));
        context.register_operator(Box::new(ProbeOp { invoked: invoked.clone() }));

        let mut dispatcher = Dispatcher::lazy(&context);
        let placement = Placement::linear(DeviceKind::Cpu, vec![0, 1]).unwrap();
        let x = dispatcher
            .feed(
                TensorDesc::new(vec![2], DType::F32),
                placement,
                Distribution::broadcast(1),
                vec![Buffer::F32(vec![1.0, 2.0]); 2],
                false,
            )
            .unwrap();
        let failed = dispatcher.dispatch("failing", &[&x], AttrMap::new()).unwrap().remove(0);
        let probed = dispatcher.dispatch("probe", &[&failed], AttrMap::new()).unwrap().remove(0);

        assert!(dispatcher.run().is_err());
        let graph = dispatcher.graph();
        assert_eq!(graph.node(failed.producer().unwrap()).unwrap().state(), NodeState::Failed);
        assert_eq!(graph.node(probed.producer().unwrap()).unwrap().state(), NodeState::Failed);
        assert!(!invoked.load(Ordering::SeqCst));

        // The failure was raised out of band, so any later collective surfaces it too.
        let shard = Buffer::F32(vec![0.0]);
        assert!(matches!(
            context.backend().all_reduce(&[&shard, &shard]),
            Err(crate::backend::CollectiveError::Failure { .. }),
        ));
    }
}
