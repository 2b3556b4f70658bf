//! Reduction and expansion operators: `reduce_sum` and `broadcast_to`.
//!
//! `reduce_sum` collapses a whole tensor to a rank-0 scalar. Under a split input each rank sums
//! only its shard, so the output is a partial sum; no communication happens until something
//! downstream needs the broadcast value. `broadcast_to` is its adjoint and carries the gradient
//! of a reduction back to the input's shape.

use std::fmt::Display;

use crate::dispatch::Dispatcher;
use crate::ops::check_arity;
use crate::registry::{AttrMap, AttrValue, DispatchError, DistributionSignature, LocalArg, Operator};
use crate::sbp::SbpEntry;
use crate::tensor::{LogicalTensor, TensorDesc};
use crate::types::Buffer;

// ---------------------------------------------------------------------------
// reduce_sum
// ---------------------------------------------------------------------------

/// Sums every element of a tensor into a rank-0 scalar.
#[derive(Copy, Clone, Debug)]
pub struct ReduceSumOp;

impl Display for ReduceSumOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reduce_sum")
    }
}

impl Operator for ReduceSumOp {
    fn kind(&self) -> &str {
        "reduce_sum"
    }

    fn infer(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
        check_arity(self.kind(), inputs, 1)?;
        Ok(vec![TensorDesc::new(vec![], inputs[0].dtype())])
    }

    fn distribution_signatures(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
        let mut signatures = Vec::with_capacity(inputs[0].rank() + 2);
        // Summing a shard yields one addend of the total: split input, partial-sum output.
        for axis in 0..inputs[0].rank() {
            signatures.push(DistributionSignature::new(
                vec![SbpEntry::Split(axis)],
                vec![SbpEntry::PartialSum],
            ));
        }
        signatures.push(DistributionSignature::new(vec![SbpEntry::Broadcast], vec![SbpEntry::Broadcast]));
        signatures.push(DistributionSignature::new(vec![SbpEntry::PartialSum], vec![SbpEntry::PartialSum]));
        signatures
    }

    fn compute(
        &self,
        inputs: &[LocalArg<'_>],
        _attrs: &AttrMap,
        _output_shapes: &[Vec<usize>],
    ) -> Result<Vec<Buffer>, DispatchError> {
        Ok(vec![inputs[0].buffer.sum_all()?])
    }

    fn gradient(
        &self,
        dispatcher: &mut Dispatcher<'_>,
        inputs: &[LogicalTensor],
        _outputs: &[LogicalTensor],
        output_grads: &[LogicalTensor],
        _attrs: &AttrMap,
    ) -> Result<Vec<Option<LogicalTensor>>, DispatchError> {
        let attrs = AttrMap::new().with("shape", AttrValue::Shape(inputs[0].shape().to_vec()));
        let grad = dispatcher.dispatch("broadcast_to", &[&output_grads[0]], attrs)?.remove(0);
        Ok(vec![Some(grad)])
    }
}

// ---------------------------------------------------------------------------
// broadcast_to
// ---------------------------------------------------------------------------

/// Expands a tensor to the shape given by the `shape` attribute.
///
/// Shapes align right; every input axis must match the target extent or have extent 1.
#[derive(Copy, Clone, Debug)]
pub struct BroadcastToOp;

impl Display for BroadcastToOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "broadcast_to")
    }
}

impl Operator for BroadcastToOp {
    fn kind(&self) -> &str {
        "broadcast_to"
    }

    fn infer(&self, inputs: &[TensorDesc], attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
        check_arity(self.kind(), inputs, 1)?;
        let target = attrs.require_shape(self.kind(), "shape")?;
        let source = inputs[0].shape();
        if source.len() > target.len() {
            return Err(DispatchError::ShapeMismatch {
                op_kind: self.kind().to_string(),
                details: format!("cannot broadcast {source:?} down to {target:?}"),
            });
        }
        let offset = target.len() - source.len();
        for (axis, extent) in source.iter().enumerate() {
            if *extent != 1 && *extent != target[offset + axis] {
                return Err(DispatchError::ShapeMismatch {
                    op_kind: self.kind().to_string(),
                    details: format!("axis {axis} of {source:?} does not broadcast to {target:?}"),
                });
            }
        }
        Ok(vec![TensorDesc::new(target.to_vec(), inputs[0].dtype())])
    }

    fn distribution_signatures(&self, _inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
        // Expansion needs the full source value on every rank.
        vec![DistributionSignature::new(vec![SbpEntry::Broadcast], vec![SbpEntry::Broadcast])]
    }

    fn compute(
        &self,
        inputs: &[LocalArg<'_>],
        _attrs: &AttrMap,
        output_shapes: &[Vec<usize>],
    ) -> Result<Vec<Buffer>, DispatchError> {
        Ok(vec![inputs[0].buffer.broadcast_to(inputs[0].shape, output_shapes[0].as_slice())?])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    fn desc(shape: &[usize]) -> TensorDesc {
        TensorDesc::new(shape.to_vec(), DType::F32)
    }

    #[test]
    fn test_reduce_sum_infers_scalar() {
        let out = ReduceSumOp.infer(&[desc(&[4, 3])], &AttrMap::new()).unwrap();
        assert_eq!(out, vec![desc(&[])]);
        assert!(out[0].is_scalar());
    }

    #[test]
    fn test_reduce_sum_split_input_yields_partial_sum() {
        let signatures = ReduceSumOp.distribution_signatures(&[desc(&[4, 3])], &AttrMap::new());
        assert!(signatures.contains(&DistributionSignature::new(
            vec![SbpEntry::Split(0)],
            vec![SbpEntry::PartialSum],
        )));
    }

    #[test]
    fn test_broadcast_to_infer_validates_shape() {
        let attrs = AttrMap::new().with("shape", AttrValue::Shape(vec![4, 3]));
        let out = BroadcastToOp.infer(&[desc(&[])], &attrs).unwrap();
        assert_eq!(out, vec![desc(&[4, 3])]);
        assert!(matches!(
            BroadcastToOp.infer(&[desc(&[2])], &attrs),
            Err(DispatchError::ShapeMismatch { .. }),
        ));
        assert!(matches!(
            BroadcastToOp.infer(&[desc(&[])], &AttrMap::new()),
            Err(DispatchError::MissingAttribute { .. }),
        ));
    }
}
