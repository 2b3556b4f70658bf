//! Elementwise operators: `add`, `sub`, `mul`, `neg`, `relu`, and the relu gradient mask.
//!
//! All of them accept inputs split on any shared tensor axis or fully broadcast; the linear
//! ones (`add`, `sub`, `neg`) additionally accept partial sums, since applying them per addend
//! commutes with the deferred summation. `mul` and `relu` do not: a product (or a clamp) of
//! partial sums is not the partial sum of the results.

use std::fmt::Display;

use crate::dispatch::Dispatcher;
use crate::ops::{check_arity, check_uniform, elementwise_signatures};
use crate::registry::{AttrMap, DispatchError, DistributionSignature, LocalArg, Operator};
use crate::tensor::{LogicalTensor, TensorDesc};
use crate::types::Buffer;

// ---------------------------------------------------------------------------
// add
// ---------------------------------------------------------------------------

/// Elementwise sum of two same-shape tensors.
#[derive(Copy, Clone, Debug)]
pub struct AddOp;

impl Display for AddOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "add")
    }
}

impl Operator for AddOp {
    fn kind(&self) -> &str {
        "add"
    }

    fn infer(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
        check_arity(self.kind(), inputs, 2)?;
        check_uniform(self.kind(), inputs)?;
        Ok(vec![inputs[0].clone()])
    }

    fn distribution_signatures(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
        elementwise_signatures(inputs[0].rank(), 2, true)
    }

    fn compute(
        &self,
        inputs: &[LocalArg<'_>],
        _attrs: &AttrMap,
        _output_shapes: &[Vec<usize>],
    ) -> Result<Vec<Buffer>, DispatchError> {
        Ok(vec![inputs[0].buffer.add(inputs[1].buffer)?])
    }

    fn gradient(
        &self,
        _dispatcher: &mut Dispatcher<'_>,
        _inputs: &[LogicalTensor],
        _outputs: &[LogicalTensor],
        output_grads: &[LogicalTensor],
        _attrs: &AttrMap,
    ) -> Result<Vec<Option<LogicalTensor>>, DispatchError> {
        Ok(vec![Some(output_grads[0].clone()), Some(output_grads[0].clone())])
    }
}

// ---------------------------------------------------------------------------
// sub
// ---------------------------------------------------------------------------

/// Elementwise difference of two same-shape tensors.
#[derive(Copy, Clone, Debug)]
pub struct SubOp;

impl Display for SubOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub")
    }
}

impl Operator for SubOp {
    fn kind(&self) -> &str {
        "sub"
    }

    fn infer(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
        check_arity(self.kind(), inputs, 2)?;
        check_uniform(self.kind(), inputs)?;
        Ok(vec![inputs[0].clone()])
    }

    fn distribution_signatures(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
        elementwise_signatures(inputs[0].rank(), 2, true)
    }

    fn compute(
        &self,
        inputs: &[LocalArg<'_>],
        _attrs: &AttrMap,
        _output_shapes: &[Vec<usize>],
    ) -> Result<Vec<Buffer>, DispatchError> {
        Ok(vec![inputs[0].buffer.sub(inputs[1].buffer)?])
    }

    fn gradient(
        &self,
        dispatcher: &mut Dispatcher<'_>,
        _inputs: &[LogicalTensor],
        _outputs: &[LogicalTensor],
        output_grads: &[LogicalTensor],
        _attrs: &AttrMap,
    ) -> Result<Vec<Option<LogicalTensor>>, DispatchError> {
        let negated = dispatcher.dispatch("neg", &[&output_grads[0]], AttrMap::new())?.remove(0);
        Ok(vec![Some(output_grads[0].clone()), Some(negated)])
    }
}

// ---------------------------------------------------------------------------
// mul
// ---------------------------------------------------------------------------

/// Elementwise product of two same-shape tensors.
#[derive(Copy, Clone, Debug)]
pub struct MulOp;

impl Display for MulOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mul")
    }
}

impl Operator for MulOp {
    fn kind(&self) -> &str {
        "mul"
    }

    fn infer(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
        check_arity(self.kind(), inputs, 2)?;
        check_uniform(self.kind(), inputs)?;
        Ok(vec![inputs[0].clone()])
    }

    fn distribution_signatures(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
        elementwise_signatures(inputs[0].rank(), 2, false)
    }

    fn compute(
        &self,
        inputs: &[LocalArg<'_>],
        _attrs: &AttrMap,
        _output_shapes: &[Vec<usize>],
    ) -> Result<Vec<Buffer>, DispatchError> {
        Ok(vec![inputs[0].buffer.mul(inputs[1].buffer)?])
    }

    fn gradient(
        &self,
        dispatcher: &mut Dispatcher<'_>,
        inputs: &[LogicalTensor],
        _outputs: &[LogicalTensor],
        output_grads: &[LogicalTensor],
        _attrs: &AttrMap,
    ) -> Result<Vec<Option<LogicalTensor>>, DispatchError> {
        let lhs_grad = dispatcher.dispatch("mul", &[&output_grads[0], &inputs[1]], AttrMap::new())?.remove(0);
        let rhs_grad = dispatcher.dispatch("mul", &[&output_grads[0], &inputs[0]], AttrMap::new())?.remove(0);
        Ok(vec![Some(lhs_grad), Some(rhs_grad)])
    }
}

// ---------------------------------------------------------------------------
// neg
// ---------------------------------------------------------------------------

/// Elementwise negation.
#[derive(Copy, Clone, Debug)]
pub struct NegOp;

impl Display for NegOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "neg")
    }
}

impl Operator for NegOp {
    fn kind(&self) -> &str {
        "neg"
    }

    fn infer(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
        check_arity(self.kind(), inputs, 1)?;
        Ok(vec![inputs[0].clone()])
    }

    fn distribution_signatures(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
        elementwise_signatures(inputs[0].rank(), 1, true)
    }

    fn compute(
        &self,
        inputs: &[LocalArg<'_>],
        _attrs: &AttrMap,
        _output_shapes: &[Vec<usize>],
    ) -> Result<Vec<Buffer>, DispatchError> {
        Ok(vec![inputs[0].buffer.neg()?])
    }

    fn gradient(
        &self,
        dispatcher: &mut Dispatcher<'_>,
        _inputs: &[LogicalTensor],
        _outputs: &[LogicalTensor],
        output_grads: &[LogicalTensor],
        _attrs: &AttrMap,
    ) -> Result<Vec<Option<LogicalTensor>>, DispatchError> {
        let negated = dispatcher.dispatch("neg", &[&output_grads[0]], AttrMap::new())?.remove(0);
        Ok(vec![Some(negated)])
    }
}

// ---------------------------------------------------------------------------
// relu
// ---------------------------------------------------------------------------

/// Elementwise `max(x, 0)`.
#[derive(Copy, Clone, Debug)]
pub struct ReluOp;

impl Display for ReluOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "relu")
    }
}

impl Operator for ReluOp {
    fn kind(&self) -> &str {
        "relu"
    }

    fn infer(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
        check_arity(self.kind(), inputs, 1)?;
        Ok(vec![inputs[0].clone()])
    }

    fn distribution_signatures(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
        elementwise_signatures(inputs[0].rank(), 1, false)
    }

    fn compute(
        &self,
        inputs: &[LocalArg<'_>],
        _attrs: &AttrMap,
        _output_shapes: &[Vec<usize>],
    ) -> Result<Vec<Buffer>, DispatchError> {
        Ok(vec![inputs[0].buffer.relu()?])
    }

    fn gradient(
        &self,
        dispatcher: &mut Dispatcher<'_>,
        inputs: &[LogicalTensor],
        _outputs: &[LogicalTensor],
        output_grads: &[LogicalTensor],
        _attrs: &AttrMap,
    ) -> Result<Vec<Option<LogicalTensor>>, DispatchError> {
        let masked = dispatcher
            .dispatch("relu_grad", &[&output_grads[0], &inputs[0]], AttrMap::new())?
            .remove(0);
        Ok(vec![Some(masked)])
    }
}

// ---------------------------------------------------------------------------
// relu_grad
// ---------------------------------------------------------------------------

/// Gates a gradient by the positivity of the matching forward input.
#[derive(Copy, Clone, Debug)]
pub struct ReluGradOp;

impl Display for ReluGradOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "relu_grad")
    }
}

impl Operator for ReluGradOp {
    fn kind(&self) -> &str {
        "relu_grad"
    }

    fn infer(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
        check_arity(self.kind(), inputs, 2)?;
        check_uniform(self.kind(), inputs)?;
        Ok(vec![inputs[0].clone()])
    }

    fn distribution_signatures(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
        elementwise_signatures(inputs[0].rank(), 2, false)
    }

    fn compute(
        &self,
        inputs: &[LocalArg<'_>],
        _attrs: &AttrMap,
        _output_shapes: &[Vec<usize>],
    ) -> Result<Vec<Buffer>, DispatchError> {
        Ok(vec![inputs[0].buffer.relu_mask(inputs[1].buffer)?])
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
    fn test_add_infer_validates_inputs() {
        let attrs = AttrMap::new();
        let out = AddOp.infer(&[desc(&[2, 3]), desc(&[2, 3])], &attrs).unwrap();
        assert_eq!(out, vec![desc(&[2, 3])]);
        assert!(matches!(
            AddOp.infer(&[desc(&[2, 3])], &attrs),
            Err(DispatchError::ArityMismatch { expected: 2, actual: 1, .. }),
        ));
        assert!(matches!(
            AddOp.infer(&[desc(&[2, 3]), desc(&[3, 2])], &attrs),
            Err(DispatchError::ShapeMismatch { .. }),
        ));
        assert!(matches!(
            AddOp.infer(&[desc(&[2]), TensorDesc::new(vec![2], DType::F64)], &attrs),
            Err(DispatchError::DtypeMismatch { .. }),
        ));
    }

    #[test]
    fn test_linear_ops_accept_partial_sum() {
        let attrs = AttrMap::new();
        let has_partial = |signatures: Vec<DistributionSignature>| {
            signatures
                .iter()
                .any(|signature| signature.inputs().iter().any(|e| matches!(e, crate::sbp::SbpEntry::PartialSum)))
        };
        assert!(has_partial(AddOp.distribution_signatures(&[desc(&[2]), desc(&[2])], &attrs)));
        assert!(!has_partial(MulOp.distribution_signatures(&[desc(&[2]), desc(&[2])], &attrs)));
        assert!(!has_partial(ReluOp.distribution_signatures(&[desc(&[2])], &attrs)));
    }

    #[test]
    fn test_relu_kernel() {
        let buffer = Buffer::F32(vec![-1.0, 2.0]);
        let arg = LocalArg { buffer: &buffer, shape: &[2] };
        let out = ReluOp.compute(&[arg], &AttrMap::new(), &[vec![2]]).unwrap();
        assert_eq!(out, vec![Buffer::F32(vec![0.0, 2.0])]);
    }
}
