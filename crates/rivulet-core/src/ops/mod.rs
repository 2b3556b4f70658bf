//! Built-in operators.
//!
//! Each operator is one struct implementing [`Operator`](crate::registry::Operator): shape and
//! dtype inference, the per-grid-axis distribution signatures, the per-rank reference kernel,
//! and (where the operator is differentiable) the gradient rule. Registration is explicit at
//! context initialization; nothing here is discovered at runtime.

pub mod elementwise;
pub mod matmul;
pub mod reduction;

use crate::registry::{DispatchError, DistributionSignature, Registry};
use crate::sbp::SbpEntry;
use crate::tensor::TensorDesc;

/// Registers every built-in operator into `registry`.
pub fn register_builtins(registry: &mut Registry) {
    registry.register(Box::new(elementwise::AddOp));
    registry.register(Box::new(elementwise::SubOp));
    registry.register(Box::new(elementwise::MulOp));
    registry.register(Box::new(elementwise::NegOp));
    registry.register(Box::new(elementwise::ReluOp));
    registry.register(Box::new(elementwise::ReluGradOp));
    registry.register(Box::new(matmul::MatmulOp));
    registry.register(Box::new(matmul::TransposeOp));
    registry.register(Box::new(reduction::ReduceSumOp));
    registry.register(Box::new(reduction::BroadcastToOp));
}

/// Checks that an operator received exactly `expected` inputs.
pub(crate) fn check_arity(op_kind: &str, inputs: &[TensorDesc], expected: usize) -> Result<(), DispatchError> {
    if inputs.len() != expected {
        return Err(DispatchError::ArityMismatch {
            op_kind: op_kind.to_string(),
            expected,
            actual: inputs.len(),
        });
    }
    Ok(())
}

/// Checks that every input shares the first input's shape and dtype.
pub(crate) fn check_uniform(op_kind: &str, inputs: &[TensorDesc]) -> Result<(), DispatchError> {
    let first = &inputs[0];
    for input in inputs.iter().skip(1) {
        if input.dtype() != first.dtype() {
            return Err(DispatchError::DtypeMismatch {
                op_kind: op_kind.to_string(),
                expected: first.dtype(),
                actual: input.dtype(),
            });
        }
        if input.shape() != first.shape() {
            return Err(DispatchError::ShapeMismatch {
                op_kind: op_kind.to_string(),
                details: format!("{:?} vs {:?}", first.shape(), input.shape()),
            });
        }
    }
    Ok(())
}

/// Signatures of an elementwise operator over same-shape inputs: split on any shared tensor
/// axis, all-broadcast, and (for operators linear in every input) all-partial-sum.
pub(crate) fn elementwise_signatures(rank: usize, arity: usize, linear: bool) -> Vec<DistributionSignature> {
    let mut signatures = Vec::with_capacity(rank + 2);
    for axis in 0..rank {
        signatures.push(DistributionSignature::new(
            vec![SbpEntry::Split(axis); arity],
            vec![SbpEntry::Split(axis)],
        ));
    }
    signatures.push(DistributionSignature::new(
        vec![SbpEntry::Broadcast; arity],
        vec![SbpEntry::Broadcast],
    ));
    if linear {
        signatures.push(DistributionSignature::new(
            vec![SbpEntry::PartialSum; arity],
            vec![SbpEntry::PartialSum],
        ));
    }
    signatures
}
