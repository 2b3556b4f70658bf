//! Matrix operators: 2-D `matmul` and `transpose`.
//!
//! `matmul` is where distribution signatures earn their keep: row-split times broadcast keeps
//! the rows split, broadcast times column-split keeps the columns split, and splitting both
//! operands along the contraction axis yields partial sums that later boxing reduces.

use std::fmt::Display;

use crate::dispatch::Dispatcher;
use crate::ops::check_arity;
use crate::registry::{AttrMap, DispatchError, DistributionSignature, LocalArg, Operator};
use crate::sbp::SbpEntry;
use crate::tensor::{LogicalTensor, TensorDesc};
use crate::types::Buffer;

// ---------------------------------------------------------------------------
// matmul
// ---------------------------------------------------------------------------

/// Row-major matrix product of an `[m, k]` tensor with a `[k, n]` tensor.
#[derive(Copy, Clone, Debug)]
pub struct MatmulOp;

impl Display for MatmulOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "matmul")
    }
}

impl Operator for MatmulOp {
    fn kind(&self) -> &str {
        "matmul"
    }

    fn infer(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
        check_arity(self.kind(), inputs, 2)?;
        let (lhs, rhs) = (&inputs[0], &inputs[1]);
        if lhs.rank() != 2 || rhs.rank() != 2 {
            return Err(DispatchError::ShapeMismatch {
                op_kind: self.kind().to_string(),
                details: format!("expects two rank-2 tensors, got {:?} and {:?}", lhs.shape(), rhs.shape()),
            });
        }
        if lhs.shape()[1] != rhs.shape()[0] {
            return Err(DispatchError::ShapeMismatch {
                op_kind: self.kind().to_string(),
                details: format!("contraction extents differ: {:?} x {:?}", lhs.shape(), rhs.shape()),
            });
        }
        if lhs.dtype() != rhs.dtype() {
            return Err(DispatchError::DtypeMismatch {
                op_kind: self.kind().to_string(),
                expected: lhs.dtype(),
                actual: rhs.dtype(),
            });
        }
        Ok(vec![TensorDesc::new(vec![lhs.shape()[0], rhs.shape()[1]], lhs.dtype())])
    }

    fn distribution_signatures(&self, _inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
        vec![
            // Row parallelism: split lhs rows, replicate rhs.
            DistributionSignature::new(vec![SbpEntry::Split(0), SbpEntry::Broadcast], vec![SbpEntry::Split(0)]),
            // Column parallelism: replicate lhs, split rhs columns.
            DistributionSignature::new(vec![SbpEntry::Broadcast, SbpEntry::Split(1)], vec![SbpEntry::Split(1)]),
            // Contraction parallelism: each rank multiplies a slice of k, the sum is deferred.
            DistributionSignature::new(vec![SbpEntry::Split(1), SbpEntry::Split(0)], vec![SbpEntry::PartialSum]),
            DistributionSignature::new(vec![SbpEntry::Broadcast, SbpEntry::Broadcast], vec![SbpEntry::Broadcast]),
        ]
    }

    fn compute(
        &self,
        inputs: &[LocalArg<'_>],
        _attrs: &AttrMap,
        _output_shapes: &[Vec<usize>],
    ) -> Result<Vec<Buffer>, DispatchError> {
        let (m, k) = (inputs[0].shape[0], inputs[0].shape[1]);
        let n = inputs[1].shape[1];
        Ok(vec![inputs[0].buffer.matmul(inputs[1].buffer, m, k, n)?])
    }

    fn gradient(
        &self,
        dispatcher: &mut Dispatcher<'_>,
        inputs: &[LogicalTensor],
        _outputs: &[LogicalTensor],
        output_grads: &[LogicalTensor],
        _attrs: &AttrMap,
    ) -> Result<Vec<Option<LogicalTensor>>, DispatchError> {
        // d(lhs) = gy . rhs^T, d(rhs) = lhs^T . gy
        let rhs_t = dispatcher.dispatch("transpose", &[&inputs[1]], AttrMap::new())?.remove(0);
        let lhs_grad = dispatcher.dispatch("matmul", &[&output_grads[0], &rhs_t], AttrMap::new())?.remove(0);
        let lhs_t = dispatcher.dispatch("transpose", &[&inputs[0]], AttrMap::new())?.remove(0);
        let rhs_grad = dispatcher.dispatch("matmul", &[&lhs_t, &output_grads[0]], AttrMap::new())?.remove(0);
        Ok(vec![Some(lhs_grad), Some(rhs_grad)])
    }
}

// ---------------------------------------------------------------------------
// transpose
// ---------------------------------------------------------------------------

/// Transposes a rank-2 tensor.
#[derive(Copy, Clone, Debug)]
pub struct TransposeOp;

impl Display for TransposeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transpose")
    }
}

impl Operator for TransposeOp {
    fn kind(&self) -> &str {
        "transpose"
    }

    fn infer(&self, inputs: &[TensorDesc], _attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError> {
        check_arity(self.kind(), inputs, 1)?;
        if inputs[0].rank() != 2 {
            return Err(DispatchError::ShapeMismatch {
                op_kind: self.kind().to_string(),
                details: format!("expects a rank-2 tensor, got {:?}", inputs[0].shape()),
            });
        }
        let shape = inputs[0].shape();
        Ok(vec![TensorDesc::new(vec![shape[1], shape[0]], inputs[0].dtype())])
    }

    fn distribution_signatures(&self, _inputs: &[TensorDesc], _attrs: &AttrMap) -> Vec<DistributionSignature> {
        // A transpose swaps which tensor axis a split refers to; broadcast and partial sum
        // pass through untouched.
        vec![
            DistributionSignature::new(vec![SbpEntry::Split(0)], vec![SbpEntry::Split(1)]),
            DistributionSignature::new(vec![SbpEntry::Split(1)], vec![SbpEntry::Split(0)]),
            DistributionSignature::new(vec![SbpEntry::Broadcast], vec![SbpEntry::Broadcast]),
            DistributionSignature::new(vec![SbpEntry::PartialSum], vec![SbpEntry::PartialSum]),
        ]
    }

    fn compute(
        &self,
        inputs: &[LocalArg<'_>],
        _attrs: &AttrMap,
        _output_shapes: &[Vec<usize>],
    ) -> Result<Vec<Buffer>, DispatchError> {
        Ok(vec![inputs[0].buffer.transpose_2d(inputs[0].shape[0], inputs[0].shape[1])?])
    }

    fn gradient(
        &self,
        dispatcher: &mut Dispatcher<'_>,
        _inputs: &[LogicalTensor],
        _outputs: &[LogicalTensor],
        output_grads: &[LogicalTensor],
        _attrs: &AttrMap,
    ) -> Result<Vec<Option<LogicalTensor>>, DispatchError> {
        let grad = dispatcher.dispatch("transpose", &[&output_grads[0]], AttrMap::new())?.remove(0);
        Ok(vec![Some(grad)])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
