//! Logical tensors: the global, distribution-agnostic view of data.
//!
//! A [`LogicalTensor`] is a cheap handle. The physical shards live in the execution graph's
//! value slots ([`crate::graph`]); the handle carries the metadata needed to dispatch further
//! operators on it, plus a back link to the node that produced it (the gradient tape edge).
//! Handles have value semantics: operators never mutate a tensor, they produce new handles.

use std::fmt::Display;

use crate::graph::{NodeId, ValueId};
use crate::placement::Placement;
use crate::sbp::{Distribution, DistributionError};
use crate::types::DType;

// ---------------------------------------------------------------------------
// Tensor descriptors
// ---------------------------------------------------------------------------

/// Global shape and element dtype of a tensor, independent of any placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    shape: Vec<usize>,
    dtype: DType,
}

impl TensorDesc {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Self { shape, dtype }
    }

    /// Global shape.
    pub fn shape(&self) -> &[usize] {
        self.shape.as_slice()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of tensor axes.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements in the global view.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns `true` iff this describes a rank-0 or single-element tensor.
    pub fn is_scalar(&self) -> bool {
        self.element_count() == 1
    }
}

impl Display for TensorDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.shape)
    }
}

// ---------------------------------------------------------------------------
// Tensor metadata
// ---------------------------------------------------------------------------

/// Full metadata of a logical tensor: its global descriptor plus where and how it is laid out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorMeta {
    desc: TensorDesc,
    placement: Placement,
    distribution: Distribution,
}

impl TensorMeta {
    pub fn new(desc: TensorDesc, placement: Placement, distribution: Distribution) -> Self {
        Self { desc, placement, distribution }
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn shape(&self) -> &[usize] {
        self.desc.shape()
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype()
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    /// The per-rank local shard shape implied by the distribution.
    pub fn local_shape(&self) -> Result<Vec<usize>, DistributionError> {
        self.distribution.local_shape(self.desc.shape(), &self.placement)
    }

    /// Returns a copy of this metadata laid out under a different distribution.
    pub fn with_distribution(&self, distribution: Distribution) -> Self {
        Self { desc: self.desc.clone(), placement: self.placement.clone(), distribution }
    }
}

impl Display for TensorMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} @ {}", self.desc, self.distribution, self.placement)
    }
}

// ---------------------------------------------------------------------------
// Logical tensors
// ---------------------------------------------------------------------------

/// Handle to a logical tensor held in an execution graph.
#[derive(Clone, Debug)]
pub struct LogicalTensor {
    pub(crate) value: ValueId,
    pub(crate) meta: TensorMeta,
    pub(crate) producer: Option<NodeId>,
    pub(crate) requires_grad: bool,
}

impl LogicalTensor {
    /// The graph value slot holding this tensor's shards.
    pub fn value(&self) -> ValueId {
        self.value
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    pub fn placement(&self) -> &Placement {
        self.meta.placement()
    }

    pub fn distribution(&self) -> &Distribution {
        self.meta.distribution()
    }

    /// The node that produced this tensor, if any (inputs have no producer).
    pub fn producer(&self) -> Option<NodeId> {
        self.producer
    }

    /// Returns `true` iff gradients should flow through this tensor.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }
}

impl Display for LogicalTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tensor({})", self.meta)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::DeviceKind;

    #[test]
    fn test_desc_accessors() {
        let desc = TensorDesc::new(vec![4, 3], DType::F32);
        assert_eq!(desc.rank(), 2);
        assert_eq!(desc.element_count(), 12);
        assert!(!desc.is_scalar());
        assert!(TensorDesc::new(vec![], DType::F32).is_scalar());
        assert!(TensorDesc::new(vec![1, 1], DType::F32).is_scalar());
        assert_eq!(desc.to_string(), "f32[4, 3]");
    }

    #[test]
    fn test_meta_local_shape() {
        let placement = Placement::linear(DeviceKind::Cpu, vec![0, 1]).unwrap();
        let meta = TensorMeta::new(TensorDesc::new(vec![4, 3], DType::F32), placement, Distribution::split(0));
        assert_eq!(meta.local_shape().unwrap(), vec![2, 3]);
        let broadcast = meta.with_distribution(Distribution::broadcast(1));
        assert_eq!(broadcast.local_shape().unwrap(), vec![4, 3]);
    }
}
