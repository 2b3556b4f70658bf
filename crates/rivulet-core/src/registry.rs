//! Operator registry: the closed table mapping operator kinds to their descriptor bundles.
//!
//! Each registered [`Operator`] bundles (a) shape/dtype inference, (b) the list of valid
//! per-grid-axis distribution signatures with their output distributions, (c) the per-rank
//! kernel, and (d) an optional gradient rule. The dispatcher only consumes this table; kernels
//! and rules are defined where the operators are ([`crate::ops`]).
//!
//! Registration happens at context initialization. Lookup of an unregistered kind fails with
//! [`DispatchError::UnknownOperator`] rather than aborting the process.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Display};

use dyn_clone::DynClone;
use thiserror::Error;

use crate::backend::CollectiveError;
use crate::boxing::BoxingError;
use crate::dispatch::Dispatcher;
use crate::graph::GraphError;
use crate::placement::PlacementError;
use crate::sbp::{DistributionError, SbpEntry};
use crate::tensor::{LogicalTensor, TensorDesc};
use crate::types::{Buffer, BufferError, DType};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for operator dispatch, kernel execution, and gradient construction.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum DispatchError {
    /// Error returned when an operator kind is not registered.
    #[error("unknown operator kind `{op_kind}`")]
    UnknownOperator { op_kind: String },

    /// Error returned when an operator receives the wrong number of inputs.
    #[error("operator `{op_kind}` expects {expected} input(s) but received {actual}")]
    ArityMismatch { op_kind: String, expected: usize, actual: usize },

    /// Error returned when input shapes violate the operator's signature.
    #[error("operator `{op_kind}` shape mismatch: {details}")]
    ShapeMismatch { op_kind: String, details: String },

    /// Error returned when input dtypes violate the operator's signature.
    #[error("operator `{op_kind}` expects dtype {expected} but received {actual}")]
    DtypeMismatch { op_kind: String, expected: DType, actual: DType },

    /// Error returned when the inputs of one dispatch call live on different placements.
    #[error("operator `{op_kind}` inputs must share one placement")]
    PlacementMismatch { op_kind: String },

    /// Error returned when a required attribute is absent.
    #[error("operator `{op_kind}` requires attribute `{name}`")]
    MissingAttribute { op_kind: String, name: String },

    /// Error returned when an attribute has the wrong type.
    #[error("attribute `{name}` must be a {expected}")]
    AttributeTypeMismatch { name: String, expected: &'static str },

    /// Error returned when no distribution signature of the operator admits the inputs.
    #[error("operator `{op_kind}` has no usable distribution signature for its inputs")]
    NoUsableSignature { op_kind: String },

    /// Error returned when a backward rule is requested for an operator that has none.
    #[error("operator `{op_kind}` has no registered gradient rule")]
    NoGradientRule { op_kind: String },

    /// Error propagated from boxing resolution.
    #[error(transparent)]
    Boxing(#[from] BoxingError),

    /// Error propagated from distribution geometry.
    #[error(transparent)]
    Distribution(#[from] DistributionError),

    /// Error propagated from a kernel's buffer manipulation.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Error propagated from a collective.
    #[error(transparent)]
    Collective(#[from] CollectiveError),

    /// Error propagated from placement geometry.
    #[error(transparent)]
    Placement(#[from] PlacementError),

    /// Error propagated from the execution graph.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// One operator attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    IntList(Vec<i64>),
    Shape(Vec<usize>),
}

/// Attribute map of one operator invocation. Iteration order is deterministic.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttrMap {
    entries: BTreeMap<String, AttrValue>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: AttrValue) -> &mut Self {
        self.entries.insert(name.into(), value);
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.entries.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.entries.get(name)
    }

    /// Fetches a required integer attribute.
    pub fn require_int(&self, op_kind: &str, name: &str) -> Result<i64, DispatchError> {
        match self.get(name) {
            Some(AttrValue::Int(value)) => Ok(*value),
            Some(_) => Err(DispatchError::AttributeTypeMismatch { name: name.to_string(), expected: "integer" }),
            None => Err(DispatchError::MissingAttribute { op_kind: op_kind.to_string(), name: name.to_string() }),
        }
    }

    /// Fetches a required shape attribute.
    pub fn require_shape(&self, op_kind: &str, name: &str) -> Result<&[usize], DispatchError> {
        match self.get(name) {
            Some(AttrValue::Shape(shape)) => Ok(shape.as_slice()),
            Some(_) => Err(DispatchError::AttributeTypeMismatch { name: name.to_string(), expected: "shape" }),
            None => Err(DispatchError::MissingAttribute { op_kind: op_kind.to_string(), name: name.to_string() }),
        }
    }
}

// ---------------------------------------------------------------------------
// Distribution signatures
// ---------------------------------------------------------------------------

/// One valid way to distribute an operator's inputs and outputs along a single grid axis.
///
/// Signatures are declared per grid axis and composed independently across axes, so one
/// signature list covers 1-D and multi-dimensional rank grids alike.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistributionSignature {
    inputs: Vec<SbpEntry>,
    outputs: Vec<SbpEntry>,
}

impl DistributionSignature {
    pub fn new(inputs: Vec<SbpEntry>, outputs: Vec<SbpEntry>) -> Self {
        Self { inputs, outputs }
    }

    /// Required input entries, one per operator input.
    pub fn inputs(&self) -> &[SbpEntry] {
        self.inputs.as_slice()
    }

    /// Produced output entries, one per operator output.
    pub fn outputs(&self) -> &[SbpEntry] {
        self.outputs.as_slice()
    }
}

// ---------------------------------------------------------------------------
// Local arguments
// ---------------------------------------------------------------------------

/// One per-rank kernel input: the local shard and its shape.
#[derive(Copy, Clone, Debug)]
pub struct LocalArg<'a> {
    pub buffer: &'a Buffer,
    pub shape: &'a [usize],
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

/// Descriptor bundle of one operator kind.
///
/// `compute` is the per-rank kernel: it sees only local shards and runs identically on every
/// rank (SPMD). `gradient` re-enters the dispatcher to build the backward operators; the default
/// marks the operator as non-differentiable.
pub trait Operator: Debug + Display + DynClone + Send + Sync {
    /// The registry key of this operator.
    fn kind(&self) -> &str;

    /// Validates input shapes/dtypes and infers the output descriptors.
    fn infer(&self, inputs: &[TensorDesc], attrs: &AttrMap) -> Result<Vec<TensorDesc>, DispatchError>;

    /// Valid per-grid-axis distribution signatures, in declaration (preference) order.
    fn distribution_signatures(&self, inputs: &[TensorDesc], attrs: &AttrMap) -> Vec<DistributionSignature>;

    /// Runs the kernel on one rank's local shards. `output_shapes` are the local output shapes
    /// implied by the selected signature.
    fn compute(
        &self,
        inputs: &[LocalArg<'_>],
        attrs: &AttrMap,
        output_shapes: &[Vec<usize>],
    ) -> Result<Vec<Buffer>, DispatchError>;

    /// Builds the gradients of this operator's inputs by dispatching backward operators.
    ///
    /// Returns one entry per forward input; `None` marks an input that receives no gradient.
    fn gradient(
        &self,
        _dispatcher: &mut Dispatcher<'_>,
        _inputs: &[LogicalTensor],
        _outputs: &[LogicalTensor],
        _output_grads: &[LogicalTensor],
        _attrs: &AttrMap,
    ) -> Result<Vec<Option<LogicalTensor>>, DispatchError> {
        Err(DispatchError::NoGradientRule { op_kind: self.kind().to_string() })
    }
}

dyn_clone::clone_trait_object!(Operator);

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Table of registered operators, keyed by kind.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    operators: HashMap<String, Box<dyn Operator>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in operator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::ops::register_builtins(&mut registry);
        registry
    }

    /// Registers `operator` under its kind, replacing any previous registration.
    pub fn register(&mut self, operator: Box<dyn Operator>) {
        self.operators.insert(operator.kind().to_string(), operator);
    }

    /// Looks up the operator registered under `op_kind`.
    pub fn get(&self, op_kind: &str) -> Result<&dyn Operator, DispatchError> {
        self.operators
            .get(op_kind)
            .map(|operator| operator.as_ref())
            .ok_or_else(|| DispatchError::UnknownOperator { op_kind: op_kind.to_string() })
    }

    /// Returns `true` iff `op_kind` is registered.
    pub fn contains(&self, op_kind: &str) -> bool {
        self.operators.contains_key(op_kind)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_map_typed_getters() {
        let attrs = AttrMap::new()
            .with("axis", AttrValue::Int(1))
            .with("shape", AttrValue::Shape(vec![4, 3]));
        assert_eq!(attrs.require_int("reduce_sum", "axis").unwrap(), 1);
        assert_eq!(attrs.require_shape("broadcast_to", "shape").unwrap(), &[4, 3]);
        assert!(matches!(
            attrs.require_int("reduce_sum", "keepdims"),
            Err(DispatchError::MissingAttribute { .. }),
        ));
        assert!(matches!(
            attrs.require_int("reduce_sum", "shape"),
            Err(DispatchError::AttributeTypeMismatch { expected: "integer", .. }),
        ));
    }

    #[test]
    fn test_unknown_operator_lookup() {
        let registry = Registry::new();
        assert!(matches!(
            registry.get("does_not_exist"),
            Err(DispatchError::UnknownOperator { .. }),
        ));
    }

    #[test]
    fn test_builtin_registration() {
        let registry = Registry::with_builtins();
        for op_kind in ["add", "sub", "mul", "neg", "relu", "matmul", "reduce_sum", "transpose", "broadcast_to"] {
            assert!(registry.contains(op_kind), "missing builtin `{op_kind}`");
        }
    }
}
