//! Reverse-mode differentiation over the gradient tape.
//!
//! `backward` walks the root's transitive producer set in reverse dispatch order and invokes
//! each operator's gradient rule. Rules build their results by re-entering the dispatcher, so
//! gradient operators go through the same signature selection and boxing resolution as forward
//! ones, and a gradient's distribution may legitimately differ from the forward input's — it is
//! boxed back to the input's distribution before accumulation.
//!
//! Boxing nodes inserted during the forward pass never appear on the tape: handles returned by
//! boxing keep their source's producer link, so the backward walk steps directly from compute
//! node to compute node.

use std::collections::HashMap;

use thiserror::Error;

use crate::dispatch::Dispatcher;
use crate::graph::{NodeId, ValueId};
use crate::registry::{AttrMap, DispatchError};
use crate::tensor::LogicalTensor;
use crate::types::Buffer;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for backward passes.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum AutogradError {
    /// Error returned when the backward root is not a scalar.
    #[error("backward root must be a scalar, got shape {shape:?}")]
    RootNotScalar { shape: Vec<usize> },

    /// Error returned when the backward root does not require gradients.
    #[error("backward root does not require gradients")]
    RootNotDifferentiable,

    /// Error propagated from dispatching gradient operators (including a missing gradient
    /// rule).
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

// ---------------------------------------------------------------------------
// Gradient map
// ---------------------------------------------------------------------------

/// Accumulated gradients of one backward pass, keyed by forward tensor.
#[derive(Clone, Debug, Default)]
pub struct Gradients {
    grads: HashMap<ValueId, LogicalTensor>,
}

impl Gradients {
    /// The accumulated gradient of `tensor`, if any flowed into it.
    pub fn get(&self, tensor: &LogicalTensor) -> Option<&LogicalTensor> {
        self.grads.get(&tensor.value())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Backward
// ---------------------------------------------------------------------------

impl Dispatcher<'_> {
    /// Runs reverse-mode differentiation from the scalar `root`.
    ///
    /// Returns the gradients of every `requires_grad` tensor the root transitively depends on,
    /// each boxed to the distribution of its forward tensor.
    pub fn backward(&mut self, root: &LogicalTensor) -> Result<Gradients, AutogradError> {
        if !root.meta().desc().is_scalar() {
            return Err(AutogradError::RootNotScalar { shape: root.shape().to_vec() });
        }
        if !root.requires_grad() {
            return Err(AutogradError::RootNotDifferentiable);
        }

        let order = self.reverse_tape_order(root);
        let mut gradients = Gradients::default();

        // Seed: d(root)/d(root) = 1, replicated on every rank.
        let ones = Buffer::ones(root.dtype(), 1).map_err(DispatchError::from)?;
        let seed = self.feed(
            root.meta().desc().clone(),
            root.placement().clone(),
            crate::sbp::Distribution::broadcast(root.placement().ndim()),
            vec![ones; root.placement().rank_count()],
            false,
        )?;
        gradients.grads.insert(root.value(), seed);

        for node in order {
            let Some(entry) = self.tape.get(&node).cloned() else {
                continue;
            };
            // An output no gradient reached contributes zeros.
            let mut output_grads = Vec::with_capacity(entry.outputs.len());
            let mut any_grad = false;
            for output in &entry.outputs {
                match gradients.grads.get(&output.value()) {
                    Some(grad) => {
                        any_grad = true;
                        output_grads.push(grad.clone());
                    }
                    None => output_grads.push(self.zeros_like(output)?),
                }
            }
            if !any_grad {
                continue;
            }

            let operator = self.context().registry().get(entry.op_kind.as_str())?;
            let input_grads =
                operator.gradient(self, &entry.inputs, &entry.outputs, &output_grads, &entry.attrs)?;

            for (input, grad) in entry.inputs.iter().zip(input_grads) {
                let Some(grad) = grad else { continue };
                if !input.requires_grad() {
                    continue;
                }
                let aligned = self.box_to(&grad, input.distribution())?;
                let accumulated = match gradients.grads.remove(&input.value()) {
                    Some(existing) => self.dispatch("add", &[&existing, &aligned], AttrMap::new())?.remove(0),
                    None => aligned,
                };
                gradients.grads.insert(input.value(), accumulated);
            }
        }
        Ok(gradients)
    }

    /// Tape nodes the root transitively depends on, most recently dispatched first.
    ///
    /// Nodes are appended in dispatch order, so descending node order is a reverse topological
    /// order of the producer closure.
    fn reverse_tape_order(&self, root: &LogicalTensor) -> Vec<NodeId> {
        let mut reachable = Vec::new();
        let mut frontier: Vec<NodeId> = root.producer().into_iter().collect();
        while let Some(node) = frontier.pop() {
            if reachable.contains(&node) {
                continue;
            }
            reachable.push(node);
            if let Some(entry) = self.tape.get(&node) {
                for input in &entry.inputs {
                    if input.requires_grad() {
                        if let Some(producer) = input.producer() {
                            frontier.push(producer);
                        }
                    }
                }
            }
        }
        reachable.sort_by_key(|node| std::cmp::Reverse(node.0));
        reachable
    }

    fn zeros_like(&mut self, tensor: &LogicalTensor) -> Result<LogicalTensor, DispatchError> {
        let local_len = tensor.meta().local_shape()?.iter().product::<usize>();
        let shards = vec![Buffer::zeros(tensor.dtype(), local_len); tensor.placement().rank_count()];
        self.feed(
            tensor.meta().desc().clone(),
            tensor.placement().clone(),
            tensor.distribution().clone(),
            shards,
            false,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::placement::{DeviceKind, Placement};
    use crate::sbp::Distribution;
    use crate::tensor::TensorDesc;
    use crate::types::DType;

    fn two_ranks() -> Placement {
        Placement::linear(DeviceKind::Cpu, vec![0, 1]).unwrap()
    }

    fn f32_desc(shape: &[usize]) -> TensorDesc {
        TensorDesc::new(shape.to_vec(), DType::F32)
    }

    #[test]
    fn test_backward_rejects_non_scalar_root() {
        let context = Context::new();
        let mut dispatcher = Dispatcher::new(&context);
        let x = dispatcher
            .feed_global(f32_desc(&[4]), two_ranks(), Distribution::split(0), Buffer::F32(vec![1.0, 2.0, 3.0, 4.0]), true)
            .unwrap();
        assert!(matches!(
            dispatcher.backward(&x),
            Err(AutogradError::RootNotScalar { .. }),
        ));
    }

    #[test]
    fn test_backward_rejects_non_differentiable_root() {
        let context = Context::new();
        let mut dispatcher = Dispatcher::new(&context);
        let x = dispatcher
            .feed_global(f32_desc(&[4]), two_ranks(), Distribution::split(0), Buffer::F32(vec![1.0, 2.0, 3.0, 4.0]), false)
            .unwrap();
        let loss = dispatcher.dispatch("reduce_sum", &[&x], AttrMap::new()).unwrap().remove(0);
        assert!(matches!(dispatcher.backward(&loss), Err(AutogradError::RootNotDifferentiable)));
    }

    #[test]
    fn test_sum_gradient_is_ones_in_input_distribution() {
        let context = Context::new();
        let mut dispatcher = Dispatcher::new(&context);
        let x = dispatcher
            .feed_global(f32_desc(&[4]), two_ranks(), Distribution::split(0), Buffer::F32(vec![1.0, 2.0, 3.0, 4.0]), true)
            .unwrap();
        let loss = dispatcher.dispatch("reduce_sum", &[&x], AttrMap::new()).unwrap().remove(0);
        let gradients = dispatcher.backward(&loss).unwrap();
        let grad = gradients.get(&x).unwrap().clone();
        assert_eq!(grad.distribution(), &Distribution::split(0));
        assert_eq!(grad.shape(), x.shape());
        assert_eq!(dispatcher.fetch_global(&grad).unwrap(), Buffer::F32(vec![1.0, 1.0, 1.0, 1.0]));
    }

    #[test]
    fn test_relu_gradient_masks_negative_inputs() {
        let context = Context::new();
        let mut dispatcher = Dispatcher::new(&context);
        let x = dispatcher
            .feed_global(
                f32_desc(&[4]),
                two_ranks(),
                Distribution::split(0),
                Buffer::F32(vec![-1.0, 2.0, -3.0, 4.0]),
                true,
            )
            .unwrap();
        let activated = dispatcher.dispatch("relu", &[&x], AttrMap::new()).unwrap().remove(0);
        let loss = dispatcher.dispatch("reduce_sum", &[&activated], AttrMap::new()).unwrap().remove(0);
        let gradients = dispatcher.backward(&loss).unwrap();
        let grad = gradients.get(&x).unwrap().clone();
        assert_eq!(dispatcher.fetch_global(&grad).unwrap(), Buffer::F32(vec![0.0, 1.0, 0.0, 1.0]));
    }

    #[test]
    fn test_shared_input_gradients_accumulate() {
        let context = Context::new();
        let mut dispatcher = Dispatcher::new(&context);
        let x = dispatcher
            .feed_global(f32_desc(&[4]), two_ranks(), Distribution::split(0), Buffer::F32(vec![1.0, 2.0, 3.0, 4.0]), true)
            .unwrap();
        let left = dispatcher.dispatch("neg", &[&x], AttrMap::new()).unwrap().remove(0);
        let right = dispatcher.dispatch("neg", &[&x], AttrMap::new()).unwrap().remove(0);
        let sum = dispatcher.dispatch("add", &[&left, &right], AttrMap::new()).unwrap().remove(0);
        let loss = dispatcher.dispatch("reduce_sum", &[&sum], AttrMap::new()).unwrap().remove(0);
        let gradients = dispatcher.backward(&loss).unwrap();
        let grad = gradients.get(&x).unwrap().clone();
        assert_eq!(dispatcher.fetch_global(&grad).unwrap(), Buffer::F32(vec![-2.0, -2.0, -2.0, -2.0]));
    }

    #[test]
    fn test_matmul_gradients_box_back_to_forward_distributions() {
        let context = Context::new();
        let mut dispatcher = Dispatcher::new(&context);
        let placement = two_ranks();
        let x = dispatcher
            .feed_global(
                f32_desc(&[2, 2]),
                placement.clone(),
                Distribution::split(0),
                Buffer::F32(vec![1.0, 2.0, 3.0, 4.0]),
                true,
            )
            .unwrap();
        let w = dispatcher
            .feed_global(
                f32_desc(&[2, 2]),
                placement,
                Distribution::broadcast(1),
                Buffer::F32(vec![1.0, 0.0, 0.0, 1.0]),
                true,
            )
            .unwrap();
        let product = dispatcher.dispatch("matmul", &[&x, &w], AttrMap::new()).unwrap().remove(0);
        assert_eq!(product.distribution(), &Distribution::split(0));
        let loss = dispatcher.dispatch("reduce_sum", &[&product], AttrMap::new()).unwrap().remove(0);
        let gradients = dispatcher.backward(&loss).unwrap();

        let x_grad = gradients.get(&x).unwrap().clone();
        assert_eq!(x_grad.distribution(), &Distribution::split(0));
        assert_eq!(dispatcher.fetch_global(&x_grad).unwrap(), Buffer::F32(vec![1.0, 1.0, 1.0, 1.0]));

        let w_grad = gradients.get(&w).unwrap().clone();
        assert_eq!(w_grad.distribution(), &Distribution::broadcast(1));
        assert_eq!(dispatcher.fetch_global(&w_grad).unwrap(), Buffer::F32(vec![4.0, 4.0, 6.0, 6.0]));
    }

    #[test]
    fn test_missing_gradient_rule_fails_backward() {
        let context = Context::new();
        let mut dispatcher = Dispatcher::new(&context);
        let placement = two_ranks();
        let grad_in = dispatcher
            .feed_global(f32_desc(&[4]), placement.clone(), Distribution::split(0), Buffer::F32(vec![1.0; 4]), true)
            .unwrap();
        let activation = dispatcher
            .feed_global(f32_desc(&[4]), placement, Distribution::split(0), Buffer::F32(vec![1.0, -1.0, 1.0, -1.0]), false)
            .unwrap();
        let masked = dispatcher.dispatch("relu_grad", &[&grad_in, &activation], AttrMap::new()).unwrap().remove(0);
        let loss = dispatcher.dispatch("reduce_sum", &[&masked], AttrMap::new()).unwrap().remove(0);
        assert!(matches!(
            dispatcher.backward(&loss),
            Err(AutogradError::Dispatch(DispatchError::NoGradientRule { .. })),
        ));
    }
}
