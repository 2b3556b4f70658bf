//! Communication backend: the collective primitives boxing steps are executed with.
//!
//! The engine simulates an SPMD run inside one process: every rank's shard is held locally, and
//! a collective is a single call over the shards of one rank group (in group order). The
//! [`CommBackend`] trait is the seam a real multi-process transport would plug into; the
//! in-process backend implements the reference semantics directly on [`Buffer`]s.
//!
//! Fault propagation is out of band. A failing rank raises on the shared [`FaultChannel`]
//! before its peers block on the next collective; every subsequent collective on that channel
//! surfaces the same [`CollectiveError::Failure`] instead of deadlocking.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::types::{sum_buffers, Buffer, BufferError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for collective execution.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum CollectiveError {
    /// Error surfaced on every participant when any rank of the group has failed.
    #[error("collective failure: {reason}")]
    Failure { reason: String },

    /// Error returned when a collective is invoked over an empty rank group.
    #[error("collective invoked over an empty rank group")]
    EmptyGroup,

    /// Error returned when the group's shards cannot be combined.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

// ---------------------------------------------------------------------------
// Fault channel
// ---------------------------------------------------------------------------

/// Out-of-band fault flag shared by every rank of a run.
///
/// The first raised fault wins; later raises are ignored. Once raised, every collective checked
/// against this channel fails with the same [`CollectiveError::Failure`] on every rank.
#[derive(Clone, Debug, Default)]
pub struct FaultChannel {
    fault: Arc<Mutex<Option<String>>>,
}

impl FaultChannel {
    /// Creates a channel with no raised fault.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises a fault, if none has been raised yet.
    pub fn raise(&self, reason: impl Into<String>) {
        if let Ok(mut fault) = self.fault.lock() {
            fault.get_or_insert_with(|| reason.into());
        }
    }

    /// Returns `true` iff a fault has been raised.
    pub fn is_raised(&self) -> bool {
        self.fault.lock().map(|fault| fault.is_some()).unwrap_or(true)
    }

    /// Fails with the raised fault, if any.
    pub fn check(&self) -> Result<(), CollectiveError> {
        let fault = self.fault.lock().map_err(|_| CollectiveError::Failure {
            reason: "fault channel poisoned".to_string(),
        })?;
        match fault.as_ref() {
            Some(reason) => Err(CollectiveError::Failure { reason: reason.clone() }),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Collective primitives over the shards of one rank group.
///
/// `shards` holds one buffer per group member, in group order; `local_shape` is the shard shape
/// shared by all members. Each method returns one buffer per member, in the same order. Every
/// method checks the fault channel first, so a raised fault surfaces identically on all ranks.
pub trait CommBackend: Debug + Send + Sync {
    /// The fault channel collectives on this backend are checked against.
    fn fault_channel(&self) -> &FaultChannel;

    /// Concatenates the group's shards along `tensor_axis`; every member receives the result.
    fn all_gather(
        &self,
        shards: &[&Buffer],
        local_shape: &[usize],
        tensor_axis: usize,
    ) -> Result<Vec<Buffer>, CollectiveError>;

    /// Sums the group's shards elementwise; every member receives the full sum.
    fn all_reduce(&self, shards: &[&Buffer]) -> Result<Vec<Buffer>, CollectiveError>;

    /// Sums the group's shards, then hands each member its slice of the sum along `tensor_axis`.
    fn reduce_scatter(
        &self,
        shards: &[&Buffer],
        local_shape: &[usize],
        tensor_axis: usize,
    ) -> Result<Vec<Buffer>, CollectiveError>;

    /// Re-partitions shards split along `from_axis` into shards split along `to_axis`.
    fn all_to_all(
        &self,
        shards: &[&Buffer],
        local_shape: &[usize],
        from_axis: usize,
        to_axis: usize,
    ) -> Result<Vec<Buffer>, CollectiveError>;
}

// ---------------------------------------------------------------------------
// In-process backend
// ---------------------------------------------------------------------------

/// Reference [`CommBackend`] operating directly on in-process buffers.
#[derive(Clone, Debug, Default)]
pub struct InProcessBackend {
    fault_channel: FaultChannel,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault_channel(fault_channel: FaultChannel) -> Self {
        Self { fault_channel }
    }

    fn gathered(
        &self,
        shards: &[&Buffer],
        local_shape: &[usize],
        tensor_axis: usize,
    ) -> Result<(Buffer, Vec<usize>), CollectiveError> {
        let shapes = vec![local_shape; shards.len()];
        let full = Buffer::concat_axis(shards, shapes.as_slice(), tensor_axis)?;
        let mut full_shape = local_shape.to_vec();
        full_shape[tensor_axis] *= shards.len();
        Ok((full, full_shape))
    }

    fn scatter(
        &self,
        full: &Buffer,
        full_shape: &[usize],
        tensor_axis: usize,
        parts: usize,
    ) -> Result<Vec<Buffer>, CollectiveError> {
        let extent = full_shape[tensor_axis] / parts;
        let mut shards = Vec::with_capacity(parts);
        for part in 0..parts {
            shards.push(full.slice_axis(full_shape, tensor_axis, part * extent, (part + 1) * extent)?);
        }
        Ok(shards)
    }

    fn check(&self, shards: &[&Buffer]) -> Result<(), CollectiveError> {
        self.fault_channel.check()?;
        if shards.is_empty() {
            return Err(CollectiveError::EmptyGroup);
        }
        Ok(())
    }
}

impl CommBackend for InProcessBackend {
    fn fault_channel(&self) -> &FaultChannel {
        &self.fault_channel
    }

    fn all_gather(
        &self,
        shards: &[&Buffer],
        local_shape: &[usize],
        tensor_axis: usize,
    ) -> Result<Vec<Buffer>, CollectiveError> {
        self.check(shards)?;
        let (full, _) = self.gathered(shards, local_shape, tensor_axis)?;
        Ok(vec![full; shards.len()])
    }

    fn all_reduce(&self, shards: &[&Buffer]) -> Result<Vec<Buffer>, CollectiveError> {
        self.check(shards)?;
        let sum = sum_buffers(shards)?;
        Ok(vec![sum; shards.len()])
    }

    fn reduce_scatter(
        &self,
        shards: &[&Buffer],
        local_shape: &[usize],
        tensor_axis: usize,
    ) -> Result<Vec<Buffer>, CollectiveError> {
        self.check(shards)?;
        let sum = sum_buffers(shards)?;
        self.scatter(&sum, local_shape, tensor_axis, shards.len())
    }

    fn all_to_all(
        &self,
        shards: &[&Buffer],
        local_shape: &[usize],
        from_axis: usize,
        to_axis: usize,
    ) -> Result<Vec<Buffer>, CollectiveError> {
        self.check(shards)?;
        // Reference semantics: reconstruct the group's full block along `from_axis`, then hand
        // each member its slice along `to_axis`.
        let (full, full_shape) = self.gathered(shards, local_shape, from_axis)?;
        self.scatter(&full, full_shape.as_slice(), to_axis, shards.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    fn f32s(values: &[f32]) -> Buffer {
        Buffer::F32(values.to_vec())
    }

    #[test]
    fn test_all_gather_concatenates_in_group_order() {
        let backend = InProcessBackend::new();
        let a = f32s(&[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        let b = f32s(&[3.0, 3.0, 3.0, 4.0, 4.0, 4.0]);
        let gathered = backend.all_gather(&[&a, &b], &[2, 3], 0).unwrap();
        assert_eq!(gathered.len(), 2);
        let expected = f32s(&[1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 4.0, 4.0, 4.0]);
        assert_eq!(gathered[0], expected);
        assert_eq!(gathered[1], expected);
    }

    #[test]
    fn test_all_reduce_sums_addends() {
        let backend = InProcessBackend::new();
        let a = f32s(&[1.0, 2.0]);
        let b = f32s(&[10.0, 20.0]);
        let reduced = backend.all_reduce(&[&a, &b]).unwrap();
        assert_eq!(reduced, vec![f32s(&[11.0, 22.0]), f32s(&[11.0, 22.0])]);
    }

    #[test]
    fn test_reduce_scatter_splits_the_sum() {
        let backend = InProcessBackend::new();
        let a = f32s(&[1.0, 2.0, 3.0, 4.0]);
        let b = f32s(&[10.0, 20.0, 30.0, 40.0]);
        let scattered = backend.reduce_scatter(&[&a, &b], &[4], 0).unwrap();
        assert_eq!(scattered, vec![f32s(&[11.0, 22.0]), f32s(&[33.0, 44.0])]);
    }

    #[test]
    fn test_all_to_all_repartitions() {
        let backend = InProcessBackend::new();
        // Two ranks, global shape [2, 2], split on axis 0 -> split on axis 1.
        let a = f32s(&[1.0, 2.0]);
        let b = f32s(&[3.0, 4.0]);
        let repartitioned = backend.all_to_all(&[&a, &b], &[1, 2], 0, 1).unwrap();
        assert_eq!(repartitioned, vec![f32s(&[1.0, 3.0]), f32s(&[2.0, 4.0])]);
    }

    #[test]
    fn test_raised_fault_fails_every_collective() {
        let backend = InProcessBackend::new();
        backend.fault_channel().raise("rank 1 kernel failed");
        backend.fault_channel().raise("rank 0 kernel failed");
        let a = Buffer::zeros(DType::F32, 2);
        let result = backend.all_reduce(&[&a, &a]);
        assert_eq!(
            result,
            Err(CollectiveError::Failure { reason: "rank 1 kernel failed".to_string() }),
        );
    }

    #[test]
    fn test_all_reduce_matches_serial_sum_within_tolerance() {
        let backend = InProcessBackend::new();
        let a = f32s(&[0.1, 0.2, 0.3]);
        let b = f32s(&[0.4, 0.5, 0.6]);
        let c = f32s(&[0.7, 0.8, 0.9]);
        let reduced = backend.all_reduce(&[&a, &b, &c]).unwrap();
        let Buffer::F32(values) = &reduced[0] else { panic!("expected f32") };
        for (value, expected) in values.iter().zip([1.2f32, 1.5, 1.8]) {
            assert!(float_cmp::approx_eq!(f32, *value, expected, ulps = 4));
        }
    }

    #[test]
    fn test_empty_group_is_rejected() {
        let backend = InProcessBackend::new();
        assert_eq!(backend.all_reduce(&[]), Err(CollectiveError::EmptyGroup));
    }
}
