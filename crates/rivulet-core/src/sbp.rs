//! SBP distribution descriptors: how a logical tensor's data maps onto a placement.
//!
//! Each grid axis of a [`Placement`] carries one [`SbpEntry`]:
//!
//! - `Split(axis)` — the tensor is partitioned along tensor axis `axis` across the ranks of that
//!   grid axis; every rank holds one contiguous, equally-sized piece.
//! - `Broadcast` — every rank of that grid axis holds the full data.
//! - `PartialSum` — every rank holds a same-shaped addend; the logical value is the elementwise
//!   sum across the grid axis.
//!
//! A [`Distribution`] is the sequence of entries, one per grid axis, and must always have exactly
//! the placement's grid dimensionality. Conversions between distributions are planned by the
//! boxing resolver ([`crate::boxing`]); this module only describes layouts and computes the
//! per-rank shard geometry they imply.

use std::fmt::Display;
use std::ops::Range;

use thiserror::Error;

use crate::placement::Placement;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for distribution validation and shard-geometry computation.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DistributionError {
    /// Error returned when a distribution's entry count does not match a placement's grid
    /// dimensionality.
    #[error("distribution has {entries} entr(ies) but the placement rank grid has {grid_ndim} axis(es)")]
    GridRankMismatch { entries: usize, grid_ndim: usize },

    /// Error returned when a split references a tensor axis the tensor does not have.
    #[error("split tensor axis {tensor_axis} is out of range for a rank-{tensor_rank} tensor")]
    SplitAxisOutOfRange { tensor_axis: usize, tensor_rank: usize },

    /// Error returned when a split does not divide the tensor evenly. Uneven splits are never
    /// silently padded.
    #[error(
        "tensor axis {tensor_axis} with extent {extent} is not divisible by grid axis {grid_axis} of size {axis_size}"
    )]
    IndivisibleSplit { tensor_axis: usize, extent: usize, grid_axis: usize, axis_size: usize },
}

// ---------------------------------------------------------------------------
// SBP entries
// ---------------------------------------------------------------------------

/// Distribution of a logical tensor along one grid axis of a placement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SbpEntry {
    /// Every rank holds the full data.
    Broadcast,
    /// The tensor is partitioned along the given tensor axis.
    Split(usize),
    /// Every rank holds an addend of the logical value.
    PartialSum,
}

impl SbpEntry {
    /// Returns the split tensor axis, if this entry is a split.
    pub fn split_axis(&self) -> Option<usize> {
        match self {
            SbpEntry::Split(tensor_axis) => Some(*tensor_axis),
            _ => None,
        }
    }
}

impl Display for SbpEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SbpEntry::Broadcast => write!(f, "B"),
            SbpEntry::Split(tensor_axis) => write!(f, "S({tensor_axis})"),
            SbpEntry::PartialSum => write!(f, "P"),
        }
    }
}

// ---------------------------------------------------------------------------
// Distribution
// ---------------------------------------------------------------------------

/// Per-grid-axis distribution descriptor of one logical tensor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Distribution {
    entries: Vec<SbpEntry>,
}

impl Distribution {
    /// Creates a distribution from one entry per grid axis.
    pub fn new(entries: Vec<SbpEntry>) -> Self {
        Self { entries }
    }

    /// Creates a fully broadcast distribution for a grid with `ndim` axes.
    pub fn broadcast(ndim: usize) -> Self {
        Self { entries: vec![SbpEntry::Broadcast; ndim] }
    }

    /// Creates a one-axis split distribution along `tensor_axis`.
    pub fn split(tensor_axis: usize) -> Self {
        Self { entries: vec![SbpEntry::Split(tensor_axis)] }
    }

    /// Creates a fully partial-sum distribution for a grid with `ndim` axes.
    pub fn partial_sum(ndim: usize) -> Self {
        Self { entries: vec![SbpEntry::PartialSum; ndim] }
    }

    /// Per-grid-axis entries.
    pub fn entries(&self) -> &[SbpEntry] {
        self.entries.as_slice()
    }

    /// Number of grid axes described.
    pub fn ndim(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` iff any grid axis carries a partial sum.
    pub fn has_partial_sum(&self) -> bool {
        self.entries.iter().any(|entry| matches!(entry, SbpEntry::PartialSum))
    }

    /// Validates that this distribution matches `placement`'s grid dimensionality.
    pub fn validate_against(&self, placement: &Placement) -> Result<(), DistributionError> {
        if self.entries.len() != placement.ndim() {
            return Err(DistributionError::GridRankMismatch {
                entries: self.entries.len(),
                grid_ndim: placement.ndim(),
            });
        }
        Ok(())
    }

    /// Computes the per-rank local shard shape of a tensor with `global_shape`.
    ///
    /// All ranks share the same shard shape: splits must divide the tensor evenly
    /// ([`DistributionError::IndivisibleSplit`] otherwise). Grid axes are applied in order, so
    /// two grid axes splitting the same tensor axis divide its extent by the product of their
    /// sizes.
    pub fn local_shape(&self, global_shape: &[usize], placement: &Placement) -> Result<Vec<usize>, DistributionError> {
        self.validate_against(placement)?;
        let mut local = global_shape.to_vec();
        for (grid_axis, entry) in self.entries.iter().enumerate() {
            if let SbpEntry::Split(tensor_axis) = entry {
                if *tensor_axis >= local.len() {
                    return Err(DistributionError::SplitAxisOutOfRange {
                        tensor_axis: *tensor_axis,
                        tensor_rank: local.len(),
                    });
                }
                let axis_size = placement.grid()[grid_axis];
                if local[*tensor_axis] % axis_size != 0 {
                    return Err(DistributionError::IndivisibleSplit {
                        tensor_axis: *tensor_axis,
                        extent: local[*tensor_axis],
                        grid_axis,
                        axis_size,
                    });
                }
                local[*tensor_axis] /= axis_size;
            }
        }
        Ok(local)
    }

    /// Computes the global index ranges held by the rank at `rank_index`, one per tensor axis.
    ///
    /// Broadcast and partial-sum axes do not restrict any range; each split narrows the range of
    /// its tensor axis according to the rank's coordinate along the splitting grid axis.
    pub fn shard_ranges(
        &self,
        global_shape: &[usize],
        placement: &Placement,
        rank_index: usize,
    ) -> Result<Vec<Range<usize>>, DistributionError> {
        // Computing the local shape first also runs all validation.
        self.local_shape(global_shape, placement)?;
        let coordinate = placement
            .coordinate(rank_index)
            .unwrap_or_else(|| vec![0; placement.ndim()]);

        let mut ranges = global_shape.iter().map(|extent| 0..*extent).collect::<Vec<_>>();
        for (grid_axis, entry) in self.entries.iter().enumerate() {
            if let SbpEntry::Split(tensor_axis) = entry {
                let axis_size = placement.grid()[grid_axis];
                let range = &ranges[*tensor_axis];
                let part = (range.end - range.start) / axis_size;
                let start = range.start + coordinate[grid_axis] * part;
                ranges[*tensor_axis] = start..start + part;
            }
        }
        Ok(ranges)
    }
}

impl Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (index, entry) in self.entries.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{entry}")?;
        }
        write!(f, ")")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
