//! Placements: the grid of physical ranks a tensor or operator lives on.
//!
//! A [`Placement`] names a set of ranks (one logical process per device in an SPMD run) arranged
//! as a one- or multi-dimensional grid in row-major order. Distribution descriptors
//! ([`crate::sbp::Distribution`]) annotate *how* a logical tensor's data maps onto that grid, one
//! entry per grid axis. Collectives operate on the *rank groups* of a single grid axis: the peers
//! that share every coordinate except the one along that axis.
//!
//! For a 2x2 grid over ranks `[0, 1, 2, 3]`, the rank at grid coordinate `(i, j)` has linear
//! index `i * 2 + j`; the groups of axis 0 are `{0, 2}` and `{1, 3}`, and the groups of axis 1
//! are `{0, 1}` and `{2, 3}`.
//!
//! Placements are immutable once constructed and compare structurally, which lets them key the
//! process-wide boxing-plan cache.

use std::fmt::Display;

use thiserror::Error;

/// Globally unique identifier of one rank (one device-bound logical process).
pub type RankId = usize;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for placement construction and grid-axis lookups.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum PlacementError {
    /// Error returned when a placement is constructed with an empty rank grid.
    #[error("placement rank grids must have at least one axis")]
    EmptyGrid,

    /// Error returned when a grid axis has size `0`.
    #[error("placement grid axis {axis} must have size > 0")]
    InvalidAxisSize { axis: usize },

    /// Error returned when the number of ranks does not match the product of grid axis sizes.
    #[error("placement has {actual} rank(s), but grid sizes imply {expected}")]
    RankCountMismatch { expected: usize, actual: usize },

    /// Error returned when a rank appears more than once in a placement.
    #[error("rank {rank} appears more than once in the placement")]
    DuplicateRank { rank: RankId },

    /// Error returned when a grid axis index is out of range.
    #[error("grid axis {axis} is out of range for a {ndim}-dimensional rank grid")]
    AxisOutOfRange { axis: usize, ndim: usize },
}

// ---------------------------------------------------------------------------
// Device kind
// ---------------------------------------------------------------------------

/// Kind of physical device backing every rank of a placement.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda => write!(f, "cuda"),
        }
    }
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Immutable grid of ranks with a shared device kind.
///
/// Ranks are stored in row-major order with respect to `grid`: for grid `[4, 2]`, the rank at
/// coordinate `(i, j)` has linear index `i * 2 + j`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Placement {
    device_kind: DeviceKind,
    grid: Vec<usize>,
    ranks: Vec<RankId>,
}

impl Placement {
    /// Creates a placement from grid axis sizes and row-major ranks.
    ///
    /// Validates that the grid has at least one axis, that all axis sizes are positive, that the
    /// rank count equals the product of axis sizes, and that ranks are unique.
    pub fn new(device_kind: DeviceKind, grid: Vec<usize>, ranks: Vec<RankId>) -> Result<Self, PlacementError> {
        if grid.is_empty() {
            return Err(PlacementError::EmptyGrid);
        }
        let mut expected = 1usize;
        for (axis, size) in grid.iter().enumerate() {
            if *size == 0 {
                return Err(PlacementError::InvalidAxisSize { axis });
            }
            expected *= size;
        }
        if ranks.len() != expected {
            return Err(PlacementError::RankCountMismatch { expected, actual: ranks.len() });
        }
        for (index, rank) in ranks.iter().enumerate() {
            if ranks[..index].contains(rank) {
                return Err(PlacementError::DuplicateRank { rank: *rank });
            }
        }
        Ok(Self { device_kind, grid, ranks })
    }

    /// Creates a one-axis placement over `ranks`.
    pub fn linear(device_kind: DeviceKind, ranks: Vec<RankId>) -> Result<Self, PlacementError> {
        let len = ranks.len();
        Self::new(device_kind, vec![len], ranks)
    }

    /// Creates a single-rank placement.
    pub fn single(device_kind: DeviceKind, rank: RankId) -> Self {
        // A one-axis, one-rank grid cannot violate any construction invariant.
        Self { device_kind, grid: vec![1], ranks: vec![rank] }
    }

    /// Device kind shared by every rank of this placement.
    pub fn device_kind(&self) -> DeviceKind {
        self.device_kind
    }

    /// Grid axis sizes.
    pub fn grid(&self) -> &[usize] {
        self.grid.as_slice()
    }

    /// Number of grid axes.
    pub fn ndim(&self) -> usize {
        self.grid.len()
    }

    /// Ranks in row-major grid order.
    pub fn ranks(&self) -> &[RankId] {
        self.ranks.as_slice()
    }

    /// Number of ranks in this placement.
    pub fn rank_count(&self) -> usize {
        self.ranks.len()
    }

    /// Returns the row-major index of `rank` in this placement, if present.
    pub fn rank_index(&self, rank: RankId) -> Option<usize> {
        self.ranks.iter().position(|candidate| *candidate == rank)
    }

    /// Returns the grid coordinate of the rank at `rank_index`, if valid.
    pub fn coordinate(&self, rank_index: usize) -> Option<Vec<usize>> {
        (rank_index < self.ranks.len()).then(|| coordinate_for_linear_index(rank_index, self.grid.as_slice()))
    }

    /// Extent of grid axis `axis`.
    pub fn axis_size(&self, axis: usize) -> Result<usize, PlacementError> {
        self.grid.get(axis).copied().ok_or(PlacementError::AxisOutOfRange { axis, ndim: self.grid.len() })
    }

    /// Returns the rank groups of grid axis `axis`.
    ///
    /// Each group collects the row-major *rank indices* that share every grid coordinate except
    /// the one along `axis`, ordered by that coordinate. These are exactly the participant sets
    /// of a collective performed along `axis`.
    pub fn rank_groups(&self, axis: usize) -> Result<Vec<Vec<usize>>, PlacementError> {
        let axis_size = self.axis_size(axis)?;
        let group_count = self.ranks.len() / axis_size;
        let mut groups = vec![Vec::with_capacity(axis_size); group_count];

        // Assign every rank index to the group identified by its coordinates on the other axes,
        // keeping row-major order within a group (ranks are visited in increasing axis
        // coordinate for a fixed remainder of the coordinate tuple).
        for rank_index in 0..self.ranks.len() {
            let coordinate = coordinate_for_linear_index(rank_index, self.grid.as_slice());
            let mut group_key = 0usize;
            for (other_axis, size) in self.grid.iter().enumerate() {
                if other_axis != axis {
                    group_key = group_key * size + coordinate[other_axis];
                }
            }
            groups[group_key].push(rank_index);
        }
        for group in &mut groups {
            group.sort_by_key(|rank_index| coordinate_for_linear_index(*rank_index, self.grid.as_slice())[axis]);
        }
        Ok(groups)
    }
}

impl Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:?} grid={:?}", self.device_kind, self.ranks, self.grid)
    }
}

fn coordinate_for_linear_index(mut index: usize, axis_sizes: &[usize]) -> Vec<usize> {
    let mut coordinate = vec![0usize; axis_sizes.len()];
    for axis in (0..axis_sizes.len()).rev() {
        let axis_size = axis_sizes[axis];
        coordinate[axis] = index % axis_size;
        index /= axis_size;
    }
    coordinate
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn placement_2x2() -> Placement {
        Placement::new(DeviceKind::Cpu, vec![2, 2], vec![0, 1, 2, 3]).unwrap()
    }

    #[test]
    fn test_construction_and_lookups() {
        let placement = placement_2x2();
        assert_eq!(placement.ndim(), 2);
        assert_eq!(placement.rank_count(), 4);
        assert_eq!(placement.rank_index(2), Some(2));
        assert_eq!(placement.rank_index(9), None);
        assert_eq!(placement.coordinate(3), Some(vec![1, 1]));
        assert_eq!(placement.coordinate(4), None);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(Placement::new(DeviceKind::Cpu, vec![], vec![]), Err(PlacementError::EmptyGrid)));
        assert!(matches!(
            Placement::new(DeviceKind::Cpu, vec![2, 0], vec![]),
            Err(PlacementError::InvalidAxisSize { axis: 1 }),
        ));
        assert!(matches!(
            Placement::new(DeviceKind::Cpu, vec![2], vec![0, 1, 2]),
            Err(PlacementError::RankCountMismatch { expected: 2, actual: 3 }),
        ));
        assert!(matches!(
            Placement::new(DeviceKind::Cpu, vec![2], vec![7, 7]),
            Err(PlacementError::DuplicateRank { rank: 7 }),
        ));
    }

    #[test]
    fn test_rank_groups_1d() {
        let placement = Placement::linear(DeviceKind::Cpu, vec![4, 5, 6]).unwrap();
        assert_eq!(placement.rank_groups(0).unwrap(), vec![vec![0, 1, 2]]);
        assert!(matches!(placement.rank_groups(1), Err(PlacementError::AxisOutOfRange { axis: 1, ndim: 1 })));
    }

    #[test]
    fn test_rank_groups_2d() {
        let placement = placement_2x2();
        assert_eq!(placement.rank_groups(0).unwrap(), vec![vec![0, 2], vec![1, 3]]);
        assert_eq!(placement.rank_groups(1).unwrap(), vec![vec![0, 1], vec![2, 3]]);
    }
}
