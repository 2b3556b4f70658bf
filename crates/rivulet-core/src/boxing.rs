//! Boxing resolution: planning the data movement that converts a tensor from one
//! [`Distribution`] to another over a shared [`Placement`].
//!
//! Resolution is a pure computation. It produces a [`BoxingPlan`], an ordered sequence of
//! [`BoxingStep`]s, each acting on a single grid axis; no data moves until the plan is executed
//! (see [`crate::executor`]). Because every distribution entry acts on exactly one grid axis,
//! the conversion decomposes per axis, and axes are always resolved in increasing order, which
//! makes plans deterministic and cacheable by `(source, target, placement)`.

use std::fmt::Display;

use thiserror::Error;

use crate::placement::Placement;
use crate::sbp::{Distribution, DistributionError, SbpEntry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for boxing resolution.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum BoxingError {
    /// Error returned when a source or target distribution does not match the placement's grid
    /// dimensionality.
    #[error("incompatible distribution: {0}")]
    IncompatibleDistribution(#[from] DistributionError),

    /// Error returned when no conversion exists between two entries on a grid axis.
    ///
    /// Broadcast to partial-sum is the canonical case: multiple encodings are valid (e.g. the
    /// full value on one rank and zeros elsewhere), so the caller must pick one explicitly.
    #[error("no boxing from {from} to {to} on grid axis {grid_axis}")]
    UnsupportedBoxing { from: SbpEntry, to: SbpEntry, grid_axis: usize },
}

// ---------------------------------------------------------------------------
// Boxing steps
// ---------------------------------------------------------------------------

/// One primitive conversion on a single grid axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BoxingStepKind {
    /// Each rank keeps only its own slice along `tensor_axis`. Purely local.
    LocalSlice { tensor_axis: usize },
    /// Ranks exchange slices and concatenate along `tensor_axis`.
    AllGather { tensor_axis: usize },
    /// Ranks sum their addends; every rank receives the full sum.
    AllReduce,
    /// Ranks sum their addends; each rank keeps its slice of the sum along `tensor_axis`.
    ReduceScatter { tensor_axis: usize },
    /// Re-partition from a split on `from_axis` to a split on `to_axis`.
    AllToAll { from_axis: usize, to_axis: usize },
}

impl BoxingStepKind {
    /// Returns `true` iff this step requires coordinated participation of a rank group.
    pub fn is_collective(&self) -> bool {
        !matches!(self, BoxingStepKind::LocalSlice { .. })
    }
}

impl Display for BoxingStepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoxingStepKind::LocalSlice { tensor_axis } => write!(f, "local-slice(axis={tensor_axis})"),
            BoxingStepKind::AllGather { tensor_axis } => write!(f, "all-gather(axis={tensor_axis})"),
            BoxingStepKind::AllReduce => write!(f, "all-reduce"),
            BoxingStepKind::ReduceScatter { tensor_axis } => write!(f, "reduce-scatter(axis={tensor_axis})"),
            BoxingStepKind::AllToAll { from_axis, to_axis } => write!(f, "all-to-all({from_axis}->{to_axis})"),
        }
    }
}

/// A [`BoxingStepKind`] bound to the grid axis it converts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BoxingStep {
    pub grid_axis: usize,
    pub kind: BoxingStepKind,
}

impl Display for BoxingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@grid[{}]", self.kind, self.grid_axis)
    }
}

// ---------------------------------------------------------------------------
// Boxing plans
// ---------------------------------------------------------------------------

/// Ordered sequence of [`BoxingStep`]s converting a source distribution into a target one.
///
/// An empty plan means the distributions already agree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoxingPlan {
    steps: Vec<BoxingStep>,
}

impl BoxingPlan {
    /// Steps in execution order.
    pub fn steps(&self) -> &[BoxingStep] {
        self.steps.as_slice()
    }

    /// Returns `true` iff the plan moves no data.
    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of collective steps in the plan (used to rank candidate operator signatures).
    pub fn collective_count(&self) -> usize {
        self.steps.iter().filter(|step| step.kind.is_collective()).count()
    }
}

impl Display for BoxingPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "[identity]");
        }
        write!(f, "[")?;
        for (index, step) in self.steps.iter().enumerate() {
            if index > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{step}")?;
        }
        write!(f, "]")
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Plans the conversion of a tensor from `source` to `target` over `placement`.
///
/// Grid axes are converted independently, in increasing axis order. The per-axis table:
///
/// | from       | to         | step                       |
/// |------------|------------|----------------------------|
/// | `X`        | `X`        | identity                   |
/// | `B`        | `S(a)`     | local slice                |
/// | `S(a)`     | `B`        | all-gather                 |
/// | `P`        | `B`        | all-reduce                 |
/// | `P`        | `S(a)`     | reduce-scatter             |
/// | `S(a)`     | `S(b)`     | all-to-all (`a != b`)      |
/// | `B`/`S(a)` | `P`        | [`BoxingError::UnsupportedBoxing`] |
pub fn resolve(
    source: &Distribution,
    target: &Distribution,
    placement: &Placement,
) -> Result<BoxingPlan, BoxingError> {
    source.validate_against(placement)?;
    target.validate_against(placement)?;

    let mut steps = Vec::new();
    for (grid_axis, (from, to)) in source.entries().iter().zip(target.entries()).enumerate() {
        if let Some(kind) = convert_entry(*from, *to, grid_axis)? {
            steps.push(BoxingStep { grid_axis, kind });
        }
    }

    let plan = BoxingPlan { steps };
    if !plan.is_identity() {
        log::debug!("boxing {source} -> {target} over {placement}: {plan}");
    }
    Ok(plan)
}

/// Plans the conversion of one grid axis. `None` means the entries already agree.
pub(crate) fn convert_entry(
    from: SbpEntry,
    to: SbpEntry,
    grid_axis: usize,
) -> Result<Option<BoxingStepKind>, BoxingError> {
    use SbpEntry::*;
    match (from, to) {
        (Broadcast, Broadcast) | (PartialSum, PartialSum) => Ok(None),
        (Split(a), Split(b)) if a == b => Ok(None),
        (Broadcast, Split(tensor_axis)) => Ok(Some(BoxingStepKind::LocalSlice { tensor_axis })),
        (Split(tensor_axis), Broadcast) => Ok(Some(BoxingStepKind::AllGather { tensor_axis })),
        (PartialSum, Broadcast) => Ok(Some(BoxingStepKind::AllReduce)),
        (PartialSum, Split(tensor_axis)) => Ok(Some(BoxingStepKind::ReduceScatter { tensor_axis })),
        (Split(from_axis), Split(to_axis)) => Ok(Some(BoxingStepKind::AllToAll { from_axis, to_axis })),
        (Broadcast | Split(_), PartialSum) => Err(BoxingError::UnsupportedBoxing { from, to, grid_axis }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::DeviceKind;

    fn placement_4() -> Placement {
        Placement::linear(DeviceKind::Cpu, vec![0, 1, 2, 3]).unwrap()
    }

    #[test]
    fn test_identity_plans_are_empty() {
        let placement = placement_4();
        for distribution in [Distribution::broadcast(1), Distribution::split(0), Distribution::partial_sum(1)] {
            let plan = resolve(&distribution, &distribution, &placement).unwrap();
            assert!(plan.is_identity(), "expected identity for {distribution}");
        }
    }

    #[test]
    fn test_single_axis_table() {
        let placement = placement_4();
        let cases = [
            (Distribution::broadcast(1), Distribution::split(1), BoxingStepKind::LocalSlice { tensor_axis: 1 }),
            (Distribution::split(0), Distribution::broadcast(1), BoxingStepKind::AllGather { tensor_axis: 0 }),
            (Distribution::partial_sum(1), Distribution::broadcast(1), BoxingStepKind::AllReduce),
            (Distribution::partial_sum(1), Distribution::split(0), BoxingStepKind::ReduceScatter { tensor_axis: 0 }),
            (Distribution::split(0), Distribution::split(1), BoxingStepKind::AllToAll { from_axis: 0, to_axis: 1 }),
        ];
        for (source, target, expected) in cases {
            let plan = resolve(&source, &target, &placement).unwrap();
            assert_eq!(plan.steps(), &[BoxingStep { grid_axis: 0, kind: expected }]);
        }
    }

    #[test]
    fn test_broadcast_to_partial_sum_is_unsupported() {
        for ranks in [vec![0], vec![0, 1, 2, 3]] {
            let placement = Placement::linear(DeviceKind::Cpu, ranks).unwrap();
            let result = resolve(&Distribution::broadcast(1), &Distribution::partial_sum(1), &placement);
            assert!(matches!(
                result,
                Err(BoxingError::UnsupportedBoxing { from: SbpEntry::Broadcast, to: SbpEntry::PartialSum, grid_axis: 0 }),
            ));
        }
    }

    #[test]
    fn test_grid_mismatch_is_rejected() {
        let placement = placement_4();
        let result = resolve(&Distribution::broadcast(2), &Distribution::broadcast(1), &placement);
        assert!(matches!(result, Err(BoxingError::IncompatibleDistribution(_))));
    }

    #[test]
    fn test_two_axis_plans_resolve_axes_in_order() {
        let placement = Placement::new(DeviceKind::Cpu, vec![2, 2], vec![0, 1, 2, 3]).unwrap();
        let source = Distribution::new(vec![SbpEntry::Split(0), SbpEntry::PartialSum]);
        let target = Distribution::new(vec![SbpEntry::Broadcast, SbpEntry::Split(1)]);
        let plan = resolve(&source, &target, &placement).unwrap();
        assert_eq!(
            plan.steps(),
            &[
                BoxingStep { grid_axis: 0, kind: BoxingStepKind::AllGather { tensor_axis: 0 } },
                BoxingStep { grid_axis: 1, kind: BoxingStepKind::ReduceScatter { tensor_axis: 1 } },
            ],
        );
        assert_eq!(plan.collective_count(), 2);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let placement = placement_4();
        let source = Distribution::split(0);
        let target = Distribution::broadcast(1);
        let first = resolve(&source, &target, &placement).unwrap();
        let second = resolve(&source, &target, &placement).unwrap();
        assert_eq!(first, second);
    }
}
