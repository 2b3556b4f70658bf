use thiserror::Error;

use crate::autograd::AutogradError;
use crate::backend::CollectiveError;
use crate::boxing::BoxingError;
use crate::graph::GraphError;
use crate::placement::PlacementError;
use crate::registry::DispatchError;
use crate::sbp::DistributionError;
use crate::types::BufferError;

/// Top-level error of the engine, aggregating every component's error type.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error(transparent)]
    Boxing(#[from] BoxingError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Collective(#[from] CollectiveError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Autograd(#[from] AutogradError),
}
