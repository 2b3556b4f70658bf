pub mod autograd;
pub mod backend;
pub mod boxing;
pub mod context;
pub mod dispatch;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod ops;
pub mod placement;
pub mod registry;
pub mod sbp;
pub mod tensor;
pub mod types;
