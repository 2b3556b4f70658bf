pub use rivulet_core as core;

pub use rivulet_core::autograd::Gradients;
pub use rivulet_core::backend::CommBackend;
pub use rivulet_core::backend::FaultChannel;
pub use rivulet_core::backend::InProcessBackend;
pub use rivulet_core::context::Context;
pub use rivulet_core::context::TieBreak;
pub use rivulet_core::dispatch::Dispatcher;
pub use rivulet_core::dispatch::ExecutionMode;
pub use rivulet_core::errors::Error;
pub use rivulet_core::placement::DeviceKind;
pub use rivulet_core::placement::Placement;
pub use rivulet_core::registry::AttrMap;
pub use rivulet_core::registry::AttrValue;
pub use rivulet_core::registry::Operator;
pub use rivulet_core::sbp::Distribution;
pub use rivulet_core::sbp::SbpEntry;
pub use rivulet_core::tensor::LogicalTensor;
pub use rivulet_core::tensor::TensorDesc;
pub use rivulet_core::types::Buffer;
pub use rivulet_core::types::DType;
