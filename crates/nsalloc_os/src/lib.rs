#![forbid(unsafe_code)]

pub mod engine;
pub mod gate;
pub mod publish;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::{AllocationEngine, AllocationError};
pub use gate::{CapacityGate, GateMode, GateOutcome, QueueEpisode};
pub use publish::{EnvFilePublisher, OutputChannel, PublishError, StdoutPublisher};
