#![forbid(unsafe_code)]

pub mod allocation;
pub mod common;
pub mod request;

pub use common::{ContractViolation, SchemaVersion, Validate};
