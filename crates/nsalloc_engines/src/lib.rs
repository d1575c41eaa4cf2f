#![forbid(unsafe_code)]

pub mod arbiter;
pub mod capacity;
pub mod config;
pub mod notify;
pub mod priority;
pub mod scheduler;
