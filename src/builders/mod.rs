//! Builders to assemble a scheduler from configuration.

pub mod scheduler_builder;

pub use scheduler_builder::{build_collaborators, build_handle, build_scheduler};
