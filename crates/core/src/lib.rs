//! Domain model shared by every stepflow crate: tasks, artifacts, workflow
//! definitions and the persisted run state.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::CoreError;
