//! Event system for stepflow
//!
//! Run and step transitions are published on an in-process broadcast bus
//! so that status surfaces can follow runs without polling the stores.

mod bus;
mod types;

pub use bus::{EventBus, TaskEvents};
pub use types::*;
