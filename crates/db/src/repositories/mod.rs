mod artifact_repository;
mod run_state_repository;
mod task_repository;

pub use artifact_repository::*;
pub use run_state_repository::*;
pub use task_repository::*;
