mod agent;
mod artifact;
mod run;
mod task;
mod workflow;

pub use agent::*;
pub use artifact::*;
pub use run::*;
pub use task::*;
pub use workflow::*;
