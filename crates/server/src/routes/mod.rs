mod health;
mod runs;
mod tasks;

pub use health::*;
pub use runs::*;
pub use tasks::*;
