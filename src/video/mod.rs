pub mod supervisor;

pub use supervisor::{RunHandle, RunOutcome, RunState, Supervisor};
