//! Run orchestration: the phase state machine, the agent backend it invokes,
//! and the persisted run state.

pub mod engine;
pub mod runner;
pub mod state;

pub use engine::{Engine, RunOutcome, RunRequest};
pub use runner::{AgentBackend, CliBackend, InvocationOutput, InvocationRequest};
pub use state::{RunState, RunStatus, RunStore};
