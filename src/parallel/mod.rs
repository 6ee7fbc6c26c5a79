//! Parallel task execution in isolated worktrees.
//!
//! - `scheduler`: dependency waves over a task batch
//! - `workspace`: the `Workspace` seam and its git worktree implementation
//! - `merge`: deterministic merge ordering
//! - `coordinator`: bounded dispatch followed by one merge stage

mod coordinator;
mod merge;
mod scheduler;
mod workspace;

pub use coordinator::{
    CoordinatorSettings, ParallelCoordinator, ParallelOutcome, ParallelRequest, TaskOutcome,
};
pub use merge::merge_order;
pub use scheduler::{TaskGraph, TaskScheduler, TaskStatus};
pub use workspace::{GitWorkspace, MergeOutcome, TaskWorkspace, Workspace};
