//! Read-only views of external state: the git working tree and the task tracker.

pub mod git;
pub mod tasks;

pub use git::{GitTracker, WorktreeSnapshot};
pub use tasks::{CliTaskTracker, Task, TaskTracker, parse_task_list};
