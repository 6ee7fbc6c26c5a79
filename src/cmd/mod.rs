//! CLI command implementations.
//!
//! | Module    | Commands handled                         |
//! |-----------|------------------------------------------|
//! | `run`     | `Run`, `Resume`                          |
//! | `status`  | `Status`, `Checkpoints`, `Events`        |
//! | `comb`    | `Comb`                                   |
//! | `project` | `Init`, `Workflows`                      |
//! | `config`  | `Config`                                 |

pub mod comb;
pub mod config;
pub mod project;
pub mod run;
pub mod status;

pub use comb::cmd_comb;
pub use config::cmd_config;
pub use project::{cmd_init, cmd_workflows};
pub use run::{ResumeArgs, RunArgs, cmd_resume, cmd_run};
pub use status::{cmd_checkpoints, cmd_events, cmd_status};
