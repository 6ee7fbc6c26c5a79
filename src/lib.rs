pub mod challenge;
pub mod checkpoint;
pub mod confidence;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod hive_config;
pub mod init;
pub mod logging;
pub mod orchestrator;
pub mod parallel;
pub mod report;
pub mod stream;
pub mod tracker;
pub mod ui;
pub mod util;
pub mod workflow;
