pub mod icons;
pub mod progress;
pub mod status;

pub use progress::{RunUI, event_line, spawn_event_printer};
pub use status::{render_run_list, render_status, terminal_width};
