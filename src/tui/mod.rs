//! TUI module for terminal user interfaces

mod run_monitor;

pub use run_monitor::{mask_key, RunMonitorApp};
