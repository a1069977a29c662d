pub mod monitor;
pub mod submit;

pub use monitor::{ClientMonitor, Disposition};
