pub mod logfile;
pub mod reporting;

pub use logfile::{LogLevel, Logfile, LogfileConfig};
