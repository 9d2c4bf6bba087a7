//! Scan scheduling and south-side acquisition.

pub mod history;
pub mod scheduler;
pub mod south;

pub use history::HistoryRunner;
pub use scheduler::{ScanScheduler, Tick};
pub use south::SouthConnector;
