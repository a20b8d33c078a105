//! Loading files into tables: batch execution, per-file loading and fan-out

pub mod coordinator;
pub mod executor;
pub mod worker;

pub use coordinator::{DispatchSummary, Dispatcher, setup_progress_tracking};
pub use executor::BatchSink;
pub use worker::FileLoader;
