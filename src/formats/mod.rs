//! File parsing: delimited record reading and batching

pub mod batch;
pub mod delimited;
pub mod reader;

pub use batch::{Batch, BatchBuilder};
pub use delimited::DelimitedRecordReader;
pub use reader::{Header, Record};
