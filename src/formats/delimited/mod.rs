//! Semicolon-delimited text files

pub mod reader;

pub use reader::DelimitedRecordReader;
