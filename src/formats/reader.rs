use std::ops::Deref;
use std::sync::Arc;

/// A single record (row) from the file
///
/// Field `i` always belongs to header column `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// 1-based line number of the record in its source file
    pub line: u64,
    pub fields: Vec<String>,
}

/// Column names read from the first record of a file
///
/// Cheap to clone; every batch of a file shares the same header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    columns: Arc<[String]>,
}

impl Header {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns: columns.into(),
        }
    }

    /// Position of a column by name
    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

impl Deref for Header {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.columns
    }
}
