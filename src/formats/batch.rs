use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::delimited::DelimitedRecordReader;
use super::reader::{Header, Record};
use crate::config::SkipPolicy;
use crate::error::LoadError;

/// A group of records destined for one multi-row insert
#[derive(Debug, Clone)]
pub struct Batch {
    pub source: Arc<Path>,
    /// 0-based ordinal of the batch within its file
    pub index: usize,
    pub header: Header,
    pub records: Vec<Record>,
    /// Rows read while filling this batch that were skipped by the policy
    pub rows_dropped: u64,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Groups records from a reader into batches of at most `batch_size` rows
///
/// Dropped rows do not count toward a batch's size: a batch is full once it
/// holds `batch_size` rows that will actually be inserted. The sequence ends
/// after the first error or when the reader is exhausted, and never ends with
/// an empty batch.
pub struct BatchBuilder<R: Read> {
    reader: DelimitedRecordReader<R>,
    source: Arc<Path>,
    batch_size: usize,
    skip_column: Option<(usize, String)>,
    next_index: usize,
    rows_read: u64,
    rows_dropped: u64,
    finished: bool,
}

impl<R: Read> BatchBuilder<R> {
    pub fn new(reader: DelimitedRecordReader<R>, batch_size: usize, policy: &SkipPolicy) -> Self {
        let source: Arc<Path> = Arc::from(reader.path());

        let skip_column = match policy {
            SkipPolicy::KeepAll => None,
            SkipPolicy::SkipEmpty { column } => match reader.header().index_of(column) {
                Some(idx) => Some((idx, column.clone())),
                None => {
                    debug!(
                        path = %source.display(),
                        column = %column,
                        "skip column not in header, keeping all rows"
                    );
                    None
                }
            },
        };

        Self {
            reader,
            source,
            batch_size,
            skip_column,
            next_index: 0,
            rows_read: 0,
            rows_dropped: 0,
            finished: false,
        }
    }

    pub fn header(&self) -> &Header {
        self.reader.header()
    }

    /// Data rows read so far (header excluded)
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Rows skipped so far because of the skip policy
    pub fn rows_dropped(&self) -> u64 {
        self.rows_dropped
    }

    fn should_drop(&self, record: &Record) -> bool {
        match &self.skip_column {
            Some((idx, _)) => record.fields[*idx].is_empty(),
            None => false,
        }
    }

    fn fill_batch(&mut self) -> Result<Option<Batch>, LoadError> {
        let mut records = Vec::with_capacity(self.batch_size);
        let mut dropped = 0u64;

        while records.len() < self.batch_size {
            let record = match self.reader.next() {
                Some(record) => record?,
                None => {
                    self.finished = true;
                    break;
                }
            };
            self.rows_read += 1;

            if self.should_drop(&record) {
                if let Some((_, column)) = &self.skip_column {
                    warn!(
                        path = %self.source.display(),
                        line = record.line,
                        column = %column,
                        "missing value, skipping row"
                    );
                }
                dropped += 1;
                continue;
            }

            records.push(record);
        }

        self.rows_dropped += dropped;

        if records.is_empty() {
            return Ok(None);
        }

        let batch = Batch {
            source: Arc::clone(&self.source),
            index: self.next_index,
            header: self.reader.header().clone(),
            records,
            rows_dropped: dropped,
        };
        self.next_index += 1;
        Ok(Some(batch))
    }
}

impl<R: Read> Iterator for BatchBuilder<R> {
    type Item = Result<Batch, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.fill_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
