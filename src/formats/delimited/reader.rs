use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::StringRecord;

use crate::error::LoadError;
use crate::formats::reader::{Header, Record};

/// Streaming reader over a delimited file with a fixed column count
///
/// The first record is consumed as the header when the reader is created.
/// Iterating yields the remaining records one at a time; the first malformed
/// record or read error ends the sequence.
pub struct DelimitedRecordReader<R: Read> {
    path: PathBuf,
    expected_columns: usize,
    reader: csv::Reader<R>,
    header: Header,
    record: StringRecord,
    done: bool,
}

impl DelimitedRecordReader<File> {
    /// Open a file on disk and read its header
    pub fn open(path: &Path, separator: u8, expected_columns: usize) -> Result<Self, LoadError> {
        let file = File::open(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file, path, separator, expected_columns)
    }
}

impl<R: Read> DelimitedRecordReader<R> {
    /// Wrap any byte source; `path` is only used to label errors and logs
    pub fn from_reader(
        source: R,
        path: impl Into<PathBuf>,
        separator: u8,
        expected_columns: usize,
    ) -> Result<Self, LoadError> {
        let path = path.into();

        // Column counts are checked here rather than by the csv crate so the
        // error carries the expected and actual widths.
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(separator)
            .has_headers(false)
            .flexible(true)
            .from_reader(source);

        let mut record = StringRecord::new();
        let found = reader
            .read_record(&mut record)
            .map_err(|e| classify_csv_error(&path, e))?;

        if !found {
            return Err(LoadError::Format {
                path,
                line: 1,
                reason: "missing header record".to_string(),
            });
        }

        if record.len() != expected_columns {
            return Err(LoadError::Format {
                path,
                line: record_line(&record),
                reason: format!(
                    "header has {} columns, expected {}",
                    record.len(),
                    expected_columns
                ),
            });
        }

        let header = Header::new(record.iter().map(str::to_string).collect());

        Ok(Self {
            path,
            expected_columns,
            reader,
            header,
            record,
            done: false,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_next(&mut self) -> Result<Option<Record>, LoadError> {
        let found = self
            .reader
            .read_record(&mut self.record)
            .map_err(|e| classify_csv_error(&self.path, e))?;

        if !found {
            return Ok(None);
        }

        let line = record_line(&self.record);
        if self.record.len() != self.expected_columns {
            return Err(LoadError::Format {
                path: self.path.clone(),
                line,
                reason: format!(
                    "record has {} fields, expected {}",
                    self.record.len(),
                    self.expected_columns
                ),
            });
        }

        Ok(Some(Record {
            line,
            fields: self.record.iter().map(str::to_string).collect(),
        }))
    }
}

impl<R: Read> Iterator for DelimitedRecordReader<R> {
    type Item = Result<Record, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn record_line(record: &StringRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or(0)
}

/// Split csv failures into I/O errors and malformed input
fn classify_csv_error(path: &Path, err: csv::Error) -> LoadError {
    let line = err.position().map(|p| p.line()).unwrap_or(0);
    let reason = err.to_string();

    match err.into_kind() {
        csv::ErrorKind::Io(source) => LoadError::Io {
            path: path.to_path_buf(),
            source,
        },
        _ => LoadError::Format {
            path: path.to_path_buf(),
            line,
            reason,
        },
    }
}
