use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::executor::{BatchSink, execute_batch};
use crate::config::LoadConfig;
use crate::db::TableTarget;
use crate::error::LoadError;
use crate::formats::{Batch, BatchBuilder, DelimitedRecordReader};
use crate::telemetry::TelemetryEvent;

/// Outcome of a fully loaded file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileReport {
    pub path: PathBuf,
    pub batches: usize,
    pub rows_read: u64,
    pub rows_inserted: u64,
    pub rows_dropped: u64,
}

/// Loads one file at a time: read, batch, insert, verify
///
/// Within a file everything is sequential; batch k is inserted before batch
/// k+1 is read. Batches commit independently, so rows inserted before a
/// failure stay in the table.
pub struct FileLoader<S: BatchSink> {
    sink: Arc<S>,
    config: LoadConfig,
    telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl<S: BatchSink + 'static> FileLoader<S> {
    pub fn new(sink: Arc<S>, config: LoadConfig) -> Self {
        Self {
            sink,
            config,
            telemetry_tx: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>) -> Self {
        self.telemetry_tx = Some(telemetry_tx);
        self
    }

    fn send_telemetry(&self, event: TelemetryEvent) {
        if let Some(tx) = &self.telemetry_tx {
            let _ = tx.send(event);
        }
    }

    /// Reject settings that could never produce a valid insert
    pub fn validate(&self, expected_columns: usize) -> Result<(), LoadError> {
        self.config.check_columns(expected_columns)
    }

    /// Load `path` into `target`, stopping at the first error
    pub async fn load(
        &self,
        target: &TableTarget,
        path: &Path,
        expected_columns: usize,
        cancel: &CancellationToken,
    ) -> Result<FileReport, LoadError> {
        self.validate(expected_columns)?;

        self.send_telemetry(TelemetryEvent::FileStarted);
        let result = self
            .load_batches(target, path, expected_columns, cancel)
            .await;
        self.send_telemetry(TelemetryEvent::FileCompleted {
            succeeded: result.is_ok(),
        });

        if let Ok(report) = &result {
            info!(
                path = %path.display(),
                table = %target.name,
                batches = report.batches,
                inserted = report.rows_inserted,
                dropped = report.rows_dropped,
                "file loaded"
            );
        }
        result
    }

    async fn load_batches(
        &self,
        target: &TableTarget,
        path: &Path,
        expected_columns: usize,
        cancel: &CancellationToken,
    ) -> Result<FileReport, LoadError> {
        let cancelled = || LoadError::Cancelled {
            path: path.to_path_buf(),
        };

        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        debug!(path = %path.display(), table = %target.name, "opening file");
        let mut builder = self.open(path, expected_columns).await?;
        let mut report = FileReport {
            path: path.to_path_buf(),
            ..Default::default()
        };

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }

            let (returned, next) = next_batch(builder, path).await?;
            builder = returned;

            let batch = match next {
                Some(batch) => batch?,
                None => break,
            };

            if cancel.is_cancelled() {
                return Err(cancelled());
            }

            let start = Instant::now();
            let inserted = execute_batch(self.sink.as_ref(), target, &batch).await?;

            report.batches += 1;
            report.rows_inserted += inserted;
            report.rows_dropped += batch.rows_dropped;
            self.send_telemetry(TelemetryEvent::BatchLoaded {
                rows_inserted: inserted,
                rows_dropped: batch.rows_dropped,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        // Drops after the last kept row belong to no batch
        let trailing = builder.rows_dropped() - report.rows_dropped;
        if trailing > 0 {
            self.send_telemetry(TelemetryEvent::RowsDropped {
                rows_dropped: trailing,
            });
        }

        report.rows_read = builder.rows_read();
        report.rows_dropped = builder.rows_dropped();
        Ok(report)
    }

    /// Open the file and read its header off the async runtime
    async fn open(
        &self,
        path: &Path,
        expected_columns: usize,
    ) -> Result<BatchBuilder<File>, LoadError> {
        let owned = path.to_path_buf();
        let separator = self.config.separator;
        let batch_size = self.config.batch_size;
        let policy = self.config.skip_policy.clone();

        tokio::task::spawn_blocking(move || {
            let reader = DelimitedRecordReader::open(&owned, separator, expected_columns)?;
            Ok::<_, LoadError>(BatchBuilder::new(reader, batch_size, &policy))
        })
        .await
        .map_err(|e| LoadError::Worker(format!("reader for {} failed: {}", path.display(), e)))?
    }
}

type NextBatch = (BatchBuilder<File>, Option<Result<Batch, LoadError>>);

/// Read the next batch on the blocking pool, handing the builder back
async fn next_batch(mut builder: BatchBuilder<File>, path: &Path) -> Result<NextBatch, LoadError> {
    tokio::task::spawn_blocking(move || {
        let next = builder.next();
        (builder, next)
    })
    .await
    .map_err(|e| LoadError::Worker(format!("reader for {} failed: {}", path.display(), e)))
}
